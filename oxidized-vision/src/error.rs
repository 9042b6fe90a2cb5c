use std::error::Error;

/// Alias for boxed errors that can be sent across threads.
///
/// Block and layer traits return boxed errors, so that implementations
/// can use their own error types.
pub type BoxedError = Box<dyn Error + Send + Sync>;
