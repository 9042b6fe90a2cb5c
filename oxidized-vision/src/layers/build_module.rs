use std::fmt::Debug;

use candle_core::ModuleT;
use candle_nn::VarBuilder;

use crate::error::BoxedError;

/// Configurations that build a module.
///
/// Layers whose presence depends on the configuration (stochastic depth,
/// layer scale, dropout) build an [`Identity`](crate::layers::identity::Identity)
/// module when they are disabled, so that callers can always apply the
/// built module.
pub trait BuildModule: Debug {
    /// Build a module.
    ///
    /// * `vb` - Variable builder for the module parameters.
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT>, BoxedError>;
}
