pub mod blocks;
pub mod error;
pub mod layers;
pub mod util;
