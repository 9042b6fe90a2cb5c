//! Reversible residual layers (RevNet).

mod inner;
pub use inner::{
    BottleneckResidualInnerConfig, InnerBlock, InnerBlockConfig, InnerBlockError,
    ResidualInnerConfig, ReversibleFunction,
};

mod layer;
pub use layer::{
    CustomGradient, ReversibleGradients, ReversibleLayer, ReversibleLayerConfig,
    ReversibleLayerError, ReversibleResidual, StatisticsSnapshot,
};
