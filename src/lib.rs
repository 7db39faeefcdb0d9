//! Kernelized patch networks: filter stages that compare unit-norm filters
//! with image patches through a similarity kernel, average pooling between
//! them, and a linear scoring head trained by accumulated gradient descent.

pub mod utils;

pub use utils::avgpool::AvgPool;
pub use utils::config::{LayerInfo, NetworkConfig, TrainingConfig};
pub use utils::error::{NetError, Result};
pub use utils::filter::FilterLayer;
pub use utils::gradient_info::{GradientCalculationInfo, ParameterGradient};
pub use utils::head::{LossInfo, SoftMaxCrossEntropy, SquaredError};
pub use utils::kernel::{DotProduct, Kernel, KernelInfo, RadialBasisFunction};
pub use utils::network::Network;
pub use utils::nn_trait::{Layer, LossFunction};
pub use utils::optimizer::Optimizer;
pub use utils::snapshot::{NetworkState, OptimizerState, StageState};
