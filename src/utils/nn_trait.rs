use crate::utils::error::Result;
use crate::utils::gradient_info::{GradientCalculationInfo, ParameterGradient};
use crate::utils::mat::Size;
use crate::utils::head::LossInfo;
use crate::utils::snapshot::StageState;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::fmt;

/// One stage of the network. Inputs and outputs are channel-major
/// `(channels, height * width)` matrices.
pub trait Layer: fmt::Debug + Send + Sync {
    fn input_size(&self) -> Size;
    fn output_size(&self) -> Size;
    fn in_channels(&self) -> usize;
    fn out_channels(&self) -> usize;

    fn forward(&mut self, input: ArrayView2<f64>) -> Result<Array2<f64>>;
    fn last_output(&self) -> Option<&Array2<f64>>;

    /// Consumes the carrier of the stage above and returns this stage's
    /// parameter gradient plus the carrier for the stage below.
    fn compute_gradient(
        &self,
        info: GradientCalculationInfo,
    ) -> Result<(ParameterGradient, GradientCalculationInfo)>;

    /// Subtracts `descent` from the parameters and restores their invariants.
    fn gradient_descent(&mut self, descent: &ParameterGradient) -> Result<()>;

    /// Shape of the trainable parameter; empty for parameter-free stages.
    fn parameter_shape(&self) -> Vec<usize>;

    fn export(&self) -> StageState;
}

pub trait LossFunction: fmt::Debug {
    fn loss(&self, predicted: ArrayView1<f64>, expected: ArrayView1<f64>) -> Result<f64>;
    fn gradient(
        &self,
        predicted: ArrayView1<f64>,
        expected: ArrayView1<f64>,
    ) -> Result<Array1<f64>>;
    fn info(&self) -> LossInfo;
}
