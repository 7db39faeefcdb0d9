use crate::utils::error::{NetError, Result};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// State handed from one stage to the one below it while walking the
/// network backwards. A fresh value is built at every step.
#[derive(Debug, Clone)]
pub struct GradientCalculationInfo {
    /// Activation of the last stage, the one feeding the output head.
    pub last_output_after_pooling: Array2<f64>,
    /// Error signal at the output head, `(channels_final, H_final * W_final)`.
    pub u: Array2<f64>,
    /// Error signal lifted to the output resolution of the stage about to
    /// be processed.
    pub u_upscaled: Array2<f64>,
    /// Index of the stage about to be processed; `-1` once the first stage
    /// has been handled.
    pub layer_number: isize,
}

impl GradientCalculationInfo {
    /// Carrier for the next stage down, keeping `u` and the head input.
    pub fn descend(self, u_upscaled: Array2<f64>) -> Self {
        Self {
            last_output_after_pooling: self.last_output_after_pooling,
            u: self.u,
            u_upscaled,
            layer_number: self.layer_number - 1,
        }
    }
}

/// Gradient of the loss with respect to one parameter tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterGradient {
    /// Placeholder for stages without parameters.
    None,
    Filter(Array2<f64>),
    Output(Array3<f64>),
}

impl ParameterGradient {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            ParameterGradient::None => Vec::new(),
            ParameterGradient::Filter(g) => g.shape().to_vec(),
            ParameterGradient::Output(g) => g.shape().to_vec(),
        }
    }

    pub fn add_assign(&mut self, other: &ParameterGradient) -> Result<()> {
        match (self, other) {
            (ParameterGradient::None, ParameterGradient::None) => Ok(()),
            (ParameterGradient::Filter(a), ParameterGradient::Filter(b))
                if a.shape() == b.shape() =>
            {
                *a += b;
                Ok(())
            }
            (ParameterGradient::Output(a), ParameterGradient::Output(b))
                if a.shape() == b.shape() =>
            {
                *a += b;
                Ok(())
            }
            (a, b) => Err(NetError::shape("gradient accumulation", &a.shape(), &b.shape())),
        }
    }

    pub fn scaled(&self, factor: f64) -> ParameterGradient {
        match self {
            ParameterGradient::None => ParameterGradient::None,
            ParameterGradient::Filter(g) => ParameterGradient::Filter(g * factor),
            ParameterGradient::Output(g) => ParameterGradient::Output(g * factor),
        }
    }
}
