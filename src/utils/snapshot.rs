//! Logical export layout of a network and its optimizer.
//!
//! Everything here derives serde; callers pick the encoding. Forward caches
//! are not part of the state.

use crate::utils::avgpool::AvgPool;
use crate::utils::error::Result;
use crate::utils::filter::FilterLayer;
use crate::utils::gradient_info::ParameterGradient;
use crate::utils::head::LossInfo;
use crate::utils::kernel::KernelInfo;
use crate::utils::mat::{check_shape, Size};
use crate::utils::nn_trait::Layer;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StageState {
    Filter {
        input_size: Size,
        in_channels: usize,
        filter_size: Size,
        zero_padding: Size,
        out_channels: usize,
        kernel: KernelInfo,
        filter_matrix: Array2<f64>,
    },
    Pooling {
        input_size: Size,
        in_channels: usize,
        pooling_size: Size,
    },
}

impl StageState {
    pub fn build(&self) -> Result<Box<dyn Layer>> {
        Ok(match self {
            StageState::Filter {
                input_size,
                in_channels,
                filter_size,
                zero_padding,
                out_channels,
                kernel,
                filter_matrix,
            } => {
                check_shape(
                    "filter stage out channels",
                    &[filter_matrix.ncols()],
                    &[*out_channels],
                )?;
                Box::new(FilterLayer::new(
                    *input_size,
                    *in_channels,
                    *filter_size,
                    *zero_padding,
                    kernel.build()?,
                    filter_matrix.clone(),
                )?)
            }
            StageState::Pooling {
                input_size,
                in_channels,
                pooling_size,
            } => Box::new(AvgPool::new(*input_size, *in_channels, *pooling_size)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub stages: Vec<StageState>,
    pub output_weights: Array3<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub network: NetworkState,
    pub loss: LossInfo,
    pub loss_sum: f64,
    pub gradient_sum: Option<Vec<ParameterGradient>>,
    pub num_steps: usize,
}
