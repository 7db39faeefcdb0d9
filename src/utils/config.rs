use crate::utils::avgpool::AvgPool;
use crate::utils::error::Result;
use crate::utils::filter::FilterLayer;
use crate::utils::head::LossInfo;
use crate::utils::kernel::KernelInfo;
use crate::utils::mat::Size;
use crate::utils::network::Network;
use crate::utils::nn_trait::Layer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Shape-free description of one stage. The input geometry is filled in
/// when the network chains the stages together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LayerInfo {
    Filter {
        filter_size: Size,
        zero_padding: Size,
        out_channels: usize,
        kernel: KernelInfo,
    },
    Pooling {
        pooling_size: Size,
    },
}

impl LayerInfo {
    pub fn build<R: Rng + ?Sized>(
        &self,
        input_size: Size,
        in_channels: usize,
        rng: &mut R,
    ) -> Result<Box<dyn Layer>> {
        Ok(match self {
            LayerInfo::Filter {
                filter_size,
                zero_padding,
                out_channels,
                kernel,
            } => Box::new(FilterLayer::with_random_filters(
                input_size,
                in_channels,
                *filter_size,
                *zero_padding,
                *out_channels,
                kernel.build()?,
                rng,
            )?),
            LayerInfo::Pooling { pooling_size } => {
                Box::new(AvgPool::new(input_size, in_channels, *pooling_size)?)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub input_size: Size,
    pub in_channels: usize,
    pub layers: Vec<LayerInfo>,
    pub output_nodes: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl NetworkConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn build(&self) -> Result<Network> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Network::build(
            self.input_size,
            self.in_channels,
            &self.layers,
            self.output_nodes,
            None,
            &mut rng,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub regularization_parameter: f64,
    #[serde(default)]
    pub loss: LossInfo,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            regularization_parameter: 0.0,
            loss: LossInfo::SquaredError,
        }
    }
}
