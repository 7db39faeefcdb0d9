use crate::utils::config::LayerInfo;
use crate::utils::error::{NetError, Result};
use crate::utils::gradient_info::{GradientCalculationInfo, ParameterGradient};
use crate::utils::mat::{check_shape, normal_init, spatial_len, Size};
use crate::utils::nn_trait::Layer;
use crate::utils::snapshot::NetworkState;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::Rng;

/// Stack of stages followed by a linear head that scores every class with
/// a weighted sum over channels and positions of the last activation.
#[derive(Debug)]
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
    // (num_classes, channels_final, H_final * W_final)
    output_weights: Array3<f64>,
    last_output: Option<Array1<f64>>,
}

impl Network {
    pub fn new(layers: Vec<Box<dyn Layer>>, output_weights: Array3<f64>) -> Result<Self> {
        let last = layers.last().ok_or_else(|| {
            NetError::InvalidConfiguration("network needs at least one stage".into())
        })?;
        for (index, pair) in layers.windows(2).enumerate() {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.output_size() != next.input_size()
                || prev.out_channels() != next.in_channels()
            {
                return Err(NetError::InvalidConfiguration(format!(
                    "stage {} produces {:?}x{} but stage {} expects {:?}x{}",
                    index,
                    prev.output_size(),
                    prev.out_channels(),
                    index + 1,
                    next.input_size(),
                    next.in_channels()
                )));
            }
        }
        if output_weights.len_of(Axis(0)) == 0 {
            return Err(NetError::InvalidConfiguration(
                "output head needs at least one class".into(),
            ));
        }
        check_shape(
            "output weights",
            &output_weights.shape()[1..],
            &[last.out_channels(), spatial_len(last.output_size())],
        )?;
        Ok(Self {
            layers,
            output_weights,
            last_output: None,
        })
    }

    /// Builds the stages one after another, each taking the previous
    /// stage's output geometry. Output weights default to
    /// `N(0, 1 / sqrt(C * H * W))` of the last stage.
    pub fn build<R: Rng + ?Sized>(
        input_size: Size,
        in_channels: usize,
        layer_infos: &[LayerInfo],
        output_nodes: usize,
        output_weights: Option<Array3<f64>>,
        rng: &mut R,
    ) -> Result<Self> {
        let mut size = input_size;
        let mut channels = in_channels;
        let mut layers = Vec::with_capacity(layer_infos.len());
        for (index, info) in layer_infos.iter().enumerate() {
            let layer = info
                .build(size, channels, rng)
                .map_err(|err| err.in_stage(index))?;
            tracing::debug!(
                stage = index,
                input = ?size,
                output = ?layer.output_size(),
                out_channels = layer.out_channels(),
                "built stage"
            );
            size = layer.output_size();
            channels = layer.out_channels();
            layers.push(layer);
        }
        let output_weights = match output_weights {
            Some(weights) => {
                check_shape("output classes", &[weights.len_of(Axis(0))], &[output_nodes])?;
                weights
            }
            None => {
                let features = channels * spatial_len(size);
                let sigma = 1.0 / (features.max(1) as f64).sqrt();
                normal_init((output_nodes, channels, spatial_len(size)), sigma, rng)?
            }
        };
        Self::new(layers, output_weights)
    }

    pub fn input_size(&self) -> Size {
        self.layers[0].input_size()
    }
    pub fn in_channels(&self) -> usize {
        self.layers[0].in_channels()
    }
    /// Number of classes scored by the head.
    pub fn output_size(&self) -> usize {
        self.output_weights.len_of(Axis(0))
    }
    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }
    pub fn output_weights(&self) -> &Array3<f64> {
        &self.output_weights
    }
    pub fn last_output(&self) -> Option<&Array1<f64>> {
        self.last_output.as_ref()
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }
    pub(crate) fn output_weights_mut(&mut self) -> &mut Array3<f64> {
        &mut self.output_weights
    }

    pub fn forward(&mut self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        let mut x = x.to_owned();
        for (index, layer) in self.layers.iter_mut().enumerate() {
            x = layer.forward(x.view()).map_err(|err| err.in_stage(index))?;
        }
        let scores = Array1::from_iter(
            self.output_weights
                .outer_iter()
                .map(|weights| (&weights * &x).sum()),
        );
        self.last_output = Some(scores.clone());
        Ok(scores)
    }

    /// Gradients of every stage followed by the head's, index-aligned with
    /// the stages. Parameter-free stages yield `ParameterGradient::None`.
    pub fn gradients(&self, loss_gradient: ArrayView1<f64>) -> Result<Vec<ParameterGradient>> {
        check_shape("loss gradient", loss_gradient.shape(), &[self.output_size()])?;
        let num_layers = self.layers.len();
        let last_output = self.layers[num_layers - 1]
            .last_output()
            .ok_or_else(|| NetError::MissingForward {
                context: "network".into(),
            })?;

        let output_gradient = Array3::from_shape_fn(self.output_weights.raw_dim(), |(i, j, k)| {
            loss_gradient[i] * last_output[[j, k]]
        });

        let mut u: Array2<f64> = Array2::zeros(last_output.raw_dim());
        for (weights, g) in self.output_weights.outer_iter().zip(loss_gradient.iter()) {
            u.scaled_add(*g, &weights);
        }

        let mut gradients = vec![ParameterGradient::None; num_layers + 1];
        let mut info = GradientCalculationInfo {
            last_output_after_pooling: last_output.clone(),
            u: u.clone(),
            u_upscaled: u,
            layer_number: num_layers as isize - 1,
        };
        for (index, layer) in self.layers.iter().enumerate().rev() {
            debug_assert_eq!(info.layer_number, index as isize);
            let (gradient, next) = layer
                .compute_gradient(info)
                .map_err(|err| err.in_stage(index))?;
            gradients[index] = gradient;
            info = next;
        }
        debug_assert_eq!(info.layer_number, -1);
        gradients[num_layers] = ParameterGradient::Output(output_gradient);
        Ok(gradients)
    }

    pub fn export(&self) -> NetworkState {
        NetworkState {
            stages: self.layers.iter().map(|layer| layer.export()).collect(),
            output_weights: self.output_weights.clone(),
        }
    }

    pub fn import(state: NetworkState) -> Result<Self> {
        let layers = state
            .stages
            .iter()
            .enumerate()
            .map(|(index, stage)| stage.build().map_err(|err| err.in_stage(index)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(layers, state.output_weights)
    }

    /// Shape each entry of [`Network::gradients`] has.
    pub fn gradient_shapes(&self) -> Vec<Vec<usize>> {
        self.layers
            .iter()
            .map(|layer| layer.parameter_shape())
            .chain(std::iter::once(self.output_weights.shape().to_vec()))
            .collect()
    }
}
