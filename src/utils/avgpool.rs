use crate::utils::error::{NetError, Result};
use crate::utils::gradient_info::{GradientCalculationInfo, ParameterGradient};
use crate::utils::mat::{check_shape, spatial_len, Size};
use crate::utils::nn_trait;
use crate::utils::snapshot::StageState;
use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Non-overlapping average pooling. Rows and columns past the last full
/// block are dropped.
#[derive(Debug, Clone)]
pub struct AvgPool {
    in_channels: usize,
    input_size: Size,
    output_size: Size,
    pooling_size: Size,
    last_output: Option<Array2<f64>>,
}

impl AvgPool {
    pub fn new(input_size: Size, in_channels: usize, pooling_size: Size) -> Result<Self> {
        if in_channels == 0 || pooling_size.0 == 0 || pooling_size.1 == 0 {
            return Err(NetError::InvalidConfiguration(
                "pooling stage sizes must be positive".into(),
            ));
        }
        let output_size = (input_size.0 / pooling_size.0, input_size.1 / pooling_size.1);
        if output_size.0 == 0 || output_size.1 == 0 {
            return Err(NetError::InvalidConfiguration(format!(
                "pooling size {:?} exceeds input size {:?}",
                pooling_size, input_size
            )));
        }
        Ok(Self {
            in_channels,
            input_size,
            output_size,
            pooling_size,
            last_output: None,
        })
    }

    pub fn pooling_size(&self) -> Size {
        self.pooling_size
    }

    fn area(&self) -> f64 {
        spatial_len(self.pooling_size) as f64
    }

    // Flat input positions covered by output cell (i, j).
    fn block(&self, i: usize, j: usize) -> impl Iterator<Item = usize> + '_ {
        let (ph, pw) = self.pooling_size;
        let im_col = self.input_size.1;
        (0..ph).flat_map(move |dy| (0..pw).map(move |dx| (i * ph + dy) * im_col + j * pw + dx))
    }

    pub fn pool(&self, input: ArrayView2<f64>) -> Result<Array2<f64>> {
        check_shape(
            "pooling stage input",
            input.shape(),
            &[self.in_channels, spatial_len(self.input_size)],
        )?;
        let (feat_row, feat_col) = self.output_size;
        let area = self.area();
        let mut ret: Array2<f64> = Array2::zeros((self.in_channels, feat_row * feat_col));
        ret.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(input.axis_iter(Axis(0)))
            .for_each(|(mut dst, src)| {
                for i in 0..feat_row {
                    for j in 0..feat_col {
                        let sum: f64 = self.block(i, j).map(|idx| src[idx]).sum();
                        dst[i * feat_col + j] = sum / area;
                    }
                }
            });
        Ok(ret)
    }

    /// Transpose of [`AvgPool::pool`]: each value is spread over its block
    /// scaled by `1 / (ph * pw)`; the truncated remainder stays zero.
    pub fn backward(&self, d_loss: ArrayView2<f64>) -> Result<Array2<f64>> {
        let (feat_row, feat_col) = self.output_size;
        check_shape(
            "pooling stage error signal",
            d_loss.shape(),
            &[self.in_channels, feat_row * feat_col],
        )?;
        let area = self.area();
        let mut ret: Array2<f64> = Array2::zeros((self.in_channels, spatial_len(self.input_size)));
        ret.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(d_loss.axis_iter(Axis(0)))
            .for_each(|(mut dst, src)| {
                for i in 0..feat_row {
                    for j in 0..feat_col {
                        let val = src[i * feat_col + j] / area;
                        for idx in self.block(i, j) {
                            dst[idx] = val;
                        }
                    }
                }
            });
        Ok(ret)
    }
}

impl nn_trait::Layer for AvgPool {
    fn input_size(&self) -> Size {
        self.input_size
    }
    fn output_size(&self) -> Size {
        self.output_size
    }
    fn in_channels(&self) -> usize {
        self.in_channels
    }
    fn out_channels(&self) -> usize {
        self.in_channels
    }

    fn forward(&mut self, input: ArrayView2<f64>) -> Result<Array2<f64>> {
        let ret = self.pool(input)?;
        self.last_output = Some(ret.clone());
        Ok(ret)
    }

    fn last_output(&self) -> Option<&Array2<f64>> {
        self.last_output.as_ref()
    }

    fn compute_gradient(
        &self,
        info: GradientCalculationInfo,
    ) -> Result<(ParameterGradient, GradientCalculationInfo)> {
        let upscaled = self.backward(info.u_upscaled.view())?;
        Ok((ParameterGradient::None, info.descend(upscaled)))
    }

    fn gradient_descent(&mut self, descent: &ParameterGradient) -> Result<()> {
        match descent {
            ParameterGradient::None => Ok(()),
            other => Err(NetError::shape("pooling stage descent", &[], &other.shape())),
        }
    }

    fn parameter_shape(&self) -> Vec<usize> {
        Vec::new()
    }

    fn export(&self) -> StageState {
        StageState::Pooling {
            input_size: self.input_size,
            in_channels: self.in_channels,
            pooling_size: self.pooling_size,
        }
    }
}
