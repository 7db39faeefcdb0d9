use crate::utils::error::{NetError, Result};
use crate::utils::gradient_info::{GradientCalculationInfo, ParameterGradient};
use crate::utils::kernel::Kernel;
use crate::utils::mat::{check_shape, normal_init, normalize_columns, spatial_len, Size};
use crate::utils::nn_trait;
use crate::utils::snapshot::StageState;
use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;
use rayon::prelude::*;
use std::sync::Arc;

/// Convolution-like stage: every output is `kernel(filter column, patch)`
/// over unit-stride patches of the zero-padded input.
#[derive(Debug)]
pub struct FilterLayer {
    input_size: Size,
    output_size: Size,
    in_channels: usize,
    out_channels: usize,
    filter_size: Size,
    zero_padding: Size,

    // (in_channels * fh * fw, out_channels), columns of unit norm
    filter_matrix: Array2<f64>,
    kernel: Arc<dyn Kernel>,

    last_patches: Option<Array2<f64>>,
    last_output: Option<Array2<f64>>,
}

impl FilterLayer {
    pub fn new(
        input_size: Size,
        in_channels: usize,
        filter_size: Size,
        zero_padding: Size,
        kernel: Arc<dyn Kernel>,
        filter_matrix: Array2<f64>,
    ) -> Result<Self> {
        if in_channels == 0 || filter_matrix.ncols() == 0 {
            return Err(NetError::InvalidConfiguration(
                "filter stage needs at least one input and one output channel".into(),
            ));
        }
        let output_size = (
            Self::feat_len(input_size.0, zero_padding.0, filter_size.0)?,
            Self::feat_len(input_size.1, zero_padding.1, filter_size.1)?,
        );
        let patch_len = in_channels * spatial_len(filter_size);
        check_shape("filter matrix", &[filter_matrix.nrows()], &[patch_len])?;
        Ok(Self {
            input_size,
            output_size,
            in_channels,
            out_channels: filter_matrix.ncols(),
            filter_size,
            zero_padding,
            filter_matrix,
            kernel,
            last_patches: None,
            last_output: None,
        })
    }

    /// Filters drawn from a standard normal, then scaled to unit norm.
    pub fn with_random_filters<R: Rng + ?Sized>(
        input_size: Size,
        in_channels: usize,
        filter_size: Size,
        zero_padding: Size,
        out_channels: usize,
        kernel: Arc<dyn Kernel>,
        rng: &mut R,
    ) -> Result<Self> {
        let patch_len = in_channels * spatial_len(filter_size);
        let mut filter_matrix: Array2<f64> = normal_init((patch_len, out_channels), 1.0, rng)?;
        let fill = 1.0 / (patch_len.max(1) as f64).sqrt();
        let fallback = Array2::from_elem((patch_len, out_channels), fill);
        normalize_columns(&mut filter_matrix, fallback.view());
        Self::new(
            input_size,
            in_channels,
            filter_size,
            zero_padding,
            kernel,
            filter_matrix,
        )
    }

    fn feat_len(im_len: usize, padding: usize, filter_len: usize) -> Result<usize> {
        if im_len == 0 || filter_len == 0 {
            return Err(NetError::InvalidConfiguration(
                "filter stage sizes must be positive".into(),
            ));
        }
        let padded = padding
            .checked_mul(2)
            .and_then(|p| p.checked_add(im_len))
            .ok_or_else(|| {
                NetError::InvalidConfiguration(format!("zero padding {} is too large", padding))
            })?;
        padded.checked_sub(filter_len).map(|d| d + 1).ok_or_else(|| {
            NetError::InvalidConfiguration(format!(
                "filter length {} exceeds padded input length {}",
                filter_len, padded
            ))
        })
    }

    pub fn filter_matrix(&self) -> &Array2<f64> {
        &self.filter_matrix
    }
    pub fn filter_size(&self) -> Size {
        self.filter_size
    }
    pub fn zero_padding(&self) -> Size {
        self.zero_padding
    }
    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    fn patch_len(&self) -> usize {
        self.in_channels * spatial_len(self.filter_size)
    }

    // Input cell (channel, flat position) read by patch row `row` of the
    // receptive field at output `position`; None inside the zero padding.
    fn source(&self, position: usize, row: usize) -> Option<(usize, usize)> {
        let channel = row % self.in_channels;
        let offset = row / self.in_channels;
        let (dy, dx) = (offset / self.filter_size.1, offset % self.filter_size.1);
        let (oy, ox) = (position / self.output_size.1, position % self.output_size.1);
        let y = (oy + dy).checked_sub(self.zero_padding.0)?;
        let x = (ox + dx).checked_sub(self.zero_padding.1)?;
        if y >= self.input_size.0 || x >= self.input_size.1 {
            return None;
        }
        Some((channel, y * self.input_size.1 + x))
    }

    // C*HW => (fh*fw*C)*H'W'
    pub fn extract_patches(&self, input: ArrayView2<f64>) -> Result<Array2<f64>> {
        check_shape(
            "filter stage input",
            input.shape(),
            &[self.in_channels, spatial_len(self.input_size)],
        )?;
        let mut patches: Array2<f64> =
            Array2::zeros((self.patch_len(), spatial_len(self.output_size)));
        patches
            .axis_iter_mut(Axis(1))
            .into_par_iter()
            .enumerate()
            .for_each(|(position, mut col)| {
                for (row, dst) in col.iter_mut().enumerate() {
                    if let Some((channel, idx)) = self.source(position, row) {
                        *dst = input[[channel, idx]];
                    }
                }
            });
        Ok(patches)
    }

    // (fh*fw*C)*H'W' => C*HW, overlapping contributions summed
    pub fn extract_patches_adj(&self, patches: ArrayView2<f64>) -> Result<Array2<f64>> {
        check_shape(
            "filter stage patches",
            patches.shape(),
            &[self.patch_len(), spatial_len(self.output_size)],
        )?;
        let positions = spatial_len(self.output_size);
        let offsets = spatial_len(self.filter_size);
        let mut folded: Array2<f64> =
            Array2::zeros((self.in_channels, spatial_len(self.input_size)));
        folded
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(channel, mut dst)| {
                for position in 0..positions {
                    for offset in 0..offsets {
                        let row = offset * self.in_channels + channel;
                        if let Some((_, idx)) = self.source(position, row) {
                            dst[idx] += patches[[row, position]];
                        }
                    }
                }
            });
        Ok(folded)
    }
}

impl nn_trait::Layer for FilterLayer {
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
        self.out_channels
    }

    fn forward(&mut self, input: ArrayView2<f64>) -> Result<Array2<f64>> {
        let patches = self.extract_patches(input)?;
        let kernel = self.kernel.as_ref();
        let filter_matrix = &self.filter_matrix;
        let mut output: Array2<f64> = Array2::zeros((self.out_channels, patches.ncols()));
        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(channel, mut row)| {
                let filter = filter_matrix.column(channel);
                for (position, dst) in row.iter_mut().enumerate() {
                    *dst = kernel.value(filter, patches.column(position));
                }
            });
        self.last_patches = Some(patches);
        self.last_output = Some(output.clone());
        Ok(output)
    }

    fn last_output(&self) -> Option<&Array2<f64>> {
        self.last_output.as_ref()
    }

    fn compute_gradient(
        &self,
        info: GradientCalculationInfo,
    ) -> Result<(ParameterGradient, GradientCalculationInfo)> {
        let patches = self
            .last_patches
            .as_ref()
            .ok_or_else(|| NetError::MissingForward {
                context: "filter stage".into(),
            })?;
        let upstream = info.u_upscaled.view();
        check_shape(
            "filter stage error signal",
            upstream.shape(),
            &[self.out_channels, patches.ncols()],
        )?;

        // b: upstream-weighted cross-term coefficients, c: upstream-weighted
        // self-term coefficients, both (out_channels, positions)
        let kernel = self.kernel.as_ref();
        let mut b: Array2<f64> = Array2::zeros(upstream.raw_dim());
        let mut c: Array2<f64> = Array2::zeros(upstream.raw_dim());
        b.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(c.axis_iter_mut(Axis(0)))
            .enumerate()
            .for_each(|(channel, (mut b_row, mut c_row))| {
                let filter = self.filter_matrix.column(channel);
                for position in 0..patches.ncols() {
                    let patch = patches.column(position);
                    let err = upstream[[channel, position]];
                    b_row[position] = err * kernel.gradient(filter, patch);
                    c_row[position] = err * kernel.self_gradient(filter, patch);
                }
            });

        let g = patches.dot(&b.t()) + &self.filter_matrix * &c.sum_axis(Axis(1));
        let h = self.filter_matrix.dot(&b) + patches * &c.sum_axis(Axis(0));
        let u_upscaled = self.extract_patches_adj(h.view())?;
        Ok((ParameterGradient::Filter(g), info.descend(u_upscaled)))
    }

    fn gradient_descent(&mut self, descent: &ParameterGradient) -> Result<()> {
        let delta = match descent {
            ParameterGradient::Filter(delta) => delta,
            other => {
                return Err(NetError::shape(
                    "filter stage descent",
                    self.filter_matrix.shape(),
                    &other.shape(),
                ))
            }
        };
        check_shape("filter stage descent", delta.shape(), self.filter_matrix.shape())?;
        let previous = self.filter_matrix.clone();
        self.filter_matrix -= delta;
        let degenerate = normalize_columns(&mut self.filter_matrix, previous.view());
        if !degenerate.is_empty() {
            tracing::warn!(
                columns = ?degenerate,
                "filter columns collapsed to zero norm, keeping previous values"
            );
        }
        Ok(())
    }

    fn parameter_shape(&self) -> Vec<usize> {
        self.filter_matrix.shape().to_vec()
    }

    fn export(&self) -> StageState {
        StageState::Filter {
            input_size: self.input_size,
            in_channels: self.in_channels,
            filter_size: self.filter_size,
            zero_padding: self.zero_padding,
            out_channels: self.out_channels,
            kernel: self.kernel.info(),
            filter_matrix: self.filter_matrix.clone(),
        }
    }
}
