//! Similarity kernels used by the filter stage in place of a raw dot product.

use crate::utils::error::{NetError, Result};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A scalar similarity `k(z, x)` between a filter column `z` and a patch `x`.
///
/// Derivatives are expressed through two coefficients so that
///
/// ```text
/// dk/dz = gradient * x + self_gradient * z
/// dk/dx = gradient * z + self_gradient * x
/// ```
///
/// which covers every kernel of the form `f(z.x, |z|^2 + |x|^2)`.
pub trait Kernel: fmt::Debug + Send + Sync {
    fn value(&self, filter: ArrayView1<f64>, patch: ArrayView1<f64>) -> f64;
    fn gradient(&self, filter: ArrayView1<f64>, patch: ArrayView1<f64>) -> f64;
    fn self_gradient(&self, filter: ArrayView1<f64>, patch: ArrayView1<f64>) -> f64;
    fn info(&self) -> KernelInfo;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DotProduct;

impl Kernel for DotProduct {
    fn value(&self, filter: ArrayView1<f64>, patch: ArrayView1<f64>) -> f64 {
        filter.dot(&patch)
    }
    fn gradient(&self, _: ArrayView1<f64>, _: ArrayView1<f64>) -> f64 {
        1.0
    }
    fn self_gradient(&self, _: ArrayView1<f64>, _: ArrayView1<f64>) -> f64 {
        0.0
    }
    fn info(&self) -> KernelInfo {
        KernelInfo::DotProduct
    }
}

/// `exp(-|z - x|^2 / (2 * bandwidth^2))`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadialBasisFunction {
    bandwidth: f64,
}

impl RadialBasisFunction {
    pub fn new(bandwidth: f64) -> Result<Self> {
        if !(bandwidth.is_finite() && bandwidth > 0.0) {
            return Err(NetError::InvalidConfiguration(format!(
                "rbf bandwidth must be positive, got {}",
                bandwidth
            )));
        }
        Ok(Self { bandwidth })
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    fn squared_distance(filter: ArrayView1<f64>, patch: ArrayView1<f64>) -> f64 {
        filter
            .iter()
            .zip(patch.iter())
            .map(|(z, x)| (z - x) * (z - x))
            .sum()
    }
}

impl Kernel for RadialBasisFunction {
    fn value(&self, filter: ArrayView1<f64>, patch: ArrayView1<f64>) -> f64 {
        let d2 = Self::squared_distance(filter, patch);
        (-d2 / (2.0 * self.bandwidth * self.bandwidth)).exp()
    }
    fn gradient(&self, filter: ArrayView1<f64>, patch: ArrayView1<f64>) -> f64 {
        self.value(filter, patch) / (self.bandwidth * self.bandwidth)
    }
    fn self_gradient(&self, filter: ArrayView1<f64>, patch: ArrayView1<f64>) -> f64 {
        -self.gradient(filter, patch)
    }
    fn info(&self) -> KernelInfo {
        KernelInfo::RadialBasisFunction {
            bandwidth: self.bandwidth,
        }
    }
}

/// Serialisable descriptor of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KernelInfo {
    DotProduct,
    RadialBasisFunction { bandwidth: f64 },
}

impl KernelInfo {
    pub fn build(&self) -> Result<Arc<dyn Kernel>> {
        Ok(match *self {
            KernelInfo::DotProduct => Arc::new(DotProduct),
            KernelInfo::RadialBasisFunction { bandwidth } => {
                Arc::new(RadialBasisFunction::new(bandwidth)?)
            }
        })
    }
}
