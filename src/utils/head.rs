use crate::utils::error::Result;
use crate::utils::mat::check_shape;
use crate::utils::nn_trait::LossFunction;
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Serialisable descriptor of a loss function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type")]
pub enum LossInfo {
    #[default]
    SquaredError,
    SoftMaxCrossEntropy,
}

impl LossInfo {
    pub fn build(&self) -> Box<dyn LossFunction> {
        match self {
            LossInfo::SquaredError => Box::new(SquaredError),
            LossInfo::SoftMaxCrossEntropy => Box::new(SoftMaxCrossEntropy),
        }
    }
}

fn check_lengths(predicted: &ArrayView1<f64>, expected: &ArrayView1<f64>) -> Result<()> {
    check_shape("loss expected output", expected.shape(), predicted.shape())
}

/// `0.5 * |p - e|^2`
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredError;

impl LossFunction for SquaredError {
    fn loss(&self, predicted: ArrayView1<f64>, expected: ArrayView1<f64>) -> Result<f64> {
        check_lengths(&predicted, &expected)?;
        let diff = &predicted - &expected;
        Ok(0.5 * diff.dot(&diff))
    }

    fn gradient(
        &self,
        predicted: ArrayView1<f64>,
        expected: ArrayView1<f64>,
    ) -> Result<Array1<f64>> {
        check_lengths(&predicted, &expected)?;
        Ok(&predicted - &expected)
    }

    fn info(&self) -> LossInfo {
        LossInfo::SquaredError
    }
}

/// Softmax over the raw class scores followed by cross entropy against a
/// one-hot (or any probability) target.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftMaxCrossEntropy;

impl SoftMaxCrossEntropy {
    pub fn softmax(input: ArrayView1<f64>) -> Array1<f64> {
        let max_val = input.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exp = input.mapv(|v| (v - max_val).exp());
        let sum = exp.sum();
        exp / sum
    }
}

impl LossFunction for SoftMaxCrossEntropy {
    fn loss(&self, predicted: ArrayView1<f64>, expected: ArrayView1<f64>) -> Result<f64> {
        check_lengths(&predicted, &expected)?;
        let prob = Self::softmax(predicted);
        Ok(prob
            .iter()
            .zip(expected.iter())
            .map(|(p, t)| -t * p.max(1e-7).ln())
            .sum())
    }

    fn gradient(
        &self,
        predicted: ArrayView1<f64>,
        expected: ArrayView1<f64>,
    ) -> Result<Array1<f64>> {
        check_lengths(&predicted, &expected)?;
        Ok(Self::softmax(predicted) - expected)
    }

    fn info(&self) -> LossInfo {
        LossInfo::SoftMaxCrossEntropy
    }
}
