use crate::utils::config::TrainingConfig;
use crate::utils::error::{NetError, Result};
use crate::utils::gradient_info::ParameterGradient;
use crate::utils::mat::check_shape;
use crate::utils::network::Network;
use crate::utils::nn_trait::LossFunction;
use crate::utils::snapshot::OptimizerState;
use ndarray::{ArrayView1, ArrayView2};
use std::cell::{RefCell, RefMut};
use std::rc::Rc;

/// Gradient descent over accumulated examples.
///
/// `step` adds one example's loss and gradients; `optim` applies the mean
/// gradient scaled by the learning rate, with weight decay on the output
/// head, and clears the accumulators.
#[derive(Debug)]
pub struct Optimizer {
    loss_function: Box<dyn LossFunction>,
    network: Option<Rc<RefCell<Network>>>,

    loss_sum: f64,
    gradient_sum: Option<Vec<ParameterGradient>>,
    num_steps: usize,
}

impl Optimizer {
    pub fn new(
        loss_function: Box<dyn LossFunction>,
        network: Option<Rc<RefCell<Network>>>,
    ) -> Self {
        Self {
            loss_function,
            network,
            loss_sum: 0.0,
            gradient_sum: None,
            num_steps: 0,
        }
    }

    pub fn from_config(config: &TrainingConfig, network: Option<Rc<RefCell<Network>>>) -> Self {
        Self::new(config.loss.build(), network)
    }

    /// Binds `network`; accumulators are cleared unless it is the network
    /// already bound.
    pub fn set_network(&mut self, network: Rc<RefCell<Network>>) {
        let same = self
            .network
            .as_ref()
            .map_or(false, |bound| Rc::ptr_eq(bound, &network));
        if !same {
            self.network = Some(network);
            self.reset();
        }
    }

    pub fn network(&self) -> Option<&Rc<RefCell<Network>>> {
        self.network.as_ref()
    }
    pub fn loss_function(&self) -> &dyn LossFunction {
        self.loss_function.as_ref()
    }
    pub fn loss_sum(&self) -> f64 {
        self.loss_sum
    }
    pub fn gradient_sum(&self) -> Option<&[ParameterGradient]> {
        self.gradient_sum.as_deref()
    }
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    fn bound(&self) -> Result<&Rc<RefCell<Network>>> {
        self.network.as_ref().ok_or(NetError::UnboundNetwork)
    }

    fn bound_mut(&self) -> Result<RefMut<'_, Network>> {
        self.bound()?
            .try_borrow_mut()
            .map_err(|_| NetError::NetworkBusy)
    }

    pub fn step(
        &mut self,
        training_input: ArrayView2<f64>,
        expected_output: ArrayView1<f64>,
    ) -> Result<()> {
        let (loss, gradients) = {
            let mut network = self.bound_mut()?;
            let predicted = network.forward(training_input)?;
            let loss = self.loss_function.loss(predicted.view(), expected_output)?;
            let loss_gradient = self.loss_function.gradient(predicted.view(), expected_output)?;
            (loss, network.gradients(loss_gradient.view())?)
        };
        if !loss.is_finite() {
            tracing::warn!(loss, step = self.num_steps, "non-finite loss accumulated");
        }

        match self.gradient_sum.as_mut() {
            None => self.gradient_sum = Some(gradients),
            Some(sum) => {
                let sum_shapes: Vec<Vec<usize>> = sum.iter().map(|g| g.shape()).collect();
                let new_shapes: Vec<Vec<usize>> = gradients.iter().map(|g| g.shape()).collect();
                if sum_shapes != new_shapes {
                    return Err(NetError::InvalidConfiguration(
                        "gradient layout changed during accumulation".into(),
                    ));
                }
                for (acc, gradient) in sum.iter_mut().zip(gradients.iter()) {
                    acc.add_assign(gradient)?;
                }
            }
        }
        self.loss_sum += loss;
        self.num_steps += 1;
        tracing::trace!(loss, steps = self.num_steps, "accumulated step");
        Ok(())
    }

    /// Applies the accumulated update and returns the mean loss plus the
    /// L2 term of the output weights before the update. `None` when no
    /// step was accumulated, in which case nothing is touched.
    pub fn optim(
        &mut self,
        learning_rate: f64,
        regularization_parameter: f64,
    ) -> Result<Option<f64>> {
        self.bound()?;
        if self.num_steps == 0 {
            return Ok(None);
        }
        let gradient_sum = self.gradient_sum.as_ref().ok_or_else(|| {
            NetError::InvalidConfiguration("steps recorded without gradients".into())
        })?;

        let mut network = self.bound_mut()?;
        let num_layers = network.layers().len();
        check_layout(gradient_sum, &network.gradient_shapes())?;
        let output_gradient = match &gradient_sum[num_layers] {
            ParameterGradient::Output(g) => g,
            other => {
                return Err(NetError::shape(
                    "output head descent",
                    network.output_weights().shape(),
                    &other.shape(),
                ))
            }
        };

        let grad_sum_scalar = learning_rate / self.num_steps as f64;
        let regularization_term =
            regularization_parameter / 2.0 * network.output_weights().mapv(|w| w * w).sum();

        for (index, (layer, gradient)) in network
            .layers_mut()
            .iter_mut()
            .zip(gradient_sum.iter())
            .enumerate()
        {
            layer
                .gradient_descent(&gradient.scaled(grad_sum_scalar))
                .map_err(|err| err.in_stage(index))?;
        }
        let output_weights = network.output_weights_mut();
        *output_weights *= 1.0 - learning_rate * regularization_parameter;
        output_weights.scaled_add(-grad_sum_scalar, output_gradient);

        let loss = self.loss_sum / self.num_steps as f64 + regularization_term;
        tracing::debug!(
            steps = self.num_steps,
            learning_rate,
            regularization_parameter,
            loss,
            "applied optimisation step"
        );
        drop(network);
        self.reset();
        Ok(Some(loss))
    }

    pub fn optim_with(&mut self, config: &TrainingConfig) -> Result<Option<f64>> {
        self.optim(config.learning_rate, config.regularization_parameter)
    }

    pub fn reset(&mut self) {
        self.loss_sum = 0.0;
        self.gradient_sum = None;
        self.num_steps = 0;
    }

    pub fn export(&self) -> Result<OptimizerState> {
        let network = self
            .bound()?
            .try_borrow()
            .map_err(|_| NetError::NetworkBusy)?
            .export();
        Ok(OptimizerState {
            network,
            loss: self.loss_function.info(),
            loss_sum: self.loss_sum,
            gradient_sum: self.gradient_sum.clone(),
            num_steps: self.num_steps,
        })
    }

    /// Rebuilds the network and the accumulators; the network is reachable
    /// through [`Optimizer::network`].
    pub fn import(state: OptimizerState) -> Result<Self> {
        let network = Network::import(state.network)?;
        match &state.gradient_sum {
            Some(sum) => check_layout(sum, &network.gradient_shapes())?,
            None if state.num_steps > 0 => {
                return Err(NetError::InvalidConfiguration(
                    "steps recorded without gradients".into(),
                ))
            }
            None => {}
        }
        Ok(Self {
            loss_function: state.loss.build(),
            network: Some(Rc::new(RefCell::new(network))),
            loss_sum: state.loss_sum,
            gradient_sum: state.gradient_sum,
            num_steps: state.num_steps,
        })
    }
}

fn check_layout(gradients: &[ParameterGradient], expected: &[Vec<usize>]) -> Result<()> {
    if gradients.len() != expected.len() {
        return Err(NetError::shape(
            "gradient list",
            &[expected.len()],
            &[gradients.len()],
        ));
    }
    for (index, (gradient, shape)) in gradients.iter().zip(expected.iter()).enumerate() {
        check_shape("accumulated gradient", &gradient.shape(), shape)
            .map_err(|err| err.in_stage(index))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::LayerInfo;
    use crate::utils::head::{LossInfo, SquaredError};
    use crate::utils::kernel::KernelInfo;
    use crate::utils::mat::column_norms;
    use crate::utils::snapshot::StageState;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn network(seed: u64) -> Rc<RefCell<Network>> {
        let layers = vec![
            LayerInfo::Filter {
                filter_size: (2, 2),
                zero_padding: (1, 1),
                out_channels: 2,
                kernel: KernelInfo::DotProduct,
            },
            LayerInfo::Pooling { pooling_size: (2, 2) },
        ];
        let mut rng = StdRng::seed_from_u64(seed);
        Rc::new(RefCell::new(
            Network::build((3, 3), 1, &layers, 2, None, &mut rng).unwrap(),
        ))
    }

    fn assert_all_close<'a>(
        actual: impl ExactSizeIterator<Item = &'a f64>,
        expected: impl ExactSizeIterator<Item = &'a f64>,
    ) {
        assert_eq!(actual.len(), expected.len());
        for (a, b) in actual.zip(expected) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    fn sample() -> (Array2<f64>, ndarray::Array1<f64>) {
        (
            array![[0.1, 0.2, 0.3, 0.0, -0.2, 0.4, 0.5, 0.1, -0.1]],
            array![1.0, 0.0],
        )
    }

    #[test]
    fn unbound_network_fails_fast() {
        let mut optimizer = Optimizer::new(Box::new(SquaredError), None);
        let (x, y) = sample();
        assert!(matches!(optimizer.step(x.view(), y.view()), Err(NetError::UnboundNetwork)));
        assert!(matches!(optimizer.optim(0.1, 0.0), Err(NetError::UnboundNetwork)));
        assert!(matches!(optimizer.export(), Err(NetError::UnboundNetwork)));
    }

    #[test]
    fn optim_without_steps_changes_nothing() {
        let net = network(1);
        let before = net.borrow().export();
        let mut optimizer = Optimizer::new(Box::new(SquaredError), Some(net.clone()));
        assert_eq!(optimizer.optim(0.5, 0.1).unwrap(), None);
        assert_eq!(net.borrow().export(), before);
    }

    #[test]
    fn step_accumulates_and_optim_resets() {
        let net = network(2);
        let mut optimizer = Optimizer::new(Box::new(SquaredError), Some(net.clone()));
        let (x, y) = sample();
        optimizer.step(x.view(), y.view()).unwrap();
        let first = optimizer.gradient_sum().unwrap().to_vec();
        let first_loss = optimizer.loss_sum();
        optimizer.step(x.view(), y.view()).unwrap();
        assert_eq!(optimizer.num_steps(), 2);
        assert_abs_diff_eq!(optimizer.loss_sum(), 2.0 * first_loss, epsilon = 1e-12);
        let doubled: Vec<ParameterGradient> = first.iter().map(|g| g.scaled(2.0)).collect();
        let sum = optimizer.gradient_sum().unwrap();
        assert_eq!(sum.len(), 3);
        for (a, b) in sum.iter().zip(doubled.iter()) {
            match (a, b) {
                (ParameterGradient::Filter(a), ParameterGradient::Filter(b)) => {
                    assert!(b.iter().any(|v| *v != 0.0));
                    assert_all_close(a.iter(), b.iter());
                }
                (ParameterGradient::Output(a), ParameterGradient::Output(b)) => {
                    assert!(b.iter().any(|v| *v != 0.0));
                    assert_all_close(a.iter(), b.iter());
                }
                (ParameterGradient::None, ParameterGradient::None) => {}
                other => panic!("mismatched gradients {other:?}"),
            }
        }

        let loss = optimizer.optim(0.1, 0.0).unwrap().unwrap();
        assert_abs_diff_eq!(loss, first_loss, epsilon = 1e-12);
        assert_eq!(optimizer.num_steps(), 0);
        assert!(optimizer.gradient_sum().is_none());
        assert_eq!(optimizer.loss_sum(), 0.0);
    }

    #[test]
    fn optim_applies_decay_then_mean_gradient() {
        let net = network(3);
        let mut optimizer = Optimizer::new(Box::new(SquaredError), Some(net.clone()));
        let (x, y) = sample();
        optimizer.step(x.view(), y.view()).unwrap();
        let loss_sum = optimizer.loss_sum();
        let output_gradient = match optimizer.gradient_sum().unwrap().last() {
            Some(ParameterGradient::Output(g)) => g.clone(),
            other => panic!("unexpected gradient {other:?}"),
        };
        let weights = net.borrow().output_weights().clone();
        let (lr, reg) = (0.2, 0.05);

        let loss = optimizer.optim(lr, reg).unwrap().unwrap();

        let expected = &weights * (1.0 - lr * reg) - &output_gradient * lr;
        let updated = net.borrow().output_weights().clone();
        for (a, b) in updated.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        let regularization = reg / 2.0 * weights.mapv(|w| w * w).sum();
        assert_abs_diff_eq!(loss, loss_sum + regularization, epsilon = 1e-12);

        for layer in net.borrow().layers() {
            if let StageState::Filter { filter_matrix, .. } = layer.export() {
                for norm in column_norms(filter_matrix.view()) {
                    assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn optim_scales_summed_gradient_by_step_count() {
        let net = network(7);
        let mut optimizer = Optimizer::new(Box::new(SquaredError), Some(net.clone()));
        let inputs = [
            array![[0.1, 0.2, 0.3, 0.0, -0.2, 0.4, 0.5, 0.1, -0.1]],
            array![[-0.3, 0.0, 0.6, 0.2, 0.1, -0.5, 0.0, 0.3, 0.2]],
            array![[0.4, -0.1, 0.0, 0.3, 0.5, 0.1, -0.2, 0.0, 0.6]],
        ];
        let targets = [array![1.0, 0.0], array![0.0, 1.0], array![0.5, 0.5]];

        let weights = net.borrow().output_weights().clone();
        let mut expected_sum: Array3<f64> = Array3::zeros(weights.raw_dim());
        let mut loss_sum = 0.0;
        for (x, y) in inputs.iter().zip(targets.iter()) {
            // each example against the untouched network
            let gradients = {
                let mut network = net.borrow_mut();
                let predicted = network.forward(x.view()).unwrap();
                loss_sum += SquaredError.loss(predicted.view(), y.view()).unwrap();
                let g = SquaredError.gradient(predicted.view(), y.view()).unwrap();
                network.gradients(g.view()).unwrap()
            };
            match gradients.last() {
                Some(ParameterGradient::Output(g)) => expected_sum += g,
                other => panic!("unexpected gradient {other:?}"),
            }
            optimizer.step(x.view(), y.view()).unwrap();
        }
        assert_eq!(optimizer.num_steps(), 3);
        match optimizer.gradient_sum().unwrap().last() {
            Some(ParameterGradient::Output(g)) => assert_all_close(g.iter(), expected_sum.iter()),
            other => panic!("unexpected gradient {other:?}"),
        }

        let (lr, reg) = (0.3, 0.1);
        let loss = optimizer.optim(lr, reg).unwrap().unwrap();
        let expected = &weights * (1.0 - lr * reg) - &expected_sum * (lr / 3.0);
        let updated = net.borrow().output_weights().clone();
        assert_eq!(updated.shape(), expected.shape());
        assert_all_close(updated.iter(), expected.iter());
        let regularization = reg / 2.0 * weights.mapv(|w| w * w).sum();
        assert_abs_diff_eq!(loss, loss_sum / 3.0 + regularization, epsilon = 1e-12);
    }

    #[test]
    fn busy_network_is_an_error() {
        let net = network(8);
        let mut optimizer = Optimizer::new(Box::new(SquaredError), Some(net.clone()));
        let (x, y) = sample();
        optimizer.step(x.view(), y.view()).unwrap();
        {
            let _held = net.borrow();
            assert!(matches!(optimizer.step(x.view(), y.view()), Err(NetError::NetworkBusy)));
            assert!(matches!(optimizer.optim(0.1, 0.0), Err(NetError::NetworkBusy)));
        }
        {
            let _held = net.borrow_mut();
            assert!(matches!(optimizer.export(), Err(NetError::NetworkBusy)));
        }
        assert_eq!(optimizer.num_steps(), 1);
        assert!(optimizer.optim(0.1, 0.0).unwrap().is_some());
    }

    #[test]
    fn rebinding_resets_only_for_other_networks() {
        let net = network(4);
        let mut optimizer = Optimizer::new(Box::new(SquaredError), Some(net.clone()));
        let (x, y) = sample();
        optimizer.step(x.view(), y.view()).unwrap();
        optimizer.set_network(net.clone());
        assert_eq!(optimizer.num_steps(), 1);
        optimizer.set_network(network(4));
        assert_eq!(optimizer.num_steps(), 0);
        assert!(optimizer.gradient_sum().is_none());
    }

    #[test]
    fn export_import_keeps_accumulators() {
        let net = network(5);
        let mut optimizer = Optimizer::new(LossInfo::SoftMaxCrossEntropy.build(), Some(net));
        let (x, y) = sample();
        optimizer.step(x.view(), y.view()).unwrap();

        let json = serde_json::to_string(&optimizer.export().unwrap()).unwrap();
        let mut restored = Optimizer::import(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.num_steps(), 1);
        assert_eq!(restored.loss_sum(), optimizer.loss_sum());
        assert_eq!(restored.loss_function().info(), LossInfo::SoftMaxCrossEntropy);
        assert_eq!(restored.gradient_sum(), optimizer.gradient_sum());

        let a = optimizer.optim(0.1, 0.01).unwrap();
        let b = restored.optim(0.1, 0.01).unwrap();
        assert_eq!(a, b);
        let original = optimizer.network().unwrap().borrow().export();
        let copy = restored.network().unwrap().borrow().export();
        assert_eq!(original, copy);
    }

    #[test]
    fn import_rejects_inconsistent_accumulators() {
        let net = network(6);
        let optimizer = Optimizer::new(Box::new(SquaredError), Some(net));
        let mut state = optimizer.export().unwrap();
        state.num_steps = 3;
        assert!(Optimizer::import(state.clone()).is_err());
        state.gradient_sum = Some(vec![ParameterGradient::None]);
        assert!(Optimizer::import(state).is_err());
    }
}
