use super::ParamGroup;
use crate::nn::module::{Module, named_parameters, visit_parameters_mut};
use crate::tensor::{Result, TensorElem, TensorError};
use num_traits::Float;
use std::collections::HashMap;
use tracing::debug;

/// AdamW optimizer.
///
/// Implements Adam algorithm with Weight Decay fix as described in [Decoupled Weight Decay Regularization](https://arxiv.org/abs/1711.05101).
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \hat{m}_t = m_t / (1 - \beta_1^t) \\
/// & \hat{v}_t = v_t / (1 - \beta_2^t) \\
/// & \theta_t = \theta_{t-1} - \eta (\hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon) + \lambda \theta_{t-1})
/// \end{aligned}
/// $$
///
/// Moments are kept per fully qualified parameter name, so one optimizer serves one rank's shard.
#[derive(Debug, Clone)]
pub struct AdamW<T: TensorElem> {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// name -> (m, v, step)
    state: HashMap<String, (Vec<T>, Vec<T>, u64)>,
}

fn cast<T: TensorElem>(v: f64) -> Result<T> {
    T::from_f64(v)
        .ok_or_else(|| TensorError::Unsupported(format!("{v} not representable in element type")))
}

impl<T: TensorElem + Float> AdamW<T> {
    /// Creates an optimizer with `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-8` and
    /// `weight_decay = 0.01`.
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            state: HashMap::new(),
        }
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Number of steps taken for `name`, 0 if it was never updated.
    pub fn step_count(&self, name: &str) -> u64 {
        self.state.get(name).map_or(0, |(_, _, step)| *step)
    }

    /// Updates every parameter of `model` that is named in one of `groups`.
    ///
    /// A parameter without an entry in `grads` is left untouched. A group's `weight_decay`
    /// overrides the optimizer's.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when a gradient's length differs from its parameter's.
    pub fn step(
        &mut self,
        model: &mut dyn Module<T>,
        grads: &HashMap<String, Vec<T>>,
        groups: &[ParamGroup],
    ) -> Result<()> {
        let mut decay_for: HashMap<&str, f64> = HashMap::new();
        for group in groups {
            let wd = group.weight_decay.unwrap_or(self.weight_decay);
            for name in &group.names {
                decay_for.insert(name.as_str(), wd);
            }
        }

        // Check every gradient up front so a bad one leaves the model and state untouched.
        for (name, p) in named_parameters(&*model) {
            if !decay_for.contains_key(name.as_str()) {
                continue;
            }
            match grads.get(&name) {
                Some(grad) if grad.len() != p.data.len() => {
                    return Err(TensorError::ShapeMismatch {
                        expected: p.shape,
                        got: vec![grad.len()],
                    });
                }
                _ => {}
            }
        }

        let mut first_err = None;
        let mut updated = 0usize;
        visit_parameters_mut(model, &mut |name, param| {
            if first_err.is_some() {
                return;
            }
            let (Some(wd), Some(grad)) = (decay_for.get(name), grads.get(name)) else {
                return;
            };
            match self.update(name, param.data, grad, *wd) {
                Ok(()) => updated += 1,
                Err(e) => first_err = Some(e),
            }
        });
        if let Some(e) = first_err {
            return Err(e);
        }
        debug!(updated, "adamw step");
        Ok(())
    }

    fn update(&mut self, name: &str, param: &mut [T], grad: &[T], weight_decay: f64) -> Result<()> {
        if param.len() != grad.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![param.len()],
                got: vec![grad.len()],
            });
        }

        let next = self.step_count(name) + 1;
        let t = i32::try_from(next).unwrap_or(i32::MAX);

        let lr: T = cast(self.learning_rate)?;
        let b1: T = cast(self.beta1)?;
        let b2: T = cast(self.beta2)?;
        let eps: T = cast(self.epsilon)?;
        let lambda: T = cast(weight_decay)?;
        let bias_correction1: T = cast(1.0 - self.beta1.powi(t))?;
        let bias_correction2: T = cast(1.0 - self.beta2.powi(t))?;
        let one = T::one();

        let (m, v, step) = self
            .state
            .entry(name.to_string())
            .or_insert_with(|| (vec![T::zero(); param.len()], vec![T::zero(); param.len()], 0));
        *step = next;

        for (((p, g), m), v) in param.iter_mut().zip(grad).zip(m.iter_mut()).zip(v.iter_mut()) {
            *m = b1 * *m + (one - b1) * *g;
            *v = b2 * *v + (one - b2) * *g * *g;
            let m_hat = *m / bias_correction1;
            let v_hat = *v / bias_correction2;
            *p = *p - lr * (m_hat / (v_hat.sqrt() + eps) + lambda * *p);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::linear::Linear;
    use crate::tensor::Tensor;

    fn layer() -> Linear<f32> {
        Linear::new(
            Tensor::new(vec![1.0, 1.0], [1, 2]).unwrap(),
            Some(Tensor::new(vec![1.0], [1]).unwrap()),
        )
        .unwrap()
    }

    fn grads() -> HashMap<String, Vec<f32>> {
        HashMap::from([
            ("weight".to_string(), vec![0.1, 0.1]),
            ("bias".to_string(), vec![0.1]),
        ])
    }

    #[test]
    fn test_adamw_new() {
        let adam = AdamW::<f32>::new(0.001);
        assert_eq!(adam.learning_rate, 0.001);
        assert_eq!(adam.beta1, 0.9);
        assert_eq!(adam.weight_decay, 0.01);
    }

    #[test]
    fn test_adamw_first_step() {
        let mut adam = AdamW::<f32>::new(0.1).with_weight_decay(0.0);
        let mut model = layer();
        let groups = [ParamGroup {
            names: vec!["weight".to_string(), "bias".to_string()],
            weight_decay: None,
        }];
        adam.step(&mut model, &grads(), &groups).unwrap();

        // m_hat = 0.1, v_hat = 0.01, so p = 1.0 - 0.1 * (0.1 / 0.1) = 0.9
        for p in model.weight.data() {
            assert!((p - 0.9).abs() < 1e-5, "p={p}");
        }
        assert_eq!(adam.step_count("weight"), 1);

        adam.step(&mut model, &grads(), &groups).unwrap();
        assert_eq!(adam.step_count("weight"), 2);
    }

    #[test]
    fn test_group_weight_decay_override() {
        let mut adam = AdamW::<f32>::new(0.1).with_weight_decay(0.5);
        let mut model = layer();
        let groups = [
            ParamGroup {
                names: vec!["weight".to_string()],
                weight_decay: None,
            },
            ParamGroup {
                names: vec!["bias".to_string()],
                weight_decay: Some(0.0),
            },
        ];
        adam.step(&mut model, &grads(), &groups).unwrap();

        let bias = model.bias.as_ref().unwrap().data()[0];
        assert!((bias - 0.9).abs() < 1e-5);
        // Decayed: 1.0 - 0.1 * (1.0 + 0.5 * 1.0) = 0.85
        assert!((model.weight.data()[0] - 0.85).abs() < 1e-5);
    }

    #[test]
    fn test_missing_grad_or_group_skips_parameter() {
        let mut adam = AdamW::<f32>::new(0.1);
        let mut model = layer();
        let only_weight = HashMap::from([("weight".to_string(), vec![0.1, 0.1])]);
        let groups = [ParamGroup {
            names: vec!["weight".to_string(), "bias".to_string()],
            weight_decay: None,
        }];
        adam.step(&mut model, &only_weight, &groups).unwrap();
        assert_eq!(model.bias.as_ref().unwrap().data(), &[1.0]);
        assert_eq!(adam.step_count("bias"), 0);

        let ungrouped = [ParamGroup {
            names: vec!["bias".to_string()],
            weight_decay: None,
        }];
        adam.step(&mut model, &grads(), &ungrouped).unwrap();
        assert_eq!(adam.step_count("weight"), 1);
        assert_eq!(adam.step_count("bias"), 1);
    }

    #[test]
    fn test_gradient_length_mismatch() {
        let mut adam = AdamW::<f32>::new(0.1);
        let mut model = layer();
        let bad = HashMap::from([("weight".to_string(), vec![0.1])]);
        let groups = [ParamGroup {
            names: vec!["weight".to_string()],
            weight_decay: None,
        }];
        assert!(matches!(
            adam.step(&mut model, &bad, &groups),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejected_step_changes_nothing() {
        let mut adam = AdamW::<f32>::new(0.1);
        let mut model = layer();
        // "weight" is fine, "bias" has one value too many.
        let bad = HashMap::from([
            ("weight".to_string(), vec![0.1, 0.1]),
            ("bias".to_string(), vec![0.1, 0.1]),
        ]);
        let groups = [ParamGroup {
            names: vec!["weight".to_string(), "bias".to_string()],
            weight_decay: None,
        }];
        assert!(matches!(
            adam.step(&mut model, &bad, &groups),
            Err(TensorError::ShapeMismatch { .. })
        ));
        assert_eq!(model.weight.data(), &[1.0, 1.0]);
        assert_eq!(model.bias.as_ref().unwrap().data(), &[1.0]);
        assert_eq!(adam.step_count("weight"), 0);
        assert_eq!(adam.step_count("bias"), 0);
    }
}
