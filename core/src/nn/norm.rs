use crate::nn::module::{Module, ModuleKind, Parameter, ParameterMut};
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;

/// Layer Normalization over the last dimension.
///
/// Formula: `y = (x - mean) / sqrt(var + eps) * gamma + beta`
#[derive(Debug, Clone)]
pub struct LayerNorm<T: TensorElem> {
    pub weight: Tensor<T, 1>,
    pub bias: Tensor<T, 1>,
    pub eps: T,
}

impl<T: TensorElem + Float> LayerNorm<T> {
    /// Creates a new LayerNorm layer.
    ///
    /// # Arguments
    ///
    /// * `weight` - The scale weights (gamma) of shape `[features]`.
    /// * `bias` - The shift weights (beta) of shape `[features]`.
    /// * `eps` - A small constant for numerical stability.
    pub fn new(weight: Tensor<T, 1>, bias: Tensor<T, 1>, eps: T) -> Self {
        Self { weight, bias, eps }
    }

    /// `gamma = 1`, `beta = 0`.
    pub fn with_features(features: usize, eps: T) -> Self {
        Self::new(Tensor::ones([features]), Tensor::zeros([features]), eps)
    }

    pub fn forward<const RANK: usize>(&self, x: &Tensor<T, RANK>) -> Result<Tensor<T, RANK>> {
        let last_dim = x.last_dim();
        if last_dim != self.weight.shape()[0] || last_dim != self.bias.shape()[0] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![last_dim, last_dim],
                got: vec![self.weight.shape()[0], self.bias.shape()[0]],
            });
        }

        let out = gpt2_tp_kernels::cpu_layer_norm_rows(
            x.data(),
            self.weight.data(),
            self.bias.data(),
            self.eps,
        )?;
        Tensor::new(out, *x.shape())
    }
}

impl<T: TensorElem> Module<T> for LayerNorm<T> {
    fn kind(&self) -> ModuleKind {
        ModuleKind::LayerNorm
    }

    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        vec![
            Parameter::from_tensor("weight", &self.weight),
            Parameter::from_tensor("bias", &self.bias),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        vec![
            ParameterMut::from_tensor("weight", &mut self.weight),
            ParameterMut::from_tensor("bias", &mut self.bias),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layernorm_forward() {
        // Mean 2, var 2/3: [-1.2247, 0.0, 1.2247]
        let input = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
        let norm = LayerNorm::with_features(3, 1e-5);

        let output = norm.forward(&input).unwrap();

        let std = (2.0f32 / 3.0 + 1e-5).sqrt();
        let expected = [-1.0 / std, 0.0, 1.0 / std];
        for (got, exp) in output.data().iter().zip(expected.iter()) {
            assert!((got - exp).abs() < 1e-4);
        }
    }

    #[test]
    fn test_layernorm_affine() {
        let input = Tensor::<f32, 2>::new(vec![1.0, 3.0, 5.0, 5.0], [2, 2]).unwrap();
        let weight = Tensor::new(vec![2.0, 2.0], [2]).unwrap();
        let bias = Tensor::new(vec![0.5, 0.5], [2]).unwrap();
        let norm = LayerNorm::new(weight, bias, 0.0);
        let out = norm.forward(&input).unwrap();
        // Row 0 normalises to [-1, 1]; row 1 has zero variance and eps 0 so only check row 0.
        assert!((out.data()[0] + 1.5).abs() < 1e-5);
        assert!((out.data()[1] - 2.5).abs() < 1e-5);
    }

    #[test]
    fn test_layernorm_shape_mismatch() {
        let norm = LayerNorm::<f32>::with_features(4, 1e-5);
        let input = Tensor::<f32, 2>::zeros([2, 3]);
        assert!(norm.forward(&input).is_err());
    }

    #[test]
    fn test_layernorm_kind() {
        let norm = LayerNorm::<f32>::with_features(4, 1e-5);
        assert_eq!(norm.kind(), ModuleKind::LayerNorm);
    }
}
