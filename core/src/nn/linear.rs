use crate::nn::module::{Module, Parameter, ParameterMut};
use crate::tensor::{Result, Tensor, TensorElem, TensorError};

/// Linear Layer: `y = xA^T + b`
///
/// The weight is stored `[out_features, in_features]` and applied to the last dimension of the
/// input, so any rank `>= 1` works: `[.., in] -> [.., out]`.
///
/// # Examples
/// ```rust
/// use gpt2_tp::nn::Linear;
/// use gpt2_tp::tensor::Tensor;
/// // Create a layer with 10 inputs and 5 outputs
/// let layer = Linear::<f32>::new(
///     Tensor::zeros([5, 10]), // Weights: [out, in]
///     Some(Tensor::zeros([5])) // Bias: [out]
/// ).unwrap();
/// let y = layer.forward(&Tensor::<f32, 3>::ones([2, 4, 10])).unwrap();
/// assert_eq!(y.shape(), &[2, 4, 5]);
/// ```
#[derive(Debug, Clone)]
pub struct Linear<T: TensorElem> {
    /// Shape: `[out_features, in_features]`
    pub weight: Tensor<T, 2>,

    /// Shape: `[out_features]`
    pub bias: Option<Tensor<T, 1>>,
}

impl<T: TensorElem> Linear<T> {
    /// Creates a new Linear layer.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the bias length differs from `out_features`.
    pub fn new(weight: Tensor<T, 2>, bias: Option<Tensor<T, 1>>) -> Result<Self> {
        if let Some(b) = &bias
            && b.shape()[0] != weight.shape()[0]
        {
            return Err(TensorError::ShapeMismatch {
                expected: vec![weight.shape()[0]],
                got: b.shape().to_vec(),
            });
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn forward<const RANK: usize>(&self, x: &Tensor<T, RANK>) -> Result<Tensor<T, RANK>> {
        let out = x.matmul_nt(&self.weight)?;
        match &self.bias {
            Some(b) => out.add_last_dim(b.data()),
            None => Ok(out),
        }
    }
}

impl<T: TensorElem> Module<T> for Linear<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        let mut params = vec![Parameter::from_tensor("weight", &self.weight)];
        if let Some(b) = &self.bias {
            params.push(Parameter::from_tensor("bias", b));
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        let mut params = vec![ParameterMut::from_tensor("weight", &mut self.weight)];
        if let Some(b) = &mut self.bias {
            params.push(ParameterMut::from_tensor("bias", b));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_new() {
        let weight = Tensor::<f32, 2>::zeros([5, 10]);
        let bias = Tensor::<f32, 1>::zeros([5]);
        let layer = Linear::new(weight, Some(bias)).unwrap();
        assert_eq!(layer.in_features(), 10);
        assert_eq!(layer.out_features(), 5);

        let err = Linear::new(Tensor::<f32, 2>::zeros([5, 10]), Some(Tensor::zeros([4])));
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_linear_forward_2d() {
        // W = [[1, 2], [3, 4], [5, 6]], b = [1, 1, 1], x = [1, 1]
        let weight = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [3, 2]).unwrap();
        let bias = Tensor::new(vec![1.0, 1.0, 1.0], [3]).unwrap();
        let layer = Linear::<f32>::new(weight, Some(bias)).unwrap();
        let x = Tensor::new(vec![1.0, 1.0], [1, 2]).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.data(), &[4.0, 8.0, 12.0]);
    }

    #[test]
    fn test_linear_forward_3d_no_bias() {
        let layer = Linear::<f32>::new(Tensor::ones([2, 3]), None).unwrap();
        let x = Tensor::<f32, 3>::ones([2, 2, 3]);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 2, 2]);
        assert!(y.data().iter().all(|v| *v == 3.0));
    }

    #[test]
    fn test_linear_parameters() {
        let layer = Linear::<f32>::new(Tensor::ones([2, 3]), Some(Tensor::zeros([2]))).unwrap();
        let names: Vec<_> = layer.parameters().iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["weight", "bias"]);
    }
}
