//! Activation Functions.
//!
//! GPT-2 uses GELU in its feed-forward block, in the tanh approximation.

use crate::tensor::{Tensor, TensorElem};
use num_traits::Float;

/// Activation functions namespace.
pub struct Activation;

impl Activation {
    /// Applies the GELU activation function element-wise to a tensor.
    pub fn gelu<const RANK: usize, T: TensorElem + Float>(x: &Tensor<T, RANK>) -> Tensor<T, RANK> {
        x.map(gelu)
    }
}

/// Computes the GELU (Gaussian Error Linear Unit) activation function.
///
/// $$ \text{GELU}(x) \approx 0.5 x (1 + \tanh[\sqrt{2/\pi} (x + 0.044715 x^3)]) $$
pub fn gelu<T: TensorElem + Float>(x: T) -> T {
    let half = T::from_f64(0.5).unwrap_or_else(T::zero);
    let c = T::from_f64(0.044715).unwrap_or_else(T::zero);
    let sqrt_2_over_pi =
        T::from_f64((2.0 / std::f64::consts::PI).sqrt()).unwrap_or_else(T::zero);

    let inner = sqrt_2_over_pi * (x + c * x * x * x);
    half * x * (T::one() + inner.tanh())
}
