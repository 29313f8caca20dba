use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use rand::Rng;
use rand::rngs::StdRng;

/// Inverted dropout.
///
/// With an RNG each element is kept with probability `1 - p` and scaled by `1 / (1 - p)`;
/// without one (evaluation) the input passes through unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    p: f64,
}

impl Dropout {
    /// # Errors
    ///
    /// Returns `TensorError::InvalidConfig` unless `0 <= p < 1`.
    pub fn new(p: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(TensorError::InvalidConfig(format!(
                "dropout probability {p} outside [0, 1)"
            )));
        }
        Ok(Self { p })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn forward<T: TensorElem, const RANK: usize>(
        &self,
        x: Tensor<T, RANK>,
        rng: Option<&mut StdRng>,
    ) -> Result<Tensor<T, RANK>> {
        let Some(rng) = rng else {
            return Ok(x);
        };
        if self.p == 0.0 {
            return Ok(x);
        }

        let scale = T::from_f64(1.0 / (1.0 - self.p)).ok_or_else(|| {
            TensorError::Unsupported("dropout scale not representable".to_string())
        })?;
        let mut x = x;
        // Sequential so the mask depends only on the seed.
        for v in x.data_mut() {
            if rng.random::<f64>() < self.p {
                *v = T::zero();
            } else {
                *v *= scale;
            }
        }
        Ok(x)
    }
}
