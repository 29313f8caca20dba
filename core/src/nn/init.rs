//! Seeded weight initialisers.
//!
//! Every rank builds the same full ("master") weight from the same `StdRng` and keeps its own
//! partition, so the values never depend on the world size.

use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// How a weight is initialised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// `N(0, std^2)`.
    Normal { std: f64 },
    /// `N(0, (std / sqrt(2 * num_layers))^2)`, used for the projections that feed residuals.
    ScaledNormal { std: f64, num_layers: usize },
}

pub fn normal(std: f64) -> Init {
    Init::Normal { std }
}

pub fn scaled_normal(std: f64, num_layers: usize) -> Init {
    Init::ScaledNormal { std, num_layers }
}

impl Init {
    pub fn std(&self) -> f64 {
        match *self {
            Init::Normal { std } => std,
            Init::ScaledNormal { std, num_layers } => std / (2.0 * num_layers as f64).sqrt(),
        }
    }

    /// Draws a tensor of `shape` from this distribution.
    pub fn sample<T: TensorElem, const RANK: usize>(
        &self,
        shape: [usize; RANK],
        rng: &mut StdRng,
    ) -> Result<Tensor<T, RANK>> {
        let std = self.std();
        if !std.is_finite() || std < 0.0 {
            return Err(TensorError::InvalidConfig(format!(
                "init std {std} must be finite and non-negative"
            )));
        }
        let dist = Normal::new(0.0, std)
            .map_err(|e| TensorError::InvalidConfig(format!("init std {std}: {e}")))?;
        let size: usize = shape.iter().product();
        let data = (0..size)
            .map(|_| {
                let v: f64 = dist.sample(rng);
                T::from_f64(v).ok_or_else(|| {
                    TensorError::Unsupported(format!("init value {v} not representable"))
                })
            })
            .collect::<Result<Vec<T>>>()?;
        Tensor::new(data, shape)
    }
}
