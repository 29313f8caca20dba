//! Typed collectives over [`Tensor`]s.
//!
//! The backend speaks `f64`; these helpers convert to and from the element type and
//! reassemble gathered pieces into a tensor.

use super::backend::CollectiveBackend;
use crate::tensor::{Result, Tensor, TensorElem, TensorError};

pub(crate) fn to_wire<T: TensorElem>(data: &[T]) -> Result<Vec<f64>> {
    data.iter()
        .map(|v| {
            v.to_f64().ok_or_else(|| {
                TensorError::Collective(format!("element {v:?} is not representable as f64"))
            })
        })
        .collect()
}

pub(crate) fn from_wire<T: TensorElem>(wire: &[f64]) -> Result<Vec<T>> {
    wire.iter()
        .map(|v| {
            T::from_f64(*v).ok_or_else(|| {
                TensorError::Collective(format!("wire value {v} does not fit the element type"))
            })
        })
        .collect()
}

/// Sums `tensor` across all ranks. Every rank receives the total.
pub fn all_reduce_sum_tensor<T: TensorElem, const RANK: usize>(
    backend: &dyn CollectiveBackend,
    tensor: &Tensor<T, RANK>,
) -> Result<Tensor<T, RANK>> {
    if backend.world_size() == 1 {
        return Ok(tensor.clone());
    }
    let mut wire = to_wire(tensor.data())?;
    backend.all_reduce_sum(&mut wire)?;
    Tensor::new(from_wire(&wire)?, *tensor.shape())
}

/// Gathers every rank's `tensor` and concatenates them along the last dimension in rank order.
///
/// All ranks must contribute the same shape.
pub fn all_gather_last_dim<T: TensorElem, const RANK: usize>(
    backend: &dyn CollectiveBackend,
    tensor: &Tensor<T, RANK>,
) -> Result<Tensor<T, RANK>> {
    if backend.world_size() == 1 {
        return Ok(tensor.clone());
    }
    let pieces = backend.all_gather(&to_wire(tensor.data())?)?;
    let parts = pieces
        .iter()
        .map(|p| Tensor::new(from_wire(p)?, *tensor.shape()))
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat_last(&parts)
}
