//! Model-parallel region mappings.
//!
//! These four functions mark where activations enter and leave a model-parallel region. Only
//! their forward semantics exist here; the comment on each names the conjugate a backward pass
//! would apply.
//!
//! | function | forward | backward |
//! |----------|---------|----------|
//! | [`copy_to_model_parallel_region`] | identity | all-reduce |
//! | [`reduce_from_model_parallel_region`] | all-reduce | identity |
//! | [`scatter_to_model_parallel_region`] | split last dim | all-gather |
//! | [`gather_from_model_parallel_region`] | all-gather last dim | split |

use super::backend::CollectiveBackend;
use super::comm::{all_gather_last_dim, all_reduce_sum_tensor};
use super::utils::divide;
use crate::tensor::{Result, Tensor, TensorElem};

/// Enters a model-parallel region. The input is already replicated on every rank.
pub fn copy_to_model_parallel_region<T: TensorElem, const RANK: usize>(
    _backend: &dyn CollectiveBackend,
    input: &Tensor<T, RANK>,
) -> Result<Tensor<T, RANK>> {
    Ok(input.clone())
}

/// Leaves a model-parallel region by summing the partial results of every rank.
pub fn reduce_from_model_parallel_region<T: TensorElem, const RANK: usize>(
    backend: &dyn CollectiveBackend,
    input: &Tensor<T, RANK>,
) -> Result<Tensor<T, RANK>> {
    all_reduce_sum_tensor(backend, input)
}

/// Keeps only this rank's chunk of the last dimension.
pub fn scatter_to_model_parallel_region<T: TensorElem, const RANK: usize>(
    backend: &dyn CollectiveBackend,
    input: &Tensor<T, RANK>,
) -> Result<Tensor<T, RANK>> {
    let world = backend.world_size();
    if world == 1 {
        return Ok(input.clone());
    }
    let per = divide(input.last_dim(), world)?;
    input.narrow_last(backend.rank() * per, per)
}

/// Concatenates every rank's chunk along the last dimension, in rank order.
pub fn gather_from_model_parallel_region<T: TensorElem, const RANK: usize>(
    backend: &dyn CollectiveBackend,
    input: &Tensor<T, RANK>,
) -> Result<Tensor<T, RANK>> {
    all_gather_last_dim(backend, input)
}
