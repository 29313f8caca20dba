//! Model-parallel layers.
//!
//! Each layer is built from a full "master" weight that every rank draws identically from the
//! same seeded RNG; the rank then keeps only its partition. A model split `N` ways therefore
//! holds exactly the numbers the serial model holds, just distributed.
//!
//! # Column vs Row parallelism
//!
//! For `Y = X A^T` with `A: [out, in]`:
//!
//! * **Column**: `A` is split along `out`. Each rank computes `Y_i = X A_i^T`, a slice of the
//!   output features. Gathering the slices gives `Y`.
//! * **Row**: `A` is split along `in` and `X` along its last dimension. Each rank computes a
//!   partial `Y_i = X_i A_i^T` and the partials are summed: `Y = sum_i Y_i`.
//!
//! A column-parallel layer followed by a row-parallel one (the MLP, attention) therefore needs a
//! single all-reduce, after the second layer.

use super::backend::CollectiveBackend;
use super::mappings::{
    copy_to_model_parallel_region, gather_from_model_parallel_region,
    reduce_from_model_parallel_region, scatter_to_model_parallel_region,
};
use super::utils::{VocabUtility, divide, pad_vocab_size};
use crate::nn::init::Init;
use crate::nn::module::{Module, Parameter, ParameterMut};
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;

/// Embedding table split along the vocabulary dimension.
///
/// Rank `r` holds rows `[r * per, (r + 1) * per)` of the (padded) table. A lookup zeroes the rows
/// for ids owned by other ranks and all-reduces, so every rank ends up with the full embedding.
#[derive(Debug)]
pub struct VocabParallelEmbedding<T: TensorElem> {
    num_embeddings: usize,
    padded_num_embeddings: usize,
    embedding_dim: usize,
    vocab_range: Range<usize>,
    /// Shape: `[padded_num_embeddings / world, embedding_dim]`
    pub weight: Tensor<T, 2>,
    backend: Arc<dyn CollectiveBackend>,
}

impl<T: TensorElem> VocabParallelEmbedding<T> {
    /// Draws a `[num_embeddings, embedding_dim]` master table from `rng` and keeps this rank's
    /// rows. The table is padded with zero rows until it divides the world size.
    pub fn new(
        num_embeddings: usize,
        embedding_dim: usize,
        init: Init,
        rng: &mut StdRng,
        backend: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        let master: Tensor<T, 2> = init.sample([num_embeddings, embedding_dim], rng)?;
        Self::from_master(&master, backend)
    }

    /// Partitions an existing `[num_embeddings, embedding_dim]` table.
    pub fn from_master(master: &Tensor<T, 2>, backend: Arc<dyn CollectiveBackend>) -> Result<Self> {
        let [num_embeddings, embedding_dim] = *master.shape();
        let world = backend.world_size();
        let padded_num_embeddings = pad_vocab_size(num_embeddings, world, 1);
        let vocab_range = VocabUtility::vocab_range_from_global_vocab_size(
            padded_num_embeddings,
            backend.rank(),
            world,
        )?;

        let per = vocab_range.len();
        let mut data = vec![T::zero(); per * embedding_dim];
        let real_end = vocab_range.end.min(num_embeddings);
        if real_end > vocab_range.start {
            let rows = master.narrow_first(vocab_range.start, real_end - vocab_range.start)?;
            data[..rows.size()].copy_from_slice(rows.data());
        }

        Ok(Self {
            num_embeddings,
            padded_num_embeddings,
            embedding_dim,
            vocab_range,
            weight: Tensor::new(data, [per, embedding_dim])?,
            backend,
        })
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    /// Rows of the table across all ranks, including padding.
    pub fn padded_num_embeddings(&self) -> usize {
        self.padded_num_embeddings
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// The token ids whose rows live on this rank.
    pub fn vocab_range(&self) -> Range<usize> {
        self.vocab_range.clone()
    }

    /// Looks up `[batch, seq]` ids, returning the full `[batch, seq, dim]` embedding on every rank.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` for an id `>= num_embeddings`.
    pub fn forward(&self, input: &Tensor<usize, 2>) -> Result<Tensor<T, 3>> {
        let [batch, seq] = *input.shape();
        if let Some(&bad) = input.data().iter().find(|&&id| id >= self.num_embeddings) {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![bad],
                shape: vec![self.num_embeddings, self.embedding_dim],
            });
        }

        let dim = self.embedding_dim;
        let owned = self.vocab_range.clone();
        let start = owned.start;
        let mut out = Tensor::zeros([batch, seq, dim]);
        if dim > 0 {
            let weight = self.weight.data();
            out.data_mut()
                .par_chunks_mut(dim)
                .zip(input.data().par_iter())
                .for_each(|(row, &id)| {
                    // Ids owned by another rank stay zero.
                    if owned.contains(&id) {
                        let local = id - start;
                        row.copy_from_slice(&weight[local * dim..(local + 1) * dim]);
                    }
                });
        }

        reduce_from_model_parallel_region(self.backend.as_ref(), &out)
    }
}

impl<T: TensorElem> Module<T> for VocabParallelEmbedding<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        vec![Parameter::from_tensor("weight", &self.weight)]
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        vec![ParameterMut::from_tensor("weight", &mut self.weight)]
    }
}

/// Rows of `master` (`[out, in]`) that belong to `rank` when the output dimension is split into
/// `world * stride` blocks and rank `r` takes blocks `r, r + world, r + 2 * world, ...`.
///
/// A stride of 3 keeps the query, key and value rows of the same heads together on one rank.
fn column_partition<T: TensorElem>(
    master: &Tensor<T, 2>,
    rank: usize,
    world: usize,
    stride: usize,
) -> Result<Tensor<T, 2>> {
    let [out, input] = *master.shape();
    let block = divide(out, world * stride.max(1))?;
    let mut data = Vec::with_capacity(block * stride * input);
    for s in 0..stride.max(1) {
        let rows = master.narrow_first((s * world + rank) * block, block)?;
        data.extend_from_slice(rows.data());
    }
    Tensor::new(data, [block * stride.max(1), input])
}

/// Linear layer `Y = X A^T + b` with `A` split along its output dimension.
#[derive(Debug)]
pub struct ColumnParallelLinear<T: TensorElem> {
    input_size: usize,
    output_size: usize,
    gather_output: bool,
    stride: usize,
    /// Shape: `[output_size / world, input_size]`
    pub weight: Tensor<T, 2>,
    /// Shape: `[output_size / world]`
    pub bias: Option<Tensor<T, 1>>,
    backend: Arc<dyn CollectiveBackend>,
}

impl<T: TensorElem> ColumnParallelLinear<T> {
    /// Draws a `[output_size, input_size]` master weight and keeps this rank's rows.
    /// The bias, when present, starts at zero.
    pub fn new(
        input_size: usize,
        output_size: usize,
        bias: bool,
        gather_output: bool,
        init: Init,
        rng: &mut StdRng,
        backend: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        let master: Tensor<T, 2> = init.sample([output_size, input_size], rng)?;
        Self::from_master(&master, bias, gather_output, 1, backend)
    }

    /// Partitions an existing master weight, taking `stride` interleaved blocks per rank.
    pub fn from_master(
        master: &Tensor<T, 2>,
        bias: bool,
        gather_output: bool,
        stride: usize,
        backend: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        let [output_size, input_size] = *master.shape();
        let weight = column_partition(master, backend.rank(), backend.world_size(), stride)?;
        let per = weight.shape()[0];
        Ok(Self {
            input_size,
            output_size,
            gather_output,
            stride: stride.max(1),
            weight,
            bias: bias.then(|| Tensor::zeros([per])),
            backend,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn output_size_per_partition(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn gather_output(&self) -> bool {
        self.gather_output
    }

    /// `[.., input_size] -> [.., output_size / world]`, or `[.., output_size]` when gathering.
    pub fn forward<const RANK: usize>(&self, x: &Tensor<T, RANK>) -> Result<Tensor<T, RANK>> {
        let input_parallel = copy_to_model_parallel_region(self.backend.as_ref(), x)?;
        let mut out = input_parallel.matmul_nt(&self.weight)?;
        if let Some(b) = &self.bias {
            out = out.add_last_dim(b.data())?;
        }
        if self.gather_output {
            gather_from_model_parallel_region(self.backend.as_ref(), &out)
        } else {
            Ok(out)
        }
    }
}

impl<T: TensorElem> Module<T> for ColumnParallelLinear<T> {
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

/// Linear layer `Y = X A^T + b` with `A` split along its input dimension.
///
/// The bias is replicated and added once, after the partial products are summed.
#[derive(Debug)]
pub struct RowParallelLinear<T: TensorElem> {
    input_size: usize,
    output_size: usize,
    input_is_parallel: bool,
    /// Shape: `[output_size, input_size / world]`
    pub weight: Tensor<T, 2>,
    /// Shape: `[output_size]`
    pub bias: Option<Tensor<T, 1>>,
    backend: Arc<dyn CollectiveBackend>,
}

impl<T: TensorElem> RowParallelLinear<T> {
    pub fn new(
        input_size: usize,
        output_size: usize,
        bias: bool,
        input_is_parallel: bool,
        init: Init,
        rng: &mut StdRng,
        backend: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        let master: Tensor<T, 2> = init.sample([output_size, input_size], rng)?;
        Self::from_master(&master, bias, input_is_parallel, backend)
    }

    pub fn from_master(
        master: &Tensor<T, 2>,
        bias: bool,
        input_is_parallel: bool,
        backend: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        let [output_size, input_size] = *master.shape();
        let per = divide(input_size, backend.world_size())?;
        let weight = master.narrow_last(backend.rank() * per, per)?;
        Ok(Self {
            input_size,
            output_size,
            input_is_parallel,
            weight,
            bias: bias.then(|| Tensor::zeros([output_size])),
            backend,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    pub fn input_size_per_partition(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn input_is_parallel(&self) -> bool {
        self.input_is_parallel
    }

    /// `[.., input_size / world] -> [.., output_size]` (or `[.., input_size]` input when the
    /// layer scatters it itself).
    pub fn forward<const RANK: usize>(&self, x: &Tensor<T, RANK>) -> Result<Tensor<T, RANK>> {
        let backend = self.backend.as_ref();
        let input_parallel = if self.input_is_parallel {
            x.clone()
        } else {
            scatter_to_model_parallel_region(backend, x)?
        };
        let partial = input_parallel.matmul_nt(&self.weight)?;
        let out = reduce_from_model_parallel_region(backend, &partial)?;
        match &self.bias {
            Some(b) => out.add_last_dim(b.data()),
            None => Ok(out),
        }
    }
}

impl<T: TensorElem> Module<T> for RowParallelLinear<T> {
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
