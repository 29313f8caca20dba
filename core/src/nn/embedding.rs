use crate::nn::module::{Module, Parameter, ParameterMut};
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use rayon::prelude::*;

/// A replicated lookup table: `[num_embeddings, dim]`.
#[derive(Debug, Clone)]
pub struct Embedding<T: TensorElem> {
    pub weight: Tensor<T, 2>,
}

impl<T: TensorElem> Embedding<T> {
    pub fn new(weight: Tensor<T, 2>) -> Self {
        Self { weight }
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn embedding_dim(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Looks up `[batch, seq]` ids, returning `[batch, seq, dim]`.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` for an id `>= num_embeddings`.
    pub fn forward(&self, input: &Tensor<usize, 2>) -> Result<Tensor<T, 3>> {
        let [batch_size, seq_len] = *input.shape();
        let [vocab_size, hidden_dim] = *self.weight.shape();

        if let Some(&bad) = input.data().iter().find(|&&id| id >= vocab_size) {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![bad],
                shape: vec![vocab_size, hidden_dim],
            });
        }

        let mut out = Tensor::zeros([batch_size, seq_len, hidden_dim]);
        if hidden_dim == 0 {
            return Ok(out);
        }
        let weight_data = self.weight.data();
        out.data_mut()
            .par_chunks_mut(hidden_dim)
            .zip(input.data().par_iter())
            .for_each(|(row, &id)| {
                row.copy_from_slice(&weight_data[id * hidden_dim..(id + 1) * hidden_dim]);
            });

        Ok(out)
    }
}

impl<T: TensorElem> Module<T> for Embedding<T> {
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        vec![Parameter::from_tensor("weight", &self.weight)]
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        vec![ParameterMut::from_tensor("weight", &mut self.weight)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_lookup() {
        let weight = Tensor::<f32, 2>::from_fn([4, 2], |i| i as f32);
        let emb = Embedding::new(weight);
        let ids = Tensor::new(vec![3, 0, 1], [1, 3]).unwrap();
        let out = emb.forward(&ids).unwrap();
        assert_eq!(out.shape(), &[1, 3, 2]);
        assert_eq!(out.data(), &[6.0, 7.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_embedding_out_of_range() {
        let emb = Embedding::new(Tensor::<f32, 2>::zeros([4, 2]));
        let ids = Tensor::new(vec![4], [1, 1]).unwrap();
        assert!(matches!(
            emb.forward(&ids),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }
}
