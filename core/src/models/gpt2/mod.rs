//! GPT-2 with tensor model parallelism.
//!
//! Both models share one trunk: a vocabulary-sharded word embedding, a replicated learned
//! position embedding, embedding dropout and the parallel transformer stack. They differ in the
//! head:
//!
//! * [`GPT2Model`] projects back onto the word-embedding table (tied weights), producing logits
//!   for this rank's slice of the vocabulary, gathered into the full vocabulary on request.
//! * [`GPT2Classifier`] applies a replicated `Linear -> Linear` head to every position.
//!
//! ```rust
//! use gpt2_tp::distributed::backend::SerialBackend;
//! use gpt2_tp::models::gpt2::{GPT2Config, GPT2Model};
//! use gpt2_tp::tensor::Tensor;
//! use std::sync::Arc;
//!
//! let config = GPT2Config { parallel_output: false, ..GPT2Config::tiny() };
//! let model = GPT2Model::<f32>::new(&config, Arc::new(SerialBackend)).unwrap();
//!
//! let ids = Tensor::new(vec![1, 2, 3], [1, 3]).unwrap();
//! let out = model.generate(&ids, 2, None).unwrap();
//! assert_eq!(out.shape(), &[1, 5]);
//! ```

mod classifier;
mod config;

pub use classifier::GPT2Classifier;
pub use config::{GPT2ClassifierConfig, GPT2Config};

use crate::data::get_ltor_masks_and_position_ids;
use crate::distributed::backend::CollectiveBackend;
use crate::distributed::layers::VocabParallelEmbedding;
use crate::distributed::mappings::{
    copy_to_model_parallel_region, gather_from_model_parallel_region,
};
use crate::distributed::random::{RngStream, RngTracker};
use crate::distributed::transformer::ParallelTransformer;
use crate::nn::dropout::Dropout;
use crate::nn::embedding::Embedding;
use crate::nn::init::normal;
use crate::nn::module::{Module, num_parameters};
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use tracing::{debug, info};

/// Embeddings plus transformer, shared by the language model and the classifier.
#[derive(Debug)]
pub(crate) struct GPT2Trunk<T: TensorElem> {
    pub(crate) word_embeddings: VocabParallelEmbedding<T>,
    pub(crate) position_embeddings: Embedding<T>,
    embedding_dropout: Dropout,
    pub(crate) transformer: ParallelTransformer<T>,
}

impl<T: TensorElem + Float> GPT2Trunk<T> {
    /// Draws every weight from `rng` in a fixed order, identical on all ranks.
    fn new(
        config: &GPT2Config,
        rng: &mut StdRng,
        backend: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        let init = normal(config.init_method_std);
        let word_embeddings = VocabParallelEmbedding::new(
            config.vocab_size,
            config.hidden_size,
            init,
            rng,
            backend.clone(),
        )?;
        let position_embeddings =
            Embedding::new(init.sample([config.max_sequence_length, config.hidden_size], rng)?);
        let transformer = ParallelTransformer::new(&config.transformer_config(), rng, backend)?;

        Ok(Self {
            word_embeddings,
            position_embeddings,
            embedding_dropout: Dropout::new(config.embedding_dropout_prob)?,
            transformer,
        })
    }

    fn forward(
        &self,
        input_ids: &Tensor<usize, 2>,
        position_ids: &Tensor<usize, 2>,
        attention_mask: &Tensor<T, 3>,
        mut rng: Option<&mut RngTracker>,
    ) -> Result<Tensor<T, 3>> {
        if input_ids.shape() != position_ids.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: input_ids.shape().to_vec(),
                got: position_ids.shape().to_vec(),
            });
        }

        let words = self.word_embeddings.forward(input_ids)?;
        let positions = self.position_embeddings.forward(position_ids)?;
        let embeddings = self.embedding_dropout.forward(
            (&words + &positions)?,
            rng.as_deref_mut().map(|t| t.get(RngStream::Default)),
        )?;

        self.transformer.forward(&embeddings, attention_mask, rng)
    }
}

impl<T: TensorElem> Module<T> for GPT2Trunk<T> {
    fn children(&self) -> Vec<(String, &dyn Module<T>)> {
        vec![
            (
                "word_embeddings".to_string(),
                &self.word_embeddings as &dyn Module<T>,
            ),
            (
                "position_embeddings".to_string(),
                &self.position_embeddings as &dyn Module<T>,
            ),
            ("transformer".to_string(), &self.transformer as &dyn Module<T>),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module<T>)> {
        vec![
            (
                "word_embeddings".to_string(),
                &mut self.word_embeddings as &mut dyn Module<T>,
            ),
            (
                "position_embeddings".to_string(),
                &mut self.position_embeddings as &mut dyn Module<T>,
            ),
            (
                "transformer".to_string(),
                &mut self.transformer as &mut dyn Module<T>,
            ),
        ]
    }
}

/// GPT-2 language model with a tied output projection.
#[derive(Debug)]
pub struct GPT2Model<T: TensorElem> {
    config: GPT2Config,
    trunk: GPT2Trunk<T>,
    backend: Arc<dyn CollectiveBackend>,
}

impl<T: TensorElem + Float> GPT2Model<T> {
    /// Builds this rank's shard of the model.
    ///
    /// Weights come from `config.seed`, so every world size yields the same model.
    pub fn new(config: &GPT2Config, backend: Arc<dyn CollectiveBackend>) -> Result<Self> {
        config.validate(backend.world_size())?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let trunk = GPT2Trunk::new(config, &mut rng, backend.clone())?;

        let model = Self {
            config: config.clone(),
            trunk,
            backend,
        };
        info!(
            rank = model.backend.rank(),
            world_size = model.backend.world_size(),
            vocab_per_partition = model.trunk.word_embeddings.vocab_range().len(),
            parameters = num_parameters(&model),
            "built GPT-2 model shard"
        );
        Ok(model)
    }

    pub fn config(&self) -> &GPT2Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CollectiveBackend> {
        &self.backend
    }

    /// The vocabulary-sharded word embedding, which doubles as the output projection.
    pub fn word_embeddings(&self) -> &VocabParallelEmbedding<T> {
        &self.trunk.word_embeddings
    }

    pub fn transformer(&self) -> &ParallelTransformer<T> {
        &self.trunk.transformer
    }

    /// Computes next-token logits.
    ///
    /// * `input_ids`, `position_ids`: `[b, s]`.
    /// * `attention_mask`: `[1 or b, s, s]`, 1 = visible.
    /// * `rng`: `None` evaluates without dropout.
    ///
    /// Returns `[b, s, vocab_padded / world]` when `parallel_output` is set, otherwise the
    /// gathered `[b, s, vocab_padded]`. Columns at or beyond `vocab_size` are padding.
    pub fn forward(
        &self,
        input_ids: &Tensor<usize, 2>,
        position_ids: &Tensor<usize, 2>,
        attention_mask: &Tensor<T, 3>,
        rng: Option<&mut RngTracker>,
    ) -> Result<Tensor<T, 3>> {
        let logits_parallel = self.forward_parallel(input_ids, position_ids, attention_mask, rng)?;
        if self.config.parallel_output {
            return Ok(logits_parallel);
        }
        gather_from_model_parallel_region(self.backend.as_ref(), &logits_parallel)
    }

    fn forward_parallel(
        &self,
        input_ids: &Tensor<usize, 2>,
        position_ids: &Tensor<usize, 2>,
        attention_mask: &Tensor<T, 3>,
        rng: Option<&mut RngTracker>,
    ) -> Result<Tensor<T, 3>> {
        let output = self
            .trunk
            .forward(input_ids, position_ids, attention_mask, rng)?;
        let output_parallel = copy_to_model_parallel_region(self.backend.as_ref(), &output)?;
        let logits = output_parallel.matmul_nt(&self.trunk.word_embeddings.weight)?;
        debug!(
            rank = self.backend.rank(),
            shape = ?logits.shape(),
            gather = !self.config.parallel_output,
            "lm logits"
        );
        Ok(logits)
    }

    /// Greedy decoding.
    ///
    /// Appends up to `max_new_tokens` tokens to every row of `prompt` (`[b, s]`), stopping early
    /// once every row has produced `eod` or the context reaches `max_sequence_length`. Logits
    /// are always gathered here and padded vocabulary entries are never chosen.
    ///
    /// Every rank must call this with the same prompt; all ranks return the same tokens.
    pub fn generate(
        &self,
        prompt: &Tensor<usize, 2>,
        max_new_tokens: usize,
        eod: Option<usize>,
    ) -> Result<Tensor<usize, 2>> {
        let [batch, prompt_len] = *prompt.shape();
        if prompt_len == 0 {
            return Err(TensorError::InvalidConfig(
                "generation needs a non-empty prompt".to_string(),
            ));
        }

        let vocab = self.config.vocab_size;
        let mut tokens = prompt.clone();
        let mut finished = vec![false; batch];

        for _ in 0..max_new_tokens {
            let [_, seq] = *tokens.shape();
            if seq >= self.config.max_sequence_length {
                break;
            }

            let inputs = get_ltor_masks_and_position_ids::<T>(
                &tokens,
                eod.unwrap_or(usize::MAX),
                false,
                false,
                false,
            )?;
            let logits_parallel =
                self.forward_parallel(&tokens, &inputs.position_ids, &inputs.attention_mask, None)?;
            let logits =
                gather_from_model_parallel_region(self.backend.as_ref(), &logits_parallel)?;
            let padded = logits.last_dim();

            let mut next = Vec::with_capacity(batch);
            for b in 0..batch {
                let row = &logits.data()[(b * seq + seq - 1) * padded..][..vocab];
                let best = row
                    .iter()
                    .enumerate()
                    .fold((0, T::neg_infinity()), |acc, (i, &v)| {
                        if v > acc.1 { (i, v) } else { acc }
                    })
                    .0;
                next.push(best);
            }

            let mut data = Vec::with_capacity(batch * (seq + 1));
            for (b, &token) in next.iter().enumerate() {
                data.extend_from_slice(&tokens.data()[b * seq..(b + 1) * seq]);
                data.push(token);
                if Some(token) == eod {
                    finished[b] = true;
                }
            }
            tokens = Tensor::new(data, [batch, seq + 1])?;

            if eod.is_some() && finished.iter().all(|f| *f) {
                break;
            }
        }

        Ok(tokens)
    }
}

impl<T: TensorElem> Module<T> for GPT2Model<T> {
    fn children(&self) -> Vec<(String, &dyn Module<T>)> {
        self.trunk.children()
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module<T>)> {
        self.trunk.children_mut()
    }
}
