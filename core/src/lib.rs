//! # gpt2-tp
//!
//! `gpt2-tp` is a pure Rust, CPU-only GPT-2 with Megatron-style tensor (model) parallelism.
//!
//! Every rank builds the same master weights from a shared seed and keeps its own partition, so a
//! model split across `N` ranks computes the same logits as the unsplit one.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: N-dimensional CPU tensor and its error type.
//! - [`nn`]: replicated layers (linear, layer norm, embedding, dropout) and the [`nn::Module`] tree.
//! - [`distributed`]: collectives, model-parallel layers and the parallel transformer.
//! - [`models`]: the GPT-2 language model and sequence classifier.
//! - [`data`]: attention masks and position ids for packed batches.
//! - [`optim`]: weight-decay parameter groups and AdamW.
//! - [`checkpoint`]: per-rank `safetensors` shards.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use gpt2_tp::data::get_ltor_masks_and_position_ids;
//! use gpt2_tp::distributed::SerialBackend;
//! use gpt2_tp::models::gpt2::{GPT2Config, GPT2Model};
//! use gpt2_tp::tensor::Tensor;
//!
//! let config = GPT2Config::tiny();
//! let model = GPT2Model::<f32>::new(&config, Arc::new(SerialBackend)).unwrap();
//!
//! let tokens = Tensor::new(vec![1, 2, 3, 4], [1, 4]).unwrap();
//! let inputs = get_ltor_masks_and_position_ids::<f32>(&tokens, 0, false, false, false).unwrap();
//! let logits = model
//!     .forward(&tokens, &inputs.position_ids, &inputs.attention_mask, None)
//!     .unwrap();
//! assert_eq!(logits.shape()[..2], [1, 4]);
//! ```

pub mod checkpoint;
pub mod data;
pub mod distributed;
pub mod models;
pub mod nn;
pub mod optim;
pub mod tensor;

pub use tensor::{Tensor, TensorElem, TensorError};
