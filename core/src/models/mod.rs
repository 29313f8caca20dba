//! Model architectures built from the model-parallel layers.
//!
//! - **GPT-2**: language model and sequence classifier. See [`gpt2`].

pub mod gpt2;
