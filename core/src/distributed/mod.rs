//! # Tensor (Model) Parallelism
//!
//! This is where a single GPT-2 is split across several ranks.
//!
//! ## 🎓 The idea
//!
//! A transformer spends nearly all of its time in matrix multiplications. Tensor parallelism cuts
//! each weight matrix into slices, gives one slice to each rank, and stitches the partial results
//! back together with collective operations:
//!
//! *   A **column-parallel** linear layer splits the output features. Each rank computes a slice
//!     of the output.
//! *   A **row-parallel** linear layer splits the input features. Each rank computes a partial
//!     sum, and an **all-reduce** adds them up.
//! *   A **vocabulary-parallel** embedding splits the vocabulary. A rank only knows its own rows,
//!     so it writes zeros for foreign tokens and an all-reduce fills in the rest.
//!
//! Pairing a column-parallel layer with a row-parallel one (attention, MLP) needs exactly one
//! all-reduce per block in the forward pass.
//!
//! ## 📦 Module Contents
//!
//! *   [`CollectiveBackend`](backend::CollectiveBackend): the communication interface.
//!     *   [`SerialBackend`](backend::SerialBackend): a world of one.
//!     *   [`CpuBackend`](cpu_backend::CpuBackend): ring all-reduce and all-gather between threads.
//! *   [`mappings`]: copy, reduce, scatter and gather across the model-parallel region.
//! *   [`layers`]: the parallel embedding and linear layers.
//! *   [`transformer`]: self-attention, MLP and the layer stack built from them.
//! *   [`random`]: per-rank dropout streams.
//!
//! ## 🚀 Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use gpt2_tp::distributed::{CollectiveBackend, CpuBackend};
//!
//! let handles: Vec<_> = CpuBackend::ring(2)
//!     .into_iter()
//!     .map(|backend| {
//!         std::thread::spawn(move || {
//!             let mut buf = vec![backend.rank() as f64 + 1.0; 4];
//!             backend.all_reduce_sum(&mut buf).unwrap();
//!             buf
//!         })
//!     })
//!     .collect();
//! for h in handles {
//!     assert_eq!(h.join().unwrap(), vec![3.0; 4]);
//! }
//! ```

pub mod backend;
pub mod comm;
pub mod cpu_backend;
pub mod layers;
pub mod mappings;
pub mod random;
pub mod transformer;
pub mod utils;

pub use backend::{CollectiveBackend, SerialBackend};
pub use cpu_backend::CpuBackend;
pub use layers::{ColumnParallelLinear, RowParallelLinear, VocabParallelEmbedding};
pub use random::{RngStream, RngTracker};
pub use transformer::{ParallelTransformer, ParallelTransformerConfig};
