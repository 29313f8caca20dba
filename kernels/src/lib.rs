//! # gpt2-tp-kernels
//!
//! Slice-level CPU kernels used by the `gpt2-tp` tensor type.
//!
//! Kernels work on flat, row-major buffers plus a shape. They know nothing about
//! tensors, ranks or sharding, which keeps them swappable for BLAS-backed versions.
//! Every kernel is parallelised over rows with `rayon`.

use num_traits::{Float, FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_layer_norm;
pub mod cpu_matmul;
pub mod cpu_softmax;
pub mod cpu_transpose;

pub use cpu_layer_norm::cpu_layer_norm_rows;
pub use cpu_matmul::{cpu_matmul, cpu_matmul_nt};
pub use cpu_softmax::cpu_softmax_rows;
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Trait bound for elements that can be processed by kernels.
/// This mirrors `TensorElem` in the main crate to avoid circular dependencies.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// Floating point elements, required by the normalisation kernels.
pub trait FloatElem: KernelElem + Float {}

impl<T> FloatElem for T where T: KernelElem + Float {}
