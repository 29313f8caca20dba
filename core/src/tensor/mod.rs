//! Core Tensor implementation.
//!
//! A `Tensor<T, RANK>` is a dense, row-major, CPU-resident N-dimensional array. The rank is a
//! const generic so that layer signatures document their expected layout
//! (`[batch, seq, hidden]` is `Tensor<T, 3>`), while the individual dimension sizes stay
//! dynamic so that batch size and sequence length can vary between calls.
//!
//! ```rust
//! use gpt2_tp::tensor::Tensor;
//!
//! let tensor = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! ```
//!
//! Besides the usual arithmetic, this module carries the slicing primitives the model-parallel
//! layers are built from: [`Tensor::narrow_last`], [`Tensor::narrow_first`],
//! [`Tensor::split_last`] and [`Tensor::cat_last`].

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod ops;

/// Error type shared by every fallible operation in the crate.
#[derive(Error, Debug)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An index is out of bounds for the given shape.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// The requested operation is not supported (e.g., for a specific rank or type).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// A model or layer was constructed with inconsistent parameters.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A collective operation could not complete.
    #[error("Collective failure: {0}")]
    Collective(String),
    /// A checkpoint could not be written, read or matched against the model.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;

impl From<gpt2_tp_kernels::KernelError> for TensorError {
    fn from(e: gpt2_tp_kernels::KernelError) -> Self {
        match e {
            gpt2_tp_kernels::KernelError::ShapeMismatch { expected, got } => {
                TensorError::ShapeMismatch { expected, got }
            }
            gpt2_tp_kernels::KernelError::InvalidArgument(msg) => TensorError::Unsupported(msg),
        }
    }
}

/// Trait bound for elements that can be stored in a Tensor.
///
/// `Send + Sync` is required because kernels run on the `rayon` pool and tensors are moved
/// across rank threads.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
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

/// A dense, contiguous, row-major tensor.
///
/// Shape mismatches between operands are detected at runtime and reported as
/// [`TensorError::ShapeMismatch`].
#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the length of `data` does not match the product of `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
        })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::zero())
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::one())
    }

    /// Creates a new Tensor with every element set to `value`.
    pub fn full(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
        }
    }

    /// Creates a new Tensor whose elements are produced by `f(flat_index)` in row-major order.
    pub fn from_fn<F>(shape: [usize; RANK], f: F) -> Self
    where
        F: FnMut(usize) -> T,
    {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: (0..size).map(f).collect(),
        }
    }

    /// Reshapes the tensor to a new shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the total number of elements in `new_shape`
    /// does not match the current size of the tensor.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK>> {
        let new_size: usize = new_shape.iter().product();
        if self.data.len() != new_size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.data.len()],
                got: vec![new_size],
            });
        }

        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: self.data,
        })
    }

    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the row-major strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns a reference to the underlying data as a slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns a mutable reference to the underlying data as a slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consumes the tensor and returns its flat data.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Returns the total number of elements in the tensor.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Size of the last dimension (1 for a scalar).
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Copies `len` entries of the last dimension starting at `start`.
    ///
    /// This is how a rank extracts its partition of a column-sharded activation or weight.
    pub fn narrow_last(&self, start: usize, len: usize) -> Result<Self> {
        const { assert!(RANK >= 1, "narrow_last requires rank >= 1") };

        let dim = self.shape[RANK - 1];
        if start + len > dim {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start, start + len],
                shape: self.shape.to_vec(),
            });
        }

        let mut new_shape = self.shape;
        new_shape[RANK - 1] = len;
        let mut data = Vec::with_capacity(self.data.len() / dim.max(1) * len);
        if dim > 0 {
            for row in self.data.chunks(dim) {
                data.extend_from_slice(&row[start..start + len]);
            }
        }
        Self::new(data, new_shape)
    }

    /// Copies `len` entries of the first dimension starting at `start`.
    ///
    /// Used to take a row-block of a master weight (e.g. a vocabulary range).
    pub fn narrow_first(&self, start: usize, len: usize) -> Result<Self> {
        const { assert!(RANK >= 1, "narrow_first requires rank >= 1") };

        let dim = self.shape[0];
        if start + len > dim {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start, start + len],
                shape: self.shape.to_vec(),
            });
        }

        let row = self.strides[0];
        let mut new_shape = self.shape;
        new_shape[0] = len;
        Self::new(
            self.data[start * row..(start + len) * row].to_vec(),
            new_shape,
        )
    }

    /// Splits the last dimension into `parts` equally sized tensors.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if the last dimension is not divisible by `parts`.
    pub fn split_last(&self, parts: usize) -> Result<Vec<Self>> {
        let dim = self.last_dim();
        if parts == 0 || dim % parts != 0 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![parts],
                got: vec![dim],
            });
        }
        let chunk = dim / parts;
        (0..parts)
            .map(|i| self.narrow_last(i * chunk, chunk))
            .collect()
    }

    /// Concatenates tensors along the last dimension.
    ///
    /// All leading dimensions must match. This is the inverse of [`Tensor::split_last`] and the
    /// local step of an all-gather.
    pub fn cat_last(parts: &[Self]) -> Result<Self> {
        const { assert!(RANK >= 1, "cat_last requires rank >= 1") };

        let first = parts
            .first()
            .ok_or_else(|| TensorError::Unsupported("cat_last of zero tensors".into()))?;
        let lead = &first.shape[..RANK - 1];
        for p in parts {
            if &p.shape[..RANK - 1] != lead {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape.to_vec(),
                    got: p.shape.to_vec(),
                });
            }
        }

        let rows: usize = lead.iter().product();
        let total: usize = parts.iter().map(|p| p.shape[RANK - 1]).sum();
        let mut data = Vec::with_capacity(rows * total);
        for r in 0..rows {
            for p in parts {
                let w = p.shape[RANK - 1];
                data.extend_from_slice(&p.data[r * w..(r + 1) * w]);
            }
        }

        let mut shape = first.shape;
        shape[RANK - 1] = total;
        Self::new(data, shape)
    }
}

/// Computes row-major strides for a given shape.
pub(crate) const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_creation() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let tensor = Tensor::<f32, 2>::new(data.clone(), [2, 2]).unwrap();
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.data(), &data[..]);

        let err = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0], [2, 2]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_zeros_ones_full() {
        assert_eq!(Tensor::<f32, 2>::zeros([2, 3]).data(), &[0.0; 6]);
        assert_eq!(Tensor::<f32, 2>::ones([2, 3]).data(), &[1.0; 6]);
        assert_eq!(Tensor::<f32, 1>::full([2], 7.0).data(), &[7.0, 7.0]);
    }

    #[test]
    fn test_from_fn() {
        let t = Tensor::<f32, 2>::from_fn([2, 2], |i| i as f32 * 2.0);
        assert_eq!(t.data(), &[0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_reshape() {
        let tensor = Tensor::<f32, 2>::zeros([2, 3]);
        let reshaped = tensor.reshape([3, 2]).unwrap();
        assert_eq!(reshaped.shape(), &[3, 2]);

        let err = reshaped.reshape([4, 2]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_compute_strides() {
        assert_eq!(compute_strides(&[2, 3, 4]), [12, 4, 1]);
    }

    #[test]
    fn test_narrow_last() {
        // [[0 1 2 3]
        //  [4 5 6 7]]
        let t = Tensor::<f32, 2>::from_fn([2, 4], |i| i as f32);
        let n = t.narrow_last(1, 2).unwrap();
        assert_eq!(n.shape(), &[2, 2]);
        assert_eq!(n.data(), &[1.0, 2.0, 5.0, 6.0]);

        let err = t.narrow_last(3, 2);
        assert!(matches!(err, Err(TensorError::IndexOutOfBounds { .. })));
    }

    #[test]
    fn test_narrow_first() {
        let t = Tensor::<f32, 2>::from_fn([3, 2], |i| i as f32);
        let n = t.narrow_first(1, 2).unwrap();
        assert_eq!(n.shape(), &[2, 2]);
        assert_eq!(n.data(), &[2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_split_and_cat_last() {
        let t = Tensor::<f32, 3>::from_fn([2, 1, 6], |i| i as f32);
        let parts = t.split_last(3).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].data(), &[2.0, 3.0, 8.0, 9.0]);

        let joined = Tensor::cat_last(&parts).unwrap();
        assert_eq!(joined, t);

        let err = t.split_last(4);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_cat_last_leading_mismatch() {
        let a = Tensor::<f32, 2>::zeros([2, 2]);
        let b = Tensor::<f32, 2>::zeros([3, 2]);
        let err = Tensor::cat_last(&[a, b]);
        assert!(matches!(err, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_tensor_error_display() {
        let err = TensorError::ShapeMismatch {
            expected: vec![2, 2],
            got: vec![4],
        };
        assert_eq!(
            format!("{}", err),
            "Shape mismatch: expected [2, 2], got [4]"
        );

        let err = TensorError::Collective("peer hung up".to_string());
        assert_eq!(format!("{}", err), "Collective failure: peer hung up");
    }

    #[test]
    fn test_kernel_error_conversion() {
        let err: TensorError = gpt2_tp_kernels::KernelError::InvalidArgument("x".into()).into();
        assert!(matches!(err, TensorError::Unsupported(_)));
    }

    #[test]
    fn test_tensor_debug() {
        let t = Tensor::<f32, 1>::new(vec![1.0], [1]).unwrap();
        let debug_str = format!("{:?}", t);
        assert!(debug_str.contains("Tensor"));
        assert!(debug_str.contains("shape"));
    }
}
