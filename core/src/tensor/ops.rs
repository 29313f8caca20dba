//! Tensor operations.
//!
//! Element-wise arithmetic, matrix products and axis permutations. Heavy loops are delegated to
//! `gpt2_tp_kernels`; the rest is parallelised here with `rayon`.
//!
//! Shapes must match exactly for element-wise operations. The one broadcast the model needs,
//! adding a bias vector along the last dimension, is provided explicitly by
//! [`Tensor::add_last_dim`].
//!
//! ```rust
//! use gpt2_tp::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//!
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Result, Tensor, TensorElem, TensorError, compute_strides};

use num_traits::Float;
use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic trait for `&Tensor`, checking shapes and running in parallel.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = crate::tensor::Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .as_mut_slice()
                    .par_iter_mut()
                    .zip(self.data.as_slice().par_iter())
                    .zip(rhs.data.as_slice().par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies a function element-wise to the tensor.
    ///
    /// ```rust
    /// use gpt2_tp::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .as_mut_slice()
            .par_iter_mut()
            .zip(self.data.as_slice().par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Adds `other` into `self` in place.
    pub fn add_assign(&mut self, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        self.data
            .par_iter_mut()
            .zip(other.data.par_iter())
            .for_each(|(a, b)| *a += *b);
        Ok(())
    }

    /// Adds a vector of length `last_dim` to every row of the tensor (bias broadcast).
    pub fn add_last_dim(&self, bias: &[T]) -> Result<Self> {
        let n = self.last_dim();
        if bias.len() != n {
            return Err(TensorError::ShapeMismatch {
                expected: vec![n],
                got: vec![bias.len()],
            });
        }
        let mut out = self.clone();
        if n > 0 {
            out.data.par_chunks_mut(n).for_each(|row| {
                for (o, b) in row.iter_mut().zip(bias) {
                    *o += *b;
                }
            });
        }
        Ok(out)
    }

    /// Matrix multiplication over the last two dimensions.
    ///
    /// If the rank is greater than 2, the leading dimensions are treated as batch dimensions
    /// and must match: `[.., M, K] x [.., K, N] -> [.., M, N]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

        if self.shape[..RANK - 2] != rhs.shape[..RANK - 2] {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: rhs.shape.to_vec(),
            });
        }

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 1];

        let out_data = gpt2_tp_kernels::cpu_matmul(
            self.data.as_slice(),
            rhs.data.as_slice(),
            &self.shape,
            &rhs.shape,
        )?;

        Ok(Tensor {
            shape: out_shape,
            strides: compute_strides(&out_shape),
            data: out_data,
        })
    }

    /// Multiplies by the transpose of a `[N, K]` matrix: `[.., K] x [N, K]^T -> [.., N]`.
    ///
    /// This is the shape of every linear layer (weights stored `[out, in]`) and of the tied
    /// language-model head.
    pub fn matmul_nt(&self, weight: &Tensor<T, 2>) -> Result<Self> {
        const { assert!(RANK >= 1, "matmul_nt requires rank >= 1") };

        let k = self.last_dim();
        let [n, wk] = *weight.shape();
        if wk != k {
            return Err(TensorError::ShapeMismatch {
                expected: vec![n, k],
                got: weight.shape.to_vec(),
            });
        }
        let m = if k == 0 {
            self.shape[..RANK - 1].iter().product()
        } else {
            self.data.len() / k
        };

        let out_data = gpt2_tp_kernels::cpu_matmul_nt(&self.data, weight.data(), m, k, n)?;
        let mut out_shape = self.shape;
        out_shape[RANK - 1] = n;
        Ok(Tensor {
            shape: out_shape,
            strides: compute_strides(&out_shape),
            data: out_data,
        })
    }

    /// Swaps the last two dimensions.
    pub fn transpose(&self) -> Result<Self> {
        const { assert!(RANK >= 2, "transpose requires rank >= 2") };

        let out_data = gpt2_tp_kernels::cpu_transpose(&self.data, &self.shape)?;
        let mut new_shape = self.shape;
        new_shape.swap(RANK - 1, RANK - 2);
        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: out_data,
        })
    }

    /// Transposes two specific axes of the tensor, physically permuting the data.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if `ax1` or `ax2` are out of bounds.
    pub fn transpose_axes(&self, ax1: usize, ax2: usize) -> Result<Self> {
        if ax1 >= RANK || ax2 >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![ax1, ax2],
                shape: self.shape.to_vec(),
            });
        }
        if ax1 == ax2 {
            return Ok(self.clone());
        }

        let mut new_shape = self.shape;
        new_shape.swap(ax1, ax2);

        // Strides of the source, read in the order of the destination axes.
        let mut src_strides = self.strides;
        src_strides.swap(ax1, ax2);
        let dst_strides = compute_strides(&new_shape);

        let mut out = Tensor::zeros(new_shape);
        out.data.par_iter_mut().enumerate().for_each(|(i, o)| {
            let mut rem = i;
            let mut src = 0;
            for d in 0..RANK {
                let idx = rem / dst_strides[d];
                rem %= dst_strides[d];
                src += idx * src_strides[d];
            }
            *o = self.data[src];
        });
        Ok(out)
    }
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem + Float,
{
    /// Numerically stable softmax over the last dimension.
    pub fn softmax_last(&self) -> Result<Self> {
        let mut out = self.clone();
        gpt2_tp_kernels::cpu_softmax_rows(&mut out.data, self.last_dim())?;
        Ok(out)
    }

    /// Largest absolute element-wise difference to `other`.
    pub fn max_abs_diff(&self, other: &Self) -> Result<T> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .fold(T::zero(), |acc, (a, b)| acc.max((*a - *b).abs())))
    }
}
