use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Batched matrix multiplication `[.., M, K] x [.., K, N] -> [.., M, N]`.
///
/// The leading (batch) dimensions of both operands must be identical.
/// The right-hand side is transposed once up front so that every dot product
/// walks two contiguous rows.
pub fn cpu_matmul<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if RANK < 2 {
        return Err(KernelError::InvalidArgument(
            "matmul requires rank >= 2".into(),
        ));
    }

    let m = lhs_shape[RANK - 2];
    let k = lhs_shape[RANK - 1];
    let n = rhs_shape[RANK - 1];

    if k != rhs_shape[RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[RANK - 2]],
        });
    }
    if lhs_shape[..RANK - 2] != rhs_shape[..RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape.to_vec(),
            got: rhs_shape.to_vec(),
        });
    }
    check_len(lhs_data, lhs_shape)?;
    check_len(rhs_data, rhs_shape)?;

    let batch: usize = lhs_shape[..RANK - 2].iter().product();
    let mut out_data = vec![T::zero(); batch * m * n];
    if n == 0 {
        return Ok(out_data);
    }

    // rhs is [..., K, N]; rhs_t is [..., N, K]
    let rhs_t_data = crate::cpu_transpose::cpu_transpose(rhs_data, rhs_shape)?;

    out_data
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(global_row_idx, out_row)| {
            let batch_idx = global_row_idx / m;
            let row_in_matrix = global_row_idx % m;

            let a_row_start = batch_idx * m * k + row_in_matrix * k;
            let a_slice = &lhs_data[a_row_start..a_row_start + k];
            let b_t_batch_offset = batch_idx * n * k;

            for (col, out_elem) in out_row.iter_mut().enumerate() {
                let b_t_row_start = b_t_batch_offset + col * k;
                let b_t_slice = &rhs_t_data[b_t_row_start..b_t_row_start + k];
                *out_elem = dot(a_slice, b_t_slice);
            }
        });

    Ok(out_data)
}

/// Linear-layer product `X[M, K] x W[N, K]^T -> [M, N]`.
///
/// `W` is stored `[out_features, in_features]`, so each output element is a dot
/// product of one row of `X` with one row of `W` and no transpose is materialised.
pub fn cpu_matmul_nt<T>(
    x_data: &[T],
    w_data: &[T],
    m: usize,
    k: usize,
    n: usize,
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if x_data.len() != m * k {
        return Err(KernelError::ShapeMismatch {
            expected: vec![m, k],
            got: vec![x_data.len()],
        });
    }
    if w_data.len() != n * k {
        return Err(KernelError::ShapeMismatch {
            expected: vec![n, k],
            got: vec![w_data.len()],
        });
    }

    let mut out_data = vec![T::zero(); m * n];
    if n == 0 {
        return Ok(out_data);
    }

    out_data
        .par_chunks_mut(n)
        .zip(x_data.par_chunks(k.max(1)))
        .for_each(|(out_row, x_row)| {
            for (j, out_elem) in out_row.iter_mut().enumerate() {
                *out_elem = dot(x_row, &w_data[j * k..(j + 1) * k]);
            }
        });

    Ok(out_data)
}

#[inline]
fn dot<T: KernelElem>(a: &[T], b: &[T]) -> T {
    let mut sum = T::zero();
    for (&x, &y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

fn check_len<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<()> {
    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }
    Ok(())
}
