use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Swaps the last two dimensions of a row-major buffer.
///
/// Output rows are filled in parallel; each output row gathers one column of the
/// corresponding input matrix.
pub fn cpu_transpose<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    if RANK < 2 {
        return Err(KernelError::InvalidArgument(
            "transpose requires rank >= 2".into(),
        ));
    }

    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }

    let m = shape[RANK - 2];
    let n = shape[RANK - 1];
    let mut out_data = vec![T::zero(); size];
    if m == 0 || n == 0 {
        return Ok(out_data);
    }

    // Output viewed as [batch * N, M]
    out_data
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(i, out_row)| {
            let batch_idx = i / n;
            let col_idx = i % n;
            let input_batch_offset = batch_idx * m * n;

            for (r, out_elem) in out_row.iter_mut().enumerate() {
                *out_elem = data[input_batch_offset + r * n + col_idx];
            }
        });

    Ok(out_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_simple() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
        let result = cpu_transpose(&data, &[2, 3]).unwrap();
        assert_eq!(result, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_transpose_batch() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let result = cpu_transpose(&data, &[2, 2, 2]).unwrap();
        assert_eq!(result, vec![1.0, 3.0, 2.0, 4.0, 5.0, 7.0, 6.0, 8.0]);
    }

    #[test]
    fn test_transpose_rank_one_rejected() {
        let err = cpu_transpose(&[1.0, 2.0], &[2]);
        assert!(matches!(err, Err(KernelError::InvalidArgument(_))));
    }

    #[test]
    fn test_transpose_len_mismatch() {
        let err = cpu_transpose(&[1.0, 2.0], &[2, 2]);
        assert!(matches!(err, Err(KernelError::ShapeMismatch { .. })));
    }
}
