use crate::{FloatElem, KernelError, Result};
use rayon::prelude::*;

/// Layer normalisation over consecutive rows of width `gamma.len()`.
///
/// `y = (x - mean) / sqrt(var + eps) * gamma + beta`, with the biased variance.
pub fn cpu_layer_norm_rows<T: FloatElem>(
    input: &[T],
    gamma: &[T],
    beta: &[T],
    eps: T,
) -> Result<Vec<T>> {
    let n = gamma.len();
    if beta.len() != n {
        return Err(KernelError::ShapeMismatch {
            expected: vec![n],
            got: vec![beta.len()],
        });
    }
    if n == 0 || input.len() % n != 0 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![n],
            got: vec![input.len()],
        });
    }

    let width = T::from_usize(n).ok_or_else(|| {
        KernelError::InvalidArgument(format!("row width {n} not representable"))
    })?;

    let mut out = vec![T::zero(); input.len()];
    out.par_chunks_mut(n)
        .zip(input.par_chunks(n))
        .for_each(|(out_row, in_row)| {
            let mean = in_row.iter().fold(T::zero(), |acc, &v| acc + v) / width;
            let var = in_row
                .iter()
                .fold(T::zero(), |acc, &v| acc + (v - mean) * (v - mean))
                / width;
            let rstd = T::one() / (var + eps).sqrt();

            for i in 0..n {
                out_row[i] = (in_row[i] - mean) * rstd * gamma[i] + beta[i];
            }
        });

    Ok(out)
}
