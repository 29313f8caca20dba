use crate::{FloatElem, KernelError, Result};
use rayon::prelude::*;

/// In-place, numerically stable softmax over consecutive rows of width `n`.
///
/// The row maximum is subtracted before exponentiating.
pub fn cpu_softmax_rows<T: FloatElem>(data: &mut [T], n: usize) -> Result<()> {
    if n == 0 {
        return if data.is_empty() {
            Ok(())
        } else {
            Err(KernelError::InvalidArgument(
                "softmax row width must be non-zero".into(),
            ))
        };
    }
    if data.len() % n != 0 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![n],
            got: vec![data.len()],
        });
    }

    data.par_chunks_mut(n).for_each(|row| {
        let max_val = row.iter().copied().fold(T::neg_infinity(), |a, b| a.max(b));

        let mut sum_exp = T::zero();
        for v in row.iter_mut() {
            *v = (*v - max_val).exp();
            sum_exp += *v;
        }

        let inv_sum = T::one() / sum_exp;
        for v in row.iter_mut() {
            *v *= inv_sum;
        }
    });
    Ok(())
}
