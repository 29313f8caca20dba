use crate::tensor::Result;
use std::fmt::Debug;

/// Abstraction for a model-parallel communication backend.
///
/// Buffers travel as `f64` so that the trait stays object-safe (`Arc<dyn CollectiveBackend>`)
/// and every `TensorElem` survives the trip without a lossy cast. Typed helpers live in
/// [`comm`](super::comm).
///
/// Every rank of the group must issue the same sequence of collective calls with buffers of
/// the same length; a peer that disappears surfaces as [`TensorError::Collective`].
///
/// [`TensorError::Collective`]: crate::tensor::TensorError::Collective
pub trait CollectiveBackend: Send + Sync + Debug {
    /// Returns the rank of the current process/thread.
    fn rank(&self) -> usize;

    /// Returns the total number of processes/threads.
    fn world_size(&self) -> usize;

    /// Sums `buf` element-wise across all ranks, in place.
    fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<()>;

    /// Collects `local` from every rank. The result is indexed by rank.
    fn all_gather(&self, local: &[f64]) -> Result<Vec<Vec<f64>>>;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self) -> Result<()> {
        let mut token = [0.0];
        self.all_reduce_sum(&mut token)
    }
}

/// The single-rank backend. Every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialBackend;

impl CollectiveBackend for SerialBackend {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buf: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, local: &[f64]) -> Result<Vec<Vec<f64>>> {
        Ok(vec![local.to_vec()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_backend_is_identity() {
        let backend = SerialBackend;
        assert_eq!(backend.rank(), 0);
        assert_eq!(backend.world_size(), 1);

        let mut buf = vec![1.0, 2.0];
        backend.all_reduce_sum(&mut buf).unwrap();
        assert_eq!(buf, vec![1.0, 2.0]);

        let gathered = backend.all_gather(&buf).unwrap();
        assert_eq!(gathered, vec![vec![1.0, 2.0]]);
        backend.barrier().unwrap();
    }
}
