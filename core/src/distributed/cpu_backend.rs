use super::backend::CollectiveBackend;
use crate::tensor::{Result, TensorError};
use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::trace;

/// A CPU collective backend where every rank is a thread.
///
/// Ranks form a ring: each sends to `rank + 1` and receives from `rank - 1` over `crossbeam`
/// channels, the same data movement NCCL performs between GPUs.
///
/// Collectives are blocking; a backend must be driven from its own thread.
#[derive(Debug)]
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Vec<f64>>, // Receive from rank - 1
    right_tx: Sender<Vec<f64>>,  // Send to rank + 1
}

impl CpuBackend {
    pub fn new(
        rank: usize,
        world_size: usize,
        left_rx: Receiver<Vec<f64>>,
        right_tx: Sender<Vec<f64>>,
    ) -> Self {
        Self {
            rank,
            world_size,
            left_rx,
            right_tx,
        }
    }

    /// Builds a fully wired ring of `world_size` backends, indexed by rank.
    pub fn ring(world_size: usize) -> Vec<CpuBackend> {
        // Channel i carries data from rank i to rank i + 1.
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();
        let mut rxs: Vec<Option<Receiver<Vec<f64>>>> = rxs.into_iter().map(Some).collect();

        (0..world_size)
            .map(|rank| {
                let left = (rank + world_size - 1) % world_size;
                let left_rx = rxs[left].take().unwrap_or_else(|| unbounded().1);
                CpuBackend::new(rank, world_size, left_rx, txs[rank].clone())
            })
            .collect()
    }

    fn send(&self, data: Vec<f64>) -> Result<()> {
        self.right_tx.send(data).map_err(|_| {
            TensorError::Collective(format!("rank {}: right neighbour hung up", self.rank))
        })
    }

    fn recv(&self) -> Result<Vec<f64>> {
        self.left_rx.recv().map_err(|_| {
            TensorError::Collective(format!("rank {}: left neighbour hung up", self.rank))
        })
    }

    /// Chunk `idx` of a buffer of length `len` split into `world_size` pieces.
    fn chunk_bounds(&self, idx: usize, len: usize) -> (usize, usize) {
        let chunk = len.div_ceil(self.world_size);
        let start = (idx * chunk).min(len);
        let end = (start + chunk).min(len);
        (start, end)
    }
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, buf: &mut [f64]) -> Result<()> {
        let ws = self.world_size;
        trace!(rank = self.rank, len = buf.len(), "all_reduce_sum");
        if ws == 1 {
            return Ok(());
        }
        let total = buf.len();

        // Phase 1: scatter-reduce. After ws - 1 steps rank r owns the full sum of chunk r + 1.
        for step in 0..ws - 1 {
            let send_idx = (self.rank + ws - step) % ws;
            let recv_idx = (self.rank + ws - step - 1) % ws;

            let (s, e) = self.chunk_bounds(send_idx, total);
            self.send(buf[s..e].to_vec())?;

            let recv = self.recv()?;
            let (s, e) = self.chunk_bounds(recv_idx, total);
            if recv.len() != e - s {
                return Err(TensorError::Collective(format!(
                    "rank {}: all_reduce chunk of {} elements, expected {}",
                    self.rank,
                    recv.len(),
                    e - s
                )));
            }
            for (dst, v) in buf[s..e].iter_mut().zip(recv) {
                *dst += v;
            }
        }

        // Phase 2: all-gather the reduced chunks around the ring.
        for step in 0..ws - 1 {
            let send_idx = (self.rank + 1 + ws - step) % ws;
            let recv_idx = (self.rank + ws - step) % ws;

            let (s, e) = self.chunk_bounds(send_idx, total);
            self.send(buf[s..e].to_vec())?;

            let recv = self.recv()?;
            let (s, e) = self.chunk_bounds(recv_idx, total);
            if recv.len() != e - s {
                return Err(TensorError::Collective(format!(
                    "rank {}: all_reduce chunk of {} elements, expected {}",
                    self.rank,
                    recv.len(),
                    e - s
                )));
            }
            buf[s..e].copy_from_slice(&recv);
        }

        Ok(())
    }

    fn all_gather(&self, local: &[f64]) -> Result<Vec<Vec<f64>>> {
        let ws = self.world_size;
        trace!(rank = self.rank, len = local.len(), "all_gather");

        let mut pieces: Vec<Vec<f64>> = vec![Vec::new(); ws];
        pieces[self.rank] = local.to_vec();

        // At step k rank r forwards the piece that originated at rank r - k.
        for step in 0..ws.saturating_sub(1) {
            let send_idx = (self.rank + ws - step) % ws;
            let recv_idx = (self.rank + ws - step - 1) % ws;
            self.send(pieces[send_idx].clone())?;
            pieces[recv_idx] = self.recv()?;
        }

        Ok(pieces)
    }
}
