#![allow(dead_code)]

use gpt2_tp::distributed::{CollectiveBackend, CpuBackend};
use gpt2_tp::tensor::Tensor;
use std::sync::Arc;
use std::thread;

/// Runs `f` on every rank of a `world`-way CPU ring and returns the results in rank order.
pub fn on_ring<R, F>(world: usize, f: F) -> Vec<R>
where
    F: Fn(Arc<dyn CollectiveBackend>) -> R + Send + Sync + Clone + 'static,
    R: Send + 'static,
{
    let handles: Vec<_> = CpuBackend::ring(world)
        .into_iter()
        .map(|b| {
            let f = f.clone();
            thread::spawn(move || {
                let backend: Arc<dyn CollectiveBackend> = Arc::new(b);
                f(backend)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

pub fn causal(s: usize) -> Tensor<f32, 3> {
    Tensor::from_fn([1, s, s], |i| if i % s <= i / s { 1.0 } else { 0.0 })
}

pub fn positions(b: usize, s: usize) -> Tensor<usize, 2> {
    Tensor::from_fn([b, s], |i| i % s)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < tol, "index {i}: {x} vs {y}");
    }
}
