mod common;

use common::{assert_close, causal, on_ring, positions};
use gpt2_tp::checkpoint::{
    checkpoint_file_name, load_model_parallel_checkpoint, save_model_parallel_checkpoint,
};
use gpt2_tp::distributed::SerialBackend;
use gpt2_tp::models::gpt2::{GPT2Config, GPT2Model};
use gpt2_tp::nn::named_parameters;
use gpt2_tp::optim::{AdamW, get_params_for_weight_decay_optimization};
use gpt2_tp::tensor::{Tensor, TensorError};
use std::collections::HashMap;
use std::sync::Arc;

fn ids() -> Tensor<usize, 2> {
    Tensor::new(vec![2, 7, 1, 8], [1, 4]).unwrap()
}

#[test]
fn test_sharded_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();

    let matched = on_ring(2, move |backend| {
        let saved = GPT2Model::<f32>::new(&GPT2Config::tiny(), backend.clone()).unwrap();
        save_model_parallel_checkpoint(&saved, backend.as_ref(), &path).unwrap();

        // Different seed, so every weight starts out different.
        let other = GPT2Config {
            seed: 4321,
            ..GPT2Config::tiny()
        };
        let mut restored = GPT2Model::<f32>::new(&other, backend.clone()).unwrap();
        backend.barrier().unwrap();
        load_model_parallel_checkpoint(&mut restored, backend.as_ref(), &path).unwrap();

        let a = saved.forward(&ids(), &positions(1, 4), &causal(4), None).unwrap();
        let b = restored
            .forward(&ids(), &positions(1, 4), &causal(4), None)
            .unwrap();
        a == b
    });
    assert!(matched.into_iter().all(|m| m));

    assert!(dir.path().join(checkpoint_file_name(0)).exists());
    assert!(dir.path().join(checkpoint_file_name(1)).exists());
}

#[test]
fn test_world_size_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();
    on_ring(2, move |backend| {
        let model = GPT2Model::<f32>::new(&GPT2Config::tiny(), backend.clone()).unwrap();
        save_model_parallel_checkpoint(&model, backend.as_ref(), &path).unwrap();
    });

    let mut serial = GPT2Model::<f32>::new(&GPT2Config::tiny(), Arc::new(SerialBackend)).unwrap();
    let err = load_model_parallel_checkpoint(&mut serial, &SerialBackend, dir.path());
    assert!(matches!(err, Err(TensorError::Checkpoint(msg)) if msg.contains("world size")));
}

#[test]
fn test_optimizer_step_survives_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let config = GPT2Config::tiny();
    let backend = Arc::new(SerialBackend);

    let mut model = GPT2Model::<f32>::new(&config, backend.clone()).unwrap();
    let before = model
        .forward(&ids(), &positions(1, 4), &causal(4), None)
        .unwrap();

    let grads: HashMap<String, Vec<f32>> = named_parameters(&model)
        .into_iter()
        .map(|(name, p)| (name, vec![0.01; p.data.len()]))
        .collect();
    let (decay, no_decay) = get_params_for_weight_decay_optimization(&model);
    let mut adam = AdamW::new(1e-2);
    adam.step(&mut model, &grads, &[decay, no_decay]).unwrap();

    let after = model
        .forward(&ids(), &positions(1, 4), &causal(4), None)
        .unwrap();
    assert_ne!(before, after);

    save_model_parallel_checkpoint(&model, backend.as_ref(), dir.path()).unwrap();
    let mut reloaded = GPT2Model::<f32>::new(&config, backend.clone()).unwrap();
    load_model_parallel_checkpoint(&mut reloaded, backend.as_ref(), dir.path()).unwrap();
    let restored = reloaded
        .forward(&ids(), &positions(1, 4), &causal(4), None)
        .unwrap();
    assert_close(restored.data(), after.data(), 1e-6);
}
