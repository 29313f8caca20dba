use criterion::{Criterion, criterion_group, criterion_main};
use gpt2_tp::data::get_ltor_masks_and_position_ids;
use gpt2_tp::distributed::{CollectiveBackend, CpuBackend, SerialBackend};
use gpt2_tp::models::gpt2::{GPT2Config, GPT2Model};
use gpt2_tp::tensor::Tensor;
use std::hint::black_box;
use std::sync::Arc;
use std::thread;

fn bench_config() -> GPT2Config {
    GPT2Config {
        num_layers: 2,
        vocab_size: 512,
        hidden_size: 128,
        num_attention_heads: 4,
        max_sequence_length: 128,
        parallel_output: false,
        ..GPT2Config::gpt2_small()
    }
}

fn benchmark_serial_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("gpt2_forward_serial");
    let config = bench_config();
    let model = GPT2Model::<f32>::new(&config, Arc::new(SerialBackend)).unwrap();

    for &seq in &[16, 64] {
        let tokens = Tensor::from_fn([1, seq], |i| (i * 7) % config.vocab_size);
        let inputs = get_ltor_masks_and_position_ids::<f32>(&tokens, 0, false, false, false)
            .unwrap();
        group.bench_function(format!("seq_{seq}"), |b| {
            b.iter(|| {
                model
                    .forward(
                        black_box(&tokens),
                        &inputs.position_ids,
                        &inputs.attention_mask,
                        None,
                    )
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_all_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_all_reduce");

    for &world in &[2, 4] {
        group.bench_function(format!("world_{world}_64k"), |b| {
            b.iter(|| {
                let handles: Vec<_> = CpuBackend::ring(world)
                    .into_iter()
                    .map(|backend| {
                        thread::spawn(move || {
                            let mut buf = vec![1.0; 1 << 16];
                            backend.all_reduce_sum(&mut buf).unwrap();
                            buf[0]
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap())
                    .sum::<f64>()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_serial_forward, benchmark_all_reduce);
criterion_main!(benches);
