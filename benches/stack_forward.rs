use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use burn::prelude::*;
use burn::tensor::TensorData;
use burn_ndarray::NdArray;

use logit_stack::stacking::architectures::{StackModel, StackModelConfig};
use logit_stack::stacking::tta::Tta;

type BenchBackend = NdArray<f32>;

const NUM_MODELS: usize = 3;
const NUM_TTA: usize = 4;
const NUM_CLASSES: usize = 5;

fn create_model(device: &<BenchBackend as Backend>::Device) -> StackModel<BenchBackend> {
    StackModelConfig::new(NUM_MODELS, NUM_TTA, NUM_CLASSES)
        .init::<BenchBackend>(device)
        .expect("valid stack model layout")
        .eval()
}

/// Deterministic `[batch, models, tta, classes]` logits.
fn create_logits(batch_size: usize, device: &<BenchBackend as Backend>::Device) -> Tensor<BenchBackend, 4> {
    let len = batch_size * NUM_MODELS * NUM_TTA * NUM_CLASSES;
    let data: Vec<f32> = (0..len).map(|i| (i as f32 * 0.01).sin()).collect();
    Tensor::from_data(
        TensorData::new(data, [batch_size, NUM_MODELS, NUM_TTA, NUM_CLASSES]),
        device,
    )
}

fn bench_stack_forward(c: &mut Criterion) {
    let device = Default::default();
    let model = create_model(&device);

    let mut group = c.benchmark_group("stack_forward");
    group.measurement_time(Duration::from_secs(10));
    for batch_size in [1, 16, 64] {
        let input = create_logits(batch_size, &device);
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &input, |b, input| {
            b.iter(|| black_box(model.forward(input.clone())))
        });
    }
    group.finish();
}

fn bench_tta_variants(c: &mut Criterion) {
    let device = Default::default();
    let data: Vec<f32> = (0..16 * 3 * 64 * 64).map(|i| (i as f32 * 0.001).cos()).collect();
    let images = Tensor::<BenchBackend, 4>::from_data(TensorData::new(data, [16, 3, 64, 64]), &device);

    let mut group = c.benchmark_group("tta_apply");
    for tta in Tta::ALL {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{tta:?}")), &images, |b, images| {
            b.iter(|| black_box(tta.apply(images.clone())))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_stack_forward, bench_tta_variants);
criterion_main!(benches);
