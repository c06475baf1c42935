/// Benchmarks for the per-partition reduction kernels.
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};

use quadstem::dataset::MemoryDataSet;
use quadstem::executor::CancelToken;
use quadstem::geometry::Shape;
use quadstem::job::Job;
use quadstem::jobs::{ApplyMasksJob, SumFramesJob};
use quadstem::masks::{Mask, MaskContainer, MaskFactory, SparsePolicy};
use quadstem::types::DType;

const FRAMES: usize = 32;

fn make_dataset(size: usize) -> Arc<MemoryDataSet> {
    let data: ArrayD<u16> =
        ArrayD::from_shape_fn(IxDyn(&[FRAMES, size, size]), |idx| (idx[0] + idx[2]) as u16);
    Arc::new(
        MemoryDataSet::from_array(
            &data,
            2,
            DType::Uint16,
            Shape::new(vec![4, size, size], 2).unwrap(),
        )
        .unwrap(),
    )
}

fn criterion_benchmark(c: &mut Criterion) {
    let cancel = CancelToken::new();
    for size in [64, 128, 256] {
        let dataset = make_dataset(size);

        let sum = SumFramesJob::new(dataset.clone());
        let partitions = sum.get_partitions().unwrap();
        let name = format!("sum_frames({}x{}x{})", FRAMES, size, size);
        c.bench_function(&name, |b| {
            b.iter(|| black_box(sum.reduce_partition(&partitions[0], &cancel).unwrap()))
        });

        for policy in [SparsePolicy::Dense, SparsePolicy::Sparse] {
            let mask = ArrayD::from_elem(IxDyn(&[size, size]), 0.5);
            let factory: MaskFactory = Box::new(move || Mask::Dense(mask.clone()));
            let masks =
                Arc::new(MaskContainer::new(vec![factory], policy, vec![size, size]).unwrap());
            let apply = ApplyMasksJob::new(dataset.clone(), masks).unwrap();
            let partitions = apply.get_partitions().unwrap();
            let name = format!("apply_masks({}x{}x{}, {:?})", FRAMES, size, size, policy);
            c.bench_function(&name, |b| {
                b.iter(|| black_box(apply.reduce_partition(&partitions[0], &cancel).unwrap()))
            });
        }
    }
}

criterion_group!(criterion_benchmark_group, criterion_benchmark);
criterion_main!(criterion_benchmark_group);
