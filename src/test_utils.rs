//! Utilities shared between tests.

use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::dataset::MemoryDataSet;
use crate::geometry::Shape;
use crate::masks::{Mask, MaskFactory, SparseMask};
use crate::types::{DType, Element};

/// Deterministic random detector counts.
pub(crate) fn mk_random_u16(dims: &[usize], seed: u64) -> ArrayD<u16> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::from_shape_fn(IxDyn(dims), |_| rng.gen_range(0..1024_u16))
}

/// Deterministic random weights in `[0, 1)`.
pub(crate) fn mk_random_f64(dims: &[usize], seed: u64) -> ArrayD<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::from_shape_fn(IxDyn(dims), |_| rng.gen::<f64>())
}

/// Build an in-memory dataset with explicit tile and partition geometry.
pub(crate) fn memory_dataset<T: Element>(
    data: &ArrayD<T>,
    dtype: DType,
    sig_dims: usize,
    tileshape: &[usize],
    partition_shape: Option<&[usize]>,
) -> MemoryDataSet {
    let dataset = MemoryDataSet::from_array(
        data,
        sig_dims,
        dtype,
        Shape::new(tileshape.to_vec(), sig_dims).unwrap(),
    )
    .unwrap();
    match partition_shape {
        Some(pshape) => dataset
            .with_partition_shape(Shape::new(pshape.to_vec(), sig_dims).unwrap())
            .unwrap(),
        None => dataset,
    }
}

pub(crate) fn dense_mask_factory(mask: ArrayD<f64>) -> MaskFactory {
    Box::new(move || Mask::Dense(mask.clone()))
}

pub(crate) fn sparse_mask_factory(mask: ArrayD<f64>) -> MaskFactory {
    Box::new(move || Mask::Sparse(SparseMask::from_dense(&mask)))
}

/// Widen a typed array to the accumulator type.
pub(crate) fn widen<T: Element>(data: &ArrayD<T>) -> ArrayD<f64> {
    data.mapv(|value| value.as_f64())
}

/// Direct (un-tiled) frame sum over all navigation positions.
pub(crate) fn naive_sum_frames(data: &ArrayD<f64>, sig_dims: usize) -> ArrayD<f64> {
    let ndim = data.ndim();
    let sig = data.shape()[ndim - sig_dims..].to_vec();
    let sig_size: usize = sig.iter().product();
    let nav_size: usize = data.shape()[..ndim - sig_dims].iter().product();
    let flat = data.view().into_shape((nav_size, sig_size)).unwrap();
    let mut out = vec![0.0; sig_size];
    for row in flat.rows() {
        for (cell, value) in out.iter_mut().zip(row.iter()) {
            *cell += value;
        }
    }
    ArrayD::from_shape_vec(IxDyn(&sig), out).unwrap()
}

/// Direct (un-tiled) mask projection: one scalar per mask per navigation
/// position.
pub(crate) fn naive_mask_apply(
    masks: &[ArrayD<f64>],
    data: &ArrayD<f64>,
    sig_dims: usize,
) -> ArrayD<f64> {
    let ndim = data.ndim();
    let nav = data.shape()[..ndim - sig_dims].to_vec();
    let sig_size: usize = data.shape()[ndim - sig_dims..].iter().product();
    let nav_size: usize = nav.iter().product();
    let flat = data.view().into_shape((nav_size, sig_size)).unwrap();
    let mut out_dims = vec![masks.len()];
    out_dims.extend_from_slice(&nav);
    let mut out = ArrayD::zeros(IxDyn(&out_dims));
    {
        let mut out_flat = out.view_mut().into_shape((masks.len(), nav_size)).unwrap();
        for (m, mask) in masks.iter().enumerate() {
            let mask_flat = mask.view().into_shape(sig_size).unwrap();
            for n in 0..nav_size {
                out_flat[[m, n]] = flat
                    .row(n)
                    .iter()
                    .zip(mask_flat.iter())
                    .map(|(a, b)| a * b)
                    .sum();
            }
        }
    }
    out
}
