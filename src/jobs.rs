//! Reduction kinds.
//!
//! Each reduction kind is implemented as a struct that implements the
//! [Job](crate::job::Job) trait. The `Job` impl dispatches on the dataset's
//! runtime dtype into a typed kernel; the kernels accumulate in `f64` (or
//! `Complex64`) regardless of the storage dtype.

use std::sync::Arc;

use ndarray::{Array2, ArrayD, Axis, IxDyn};

use crate::dataset::DataSet;
use crate::error::QuadStemError;
use crate::executor::CancelToken;
use crate::geometry::{region_slice_info, Shape, Slice};
use crate::job::{Job, PartialResult, ResultData, ResultKind};
use crate::masks::{MaskApplyResult, MaskContainer};
use crate::partition::Partition;
use crate::types::{DType, Element};

/// Sum all frames of the dataset into one signal-shaped image.
///
/// The navigation axes are the summed (repeat) axes: each tile's frames are
/// accumulated down to the tile's signal region, and the partial sums of
/// different partitions land in (and add into) the matching signal
/// sub-region of the result.
pub struct SumFramesJob {
    dataset: Arc<dyn DataSet>,
}

impl SumFramesJob {
    pub fn new(dataset: Arc<dyn DataSet>) -> Self {
        SumFramesJob { dataset }
    }

    fn reduce_t<T: Element>(
        &self,
        partition: &Partition,
        cancel: &CancelToken,
    ) -> Result<Option<PartialResult>, QuadStemError> {
        let region = partition.slice().sig_region();
        let mut acc = ArrayD::<f64>::zeros(IxDyn(region.shape().dims()));
        for tile in partition.get_tiles(None)? {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let tile = tile?;
            let flat = tile.flat_view::<T>()?;
            let local = tile.tile_slice().sig_region().shift(&region)?;
            let mut target = acc.slice_mut(region_slice_info(&local));
            for row in flat.rows() {
                for (cell, value) in target.iter_mut().zip(row.iter()) {
                    *cell += value.as_f64();
                }
            }
        }
        Ok(Some(PartialResult::new(region, ResultData::Real(acc))))
    }
}

impl Job for SumFramesJob {
    fn result_shape(&self) -> Vec<usize> {
        self.dataset.shape().sig().to_vec()
    }

    fn get_partitions(&self) -> Result<Vec<Partition>, QuadStemError> {
        self.dataset.get_partitions()
    }

    fn reduce_partition(
        &self,
        partition: &Partition,
        cancel: &CancelToken,
    ) -> Result<Option<PartialResult>, QuadStemError> {
        match partition.dtype() {
            DType::Uint8 => self.reduce_t::<u8>(partition, cancel),
            DType::Uint16 => self.reduce_t::<u16>(partition, cancel),
            DType::Uint32 => self.reduce_t::<u32>(partition, cancel),
            DType::Uint64 => self.reduce_t::<u64>(partition, cancel),
            DType::Int32 => self.reduce_t::<i32>(partition, cancel),
            DType::Int64 => self.reduce_t::<i64>(partition, cancel),
            DType::Float32 => self.reduce_t::<f32>(partition, cancel),
            DType::Float64 => self.reduce_t::<f64>(partition, cancel),
        }
    }
}

/// Project every frame through a set of masks.
///
/// The result holds one scalar per mask per navigation position. Complex
/// masks produce a complex result; callers derive the magnitude view from
/// the result buffer.
pub struct ApplyMasksJob {
    dataset: Arc<dyn DataSet>,
    masks: Arc<MaskContainer>,
    crop_to: Option<Slice>,
}

impl ApplyMasksJob {
    pub fn new(
        dataset: Arc<dyn DataSet>,
        masks: Arc<MaskContainer>,
    ) -> Result<Self, QuadStemError> {
        if masks.sig_shape() != dataset.shape().sig() {
            return Err(QuadStemError::geometry(format!(
                "mask shape {:?} != dataset signal shape {:?}",
                masks.sig_shape(),
                dataset.shape().sig()
            )));
        }
        Ok(ApplyMasksJob {
            dataset,
            masks,
            crop_to: None,
        })
    }

    /// Restrict the projection to a region of the dataset. Tiles outside
    /// the region are skipped; in-region values are unaffected.
    pub fn with_crop(mut self, crop_to: Slice) -> Self {
        self.crop_to = Some(crop_to);
        self
    }

    pub fn masks(&self) -> &MaskContainer {
        &self.masks
    }

    fn reduce_t<T: Element>(
        &self,
        partition: &Partition,
        cancel: &CancelToken,
    ) -> Result<Option<PartialResult>, QuadStemError> {
        let nav = partition.slice().nav_region();
        let num_masks = self.masks.len();
        let mut acc_dims = vec![num_masks];
        acc_dims.extend_from_slice(nav.shape().dims());
        let mut acc = if self.masks.is_complex() {
            ResultData::Complex(ArrayD::zeros(IxDyn(&acc_dims)))
        } else {
            ResultData::Real(ArrayD::zeros(IxDyn(&acc_dims)))
        };
        for tile in partition.get_tiles(self.crop_to.as_ref())? {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let tile = tile?;
            let flat = tile.flat_view::<T>()?;
            let data = Array2::from_shape_fn(flat.dim(), |index| flat[index].as_f64());
            let matrix = self.masks.get(tile.tile_slice())?;
            let tile_nav = tile.tile_slice().nav_region().shift(&nav)?;
            let mut origin = vec![0];
            origin.extend_from_slice(tile_nav.origin());
            let mut dims = vec![num_masks];
            dims.extend_from_slice(tile_nav.shape().dims());
            let local = Slice::new(origin, Shape::new(dims, 0)?)?;
            match (&mut acc, matrix.apply(data.view())) {
                (ResultData::Real(acc), MaskApplyResult::Real(result)) => {
                    let mut target = acc.slice_mut(region_slice_info(&local));
                    for mask in 0..num_masks {
                        let mut lane = target.index_axis_mut(Axis(0), mask);
                        for (cell, value) in lane.iter_mut().zip(result.column(mask).iter()) {
                            *cell += value;
                        }
                    }
                }
                (ResultData::Complex(acc), MaskApplyResult::Complex(result)) => {
                    let mut target = acc.slice_mut(region_slice_info(&local));
                    for mask in 0..num_masks {
                        let mut lane = target.index_axis_mut(Axis(0), mask);
                        for (cell, value) in lane.iter_mut().zip(result.column(mask).iter()) {
                            *cell += value;
                        }
                    }
                }
                _ => {
                    return Err(QuadStemError::ResultMismatch {
                        reason: "mask matrix kind diverged from container".to_string(),
                    })
                }
            }
        }
        let mut origin = vec![0];
        origin.extend_from_slice(nav.origin());
        let mut dims = vec![num_masks];
        dims.extend_from_slice(nav.shape().dims());
        let region = Slice::new(origin, Shape::new(dims, 0)?)?;
        Ok(Some(PartialResult::new(region, acc)))
    }
}

impl Job for ApplyMasksJob {
    fn result_shape(&self) -> Vec<usize> {
        let mut dims = vec![self.masks.len()];
        dims.extend_from_slice(self.dataset.shape().nav());
        dims
    }

    fn result_kind(&self) -> ResultKind {
        if self.masks.is_complex() {
            ResultKind::Complex
        } else {
            ResultKind::Real
        }
    }

    fn get_partitions(&self) -> Result<Vec<Partition>, QuadStemError> {
        self.dataset.get_partitions()
    }

    fn reduce_partition(
        &self,
        partition: &Partition,
        cancel: &CancelToken,
    ) -> Result<Option<PartialResult>, QuadStemError> {
        match partition.dtype() {
            DType::Uint8 => self.reduce_t::<u8>(partition, cancel),
            DType::Uint16 => self.reduce_t::<u16>(partition, cancel),
            DType::Uint32 => self.reduce_t::<u32>(partition, cancel),
            DType::Uint64 => self.reduce_t::<u64>(partition, cancel),
            DType::Int32 => self.reduce_t::<i32>(partition, cancel),
            DType::Int64 => self.reduce_t::<i64>(partition, cancel),
            DType::Float32 => self.reduce_t::<f32>(partition, cancel),
            DType::Float64 => self.reduce_t::<f64>(partition, cancel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::masks::SparsePolicy;
    use crate::result::ResultBuffer;
    use crate::test_utils::{
        dense_mask_factory, memory_dataset, mk_random_f64, mk_random_u16, naive_mask_apply,
        naive_sum_frames, sparse_mask_factory, widen,
    };

    use ndarray::Dimension;
    use num_complex::Complex64;

    /// Run a job synchronously, merging every partition's partial result.
    fn run_sync(job: &dyn Job) -> ResultBuffer {
        let mut buffer = ResultBuffer::for_job(job);
        let cancel = CancelToken::new();
        for partition in job.get_partitions().unwrap() {
            let partial = job
                .reduce_partition(&partition, &cancel)
                .unwrap()
                .expect("not cancelled");
            buffer.merge(&partial).unwrap();
        }
        buffer
    }

    fn assert_allclose(actual: &ArrayD<f64>, expected: &ArrayD<f64>) {
        assert_eq!(expected.shape(), actual.shape());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!(
                (a - e).abs() <= 1e-9 * e.abs().max(1.0),
                "{} != {}",
                a,
                e
            );
        }
    }

    fn mask_container(
        factories: Vec<crate::masks::MaskFactory>,
        policy: SparsePolicy,
        sig_shape: &[usize],
    ) -> Arc<MaskContainer> {
        Arc::new(MaskContainer::new(factories, policy, sig_shape.to_vec()).unwrap())
    }

    #[test]
    fn sum_equals_untiled_reference() {
        let data = mk_random_u16(&[16, 16, 16, 16], 1);
        let expected = naive_sum_frames(&widen(&data), 2);
        for (tileshape, partition_shape) in [
            (&[1, 8, 16, 16], &[8, 16, 16, 16]),
            (&[4, 4, 4, 4], &[16, 16, 16, 16]),
            (&[1, 1, 2, 2], &[16, 16, 2, 2]),
        ] {
            let dataset = memory_dataset(
                &data,
                crate::types::DType::Uint16,
                2,
                tileshape.as_slice(),
                Some(partition_shape.as_slice()),
            );
            let job = SumFramesJob::new(Arc::new(dataset));
            assert_eq!(vec![16, 16], job.result_shape());
            let buffer = run_sync(&job);
            assert_allclose(buffer.as_real().unwrap(), &expected);
        }
    }

    #[test]
    fn sum_with_outlier_keeps_precision() {
        // Uniform value with one outlier ~1e6 times the baseline; the
        // accumulated sums must stay exact.
        let resolution = 64;
        let range = 1e6_f32;
        let mut data = ArrayD::from_elem(IxDyn(&[2, 2, resolution, resolution]), 1.0_f32);
        data[[0, 0, 0, 0]] += range;
        let dataset = memory_dataset(
            &data,
            crate::types::DType::Float32,
            2,
            &[1, 2, resolution, resolution],
            Some(&[1, 2, resolution, resolution]),
        );
        let job = SumFramesJob::new(Arc::new(dataset));
        let buffer = run_sync(&job);
        let result = buffer.as_real().unwrap();
        assert_eq!(4.0 + range as f64, result[[0, 0]]);
        assert_eq!(4.0, result[[0, 1]]);
        assert_eq!(4.0, result[[resolution - 1, resolution - 1]]);
    }

    #[test]
    fn mask_projection_4d_tiles() {
        // (16, 16, 16, 16) dataset, (4, 4, 4, 4) tiles, one partition, one
        // random dense mask: the projection equals the direct un-tiled
        // matrix product and has one value per scan position.
        let data = mk_random_u16(&[16, 16, 16, 16], 2);
        let mask = mk_random_f64(&[16, 16], 3);
        let expected = naive_mask_apply(&[mask.clone()], &widen(&data), 2);
        let dataset = memory_dataset(
            &data,
            crate::types::DType::Uint16,
            2,
            &[4, 4, 4, 4],
            Some(&[16, 16, 16, 16]),
        );
        let job = ApplyMasksJob::new(
            Arc::new(dataset),
            mask_container(vec![dense_mask_factory(mask)], SparsePolicy::Auto, &[16, 16]),
        )
        .unwrap();
        assert_eq!(vec![1, 16, 16], job.result_shape());
        let buffer = run_sync(&job);
        assert_allclose(buffer.as_real().unwrap(), &expected);
    }

    #[test]
    fn mask_projection_subframe_partitions() {
        // Partitions that split the signal dimensions: per-tile partial dot
        // products over pixel subsets must accumulate to the full product.
        let data = mk_random_u16(&[16, 16, 16, 16], 4);
        let mask = mk_random_f64(&[16, 16], 5);
        let expected = naive_mask_apply(&[mask.clone()], &widen(&data), 2);
        let dataset = memory_dataset(
            &data,
            crate::types::DType::Uint16,
            2,
            &[1, 1, 2, 2],
            Some(&[16, 16, 2, 2]),
        );
        let job = ApplyMasksJob::new(
            Arc::new(dataset),
            mask_container(vec![dense_mask_factory(mask)], SparsePolicy::Auto, &[16, 16]),
        )
        .unwrap();
        let buffer = run_sync(&job);
        assert_allclose(buffer.as_real().unwrap(), &expected);
    }

    #[test]
    fn sparse_and_dense_results_agree() {
        let data = mk_random_u16(&[8, 8, 8, 8], 6);
        let mask = mk_random_f64(&[8, 8], 7);
        let expected = naive_mask_apply(&[mask.clone()], &widen(&data), 2);
        for policy in [SparsePolicy::Auto, SparsePolicy::Sparse, SparsePolicy::Dense] {
            let dataset = memory_dataset(
                &data,
                crate::types::DType::Uint16,
                2,
                &[2, 2, 4, 4],
                Some(&[8, 8, 8, 8]),
            );
            let job = ApplyMasksJob::new(
                Arc::new(dataset),
                mask_container(
                    vec![sparse_mask_factory(mask.clone())],
                    policy,
                    &[8, 8],
                ),
            )
            .unwrap();
            let buffer = run_sync(&job);
            assert_allclose(buffer.as_real().unwrap(), &expected);
        }
    }

    #[test]
    fn mixed_masks_degrade_to_dense_with_equal_results() {
        let data = mk_random_u16(&[8, 8, 8, 8], 8);
        let mask0 = mk_random_f64(&[8, 8], 9);
        let mask1 = mk_random_f64(&[8, 8], 10);
        let expected = naive_mask_apply(&[mask0.clone(), mask1.clone()], &widen(&data), 2);
        // One sparse and one dense factory in auto mode: the container
        // degrades to dense.
        let container = mask_container(
            vec![
                sparse_mask_factory(mask0.clone()),
                dense_mask_factory(mask1.clone()),
            ],
            SparsePolicy::Auto,
            &[8, 8],
        );
        assert!(!container.uses_sparse());
        let dataset = memory_dataset(
            &data,
            crate::types::DType::Uint16,
            2,
            &[2, 2, 8, 8],
            Some(&[8, 8, 8, 8]),
        );
        let job = ApplyMasksJob::new(Arc::new(dataset), container).unwrap();
        let mixed = run_sync(&job);

        let dataset = memory_dataset(
            &data,
            crate::types::DType::Uint16,
            2,
            &[2, 2, 8, 8],
            Some(&[8, 8, 8, 8]),
        );
        let all_dense = ApplyMasksJob::new(
            Arc::new(dataset),
            mask_container(
                vec![dense_mask_factory(mask0), dense_mask_factory(mask1)],
                SparsePolicy::Dense,
                &[8, 8],
            ),
        )
        .unwrap();
        let dense = run_sync(&all_dense);
        assert_allclose(mixed.as_real().unwrap(), &expected);
        assert_eq!(dense.as_real().unwrap(), mixed.as_real().unwrap());
    }

    #[test]
    fn mask_projection_flat_navigation() {
        // Time series: a flat stack of frames.
        let data = mk_random_u16(&[64, 8, 8], 11);
        let mask = mk_random_f64(&[8, 8], 12);
        let expected = naive_mask_apply(&[mask.clone()], &widen(&data), 2);
        let dataset = memory_dataset(
            &data,
            crate::types::DType::Uint16,
            2,
            &[2, 8, 8],
            Some(&[16, 8, 8]),
        );
        let job = ApplyMasksJob::new(
            Arc::new(dataset),
            mask_container(vec![dense_mask_factory(mask)], SparsePolicy::Auto, &[8, 8]),
        )
        .unwrap();
        assert_eq!(vec![1, 64], job.result_shape());
        let buffer = run_sync(&job);
        assert_allclose(buffer.as_real().unwrap(), &expected);
    }

    #[test]
    fn mask_projection_1d_signal_spectrum() {
        let data = mk_random_u16(&[4, 4, 64], 13);
        let mask = mk_random_f64(&[64], 14);
        let expected = naive_mask_apply(&[mask.clone()], &widen(&data), 1);
        let dataset = memory_dataset(
            &data,
            crate::types::DType::Uint16,
            1,
            &[1, 2, 64],
            Some(&[1, 4, 64]),
        );
        let job = ApplyMasksJob::new(
            Arc::new(dataset),
            mask_container(vec![dense_mask_factory(mask)], SparsePolicy::Auto, &[64]),
        )
        .unwrap();
        assert_eq!(vec![1, 4, 4], job.result_shape());
        let buffer = run_sync(&job);
        assert_allclose(buffer.as_real().unwrap(), &expected);
    }

    #[test]
    fn mask_projection_3d_signal() {
        let data = mk_random_u16(&[8, 4, 4, 4], 15);
        let mask = mk_random_f64(&[4, 4, 4], 16);
        let expected = naive_mask_apply(&[mask.clone()], &widen(&data), 3);
        let dataset = memory_dataset(
            &data,
            crate::types::DType::Uint16,
            3,
            &[1, 4, 4, 4],
            Some(&[4, 4, 4, 4]),
        );
        let job = ApplyMasksJob::new(
            Arc::new(dataset),
            mask_container(
                vec![dense_mask_factory(mask)],
                SparsePolicy::Auto,
                &[4, 4, 4],
            ),
        )
        .unwrap();
        let buffer = run_sync(&job);
        assert_allclose(buffer.as_real().unwrap(), &expected);
    }

    #[test]
    fn complex_masks_expose_raw_and_magnitude() {
        let data = mk_random_u16(&[4, 4, 4, 4], 17);
        let re = mk_random_f64(&[4, 4], 18);
        let im = mk_random_f64(&[4, 4], 19);
        let expected_re = naive_mask_apply(&[re.clone()], &widen(&data), 2);
        let expected_im = naive_mask_apply(&[im.clone()], &widen(&data), 2);
        let complex_mask = ndarray::Zip::from(&re)
            .and(&im)
            .map_collect(|r, i| Complex64::new(*r, *i));
        let dataset = memory_dataset(
            &data,
            crate::types::DType::Uint16,
            2,
            &[2, 2, 4, 4],
            Some(&[4, 4, 4, 4]),
        );
        let job = ApplyMasksJob::new(
            Arc::new(dataset),
            mask_container(
                vec![Box::new(move || {
                    crate::masks::Mask::Complex(complex_mask.clone())
                })],
                SparsePolicy::Auto,
                &[4, 4],
            ),
        )
        .unwrap();
        assert_eq!(ResultKind::Complex, job.result_kind());
        let buffer = run_sync(&job);
        let raw = buffer.as_complex().unwrap();
        for (index, value) in raw.indexed_iter() {
            let coords = index.slice();
            assert!((value.re - expected_re[coords]).abs() < 1e-9 * expected_re[coords].abs().max(1.0));
            assert!((value.im - expected_im[coords]).abs() < 1e-9 * expected_im[coords].abs().max(1.0));
        }
        // Derived magnitude view alongside the raw complex result.
        let magnitude = buffer.magnitude();
        for (index, value) in magnitude.indexed_iter() {
            let coords = index.slice();
            let expected =
                Complex64::new(expected_re[coords], expected_im[coords]).norm();
            assert!((value - expected).abs() < 1e-9 * expected.max(1.0));
        }
    }

    #[test]
    fn crop_is_lossless_for_covered_region() {
        let data = mk_random_u16(&[8, 8, 4, 4], 20);
        let mask = mk_random_f64(&[4, 4], 21);
        let make_job = |crop: Option<Slice>| {
            let dataset = memory_dataset(
                &data,
                crate::types::DType::Uint16,
                2,
                &[1, 2, 4, 4],
                Some(&[2, 8, 4, 4]),
            );
            let mut job = ApplyMasksJob::new(
                Arc::new(dataset),
                mask_container(
                    vec![dense_mask_factory(mask.clone())],
                    SparsePolicy::Auto,
                    &[4, 4],
                ),
            )
            .unwrap();
            if let Some(crop) = crop {
                job = job.with_crop(crop);
            }
            job
        };
        let full = run_sync(&make_job(None));
        let crop = Slice::new(
            vec![2, 0, 0, 0],
            Shape::new(vec![4, 8, 4, 4], 2).unwrap(),
        )
        .unwrap();
        let cropped = run_sync(&make_job(Some(crop)));
        let full = full.as_real().unwrap();
        let cropped = cropped.as_real().unwrap();
        for (index, value) in cropped.indexed_iter() {
            let coords = index.slice();
            let row = coords[1];
            if (2..6).contains(&row) {
                // In-region values match the full computation exactly.
                assert_eq!(full[coords], *value);
            } else {
                // Everything outside the crop was never touched.
                assert_eq!(0.0, *value);
            }
        }
    }

    #[test]
    fn cancelled_partition_returns_no_partial() {
        let data = mk_random_u16(&[4, 4, 4, 4], 22);
        let dataset = memory_dataset(
            &data,
            crate::types::DType::Uint16,
            2,
            &[1, 1, 4, 4],
            Some(&[4, 4, 4, 4]),
        );
        let job = SumFramesJob::new(Arc::new(dataset));
        let cancel = CancelToken::new();
        cancel.cancel();
        let partitions = job.get_partitions().unwrap();
        let result = job.reduce_partition(&partitions[0], &cancel).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn mask_shape_mismatch_rejected_eagerly() {
        let data = mk_random_u16(&[4, 4, 4, 4], 23);
        let dataset = memory_dataset(&data, crate::types::DType::Uint16, 2, &[1, 1, 4, 4], None);
        let result = ApplyMasksJob::new(
            Arc::new(dataset),
            mask_container(
                vec![dense_mask_factory(mk_random_f64(&[8, 8], 24))],
                SparsePolicy::Auto,
                &[8, 8],
            ),
        );
        assert!(result.is_err());
    }
}
