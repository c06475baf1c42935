//! Raw binary datasets.
//!
//! A raw dataset is a headerless flat file of frames in row-major order.
//! The geometry is declared by the caller: scan shape, stored detector
//! shape and dtype. The stored detector frame can optionally be cropped to
//! a smaller read region, e.g. for detectors that pad frames with junk
//! rows.

use std::path::{Path, PathBuf};

use crate::dataset::{partition_shape, DataSet, DataSetMeta, TARGET_PARTITION_SIZE};
use crate::error::QuadStemError;
use crate::geometry::{Shape, Slice};
use crate::partition::Partition;
use crate::reader::FileReader;
use crate::types::DType;

/// Dataset over a headerless flat binary file.
#[derive(Debug)]
pub struct RawDataSet {
    path: PathBuf,
    meta: DataSetMeta,
    tileshape: Shape,
}

impl RawDataSet {
    /// Open a raw dataset, validating the file size against the declared
    /// geometry.
    ///
    /// `detector_shape` is the stored frame shape; `crop_detector_to`, if
    /// given, restricts reads to that top-left region of each frame and
    /// becomes the effective signal shape.
    pub fn open<P: AsRef<Path>>(
        path: P,
        dtype: DType,
        scan_shape: &[usize],
        detector_shape: &[usize],
        crop_detector_to: Option<&[usize]>,
        tileshape: Shape,
    ) -> Result<Self, QuadStemError> {
        let sig_dims = detector_shape.len();
        let mut raw_dims = scan_shape.to_vec();
        raw_dims.extend_from_slice(detector_shape);
        let raw_shape = Shape::new(raw_dims, sig_dims)?;

        let sig = match crop_detector_to {
            Some(crop) => {
                if crop.len() != sig_dims {
                    return Err(QuadStemError::geometry(format!(
                        "crop rank {} != detector rank {}",
                        crop.len(),
                        sig_dims
                    )));
                }
                for (c, d) in crop.iter().zip(detector_shape.iter()) {
                    if c > d {
                        return Err(QuadStemError::geometry(format!(
                            "crop {:?} exceeds detector shape {:?}",
                            crop, detector_shape
                        )));
                    }
                }
                crop.to_vec()
            }
            None => detector_shape.to_vec(),
        };
        let mut dims = scan_shape.to_vec();
        dims.extend_from_slice(&sig);
        let shape = Shape::new(dims, sig_dims)?;

        if tileshape.ndim() != shape.ndim() {
            return Err(QuadStemError::geometry(format!(
                "tile rank {} != dataset rank {}",
                tileshape.ndim(),
                shape.ndim()
            )));
        }

        let dataset = RawDataSet {
            path: path.as_ref().to_path_buf(),
            meta: DataSetMeta::new(shape, raw_shape, dtype, true),
            tileshape,
        };
        dataset.check_valid()?;
        Ok(dataset)
    }
}

impl DataSet for RawDataSet {
    fn meta(&self) -> &DataSetMeta {
        &self.meta
    }

    fn check_valid(&self) -> Result<(), QuadStemError> {
        let metadata =
            std::fs::metadata(&self.path).map_err(|err| QuadStemError::HeaderUnreadable {
                path: self.path.display().to_string(),
                source: err,
            })?;
        let expected = (self.meta.raw_shape().size() * self.meta.dtype().size_of()) as u64;
        if metadata.len() != expected {
            return Err(QuadStemError::SizeMismatch {
                expected,
                actual: metadata.len(),
            });
        }
        Ok(())
    }

    fn get_partitions(&self) -> Result<Vec<Partition>, QuadStemError> {
        let pshape = partition_shape(self.meta.shape(), self.meta.dtype(), TARGET_PARTITION_SIZE)?;
        let ds_slice = Slice::full(self.meta.shape());
        let partitions = ds_slice
            .subslices(&pshape)?
            .map(|pslice| {
                Partition::new(
                    self.meta.clone(),
                    pslice,
                    self.tileshape.clone(),
                    Box::new(FileReader::new(
                        &self.path,
                        0,
                        self.meta.raw_shape().clone(),
                        self.meta.dtype(),
                    )),
                )
            })
            .collect::<Vec<_>>();
        tracing::debug!(
            "raw dataset {} split into {} partitions of {:?}",
            self.path.display(),
            partitions.len(),
            pshape.dims()
        );
        Ok(partitions)
    }
}
