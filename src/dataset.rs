//! Datasets and partitioning.
//!
//! A [DataSet] describes an on-disk or in-memory n-dimensional array and
//! knows how to split it into [Partition]s: large contiguous regions that
//! are each processed as one unit of parallel work. Partitions collectively
//! tile the dataset exactly, with no gaps or overlaps, and every partition
//! carries a fresh reader handle so no reader state is shared between
//! concurrent tasks.

use bytes::Bytes;

use crate::error::QuadStemError;
use crate::geometry::{Shape, Slice};
use crate::partition::Partition;
use crate::reader::MemoryReader;
use crate::types::{DType, Element};

/// Default memory budget one partition should stay close to.
pub const TARGET_PARTITION_SIZE: usize = 256 * 1024 * 1024;

/// Static description of a dataset, shared with its partitions.
#[derive(Clone, Debug)]
pub struct DataSetMeta {
    shape: Shape,
    raw_shape: Shape,
    dtype: DType,
    frames_only_crop: bool,
}

impl DataSetMeta {
    pub fn new(shape: Shape, raw_shape: Shape, dtype: DType, frames_only_crop: bool) -> Self {
        DataSetMeta {
            shape,
            raw_shape,
            dtype,
            frames_only_crop,
        }
    }

    /// Effective shape of the dataset.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Shape of the stored data, which may be larger than the effective
    /// shape when the detector frame is cropped on read.
    pub fn raw_shape(&self) -> &Shape {
        &self.raw_shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Whether crop regions must cover whole signal frames.
    pub fn frames_only_crop(&self) -> bool {
        self.frames_only_crop
    }
}

/// Trait for datasets.
///
/// A dataset value only exists once its format header has been read and
/// validated, so partitioning can never observe an unvalidated dataset.
/// `get_partitions` is idempotent: every call derives the same partitions
/// from the dataset geometry.
pub trait DataSet: Send + Sync {
    fn meta(&self) -> &DataSetMeta;

    /// Re-validate the dataset against its source.
    fn check_valid(&self) -> Result<(), QuadStemError>;

    /// The ordered sequence of partitions covering the whole dataset.
    fn get_partitions(&self) -> Result<Vec<Partition>, QuadStemError>;

    fn shape(&self) -> &Shape {
        self.meta().shape()
    }

    fn dtype(&self) -> DType {
        self.meta().dtype()
    }
}

/// Compute a partition shape for the given dataset geometry.
///
/// Grows a navigation chunk, filling trailing navigation dimensions first,
/// until the estimated partition size approaches `target_size` bytes. The
/// signal dimensions are always taken whole, so a partition holds complete
/// frames.
pub fn partition_shape(
    shape: &Shape,
    dtype: DType,
    target_size: usize,
) -> Result<Shape, QuadStemError> {
    let frame_bytes = shape.sig_size() * dtype.size_of();
    let budget_frames = (target_size / frame_bytes.max(1)).max(1);
    let nav = shape.nav();
    let mut chunk = vec![1; nav.len()];
    let mut frames = 1;
    for i in (0..nav.len()).rev() {
        chunk[i] = nav[i].min((budget_frames / frames).max(1));
        frames *= chunk[i];
        if frames >= budget_frames {
            break;
        }
    }
    let mut dims = chunk;
    dims.extend_from_slice(shape.sig());
    Shape::new(dims, shape.sig_dims())
}

/// An in-memory dataset.
///
/// Mostly used for held-in-RAM data and for exercising odd partition and
/// tile geometries; the partition shape can be set explicitly instead of
/// being derived from the memory budget.
#[derive(Debug)]
pub struct MemoryDataSet {
    meta: DataSetMeta,
    data: Bytes,
    tileshape: Shape,
    partition_shape: Option<Shape>,
}

impl MemoryDataSet {
    /// Return a new MemoryDataSet over raw row-major bytes.
    pub fn new(
        data: Bytes,
        shape: Shape,
        dtype: DType,
        tileshape: Shape,
    ) -> Result<Self, QuadStemError> {
        let expected = shape.size() * dtype.size_of();
        if data.len() != expected {
            return Err(QuadStemError::SizeMismatch {
                expected: expected as u64,
                actual: data.len() as u64,
            });
        }
        if tileshape.ndim() != shape.ndim() {
            return Err(QuadStemError::geometry(format!(
                "tile rank {} != dataset rank {}",
                tileshape.ndim(),
                shape.ndim()
            )));
        }
        Ok(MemoryDataSet {
            meta: DataSetMeta::new(shape.clone(), shape, dtype, false),
            data,
            tileshape,
            partition_shape: None,
        })
    }

    /// Return a new MemoryDataSet over a typed ndarray.
    ///
    /// The array must be in standard (row-major, contiguous) layout.
    pub fn from_array<T: Element>(
        array: &ndarray::ArrayD<T>,
        sig_dims: usize,
        dtype: DType,
        tileshape: Shape,
    ) -> Result<Self, QuadStemError> {
        use zerocopy::AsBytes;
        let slice = array.as_slice().ok_or_else(|| {
            QuadStemError::geometry("array must be contiguous and in standard layout")
        })?;
        let shape = Shape::new(array.shape().to_vec(), sig_dims)?;
        Self::new(
            Bytes::copy_from_slice(slice.as_bytes()),
            shape,
            dtype,
            tileshape,
        )
    }

    /// Use an explicit partition shape instead of the memory-budget default.
    pub fn with_partition_shape(mut self, partition_shape: Shape) -> Result<Self, QuadStemError> {
        if partition_shape.ndim() != self.meta.shape().ndim() {
            return Err(QuadStemError::geometry(format!(
                "partition rank {} != dataset rank {}",
                partition_shape.ndim(),
                self.meta.shape().ndim()
            )));
        }
        self.partition_shape = Some(partition_shape);
        Ok(self)
    }
}

impl DataSet for MemoryDataSet {
    fn meta(&self) -> &DataSetMeta {
        &self.meta
    }

    fn check_valid(&self) -> Result<(), QuadStemError> {
        Ok(())
    }

    fn get_partitions(&self) -> Result<Vec<Partition>, QuadStemError> {
        let pshape = match &self.partition_shape {
            Some(shape) => shape.clone(),
            None => partition_shape(self.meta.shape(), self.meta.dtype(), TARGET_PARTITION_SIZE)?,
        };
        let ds_slice = Slice::full(self.meta.shape());
        let partitions = ds_slice
            .subslices(&pshape)?
            .map(|pslice| {
                Partition::new(
                    self.meta.clone(),
                    pslice,
                    self.tileshape.clone(),
                    Box::new(MemoryReader::new(
                        self.data.clone(),
                        self.meta.shape().clone(),
                        self.meta.dtype(),
                    )),
                )
            })
            .collect::<Vec<_>>();
        tracing::debug!(
            "memory dataset split into {} partitions of {:?}",
            partitions.len(),
            pshape.dims()
        );
        Ok(partitions)
    }
}
