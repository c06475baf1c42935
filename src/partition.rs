//! Partitions and tile streaming.
//!
//! A [Partition] owns one [Slice] of the whole dataset plus its own reader
//! handle, and produces a lazy sequence of [DataTile]s covering exactly that
//! slice. Tile iteration opens the reader once and releases it when the
//! stream is dropped, whether it was exhausted, cancelled or errored.

use bytes::Bytes;
use ndarray::{ArrayView2, ArrayViewD, IxDyn};

use crate::dataset::DataSetMeta;
use crate::error::QuadStemError;
use crate::geometry::{Shape, Slice, Subslices};
use crate::reader::{from_bytes, DatasetReader, ReaderData};
use crate::types::{DType, Element};

/// One tile of data: a dense buffer plus the slice it covers.
///
/// The tile exclusively owns its buffer for the duration of one reduction
/// step.
pub struct DataTile {
    data: Bytes,
    dtype: DType,
    tile_slice: Slice,
}

impl DataTile {
    pub fn new(data: Bytes, dtype: DType, tile_slice: Slice) -> Self {
        DataTile {
            data,
            dtype,
            tile_slice,
        }
    }

    pub fn tile_slice(&self) -> &Slice {
        &self.tile_slice
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Typed n-dimensional view over the tile's buffer.
    pub fn view<T: Element>(&self) -> Result<ArrayViewD<'_, T>, QuadStemError> {
        let elements = from_bytes::<T>(&self.data)?;
        ArrayViewD::from_shape(IxDyn(self.tile_slice.shape().dims()), elements)
            .map_err(QuadStemError::ShapeInvalid)
    }

    /// Flattened `(navigation positions, signal pixels)` view, the layout
    /// the reduction kernels consume.
    pub fn flat_view<T: Element>(&self) -> Result<ArrayView2<'_, T>, QuadStemError> {
        let elements = from_bytes::<T>(&self.data)?;
        let shape = self.tile_slice.shape();
        ArrayView2::from_shape((shape.nav_size(), shape.sig_size()), elements)
            .map_err(QuadStemError::ShapeInvalid)
    }
}

/// A large contiguous region of the dataset, processed as one unit of
/// parallel work.
///
/// Immutable once created. Each partition owns an independent reader
/// handle; concurrent iteration over the same partition object is not
/// supported, but every call to [Partition::get_tiles] reopens the reader,
/// so the tile sequence is restartable.
pub struct Partition {
    meta: DataSetMeta,
    slice: Slice,
    tileshape: Shape,
    reader: Box<dyn DatasetReader>,
}

impl Partition {
    pub fn new(
        meta: DataSetMeta,
        slice: Slice,
        tileshape: Shape,
        reader: Box<dyn DatasetReader>,
    ) -> Self {
        Partition {
            meta,
            slice,
            tileshape,
            reader,
        }
    }

    pub fn meta(&self) -> &DataSetMeta {
        &self.meta
    }

    pub fn slice(&self) -> &Slice {
        &self.slice
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype()
    }

    /// Size of this partition's data in bytes.
    pub fn num_bytes(&self) -> usize {
        self.slice.shape().size() * self.meta.dtype().size_of()
    }

    /// Stream the tiles covering this partition's slice, optionally
    /// restricted to the intersection with `crop_to`.
    ///
    /// Tiles are produced in the deterministic row-major order of the
    /// tiling; tiles whose intersection with the crop region is empty are
    /// skipped. For datasets that only support whole-frame crops, a crop
    /// region with signal extents smaller than the frame fails here, before
    /// any I/O occurs.
    pub fn get_tiles(&self, crop_to: Option<&Slice>) -> Result<TileStream<'_>, QuadStemError> {
        if let Some(crop) = crop_to {
            if crop.shape().ndim() != self.slice.shape().ndim() {
                return Err(QuadStemError::geometry(format!(
                    "crop rank {} != partition rank {}",
                    crop.shape().ndim(),
                    self.slice.shape().ndim()
                )));
            }
            if self.meta.frames_only_crop() && crop.shape().sig() != self.meta.shape().sig() {
                return Err(QuadStemError::UnsupportedCrop);
            }
        }
        let data = self.reader.open()?;
        let subslices = self.slice.subslices(&self.tileshape)?;
        Ok(TileStream {
            data,
            subslices,
            crop: crop_to.cloned(),
            dtype: self.meta.dtype(),
        })
    }
}

/// Lazy, finite stream of [DataTile]s. Holds the opened reader view for its
/// lifetime.
#[derive(Debug)]
pub struct TileStream<'a> {
    data: Box<dyn ReaderData + 'a>,
    subslices: Subslices,
    crop: Option<Slice>,
    dtype: DType,
}

impl Iterator for TileStream<'_> {
    type Item = Result<DataTile, QuadStemError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let tile_slice = self.subslices.next()?;
            let tile_slice = match &self.crop {
                Some(crop) => {
                    let intersection = tile_slice.intersection_with(crop);
                    if intersection.is_null() {
                        continue;
                    }
                    intersection
                }
                None => tile_slice,
            };
            return Some(
                self.data
                    .read_slice(&tile_slice)
                    .map(|data| DataTile::new(data, self.dtype, tile_slice)),
            );
        }
    }
}
