//! BLO (NanoMegas ASTAR) datasets.
//!
//! The format is a fixed little-endian header followed by a virtual
//! bright-field image and the diffraction pattern frames. Each stored frame
//! is preceded by 6 bytes which are skipped on read. Only the header fields
//! needed to locate and shape the frame data are consumed here.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::dataset::{partition_shape, DataSet, DataSetMeta, TARGET_PARTITION_SIZE};
use crate::error::QuadStemError;
use crate::geometry::{Shape, Slice};
use crate::partition::Partition;
use crate::reader::FileReader;
use crate::types::DType;

/// Expected value of the header's magic field.
pub const MAGIC_EXPECT: u16 = 258;

/// Bytes stored before each frame's pixel data.
const FRAME_PREFIX_BYTES: u64 = 6;

/// Parsed BLO file header.
///
/// Field layout (all little-endian): 6 identification bytes, magic `u16`,
/// two `u32` data offsets, a `u32` flag word, then `u16` detector extent,
/// detector rotation, scan extents and scan rotation.
#[derive(Clone, Debug)]
pub struct BloHeader {
    pub magic: u16,
    pub data_offset_vbf: u32,
    pub data_offset_frames: u32,
    pub dp_sz: u16,
    pub nx: u16,
    pub ny: u16,
}

impl BloHeader {
    fn read_from(path: &Path) -> Result<Self, QuadStemError> {
        let header_error = |err| QuadStemError::HeaderUnreadable {
            path: path.display().to_string(),
            source: err,
        };
        let mut file = File::open(path).map_err(header_error)?;
        let mut buf = [0_u8; 28];
        file.read_exact(&mut buf).map_err(header_error)?;
        Ok(BloHeader {
            magic: u16::from_le_bytes([buf[6], buf[7]]),
            data_offset_vbf: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            data_offset_frames: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            dp_sz: u16::from_le_bytes([buf[20], buf[21]]),
            nx: u16::from_le_bytes([buf[24], buf[25]]),
            ny: u16::from_le_bytes([buf[26], buf[27]]),
        })
    }

    fn check_magic(&self) -> Result<(), QuadStemError> {
        if self.magic != MAGIC_EXPECT {
            return Err(QuadStemError::FormatInvalid {
                expected: MAGIC_EXPECT as u64,
                observed: self.magic as u64,
            });
        }
        Ok(())
    }
}

/// Dataset over a BLO file. Frames are unsigned 8-bit.
#[derive(Debug)]
pub struct BloDataSet {
    path: PathBuf,
    header: BloHeader,
    meta: DataSetMeta,
    tileshape: Shape,
}

impl BloDataSet {
    /// Open a BLO dataset, reading and validating the header.
    pub fn open<P: AsRef<Path>>(path: P, tileshape: Shape) -> Result<Self, QuadStemError> {
        let path = path.as_ref().to_path_buf();
        let header = BloHeader::read_from(&path)?;
        header.check_magic()?;
        let shape = Shape::new(
            vec![
                header.ny as usize,
                header.nx as usize,
                header.dp_sz as usize,
                header.dp_sz as usize,
            ],
            2,
        )?;
        if tileshape.ndim() != shape.ndim() {
            return Err(QuadStemError::geometry(format!(
                "tile rank {} != dataset rank {}",
                tileshape.ndim(),
                shape.ndim()
            )));
        }
        Ok(BloDataSet {
            path,
            meta: DataSetMeta::new(shape.clone(), shape, DType::Uint8, true),
            header,
            tileshape,
        })
    }

    pub fn header(&self) -> &BloHeader {
        &self.header
    }
}

impl DataSet for BloDataSet {
    fn meta(&self) -> &DataSetMeta {
        &self.meta
    }

    fn check_valid(&self) -> Result<(), QuadStemError> {
        BloHeader::read_from(&self.path)?.check_magic()
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
                    Box::new(
                        FileReader::new(
                            &self.path,
                            self.header.data_offset_frames as u64,
                            self.meta.raw_shape().clone(),
                            self.meta.dtype(),
                        )
                        .with_frame_prefix(FRAME_PREFIX_BYTES),
                    ),
                )
            })
            .collect::<Vec<_>>();
        tracing::debug!(
            "blo dataset {} split into {} partitions of {:?}",
            self.path.display(),
            partitions.len(),
            pshape.dims()
        );
        Ok(partitions)
    }
}
