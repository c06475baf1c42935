//! Dataset readers: scoped access to the raw bytes behind a dataset.
//!
//! A [DatasetReader] is a cheap handle describing how to reach the data; it
//! is created fresh for every [crate::partition::Partition] so that
//! partitions can be processed concurrently without sharing reader state.
//! Calling [DatasetReader::open] acquires the underlying resource (file
//! handle, memory view) and returns a scoped [ReaderData] that is released
//! when dropped, whether tile iteration completed, errored or was cancelled.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::QuadStemError;
use crate::geometry::{Shape, Slice};
use crate::types::DType;

/// Convert from Bytes to `&[T]`.
///
/// Zerocopy provides a mechanism for converting between types.
/// Correct alignment of the data is necessary.
pub(crate) fn from_bytes<T: zerocopy::FromBytes>(data: &Bytes) -> Result<&[T], QuadStemError> {
    let layout = zerocopy::LayoutVerified::<_, [T]>::new_slice(&data[..]).ok_or(
        QuadStemError::FromBytes {
            type_name: std::any::type_name::<T>(),
        },
    )?;
    Ok(layout.into_slice())
}

/// Allocate a zero-filled byte buffer aligned for any supported element
/// type, so that typed views over it cannot fail on alignment.
pub(crate) fn aligned_buf(len: usize) -> Vec<u8> {
    let mut buf = maligned::align_first::<u8, maligned::A8>(len);
    buf.resize(len, 0);
    buf
}

/// Capability for reading regions of a dataset.
pub trait DatasetReader: Send + Sync {
    /// Acquire a scoped view over the data. The view holds any underlying
    /// resource until it is dropped.
    fn open(&self) -> Result<Box<dyn ReaderData + '_>, QuadStemError>;
}

/// A scoped, opened view over a dataset's data.
pub trait ReaderData {
    /// Read the dense row-major bytes of `slice`.
    fn read_slice(&mut self, slice: &Slice) -> Result<Bytes, QuadStemError>;
}

impl std::fmt::Debug for dyn ReaderData + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReaderData")
    }
}

/// Reader over an in-memory array.
pub struct MemoryReader {
    data: Bytes,
    shape: Shape,
    dtype: DType,
}

impl MemoryReader {
    pub fn new(data: Bytes, shape: Shape, dtype: DType) -> Self {
        MemoryReader { data, shape, dtype }
    }
}

impl DatasetReader for MemoryReader {
    fn open(&self) -> Result<Box<dyn ReaderData + '_>, QuadStemError> {
        Ok(Box::new(MemoryReaderData { reader: self }))
    }
}

struct MemoryReaderData<'a> {
    reader: &'a MemoryReader,
}

impl ReaderData for MemoryReaderData<'_> {
    fn read_slice(&mut self, slice: &Slice) -> Result<Bytes, QuadStemError> {
        let esize = self.reader.dtype.size_of();
        let mut out = aligned_buf(slice.shape().size() * esize);
        let mut cursor = 0;
        for (offset, len) in slice.contiguous_runs(self.reader.shape.dims())? {
            let start = offset * esize;
            let nbytes = len * esize;
            out[cursor..cursor + nbytes].copy_from_slice(&self.reader.data[start..start + nbytes]);
            cursor += nbytes;
        }
        Ok(out.into())
    }
}

/// Reader over a flat row-major binary file.
///
/// `data_offset` is the byte position of the first stored element. When
/// `frame_prefix` is non-zero, each stored signal frame is preceded by that
/// many bytes, which are skipped on read (the BLO layout stores a 6-byte
/// preamble before every frame).
pub struct FileReader {
    path: PathBuf,
    data_offset: u64,
    raw_shape: Shape,
    dtype: DType,
    frame_prefix: u64,
}

impl FileReader {
    pub fn new<P: AsRef<Path>>(path: P, data_offset: u64, raw_shape: Shape, dtype: DType) -> Self {
        FileReader {
            path: path.as_ref().to_path_buf(),
            data_offset,
            raw_shape,
            dtype,
            frame_prefix: 0,
        }
    }

    pub fn with_frame_prefix(mut self, frame_prefix: u64) -> Self {
        self.frame_prefix = frame_prefix;
        self
    }

    /// Byte position of a global element index within the file.
    fn byte_offset(&self, element: usize) -> u64 {
        let esize = self.dtype.size_of() as u64;
        if self.frame_prefix == 0 {
            return self.data_offset + element as u64 * esize;
        }
        let sig_size = self.raw_shape.sig_size();
        let frame = (element / sig_size) as u64;
        let within = (element % sig_size) as u64;
        let frame_bytes = sig_size as u64 * esize;
        self.data_offset + frame * (self.frame_prefix + frame_bytes) + self.frame_prefix
            + within * esize
    }

    fn read_error(&self, source: std::io::Error) -> QuadStemError {
        QuadStemError::DatasetRead {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl DatasetReader for FileReader {
    fn open(&self) -> Result<Box<dyn ReaderData + '_>, QuadStemError> {
        let file = File::open(&self.path).map_err(|err| self.read_error(err))?;
        Ok(Box::new(FileReaderData { reader: self, file }))
    }
}

struct FileReaderData<'a> {
    reader: &'a FileReader,
    file: File,
}

impl ReaderData for FileReaderData<'_> {
    fn read_slice(&mut self, slice: &Slice) -> Result<Bytes, QuadStemError> {
        let esize = self.reader.dtype.size_of();
        let sig_size = self.reader.raw_shape.sig_size();
        let mut out = aligned_buf(slice.shape().size() * esize);
        let mut cursor = 0;
        for (offset, len) in slice.contiguous_runs(self.reader.raw_shape.dims())? {
            let mut offset = offset;
            let mut remaining = len;
            while remaining > 0 {
                // Runs must not cross a stored frame boundary when frames
                // carry a prefix.
                let chunk = if self.reader.frame_prefix > 0 {
                    remaining.min(sig_size - offset % sig_size)
                } else {
                    remaining
                };
                let nbytes = chunk * esize;
                self.file
                    .seek(SeekFrom::Start(self.reader.byte_offset(offset)))
                    .map_err(|err| self.reader.read_error(err))?;
                self.file
                    .read_exact(&mut out[cursor..cursor + nbytes])
                    .map_err(|err| self.reader.read_error(err))?;
                cursor += nbytes;
                offset += chunk;
                remaining -= chunk;
            }
        }
        Ok(out.into())
    }
}
