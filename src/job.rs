//! Job descriptions and the per-partition reduction contract.
//!
//! A [Job] is a declarative, immutable description of a reduction over a
//! dataset. It exposes the final result shape up front, so a display
//! surface can be pre-allocated, and a per-partition reduction that an
//! executor runs locally to each task. Runtime dtype dispatch into typed
//! kernels lives in the concrete jobs (see [crate::jobs]).

use ndarray::ArrayD;
use num_complex::Complex64;

use crate::error::QuadStemError;
use crate::executor::CancelToken;
use crate::geometry::Slice;
use crate::partition::Partition;

/// Element kind of a job's result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResultKind {
    Real,
    Complex,
}

/// The payload of a partial result.
pub enum ResultData {
    Real(ArrayD<f64>),
    Complex(ArrayD<Complex64>),
}

/// The reduced output of one partition: a dense array plus the region of
/// the result buffer it accumulates into.
pub struct PartialResult {
    region: Slice,
    data: ResultData,
}

impl PartialResult {
    pub fn new(region: Slice, data: ResultData) -> Self {
        PartialResult { region, data }
    }

    /// Region of the result buffer this partial accumulates into, in
    /// result-space coordinates.
    pub fn region(&self) -> &Slice {
        &self.region
    }

    pub fn data(&self) -> &ResultData {
        &self.data
    }
}

/// Trait for reduction jobs.
///
/// This forms the contract between executors and the reduction kinds.
pub trait Job: Send + Sync {
    /// Shape of the final result buffer.
    fn result_shape(&self) -> Vec<usize>;

    /// Element kind of the result buffer.
    fn result_kind(&self) -> ResultKind {
        ResultKind::Real
    }

    /// The partitions to dispatch, in order.
    fn get_partitions(&self) -> Result<Vec<Partition>, QuadStemError>;

    /// Reduce all tiles of one partition into a single [PartialResult].
    ///
    /// Runs synchronously on a worker; tile iteration within the partition
    /// is strictly sequential. Returns `Ok(None)` when the cancel token
    /// fired mid-iteration; remaining tiles are abandoned and no partial is
    /// delivered for this partition.
    fn reduce_partition(
        &self,
        partition: &Partition,
        cancel: &CancelToken,
    ) -> Result<Option<PartialResult>, QuadStemError>;
}
