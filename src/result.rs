//! Result buffers and streaming merge.
//!
//! The caller owns a single dense [ResultBuffer] matching the job's result
//! shape. As partial results arrive from the executor, in whatever order
//! partitions complete, each one is accumulated into its own coordinate
//! sub-region. Partitions write disjoint regions, so the merge is correct
//! regardless of delivery order and the buffer can be displayed while only
//! partially filled.

use ndarray::{ArrayD, IxDyn};
use num_complex::Complex64;

use crate::error::QuadStemError;
use crate::geometry::region_slice_info;
use crate::job::{Job, PartialResult, ResultData, ResultKind};

/// Caller-owned dense result buffer.
pub enum ResultBuffer {
    Real(ArrayD<f64>),
    Complex(ArrayD<Complex64>),
}

impl ResultBuffer {
    /// Allocate a zeroed buffer matching a job's result shape and kind.
    pub fn for_job(job: &dyn Job) -> Self {
        let shape = IxDyn(&job.result_shape());
        match job.result_kind() {
            ResultKind::Real => ResultBuffer::Real(ArrayD::zeros(shape)),
            ResultKind::Complex => ResultBuffer::Complex(ArrayD::zeros(shape)),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            ResultBuffer::Real(a) => a.shape(),
            ResultBuffer::Complex(a) => a.shape(),
        }
    }

    /// Zero the buffer for a fresh run.
    pub fn reset(&mut self) {
        match self {
            ResultBuffer::Real(a) => a.fill(0.0),
            ResultBuffer::Complex(a) => a.fill(Complex64::new(0.0, 0.0)),
        }
    }

    /// Accumulate a partial result into its region of the buffer.
    pub fn merge(&mut self, partial: &PartialResult) -> Result<(), QuadStemError> {
        let region = partial.region();
        if region.shape().ndim() != self.shape().len() {
            return Err(QuadStemError::ResultMismatch {
                reason: format!(
                    "region rank {} != buffer rank {}",
                    region.shape().ndim(),
                    self.shape().len()
                ),
            });
        }
        for (dim, extent) in self.shape().iter().enumerate() {
            if region.origin()[dim] + region.shape()[dim] > *extent {
                return Err(QuadStemError::ResultMismatch {
                    reason: format!(
                        "region extends past buffer in dimension {} ({} > {})",
                        dim,
                        region.origin()[dim] + region.shape()[dim],
                        extent
                    ),
                });
            }
        }
        match (self, partial.data()) {
            (ResultBuffer::Real(buffer), ResultData::Real(data)) => {
                let mut view = buffer.slice_mut(region_slice_info(region));
                view += data;
            }
            (ResultBuffer::Complex(buffer), ResultData::Complex(data)) => {
                let mut view = buffer.slice_mut(region_slice_info(region));
                view += data;
            }
            _ => {
                return Err(QuadStemError::ResultMismatch {
                    reason: "partial result kind does not match buffer kind".to_string(),
                })
            }
        }
        Ok(())
    }

    /// Real view of the result: identity for real buffers, elementwise
    /// magnitude for complex ones.
    pub fn magnitude(&self) -> ArrayD<f64> {
        match self {
            ResultBuffer::Real(a) => a.clone(),
            ResultBuffer::Complex(a) => a.mapv(|c| c.norm()),
        }
    }

    /// The real buffer, if this is a real result.
    pub fn as_real(&self) -> Option<&ArrayD<f64>> {
        match self {
            ResultBuffer::Real(a) => Some(a),
            ResultBuffer::Complex(_) => None,
        }
    }

    /// The raw complex buffer, if this is a complex result.
    pub fn as_complex(&self) -> Option<&ArrayD<Complex64>> {
        match self {
            ResultBuffer::Real(_) => None,
            ResultBuffer::Complex(a) => Some(a),
        }
    }
}
