//! Data types and element traits.

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Supported storage data types
///
/// These are the dtypes a dataset may be stored in. Reductions never
/// accumulate in the storage dtype: elements are widened to `f64` (or
/// `Complex64` for complex masks) before summation, so a narrow detector
/// dtype combined with a large dynamic range cannot overflow or lose
/// precision in the accumulator.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// [u8]
    Uint8,
    /// [u16]
    Uint16,
    /// [u32]
    Uint32,
    /// [u64]
    Uint64,
    /// [i32]
    Int32,
    /// [i64]
    Int64,
    /// [f32]
    Float32,
    /// [f64]
    Float64,
}

impl DType {
    /// Returns the size of the associated type in bytes.
    pub fn size_of(self) -> usize {
        match self {
            Self::Uint8 => std::mem::size_of::<u8>(),
            Self::Uint16 => std::mem::size_of::<u16>(),
            Self::Uint32 => std::mem::size_of::<u32>(),
            Self::Uint64 => std::mem::size_of::<u64>(),
            Self::Int32 => std::mem::size_of::<i32>(),
            Self::Int64 => std::mem::size_of::<i64>(),
            Self::Float32 => std::mem::size_of::<f32>(),
            Self::Float64 => std::mem::size_of::<f64>(),
        }
    }
}

/// Trait for array elements.
pub trait Element:
    Clone
    + Copy
    + PartialOrd
    + Send
    + Sync
    + 'static
    + num_traits::ToPrimitive
    + num_traits::Zero
    + std::fmt::Debug
    + std::ops::Add<Output = Self>
    + zerocopy::AsBytes
    + zerocopy::FromBytes
{
    /// Widen to the accumulator type.
    fn as_f64(self) -> f64 {
        self.to_f64().unwrap_or(f64::NAN)
    }
}

/// Blanket implementation of Element.
impl<T> Element for T where
    T: Clone
        + Copy
        + PartialOrd
        + Send
        + Sync
        + 'static
        + num_traits::ToPrimitive
        + num_traits::Zero
        + std::fmt::Debug
        + std::ops::Add<Output = Self>
        + zerocopy::AsBytes
        + zerocopy::FromBytes
{
}
