//! Mask factories, sparse/dense mask matrices and caching.
//!
//! A mask is a fixed weighting array over the signal shape, applied to each
//! frame as a linear projection. For a given tile geometry all masks are
//! stacked into one `(signal pixels, num masks)` matrix so the reduction is
//! a single matrix product per tile. The matrix is represented sparse or
//! dense, two numerically equivalent encodings, and cached per tile
//! geometry, since only boundary tiles differ from the common tile shape.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use ndarray::{Array2, ArrayD, ArrayView2, Dimension};
use num_complex::Complex64;

use crate::error::QuadStemError;
use crate::geometry::{region_slice_info, Slice};

/// A function producing one mask per call.
pub type MaskFactory = Box<dyn Fn() -> Mask + Send + Sync>;

/// A single weighting array over the signal shape.
pub enum Mask {
    /// Dense real weights.
    Dense(ArrayD<f64>),
    /// Sparse real weights.
    Sparse(SparseMask),
    /// Dense complex weights.
    Complex(ArrayD<Complex64>),
}

/// Sparse coordinate-list representation of a mask.
#[derive(Clone, Debug)]
pub struct SparseMask {
    shape: Vec<usize>,
    entries: Vec<(Vec<usize>, f64)>,
}

impl SparseMask {
    pub fn new(shape: Vec<usize>) -> Self {
        SparseMask {
            shape,
            entries: vec![],
        }
    }

    /// Add a non-zero entry. Coordinates outside the shape are rejected.
    pub fn push(&mut self, coords: Vec<usize>, value: f64) -> Result<(), QuadStemError> {
        if coords.len() != self.shape.len()
            || coords.iter().zip(self.shape.iter()).any(|(c, s)| c >= s)
        {
            return Err(QuadStemError::geometry(format!(
                "sparse mask entry {:?} outside shape {:?}",
                coords, self.shape
            )));
        }
        self.entries.push((coords, value));
        Ok(())
    }

    /// Convert a dense mask, keeping only non-zero cells.
    pub fn from_dense(dense: &ArrayD<f64>) -> Self {
        let mut mask = SparseMask::new(dense.shape().to_vec());
        for (coords, value) in dense.indexed_iter() {
            if *value != 0.0 {
                mask.entries.push((coords.slice().to_vec(), *value));
            }
        }
        mask
    }

    /// Materialise as a dense array.
    pub fn to_dense(&self) -> ArrayD<f64> {
        let mut dense = ArrayD::zeros(ndarray::IxDyn(&self.shape));
        for (coords, value) in &self.entries {
            dense[ndarray::IxDyn(coords)] += *value;
        }
        dense
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
}

/// Tri-state sparse/dense selection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SparsePolicy {
    /// Sparse iff every mask is already sparse; any dense or complex input
    /// degrades the whole stacked matrix to dense.
    Auto,
    /// Always sparse; dense inputs are converted.
    Sparse,
    /// Always dense; sparse inputs are materialised.
    Dense,
}

/// Column-compressed sparse matrix, one column per mask.
pub struct SparseMatrix {
    nrows: usize,
    cols: Vec<Vec<(usize, f64)>>,
}

impl SparseMatrix {
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.cols.len()
    }
}

/// The stacked `(signal pixels, num masks)` matrix for one tile geometry.
pub enum MaskMatrix {
    Dense(Array2<f64>),
    Sparse(SparseMatrix),
    Complex(Array2<Complex64>),
}

/// Result of applying a mask matrix to one tile's flat data.
pub enum MaskApplyResult {
    /// `(navigation positions, num masks)` real projections.
    Real(Array2<f64>),
    /// `(navigation positions, num masks)` complex projections.
    Complex(Array2<Complex64>),
}

impl MaskMatrix {
    pub fn is_sparse(&self) -> bool {
        matches!(self, MaskMatrix::Sparse(_))
    }

    pub fn num_masks(&self) -> usize {
        match self {
            MaskMatrix::Dense(m) => m.ncols(),
            MaskMatrix::Sparse(m) => m.ncols(),
            MaskMatrix::Complex(m) => m.ncols(),
        }
    }

    /// Project flat tile data `(navigation positions, signal pixels)`
    /// through the matrix. All variants compute the same matrix product.
    pub fn apply(&self, data: ArrayView2<'_, f64>) -> MaskApplyResult {
        match self {
            MaskMatrix::Dense(m) => MaskApplyResult::Real(data.dot(m)),
            MaskMatrix::Sparse(m) => {
                let mut out = Array2::zeros((data.nrows(), m.ncols()));
                for (col, entries) in m.cols.iter().enumerate() {
                    for row in 0..data.nrows() {
                        let mut acc = 0.0;
                        for (pixel, weight) in entries {
                            acc += data[[row, *pixel]] * weight;
                        }
                        out[[row, col]] = acc;
                    }
                }
                MaskApplyResult::Real(out)
            }
            MaskMatrix::Complex(m) => {
                let mut out = Array2::zeros((data.nrows(), m.ncols()));
                for row in 0..data.nrows() {
                    for col in 0..m.ncols() {
                        let mut acc = Complex64::new(0.0, 0.0);
                        for pixel in 0..m.nrows() {
                            acc += m[[pixel, col]] * data[[row, pixel]];
                        }
                        out[[row, col]] = acc;
                    }
                }
                MaskApplyResult::Complex(out)
            }
        }
    }
}

/// Cache key: the signal region a matrix was computed for, plus its
/// representation.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct MaskKey {
    origin: Vec<usize>,
    dims: Vec<usize>,
    sparse: bool,
    complex: bool,
}

/// Holds the masks of a job and hands out cached per-tile mask matrices.
impl std::fmt::Debug for MaskContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskContainer")
            .field("num_masks", &self.masks.len())
            .field("sig_shape", &self.sig_shape)
            .field("use_sparse", &self.use_sparse)
            .field("complex", &self.complex)
            .finish()
    }
}

pub struct MaskContainer {
    masks: Vec<Mask>,
    sig_shape: Vec<usize>,
    use_sparse: bool,
    complex: bool,
    cache: Mutex<HashMap<MaskKey, Arc<MaskMatrix>>>,
}

impl MaskContainer {
    /// Evaluate the factories once and fix the representation.
    ///
    /// Fails eagerly when a factory produces a mask whose shape differs
    /// from the signal shape, or when the sparse representation is forced
    /// for complex masks.
    pub fn new(
        factories: Vec<MaskFactory>,
        policy: SparsePolicy,
        sig_shape: Vec<usize>,
    ) -> Result<Self, QuadStemError> {
        if factories.is_empty() {
            return Err(QuadStemError::geometry("at least one mask factory required"));
        }
        let masks: Vec<Mask> = factories.iter().map(|factory| factory()).collect();
        for mask in &masks {
            let shape = match mask {
                Mask::Dense(m) => m.shape(),
                Mask::Sparse(m) => m.shape(),
                Mask::Complex(m) => m.shape(),
            };
            if shape != sig_shape.as_slice() {
                return Err(QuadStemError::geometry(format!(
                    "mask shape {:?} != signal shape {:?}",
                    shape, sig_shape
                )));
            }
        }
        let complex = masks.iter().any(|m| matches!(m, Mask::Complex(_)));
        let all_sparse = masks.iter().all(|m| matches!(m, Mask::Sparse(_)));
        let use_sparse = match policy {
            SparsePolicy::Sparse => {
                if complex {
                    return Err(QuadStemError::ComplexSparse);
                }
                true
            }
            SparsePolicy::Dense => false,
            SparsePolicy::Auto => all_sparse,
        };
        Ok(MaskContainer {
            masks,
            sig_shape,
            use_sparse,
            complex,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Number of masks.
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// Whether any mask is complex-valued.
    pub fn is_complex(&self) -> bool {
        self.complex
    }

    /// The resolved representation.
    pub fn uses_sparse(&self) -> bool {
        self.use_sparse
    }

    pub fn sig_shape(&self) -> &[usize] {
        &self.sig_shape
    }

    /// The mask matrix for a tile, computed on first use per geometry and
    /// cached afterwards.
    pub fn get(&self, tile_slice: &Slice) -> Result<Arc<MaskMatrix>, QuadStemError> {
        let region = tile_slice.sig_region();
        if region.shape().ndim() != self.sig_shape.len()
            || region
                .origin()
                .iter()
                .zip(region.shape().dims())
                .zip(self.sig_shape.iter())
                .any(|((o, s), full)| o + s > *full)
        {
            return Err(QuadStemError::geometry(format!(
                "tile signal region {:?}+{:?} outside signal shape {:?}",
                region.origin(),
                region.shape().dims(),
                self.sig_shape
            )));
        }
        let key = MaskKey {
            origin: region.origin().to_vec(),
            dims: region.shape().dims().to_vec(),
            sparse: self.use_sparse,
            complex: self.complex,
        };
        let mut cache = self.cache.lock().expect("mask cache poisoned");
        if let Some(matrix) = cache.get(&key) {
            return Ok(matrix.clone());
        }
        let matrix = Arc::new(self.compute(&region)?);
        cache.insert(key, matrix.clone());
        Ok(matrix)
    }

    fn compute(&self, region: &Slice) -> Result<MaskMatrix, QuadStemError> {
        let dims = region.shape().dims();
        let npixels: usize = dims.iter().product();
        let mut strides = vec![1_usize; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * dims[i + 1];
        }
        let flat_index = |coords: &[usize]| -> Option<usize> {
            let mut index = 0;
            for i in 0..coords.len() {
                let c = coords[i].checked_sub(region.origin()[i])?;
                if c >= dims[i] {
                    return None;
                }
                index += c * strides[i];
            }
            Some(index)
        };
        if self.complex {
            let mut matrix = Array2::<Complex64>::zeros((npixels, self.masks.len()));
            for (col, mask) in self.masks.iter().enumerate() {
                match mask {
                    Mask::Complex(m) => {
                        for (pixel, value) in m.slice(region_slice_info(region)).iter().enumerate()
                        {
                            matrix[[pixel, col]] = *value;
                        }
                    }
                    Mask::Dense(m) => {
                        for (pixel, value) in m.slice(region_slice_info(region)).iter().enumerate()
                        {
                            matrix[[pixel, col]] = Complex64::new(*value, 0.0);
                        }
                    }
                    Mask::Sparse(m) => {
                        for (coords, value) in &m.entries {
                            if let Some(pixel) = flat_index(coords) {
                                matrix[[pixel, col]] += Complex64::new(*value, 0.0);
                            }
                        }
                    }
                }
            }
            return Ok(MaskMatrix::Complex(matrix));
        }

        if self.use_sparse {
            let mut cols = Vec::with_capacity(self.masks.len());
            for mask in &self.masks {
                let sparse;
                let entries = match mask {
                    Mask::Sparse(m) => &m.entries,
                    Mask::Dense(m) => {
                        sparse = SparseMask::from_dense(m);
                        &sparse.entries
                    }
                    Mask::Complex(_) => return Err(QuadStemError::ComplexSparse),
                };
                let col: Vec<(usize, f64)> = entries
                    .iter()
                    .filter_map(|(coords, value)| flat_index(coords).map(|pixel| (pixel, *value)))
                    .collect();
                cols.push(col);
            }
            return Ok(MaskMatrix::Sparse(SparseMatrix {
                nrows: npixels,
                cols,
            }));
        }

        let mut matrix = Array2::<f64>::zeros((npixels, self.masks.len()));
        for (col, mask) in self.masks.iter().enumerate() {
            match mask {
                Mask::Dense(m) => {
                    for (pixel, value) in m.slice(region_slice_info(region)).iter().enumerate() {
                        matrix[[pixel, col]] = *value;
                    }
                }
                Mask::Sparse(m) => {
                    for (coords, value) in &m.entries {
                        if let Some(pixel) = flat_index(coords) {
                            matrix[[pixel, col]] += *value;
                        }
                    }
                }
                Mask::Complex(_) => unreachable!("complex masks force the complex matrix"),
            }
        }
        Ok(MaskMatrix::Dense(matrix))
    }
}
