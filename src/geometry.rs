//! Dataset geometry: shapes, slices and tilings.
//!
//! A [Shape] records the dimension sizes of an n-dimensional array together
//! with the split between navigation dimensions (scan position or frame
//! index) and signal dimensions (detector frame structure). A [Slice]
//! addresses a rectangular region of an enclosing array and can be tiled
//! into sub-slices, intersected with other slices, and decomposed into
//! contiguous element runs for I/O.

use serde::{Deserialize, Serialize};

use crate::error::QuadStemError;

/// Shape of an n-dimensional array.
///
/// The trailing `sig_dims` dimensions are signal dimensions; the leading
/// dimensions are navigation dimensions. `sig_dims` may be zero for pure
/// navigation-space shapes (e.g. result regions).
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Shape {
    dims: Vec<usize>,
    sig_dims: usize,
}

impl Shape {
    /// Return a new Shape.
    ///
    /// All dimension sizes must be positive and `sig_dims` must not exceed
    /// the number of dimensions.
    pub fn new(dims: Vec<usize>, sig_dims: usize) -> Result<Self, QuadStemError> {
        if sig_dims > dims.len() {
            return Err(QuadStemError::geometry(format!(
                "sig_dims {} exceeds rank {}",
                sig_dims,
                dims.len()
            )));
        }
        if dims.iter().any(|d| *d == 0) {
            return Err(QuadStemError::geometry(format!(
                "shape {:?} contains a zero-sized dimension",
                dims
            )));
        }
        Ok(Shape { dims, sig_dims })
    }

    /// Construct without validation. Used for intersection results, which
    /// may legitimately have zero extents.
    fn raw(dims: Vec<usize>, sig_dims: usize) -> Self {
        Shape { dims, sig_dims }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn sig_dims(&self) -> usize {
        self.sig_dims
    }

    /// The navigation dimension sizes (leading dimensions).
    pub fn nav(&self) -> &[usize] {
        &self.dims[..self.dims.len() - self.sig_dims]
    }

    /// The signal dimension sizes (trailing dimensions).
    pub fn sig(&self) -> &[usize] {
        &self.dims[self.dims.len() - self.sig_dims..]
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of navigation positions.
    pub fn nav_size(&self) -> usize {
        self.nav().iter().product()
    }

    /// Number of elements in one signal frame.
    pub fn sig_size(&self) -> usize {
        self.sig().iter().product()
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.dims[index]
    }
}

/// A rectangular region of an enclosing array: an origin plus a [Shape],
/// both in the enclosing array's coordinate space.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Slice {
    origin: Vec<usize>,
    shape: Shape,
}

impl Slice {
    /// Return a new Slice.
    pub fn new(origin: Vec<usize>, shape: Shape) -> Result<Self, QuadStemError> {
        if origin.len() != shape.ndim() {
            return Err(QuadStemError::geometry(format!(
                "origin rank {} != shape rank {}",
                origin.len(),
                shape.ndim()
            )));
        }
        Ok(Slice { origin, shape })
    }

    /// The slice covering a whole array of the given shape.
    pub fn full(shape: &Shape) -> Self {
        Slice {
            origin: vec![0; shape.ndim()],
            shape: shape.clone(),
        }
    }

    pub fn origin(&self) -> &[usize] {
        &self.origin
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// One-past-the-end coordinate in the given dimension.
    fn end(&self, dim: usize) -> usize {
        self.origin[dim] + self.shape[dim]
    }

    /// Whether this slice covers no coordinates at all.
    pub fn is_null(&self) -> bool {
        self.shape.dims().iter().any(|d| *d == 0)
    }

    /// Whether `other` lies entirely within this slice.
    pub fn contains(&self, other: &Slice) -> bool {
        self.shape.ndim() == other.shape.ndim()
            && (0..self.shape.ndim())
                .all(|i| other.origin[i] >= self.origin[i] && other.end(i) <= self.end(i))
    }

    /// The overlapping region of two slices. The result may be null; check
    /// with [Slice::is_null] before use.
    pub fn intersection_with(&self, other: &Slice) -> Slice {
        let ndim = self.shape.ndim();
        let mut origin = Vec::with_capacity(ndim);
        let mut dims = Vec::with_capacity(ndim);
        for i in 0..ndim {
            let start = self.origin[i].max(other.origin[i]);
            let end = self.end(i).min(other.end(i));
            origin.push(start);
            dims.push(end.saturating_sub(start));
        }
        Slice {
            origin,
            shape: Shape::raw(dims, self.shape.sig_dims()),
        }
    }

    /// Re-express this slice relative to `base`'s origin. `self` must lie
    /// entirely within `base`.
    pub fn shift(&self, base: &Slice) -> Result<Slice, QuadStemError> {
        if !base.contains(self) {
            return Err(QuadStemError::geometry(format!(
                "slice at {:?} does not lie within base at {:?}",
                self.origin, base.origin
            )));
        }
        let origin = self
            .origin
            .iter()
            .zip(base.origin.iter())
            .map(|(o, b)| o - b)
            .collect();
        Ok(Slice {
            origin,
            shape: self.shape.clone(),
        })
    }

    /// The signal part of this slice, as a slice over signal space only.
    pub fn sig_region(&self) -> Slice {
        let nav_len = self.shape.ndim() - self.shape.sig_dims();
        Slice {
            origin: self.origin[nav_len..].to_vec(),
            shape: Shape::raw(self.shape.sig().to_vec(), self.shape.sig_dims()),
        }
    }

    /// The navigation part of this slice, as a slice over navigation space
    /// only.
    pub fn nav_region(&self) -> Slice {
        let nav_len = self.shape.ndim() - self.shape.sig_dims();
        Slice {
            origin: self.origin[..nav_len].to_vec(),
            shape: Shape::raw(self.shape.nav().to_vec(), 0),
        }
    }

    /// Tile this slice with sub-slices of (at most) `tile_shape`.
    ///
    /// Tiles are produced in row-major nested order with the last dimension
    /// varying fastest. Tiles at the upper boundary of a dimension are
    /// clipped to the remaining extent; a tile extent larger than the parent
    /// extent collapses to the parent extent. The produced tiles are
    /// pairwise disjoint and cover the parent slice exactly. The returned
    /// iterator is finite and a fresh one can be obtained by calling this
    /// method again.
    pub fn subslices(&self, tile_shape: &Shape) -> Result<Subslices, QuadStemError> {
        if tile_shape.ndim() != self.shape.ndim() {
            return Err(QuadStemError::geometry(format!(
                "tile rank {} != slice rank {}",
                tile_shape.ndim(),
                self.shape.ndim()
            )));
        }
        let tile: Vec<usize> = tile_shape
            .dims()
            .iter()
            .zip(self.shape.dims().iter())
            .map(|(t, e)| (*t).min(*e))
            .collect();
        Ok(Subslices {
            origin: self.origin.clone(),
            extents: self.shape.dims().to_vec(),
            tile,
            sig_dims: self.shape.sig_dims(),
            index: vec![0; self.shape.ndim()],
            done: self.is_null(),
        })
    }

    /// Decompose this slice into maximal contiguous element runs of an
    /// enclosing row-major array, as `(element offset, run length)` pairs in
    /// iteration order. The concatenated runs hold exactly the slice's
    /// elements in row-major order.
    pub fn contiguous_runs(&self, enclosing: &[usize]) -> Result<Runs, QuadStemError> {
        let ndim = self.shape.ndim();
        if enclosing.len() != ndim {
            return Err(QuadStemError::geometry(format!(
                "enclosing rank {} != slice rank {}",
                enclosing.len(),
                ndim
            )));
        }
        for i in 0..ndim {
            if self.end(i) > enclosing[i] {
                return Err(QuadStemError::geometry(format!(
                    "slice extends past enclosing array in dimension {} ({} > {})",
                    i,
                    self.end(i),
                    enclosing[i]
                )));
            }
        }
        let mut strides = vec![1usize; ndim];
        for i in (0..ndim.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * enclosing[i + 1];
        }
        // Trailing dimensions that the slice covers completely merge into
        // one run together with the first partially-covered dimension.
        let mut pivot = ndim;
        while pivot > 0
            && self.origin[pivot - 1] == 0
            && self.shape[pivot - 1] == enclosing[pivot - 1]
        {
            pivot -= 1;
        }
        let (run_dim, run_len) = if pivot == 0 {
            (0, self.shape.size())
        } else {
            (pivot - 1, self.shape[pivot - 1] * strides[pivot - 1])
        };
        Ok(Runs {
            origin: self.origin.clone(),
            extents: self.shape.dims().to_vec(),
            strides,
            run_dim,
            run_len,
            index: vec![0; run_dim],
            done: self.is_null(),
        })
    }
}

/// Iterator over the sub-slices of a tiling. See [Slice::subslices].
#[derive(Debug)]
pub struct Subslices {
    origin: Vec<usize>,
    extents: Vec<usize>,
    tile: Vec<usize>,
    sig_dims: usize,
    index: Vec<usize>,
    done: bool,
}

impl Iterator for Subslices {
    type Item = Slice;

    fn next(&mut self) -> Option<Slice> {
        if self.done {
            return None;
        }
        let ndim = self.extents.len();
        let mut origin = Vec::with_capacity(ndim);
        let mut dims = Vec::with_capacity(ndim);
        for i in 0..ndim {
            let start = self.index[i] * self.tile[i];
            origin.push(self.origin[i] + start);
            dims.push(self.tile[i].min(self.extents[i] - start));
        }
        // Advance the odometer, last dimension fastest.
        self.done = true;
        for i in (0..ndim).rev() {
            self.index[i] += 1;
            if self.index[i] * self.tile[i] < self.extents[i] {
                self.done = false;
                break;
            }
            self.index[i] = 0;
        }
        Some(Slice {
            origin,
            shape: Shape::raw(dims, self.sig_dims),
        })
    }
}

/// Iterator over contiguous element runs. See [Slice::contiguous_runs].
pub struct Runs {
    origin: Vec<usize>,
    extents: Vec<usize>,
    strides: Vec<usize>,
    run_dim: usize,
    run_len: usize,
    index: Vec<usize>,
    done: bool,
}

impl Iterator for Runs {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        if self.done {
            return None;
        }
        let mut offset = self.origin[self.run_dim] * self.strides[self.run_dim];
        for i in 0..self.run_dim {
            offset += (self.origin[i] + self.index[i]) * self.strides[i];
        }
        self.done = true;
        for i in (0..self.run_dim).rev() {
            self.index[i] += 1;
            if self.index[i] < self.extents[i] {
                self.done = false;
                break;
            }
            self.index[i] = 0;
        }
        Some((offset, self.run_len))
    }
}

/// Returns an [ndarray] SliceInfo addressing `region` within an array it is
/// a sub-slice of.
pub(crate) fn region_slice_info(
    region: &Slice,
) -> ndarray::SliceInfo<Vec<ndarray::SliceInfoElem>, ndarray::IxDyn, ndarray::IxDyn> {
    let si: Vec<ndarray::SliceInfoElem> = region
        .origin()
        .iter()
        .zip(region.shape().dims().iter())
        .map(|(o, s)| ndarray::SliceInfoElem::Slice {
            start: *o as isize,
            end: Some((o + s) as isize),
            step: 1,
        })
        .collect();
    ndarray::SliceInfo::try_from(si).expect("SliceInfo should not fail for IxDyn")
}
