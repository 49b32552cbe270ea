//! Lightweight multi-dimensional index calculators over externally owned
//! contiguous storage. Row-major, no ownership; extents are recorded at
//! construction for debug assertions and are not checked in release builds.

/// Row-major 2D view over a borrowed slice.
#[derive(Clone, Copy)]
pub struct DevArray2D<'a> {
    data: &'a [f64],
    n0: usize,
    n1: usize,
}

impl<'a> DevArray2D<'a> {
    #[inline]
    pub fn new(data: &'a [f64], n0: usize, n1: usize) -> DevArray2D<'a> {
        debug_assert!(data.len() >= n0 * n1);
        DevArray2D { data, n0, n1 }
    }

    #[inline]
    pub fn at(&self, i: usize, j: usize) -> f64 {
        debug_assert!(i < self.n0 && j < self.n1);
        self.data[i * self.n1 + j]
    }

    /// Contiguous row `i` of length `n1`.
    #[inline]
    pub fn row(&self, i: usize) -> &'a [f64] {
        debug_assert!(i < self.n0);
        &self.data[i * self.n1..(i + 1) * self.n1]
    }
}

/// Row-major 3D view over a borrowed slice.
#[derive(Clone, Copy)]
pub struct DevArray3D<'a> {
    data: &'a [f64],
    n0: usize,
    n1: usize,
    n2: usize,
}

impl<'a> DevArray3D<'a> {
    #[inline]
    pub fn new(data: &'a [f64], n0: usize, n1: usize, n2: usize) -> DevArray3D<'a> {
        debug_assert!(data.len() >= n0 * n1 * n2);
        DevArray3D { data, n0, n1, n2 }
    }

    #[inline]
    pub fn at(&self, i: usize, j: usize, k: usize) -> f64 {
        debug_assert!(i < self.n0 && j < self.n1 && k < self.n2);
        self.data[(i * self.n1 + j) * self.n2 + k]
    }

    /// Contiguous slab `i` of shape `(n1, n2)`.
    #[inline]
    pub fn slab(&self, i: usize) -> &'a [f64] {
        debug_assert!(i < self.n0);
        &self.data[i * self.n1 * self.n2..(i + 1) * self.n1 * self.n2]
    }
}
