//! Dense row-major 2-D tensors.
//!
//! [`Dense2`] is the single tensor representation used by the differentiation
//! engine: a shaped, owned matrix with elementwise arithmetic, matrix
//! multiplication, reductions and seeded random constructors.
//!
//! Arithmetic operators broadcast the way the graph layer needs: a `1 x C`
//! row (bias) or a `1 x 1` scalar combines with an `R x C` matrix on either
//! side. Incompatible shapes panic, matching `ndarray` semantics.

use anyhow::{bail, Result};
use scirs2_core::ndarray_ext::{Array2, Axis};
use scirs2_core::numeric::Float;
use std::fmt;
use std::ops::{Add, Div, Index, IndexMut, Mul, Neg, Sub};

/// Owned dense 2-D tensor with row-major storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense2<T> {
    data: Array2<T>,
}

impl<T: Float> Dense2<T> {
    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: Array2::from_elem((rows, cols), T::zero()),
        }
    }

    /// Create a tensor filled with ones.
    pub fn ones(rows: usize, cols: usize) -> Self {
        Self {
            data: Array2::from_elem((rows, cols), T::one()),
        }
    }

    /// Create a tensor filled with a constant.
    pub fn from_elem(rows: usize, cols: usize, value: T) -> Self {
        Self {
            data: Array2::from_elem((rows, cols), value),
        }
    }

    /// Create a tensor from a row-major data vector.
    ///
    /// Fails when `data.len() != rows * cols`.
    ///
    /// # Examples
    ///
    /// ```
    /// use remgrad_core::Dense2;
    ///
    /// let t = Dense2::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
    /// assert_eq!(t[(1, 0)], 3.0);
    /// ```
    pub fn from_vec(data: Vec<T>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            bail!(
                "cannot build {}x{} tensor from {} elements",
                rows,
                cols,
                data.len()
            );
        }
        match Array2::from_shape_vec((rows, cols), data) {
            Ok(arr) => Ok(Self { data: arr }),
            Err(e) => bail!("invalid tensor layout: {}", e),
        }
    }

    /// Create a tensor by evaluating `f(row, col)` at every position.
    pub fn from_fn(rows: usize, cols: usize, f: impl FnMut((usize, usize)) -> T) -> Self {
        Self {
            data: Array2::from_shape_fn((rows, cols), f),
        }
    }

    /// Wrap an existing `ndarray` matrix.
    pub fn from_array(data: Array2<T>) -> Self {
        Self { data }
    }

    /// Zeros with the same shape as `self`.
    pub fn zeros_like(&self) -> Self {
        let (r, c) = self.shape();
        Self::zeros(r, c)
    }

    /// Ones with the same shape as `self`.
    pub fn ones_like(&self) -> Self {
        let (r, c) = self.shape();
        Self::ones(r, c)
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// `(rows, cols)` pair.
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// True when the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True for `1 x 1` tensors.
    pub fn is_scalar(&self) -> bool {
        self.numel() == 1
    }

    /// Read a single element, returning `None` when out of bounds.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        self.data.get((row, col)).copied()
    }

    /// The sole element of a `1 x 1` tensor.
    pub fn scalar(&self) -> Result<T> {
        if !self.is_scalar() {
            bail!("expected scalar tensor, got shape {:?}", self.shape());
        }
        Ok(self.data[(0, 0)])
    }

    /// Apply `f` to every element, producing a new tensor.
    pub fn map(&self, f: impl Fn(T) -> T) -> Self {
        Self {
            data: self.data.mapv(f),
        }
    }

    /// Multiply every element by `factor`.
    pub fn scale(&self, factor: T) -> Self {
        self.map(|x| x * factor)
    }

    /// Sum of all elements.
    pub fn sum(&self) -> T {
        self.data.iter().fold(T::zero(), |acc, &x| acc + x)
    }

    /// Mean of all elements.
    pub fn mean(&self) -> T {
        let n = T::from(self.numel()).unwrap();
        self.sum() / n
    }

    /// Column-wise sum, producing a `1 x C` row.
    pub fn sum_rows(&self) -> Self {
        Self {
            data: self.data.sum_axis(Axis(0)).insert_axis(Axis(0)),
        }
    }

    /// Row-wise sum, producing an `R x 1` column.
    pub fn sum_cols(&self) -> Self {
        Self {
            data: self.data.sum_axis(Axis(1)).insert_axis(Axis(1)),
        }
    }

    /// Transposed copy.
    pub fn t(&self) -> Self {
        Self {
            data: self.data.t().to_owned(),
        }
    }

    /// Elementwise approximate equality within an absolute tolerance.
    pub fn allclose(&self, other: &Self, tol: T) -> bool {
        self.shape() == other.shape()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(&a, &b)| (a - b).abs() <= tol)
    }

    /// Largest absolute difference against `other`.
    ///
    /// Panics when shapes differ.
    pub fn max_abs_diff(&self, other: &Self) -> T {
        assert_eq!(
            self.shape(),
            other.shape(),
            "max_abs_diff requires matching shapes"
        );
        self.data
            .iter()
            .zip(other.data.iter())
            .fold(T::zero(), |acc, (&a, &b)| acc.max((a - b).abs()))
    }

    /// Iterate over elements in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.data.iter()
    }

    /// Borrow the underlying `ndarray` matrix.
    pub fn as_array(&self) -> &Array2<T> {
        &self.data
    }

    /// Consume into the underlying `ndarray` matrix.
    pub fn into_array(self) -> Array2<T> {
        self.data
    }
}

impl<T: Float + 'static> Dense2<T> {
    /// Matrix product `self @ rhs`.
    ///
    /// Panics when the inner dimensions disagree.
    pub fn dot(&self, rhs: &Self) -> Self {
        assert_eq!(
            self.cols(),
            rhs.rows(),
            "matmul dimension mismatch: {:?} @ {:?}",
            self.shape(),
            rhs.shape()
        );
        Self {
            data: self.data.dot(&rhs.data),
        }
    }
}

impl<T: Float> Dense2<T> {
    /// Tensor of samples from `N(0, 1)`, reproducible for a given seed.
    pub fn randn(rows: usize, cols: usize, seed: u64) -> Self {
        use scirs2_core::random::{rngs::StdRng, Distribution, RandNormal as Normal, SeedableRng};

        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        Self::from_fn(rows, cols, |_| T::from(normal.sample(&mut rng)).unwrap())
    }

    /// Tensor of samples from `U[low, high)`, reproducible for a given seed.
    pub fn random_uniform(rows: usize, cols: usize, low: f64, high: f64, seed: u64) -> Self {
        use scirs2_core::random::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(seed);
        Self::from_fn(rows, cols, |_| {
            T::from(rng.random_range(low..high)).unwrap()
        })
    }
}

/// Broadcast-compatible output extent for one axis.
///
/// Panics on incompatible extents, matching `ndarray` arithmetic.
fn broadcast_extent(a: usize, b: usize, lhs: (usize, usize), rhs: (usize, usize)) -> usize {
    if a == b || b == 1 {
        a
    } else if a == 1 {
        b
    } else {
        panic!("shape mismatch in broadcast: {:?} vs {:?}", lhs, rhs);
    }
}

fn broadcast_binop<T: Float>(
    a: &Dense2<T>,
    b: &Dense2<T>,
    f: impl Fn(T, T) -> T,
) -> Dense2<T> {
    let (ar, ac) = a.shape();
    let (br, bc) = b.shape();
    let rows = broadcast_extent(ar, br, (ar, ac), (br, bc));
    let cols = broadcast_extent(ac, bc, (ar, ac), (br, bc));
    Dense2::from_fn(rows, cols, |(i, j)| {
        f(a.data[(i % ar, j % ac)], b.data[(i % br, j % bc)])
    })
}

impl<T: Float> Add for &Dense2<T> {
    type Output = Dense2<T>;

    fn add(self, rhs: Self) -> Dense2<T> {
        broadcast_binop(self, rhs, |a, b| a + b)
    }
}

impl<T: Float> Sub for &Dense2<T> {
    type Output = Dense2<T>;

    fn sub(self, rhs: Self) -> Dense2<T> {
        broadcast_binop(self, rhs, |a, b| a - b)
    }
}

impl<T: Float> Mul for &Dense2<T> {
    type Output = Dense2<T>;

    fn mul(self, rhs: Self) -> Dense2<T> {
        broadcast_binop(self, rhs, |a, b| a * b)
    }
}

impl<T: Float> Div for &Dense2<T> {
    type Output = Dense2<T>;

    fn div(self, rhs: Self) -> Dense2<T> {
        broadcast_binop(self, rhs, |a, b| a / b)
    }
}

impl<T: Float> Neg for &Dense2<T> {
    type Output = Dense2<T>;

    fn neg(self) -> Dense2<T> {
        self.map(|x| -x)
    }
}

impl<T> Index<(usize, usize)> for Dense2<T> {
    type Output = T;

    fn index(&self, idx: (usize, usize)) -> &T {
        &self.data[idx]
    }
}

impl<T> IndexMut<(usize, usize)> for Dense2<T> {
    fn index_mut(&mut self, idx: (usize, usize)) -> &mut T {
        &mut self.data[idx]
    }
}

impl<T: Float + fmt::Display> fmt::Display for Dense2<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (rows, cols) = self.shape();
        writeln!(f, "Dense2 {}x{} [", rows, cols)?;
        for i in 0..rows {
            write!(f, "  ")?;
            for j in 0..cols {
                write!(f, "{:>10.4} ", self.data[(i, j)])?;
            }
            writeln!(f)?;
        }
        write!(f, "]")
    }
}
