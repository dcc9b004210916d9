use bytemuck::{Pod, Zeroable};
use num_traits::Float;
use std::fmt::Debug;

/// Element type of matrices and vectors handled by the devices.
///
/// `TYPE_NAME` is the numeric-type signature: it is spliced into generated
/// shader source and is part of the kernel cache key.
pub trait Real:
    Float + Pod + Zeroable + Default + Debug + Send + Sync + std::iter::Sum + 'static
{
    const TYPE_NAME: &'static str;
}

/// Anything that can live in a device buffer: matrix values and indices.
pub trait Element: Pod + Debug + Send + Sync + 'static {}

impl<E: Pod + Debug + Send + Sync + 'static> Element for E {}

impl Real for f32 {
    const TYPE_NAME: &'static str = "f32";
}

impl Real for f64 {
    const TYPE_NAME: &'static str = "f64";
}

/// Generic trait representing a matrix.
/// Implementations can be host-side or distributed over devices.
pub trait Matrix: Debug {
    /// The underlying numeric type of the matrix elements.
    type Value: Real;

    /// Returns the dimensions of the matrix as (rows, columns).
    fn dims(&self) -> (usize, usize);

    /// Returns the number of stored non-zero entries.
    fn nonzeros(&self) -> usize;

    /// Returns the number of rows.
    fn rows(&self) -> usize {
        self.dims().0
    }

    /// Returns the number of columns.
    fn cols(&self) -> usize {
        self.dims().1
    }

    /// Checks if the matrix is square.
    fn is_square(&self) -> bool {
        let (rows, cols) = self.dims();
        rows == cols
    }
}

/// Generic trait representing a vector.
pub trait Vector: Debug {
    /// The underlying numeric type of the vector elements.
    type Value: Real;

    /// Returns the number of elements in the vector.
    fn len(&self) -> usize;

    /// Checks if the vector is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
