use crate::error::{Result, SpmvError};
use crate::traits::{Matrix, Real};

/// Represents a sparse matrix in Compressed Sparse Row (CSR) format on the host.
///
/// This is the input side of `SpMat`: it is never uploaded as a whole, the
/// engine slices it into per-device bands.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T: Real> {
    /// Number of rows.
    rows: usize,
    /// Number of columns.
    cols: usize,
    /// Vector containing the non-zero values of the matrix.
    pub(crate) values: Vec<T>,
    /// Vector containing the column indices corresponding to the values.
    pub(crate) col_indices: Vec<usize>,
    /// `row_ptr[i]..row_ptr[i + 1]` is the span of row `i`; its length is `rows + 1`.
    pub(crate) row_ptr: Vec<usize>,
}

impl<T: Real> CsrMatrix<T> {
    /// Creates a new empty CsrMatrix with given dimensions.
    pub fn new(rows: usize, cols: usize) -> Self {
        CsrMatrix {
            rows,
            cols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_ptr: vec![0; rows + 1],
        }
    }

    /// Builds a matrix from coordinate entries. Duplicates are kept as separate entries.
    pub fn from_triplets(rows: usize, cols: usize, triplets: Vec<Triplet<T>>) -> Result<Self> {
        let mut coords = triplets;
        coords.sort_by_key(|t| (t.row, t.col));

        // Count non-zeros per row
        let mut row_ptr = vec![0usize; rows + 1];
        for t in &coords {
            if t.row >= rows {
                return Err(SpmvError::InvalidDimensions(
                    "Row index out of bounds".to_string(),
                ));
            }
            if t.col >= cols {
                return Err(SpmvError::InvalidDimensions(
                    "Column index out of bounds".to_string(),
                ));
            }
            row_ptr[t.row + 1] += 1;
        }
        for i in 1..=rows {
            row_ptr[i] += row_ptr[i - 1];
        }

        let col_indices = coords.iter().map(|t| t.col).collect();
        let values = coords.iter().map(|t| t.value).collect();

        Ok(CsrMatrix {
            rows,
            cols,
            values,
            col_indices,
            row_ptr,
        })
    }

    /// Creates a CsrMatrix from CSR components after validating them.
    pub fn from_csr(
        rows: usize,
        cols: usize,
        values: Vec<T>,
        col_indices: Vec<usize>,
        row_ptr: Vec<usize>,
    ) -> Result<Self> {
        if values.len() != col_indices.len() {
            return Err(SpmvError::InvalidMatrix(
                "values and col_indices must have the same length".to_string(),
            ));
        }
        validate_csr(rows, cols, &row_ptr, &col_indices)?;

        Ok(CsrMatrix {
            rows,
            cols,
            values,
            col_indices,
            row_ptr,
        })
    }

    /// Creates a CsrMatrix from dense rows, dropping zero entries.
    pub fn from_dense(dense: &[Vec<T>]) -> Result<Self> {
        let rows = dense.len();
        let cols = dense.first().map_or(0, |row| row.len());
        let mut values = Vec::new();
        let mut col_indices = Vec::new();
        let mut row_ptr = Vec::with_capacity(rows + 1);
        row_ptr.push(0);

        for row in dense {
            if row.len() != cols {
                return Err(SpmvError::InvalidDimensions(
                    "Input dense matrix must be rectangular".to_string(),
                ));
            }
            for (c, &val) in row.iter().enumerate() {
                if val != T::zero() {
                    values.push(val);
                    col_indices.push(c);
                }
            }
            row_ptr.push(values.len());
        }

        Ok(CsrMatrix {
            rows,
            cols,
            values,
            col_indices,
            row_ptr,
        })
    }

    /// Returns the number of non-zero elements.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Gets the value at a specific row and column.
    /// This is inefficient for sparse matrices, primarily for testing/debugging.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let span = self.row_ptr[row]..self.row_ptr[row + 1];
        self.col_indices[span.clone()]
            .iter()
            .position(|&c| c == col)
            .map(|k| self.values[span.start + k])
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    /// Serial single-pass `y = alpha * A * x`, the reference the devices are checked against.
    pub fn spmv(&self, x: &[T], alpha: T) -> Result<Vec<T>> {
        if x.len() != self.cols {
            return Err(SpmvError::InvalidDimensions(format!(
                "Matrix cols ({}) do not match vector x size ({})",
                self.cols,
                x.len()
            )));
        }
        Ok(self
            .row_ptr
            .windows(2)
            .map(|span| {
                let sum: T = (span[0]..span[1])
                    .map(|j| self.values[j] * x[self.col_indices[j]])
                    .sum();
                alpha * sum
            })
            .collect())
    }

    /// Iterates over the stored entries in row order.
    pub fn iter(&self) -> impl Iterator<Item = Triplet<T>> + '_ {
        self.row_ptr.windows(2).enumerate().flat_map(move |(row, span)| {
            (span[0]..span[1]).map(move |j| Triplet::new(row, self.col_indices[j], self.values[j]))
        })
    }
}

/// Checks the structural CSR invariants that the engine otherwise assumes.
pub fn validate_csr(rows: usize, cols: usize, row_ptr: &[usize], col_indices: &[usize]) -> Result<()> {
    if row_ptr.len() != rows + 1 {
        return Err(SpmvError::InvalidMatrix(format!(
            "row_ptr length must be rows + 1 ({}), got {}",
            rows + 1,
            row_ptr.len()
        )));
    }
    if row_ptr[0] != 0 {
        return Err(SpmvError::InvalidMatrix(
            "row_ptr must start at 0".to_string(),
        ));
    }
    if let Some(i) = row_ptr.windows(2).position(|w| w[0] > w[1]) {
        return Err(SpmvError::InvalidMatrix(format!(
            "row_ptr is not monotonic at row {}",
            i
        )));
    }
    if row_ptr[rows] != col_indices.len() {
        return Err(SpmvError::InvalidMatrix(format!(
            "Last element of row_ptr ({}) must equal the number of non-zero values ({})",
            row_ptr[rows],
            col_indices.len()
        )));
    }
    if let Some(&c) = col_indices.iter().find(|&&c| c >= cols) {
        return Err(SpmvError::InvalidMatrix(format!(
            "Column index out of bounds: {} >= {}",
            c, cols
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triplet<T> {
    row: usize,
    col: usize,
    value: T,
}

impl<T: Copy> Triplet<T> {
    pub fn new(row: usize, col: usize, value: T) -> Self {
        Triplet { row, col, value }
    }

    pub fn row(&self) -> usize {
        self.row
    }

    pub fn col(&self) -> usize {
        self.col
    }

    pub fn value(&self) -> T {
        self.value
    }
}

impl<T: Real> Matrix for CsrMatrix<T> {
    type Value = T;

    fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn nonzeros(&self) -> usize {
        self.nnz()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CsrMatrix<f64> {
        // [ 1.0, 0.0, 2.0, 0.0 ]
        // [ 0.0, 3.0, 0.0, 4.0 ]
        // [ 0.0, 0.0, 5.0, 0.0 ]
        CsrMatrix::from_csr(
            3,
            4,
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
            vec![0, 2, 1, 3, 2],
            vec![0, 2, 4, 5],
        )
        .unwrap()
    }

    #[test]
    fn test_csr_matrix_new() {
        let matrix: CsrMatrix<f32> = CsrMatrix::new(3, 4);
        assert_eq!(matrix.dims(), (3, 4));
        assert_eq!(matrix.nnz(), 0);
        assert_eq!(matrix.row_ptr, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_csr_matrix_from_csr_valid() {
        let matrix = sample();
        assert_eq!(matrix.dims(), (3, 4));
        assert_eq!(matrix.nnz(), 5);
        assert_eq!(matrix.row_ptr(), &[0, 2, 4, 5]);
    }

    #[test]
    fn test_csr_matrix_from_csr_invalid_row_ptr_len() {
        let matrix = CsrMatrix::<f32>::from_csr(3, 4, vec![1.0], vec![0], vec![0, 1]);
        match matrix {
            Err(SpmvError::InvalidMatrix(msg)) => assert!(msg.contains("row_ptr length")),
            other => panic!("Expected InvalidMatrix error, got {:?}", other),
        }
    }

    #[test]
    fn test_csr_matrix_from_csr_invalid_last_row_ptr() {
        let matrix = CsrMatrix::<f32>::from_csr(3, 4, vec![1.0, 2.0], vec![0, 1], vec![0, 1, 1, 1]);
        match matrix {
            Err(SpmvError::InvalidMatrix(msg)) => assert!(msg.contains("Last element of row_ptr")),
            other => panic!("Expected InvalidMatrix error, got {:?}", other),
        }
    }

    #[test]
    fn test_csr_matrix_from_csr_non_monotonic() {
        let matrix = CsrMatrix::<f32>::from_csr(2, 2, vec![1.0, 2.0], vec![0, 1], vec![0, 2, 1]);
        match matrix {
            Err(SpmvError::InvalidMatrix(msg)) => assert!(msg.contains("not monotonic")),
            other => panic!("Expected InvalidMatrix error, got {:?}", other),
        }
    }

    #[test]
    fn test_csr_matrix_from_csr_invalid_col_index() {
        let matrix = CsrMatrix::<f32>::from_csr(2, 3, vec![1.0, 2.0], vec![0, 3], vec![0, 1, 2]);
        match matrix {
            Err(SpmvError::InvalidMatrix(msg)) => assert!(msg.contains("Column index out of bounds")),
            other => panic!("Expected InvalidMatrix error, got {:?}", other),
        }
    }

    #[test]
    fn test_csr_matrix_get() {
        let matrix = sample();
        assert_eq!(matrix.get(0, 0), Some(1.0));
        assert_eq!(matrix.get(0, 2), Some(2.0));
        assert_eq!(matrix.get(1, 3), Some(4.0));
        assert_eq!(matrix.get(2, 2), Some(5.0));
        assert_eq!(matrix.get(0, 1), None);
        assert_eq!(matrix.get(2, 3), None);
        assert_eq!(matrix.get(3, 0), None);
        assert_eq!(matrix.get(0, 4), None);
    }

    #[test]
    fn test_csr_matrix_from_triplets_sorts_entries() {
        let matrix = CsrMatrix::from_triplets(
            2,
            3,
            vec![
                Triplet::new(1, 2, 6.0f32),
                Triplet::new(0, 1, 2.0),
                Triplet::new(1, 0, 4.0),
            ],
        )
        .unwrap();
        assert_eq!(matrix.row_ptr(), &[0, 1, 3]);
        assert_eq!(matrix.col_indices(), &[1, 0, 2]);
        assert_eq!(matrix.values(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_csr_matrix_from_dense_matches_triplets() {
        let dense = vec![vec![1.0, 0.0, 2.0, 0.0], vec![0.0, 3.0, 0.0, 4.0], vec![0.0, 0.0, 5.0, 0.0]];
        assert_eq!(CsrMatrix::from_dense(&dense).unwrap(), sample());
        let from_iter = CsrMatrix::from_triplets(3, 4, sample().iter().collect()).unwrap();
        assert_eq!(from_iter, sample());
    }

    #[test]
    fn test_reference_spmv() {
        let y = sample().spmv(&[1.0, 1.0, 1.0, 1.0], 2.0).unwrap();
        assert_eq!(y, vec![6.0, 14.0, 10.0]);
        assert!(sample().spmv(&[1.0], 1.0).is_err());
    }
}
