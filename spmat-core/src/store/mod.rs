//! Per-device storage of a matrix row band.
//!
//! A band is split into a local part, whose columns fall inside the device's
//! own column band, and a remote part holding the ghost columns. Local
//! columns are rebased to the start of the column band; remote columns are
//! renumbered densely in ascending ghost order.

mod csr;
mod hell;

pub use csr::CsrStore;
pub use hell::HellStore;

use crate::device::{Device, Stream};
use crate::error::Result;
use crate::kernels::{CsrBuffers, KernelArgs, KernelVariant, ELL_PAD};
use crate::traits::{Element, Real};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;

/// Device-side layout of a stored band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageFormat {
    Csr,
    Hell,
}

/// A row band of the matrix resident on one device.
pub trait SparseMatrixStore<T: Real, D: Device>: Debug + Send + Sync {
    fn format(&self) -> StorageFormat;

    /// Number of rows in the band.
    fn rows(&self) -> usize;

    fn local_nonzeros(&self) -> usize;

    fn remote_nonzeros(&self) -> usize;

    /// Global column of each remote column index, in index order.
    fn ghost_dictionary(&self) -> &[usize];

    /// `y = alpha * A_local * x`, or `y += alpha * A_local * x` with `append`.
    ///
    /// Returns `None` when nothing had to be launched.
    fn mul_local(
        &self,
        x: &D::Buffer<T>,
        y: &D::Buffer<T>,
        alpha: T,
        append: bool,
    ) -> Result<Option<D::Event>>;

    /// `y += alpha * A_remote * x_ghost` once `wait` has completed.
    ///
    /// Returns `None` when the band has no remote part.
    fn mul_remote(
        &self,
        x_ghost: &D::Buffer<T>,
        y: &D::Buffer<T>,
        alpha: T,
        wait: &D::Event,
    ) -> Result<Option<D::Event>>;
}

/// Creates the store matching the device class.
pub fn create_store<T: Real, D: Device>(
    device: &Arc<D>,
    band: &BandSplit<T>,
) -> Result<Box<dyn SparseMatrixStore<T, D>>> {
    Ok(match device.info().class.storage_format() {
        StorageFormat::Csr => Box::new(CsrStore::new(device, band)?),
        StorageFormat::Hell => Box::new(HellStore::new(device, band)?),
    })
}

/// Queues buffer uploads on the primary stream and waits for the last one.
struct Uploader<'a, D: Device> {
    device: &'a D,
    last: Option<D::Event>,
}

impl<'a, D: Device> Uploader<'a, D> {
    fn new(device: &'a D) -> Self {
        Self { device, last: None }
    }

    fn upload<E: Element>(&mut self, label: &str, data: &[E]) -> Result<D::Buffer<E>> {
        let buffer = self.device.create_buffer(label, data.len())?;
        if !data.is_empty() {
            self.last = Some(
                self.device
                    .enqueue_write(Stream::Primary, &buffer, data, &[])?,
            );
        }
        Ok(buffer)
    }

    fn csr<T: Real>(&mut self, label: &str, csr: &HostCsr<T>) -> Result<CsrBuffers<T, D>> {
        Ok(CsrBuffers {
            nnz: csr.nnz(),
            row: self.upload(&format!("{} row", label), &csr.row)?,
            col: self.upload(&format!("{} col", label), &csr.col)?,
            val: self.upload(&format!("{} val", label), &csr.val)?,
        })
    }

    /// The primary stream is in order, so the last write covers all of them.
    fn finish(self) -> Result<()> {
        match &self.last {
            Some(event) => self.device.wait(event),
            None => Ok(()),
        }
    }
}

/// Zeroes the first `rows` entries of `y`.
fn zero_fill<T: Real, D: Device>(device: &D, y: &D::Buffer<T>, rows: usize) -> Result<D::Event> {
    let kernel = device.kernel::<T>(KernelVariant::Fill)?;
    let args = KernelArgs::Fill {
        len: rows,
        y,
        value: T::zero(),
    };
    device.enqueue_kernel(Stream::Primary, &kernel, args, &[])
}

/// A host CSR triple with 32-bit indices, ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct HostCsr<T> {
    pub row: Vec<u32>,
    pub col: Vec<u32>,
    pub val: Vec<T>,
}

impl<T: Real> HostCsr<T> {
    pub fn rows(&self) -> usize {
        self.row.len().saturating_sub(1)
    }

    pub fn nnz(&self) -> usize {
        self.val.len()
    }

    fn row_len(&self, i: usize) -> usize {
        (self.row[i + 1] - self.row[i]) as usize
    }
}

/// A row band split into local and remote parts.
#[derive(Debug, Clone, PartialEq)]
pub struct BandSplit<T> {
    pub local: HostCsr<T>,
    pub remote: Option<HostCsr<T>>,
    /// Sorted ghost columns; position `k` is remote column `k`.
    pub ghosts: Vec<usize>,
}

impl<T: Real> BandSplit<T> {
    /// Splits the rows `rows` of a global CSR matrix for a device owning the
    /// columns `cols` and needing the ghost columns `ghosts`.
    pub fn new(
        rows: Range<usize>,
        cols: Range<usize>,
        ghosts: &BTreeSet<usize>,
        row_ptr: &[usize],
        col_indices: &[usize],
        values: &[T],
    ) -> Self {
        let base = row_ptr[rows.start];

        if rows.start == 0 && cols.start == 0 && ghosts.is_empty() {
            // The band is a prefix of the global arrays and needs no remapping.
            let end = row_ptr[rows.end];
            return Self {
                local: HostCsr {
                    row: row_ptr[..=rows.end].iter().map(|&p| p as u32).collect(),
                    col: col_indices[..end].iter().map(|&c| c as u32).collect(),
                    val: values[..end].to_vec(),
                },
                remote: None,
                ghosts: Vec::new(),
            };
        }

        let ghosts: Vec<usize> = ghosts.iter().copied().collect();
        let band_nnz = row_ptr[rows.end] - base;
        let mut local = HostCsr {
            row: Vec::with_capacity(rows.len() + 1),
            col: Vec::with_capacity(band_nnz),
            val: Vec::with_capacity(band_nnz),
        };
        let mut remote = HostCsr {
            row: Vec::with_capacity(rows.len() + 1),
            col: Vec::new(),
            val: Vec::new(),
        };
        local.row.push(0);
        remote.row.push(0);

        for i in rows {
            for j in row_ptr[i]..row_ptr[i + 1] {
                let c = col_indices[j];
                if cols.contains(&c) {
                    local.col.push((c - cols.start) as u32);
                    local.val.push(values[j]);
                } else if let Ok(k) = ghosts.binary_search(&c) {
                    remote.col.push(k as u32);
                    remote.val.push(values[j]);
                }
            }
            local.row.push(local.col.len() as u32);
            remote.row.push(remote.col.len() as u32);
        }

        Self {
            local,
            remote: (!ghosts.is_empty()).then_some(remote),
            ghosts,
        }
    }

    pub fn rows(&self) -> usize {
        self.local.rows()
    }
}

/// Widest ELL slab such that at least a third of the rows fill it.
pub fn hell_width<T: Real>(csr: &HostCsr<T>) -> usize {
    let n = csr.rows();
    if n == 0 || csr.nnz() == 0 {
        return 0;
    }
    let mut lens: Vec<usize> = (0..n).map(|i| csr.row_len(i)).collect();
    lens.sort_unstable_by(|a, b| b.cmp(a));
    lens[n.div_ceil(3) - 1]
}

/// A CSR part converted to an ELL slab plus CSR overflow.
#[derive(Debug, Clone, PartialEq)]
pub struct HostHell<T> {
    pub width: usize,
    /// Column-major `width x rows` slab; unused slots hold `ELL_PAD`.
    pub ell_col: Vec<u32>,
    pub ell_val: Vec<T>,
    pub overflow: HostCsr<T>,
}

impl<T: Real> HostHell<T> {
    pub fn from_csr(csr: &HostCsr<T>) -> Self {
        let n = csr.rows();
        let width = hell_width(csr);
        let mut ell_col = vec![ELL_PAD; width * n];
        let mut ell_val = vec![T::zero(); width * n];
        let mut overflow = HostCsr {
            row: Vec::with_capacity(n + 1),
            col: Vec::new(),
            val: Vec::new(),
        };
        overflow.row.push(0);

        for i in 0..n {
            let (beg, end) = (csr.row[i] as usize, csr.row[i + 1] as usize);
            for (k, j) in (beg..end).enumerate() {
                if k < width {
                    ell_col[k * n + i] = csr.col[j];
                    ell_val[k * n + i] = csr.val[j];
                } else {
                    overflow.col.push(csr.col[j]);
                    overflow.val.push(csr.val[j]);
                }
            }
            overflow.row.push(overflow.col.len() as u32);
        }

        Self {
            width,
            ell_col,
            ell_val,
            overflow,
        }
    }

    /// Nonzeros held in the slab, excluding padding.
    pub fn ell_nonzeros(&self) -> usize {
        self.ell_col.iter().filter(|&&c| c != ELL_PAD).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csr(row: Vec<u32>, col: Vec<u32>) -> HostCsr<f64> {
        let val = (0..col.len()).map(|v| v as f64 + 1.0).collect();
        HostCsr { row, col, val }
    }

    /// 6x6 tridiagonal (2, -1).
    fn tridiagonal() -> (Vec<usize>, Vec<usize>, Vec<f64>) {
        let mut row_ptr = vec![0];
        let (mut cols, mut vals) = (Vec::new(), Vec::new());
        for i in 0..6usize {
            for j in i.saturating_sub(1)..(i + 2).min(6) {
                cols.push(j);
                vals.push(if i == j { 2.0 } else { -1.0 });
            }
            row_ptr.push(cols.len());
        }
        (row_ptr, cols, vals)
    }

    #[test]
    fn test_first_band_without_ghosts_is_raw_prefix() {
        let (row_ptr, cols, vals) = tridiagonal();
        let split = BandSplit::new(0..6, 0..6, &BTreeSet::new(), &row_ptr, &cols, &vals);
        assert!(split.remote.is_none());
        assert_eq!(split.local.nnz(), 16);
        assert_eq!(split.local.row.len(), 7);
    }

    #[test]
    fn test_split_rebases_and_renumbers() {
        let (row_ptr, cols, vals) = tridiagonal();
        let ghosts = BTreeSet::from([2]);
        let split = BandSplit::new(3..6, 3..6, &ghosts, &row_ptr, &cols, &vals);

        assert_eq!(split.ghosts, vec![2]);
        assert_eq!(split.local.row, vec![0, 2, 5, 7]);
        assert_eq!(split.local.col, vec![0, 1, 0, 1, 2, 1, 2]);
        let remote = split.remote.unwrap();
        assert_eq!(remote.row, vec![0, 1, 1, 1]);
        assert_eq!(remote.col, vec![0]);
        assert_eq!(remote.val, vec![-1.0]);
    }

    #[test]
    fn test_ghost_renumbering_is_a_bijection() {
        // One row referencing scattered columns outside its band [0, 2).
        let row_ptr = vec![0, 5];
        let cols = vec![9, 1, 4, 7, 4];
        let vals = vec![1.0f32; 5];
        let ghosts = BTreeSet::from([4, 7, 9]);
        let split = BandSplit::new(0..1, 0..2, &ghosts, &row_ptr, &cols, &vals);

        let remote = split.remote.unwrap();
        let recovered: BTreeSet<usize> = remote
            .col
            .iter()
            .map(|&k| split.ghosts[k as usize])
            .collect();
        assert_eq!(recovered, ghosts);
        assert_eq!(remote.col, vec![2, 0, 1, 0]);
        assert_eq!(split.local.col, vec![1]);
    }

    #[test]
    fn test_hell_width_selection() {
        assert_eq!(hell_width(&csr(vec![0], vec![])), 0);
        assert_eq!(hell_width(&csr(vec![0, 0, 0], vec![])), 0);
        // Row lengths 3, 1, 1: a third of the rows reach width 3.
        assert_eq!(hell_width(&csr(vec![0, 3, 4, 5], vec![0, 1, 2, 0, 1])), 3);
        // Row lengths 4, 2, 2, 1, 1, 0: two of six rows reach width 2.
        let m = csr(vec![0, 4, 6, 8, 9, 10, 10], vec![0, 1, 2, 3, 0, 1, 0, 1, 0, 0]);
        assert_eq!(hell_width(&m), 2);
    }

    #[test]
    fn test_hell_conversion_layout() {
        // Row lengths 1, 3, 1, 1, 1, 1 -> width 1, row 1 overflows by two.
        let m = csr(vec![0, 1, 4, 5, 6, 7, 8], vec![0, 0, 1, 2, 1, 2, 3, 4]);
        let hell = HostHell::from_csr(&m);
        assert_eq!(hell.width, 1);
        assert_eq!(hell.ell_col, vec![0, 0, 1, 2, 3, 4]);
        assert_eq!(hell.ell_val, vec![1.0, 2.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(hell.overflow.row, vec![0, 0, 2, 2, 2, 2, 2]);
        assert_eq!(hell.overflow.col, vec![1, 2]);
        assert_eq!(hell.overflow.val, vec![3.0, 4.0]);
        assert_eq!(hell.ell_nonzeros() + hell.overflow.nnz(), m.nnz());
    }

    #[test]
    fn test_hell_pads_short_rows() {
        // Row lengths 2, 2, 0 -> width 2, row 2 fully padded.
        let m = csr(vec![0, 2, 4, 4], vec![0, 1, 1, 2]);
        let hell = HostHell::from_csr(&m);
        assert_eq!(hell.width, 2);
        assert_eq!(hell.ell_col, vec![0, 1, ELL_PAD, 1, 2, ELL_PAD]);
        assert_eq!(hell.ell_val[2], 0.0);
        assert_eq!(hell.overflow.nnz(), 0);
    }
}
