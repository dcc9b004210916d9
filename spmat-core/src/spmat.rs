//! Distributed sparse matrix and its multiply.
//!
//! Rows are split into bands, one per device, and so are the columns. Each
//! device multiplies its row band by its own part of `x` and, when the band
//! references columns owned by other devices, by the ghost values staged
//! through the host.

use crate::config::SpMatConfig;
use crate::device::{Device, DeviceSet, Stream};
use crate::error::{Result, SpmvError};
use crate::exchange::{ghost_columns, ExchangeLayout, GhostSets};
use crate::kernels::{KernelArgs, KernelVariant};
use crate::sparse_matrix::{validate_csr, CsrMatrix};
use crate::store::{create_store, BandSplit, SparseMatrixStore, StorageFormat};
use crate::traits::{Matrix, Real};
use crate::vector::DistVector;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Device-side exchange state of one device.
#[derive(Debug)]
struct Peer<T: Real, D: Device> {
    /// Band-rebased columns this device supplies, and the gathered values.
    send: Option<(D::Buffer<u32>, D::Buffer<T>)>,
    /// Host copy of the gathered values, moved into each readback and back.
    sent: Vec<T>,
    /// Positions in the staging array this device needs.
    cols_to_recv: Vec<usize>,
    vals_to_recv: Vec<T>,
    /// Ghost values on the device, indexed like the store's ghost dictionary.
    ghost: Option<D::Buffer<T>>,
    /// Last remote multiply; the next ghost upload must wait for it.
    last_remote: Option<D::Event>,
}

#[derive(Debug)]
struct Exchange<T: Real, D: Device> {
    layout: ExchangeLayout,
    peers: Vec<Peer<T, D>>,
    /// Host staging array, `layout.len()` values.
    rx: Vec<T>,
}

/// A sparse matrix distributed over the devices of a `DeviceSet`.
#[derive(Debug)]
pub struct SpMat<T: Real, D: Device> {
    devices: Vec<Arc<D>>,
    nrows: usize,
    ncols: usize,
    nnz: usize,
    row_part: Vec<usize>,
    col_part: Vec<usize>,
    ghosts: GhostSets,
    stores: Vec<Option<Box<dyn SparseMatrixStore<T, D>>>>,
    exchange: Option<Exchange<T, D>>,
}

impl<T: Real, D: Device> SpMat<T, D> {
    /// Builds the matrix from CSR arrays with default options.
    pub fn new(
        set: &DeviceSet<D>,
        nrows: usize,
        ncols: usize,
        row_ptr: &[usize],
        col_indices: &[usize],
        values: &[T],
    ) -> Result<Self> {
        Self::with_config(
            set,
            nrows,
            ncols,
            row_ptr,
            col_indices,
            values,
            SpMatConfig::default(),
        )
    }

    /// Builds the matrix from a host `CsrMatrix`, which is already validated.
    pub fn from_matrix(set: &DeviceSet<D>, matrix: &CsrMatrix<T>) -> Result<Self> {
        let (rows, cols) = matrix.dims();
        Self::with_config(
            set,
            rows,
            cols,
            matrix.row_ptr(),
            matrix.col_indices(),
            matrix.values(),
            SpMatConfig::unchecked(),
        )
    }

    /// Builds the matrix from CSR arrays, validating them if `config` asks for it.
    pub fn with_config(
        set: &DeviceSet<D>,
        nrows: usize,
        ncols: usize,
        row_ptr: &[usize],
        col_indices: &[usize],
        values: &[T],
        config: SpMatConfig,
    ) -> Result<Self> {
        if set.is_empty() {
            return Err(SpmvError::NoDevices);
        }
        if config.validate_input {
            validate_csr(nrows, ncols, row_ptr, col_indices)?;
            if values.len() != col_indices.len() {
                return Err(SpmvError::InvalidMatrix(format!(
                    "{} values for {} column indices",
                    values.len(),
                    col_indices.len()
                )));
            }
        }
        let nnz = row_ptr.get(nrows).copied().ok_or_else(|| {
            SpmvError::InvalidMatrix(format!("row_ptr must hold {} entries", nrows + 1))
        })?;
        if nnz > u32::MAX as usize || ncols > u32::MAX as usize {
            return Err(SpmvError::InvalidDimensions(format!(
                "{} columns and {} nonzeros exceed 32-bit device indices",
                ncols, nnz
            )));
        }

        let devices = set.devices().to_vec();
        let nd = devices.len();
        let row_part = set.partition_of(nrows)?;
        let col_part = set.partition_of(ncols)?;
        log::info!(
            "Setting up {}x{} matrix with {} nonzeros on {} device(s), row bands {:?}",
            nrows,
            ncols,
            nnz,
            nd,
            row_part
        );

        let ghosts = ghost_columns(&row_part, &col_part, row_ptr, col_indices);
        let layout = ExchangeLayout::build(&col_part, &ghosts);

        let stores = (0..nd)
            .into_par_iter()
            .map(|d| {
                let rows = row_part[d]..row_part[d + 1];
                if rows.is_empty() {
                    return Ok(None);
                }
                let cols = col_part[d]..col_part[d + 1];
                let band = BandSplit::new(rows, cols, &ghosts[d], row_ptr, col_indices, values);
                create_store(&devices[d], &band).map(Some)
            })
            .collect::<Result<Vec<_>>>()?;

        let exchange = match layout {
            Some(layout) => Some(Self::setup_exchange(&devices, &col_part, layout)?),
            None => {
                log::debug!("No ghost columns, skipping exchange setup");
                None
            }
        };

        Ok(Self {
            devices,
            nrows,
            ncols,
            nnz,
            row_part,
            col_part,
            ghosts,
            stores,
            exchange,
        })
    }

    fn setup_exchange(
        devices: &[Arc<D>],
        col_part: &[usize],
        layout: ExchangeLayout,
    ) -> Result<Exchange<T, D>> {
        let peers = devices
            .iter()
            .enumerate()
            .map(|(d, device)| {
                let send = match layout.send_count(d) {
                    0 => None,
                    count => {
                        let cols: Vec<u32> = layout
                            .local_send_columns(d, col_part)
                            .into_iter()
                            .map(|c| c as u32)
                            .collect();
                        Some((
                            device.create_buffer_init("cols_to_send", &cols)?,
                            device.create_buffer::<T>("vals_to_send", count)?,
                        ))
                    }
                };
                let cols_to_recv = layout.cols_to_recv[d].clone();
                let ghost = match cols_to_recv.len() {
                    0 => None,
                    count => Some(device.create_buffer::<T>("ghost values", count)?),
                };
                Ok(Peer {
                    send,
                    sent: Vec::with_capacity(layout.send_count(d)),
                    vals_to_recv: vec![T::zero(); cols_to_recv.len()],
                    cols_to_recv,
                    ghost,
                    last_remote: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Exchange {
            rx: vec![T::zero(); layout.len()],
            layout,
            peers,
        })
    }

    fn check_vectors(&self, x: &DistVector<T, D>, y: &DistVector<T, D>) -> Result<()> {
        if x.partition() != self.col_part.as_slice() {
            return Err(SpmvError::InvalidDimensions(format!(
                "x is split as {:?}, the matrix columns as {:?}",
                x.partition(),
                self.col_part
            )));
        }
        if y.partition() != self.row_part.as_slice() {
            return Err(SpmvError::InvalidDimensions(format!(
                "y is split as {:?}, the matrix rows as {:?}",
                y.partition(),
                self.row_part
            )));
        }
        for d in 0..self.devices.len() {
            if D::same_buffer(x.part(d), y.part(d)) {
                return Err(SpmvError::UnsupportedOperation(
                    "x and y must not share storage".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// `y = alpha * A * x`, or `y += alpha * A * x` when `append` is set.
    pub async fn multiply(
        &mut self,
        x: &DistVector<T, D>,
        y: &mut DistVector<T, D>,
        alpha: T,
        append: bool,
    ) -> Result<()> {
        self.check_vectors(x, y)?;

        // Start gathering the values other devices need.
        let mut pending = Vec::new();
        if let Some(exchange) = &mut self.exchange {
            for (d, peer) in exchange.peers.iter_mut().enumerate() {
                if let Some((cols, vals)) = &peer.send {
                    let device = &self.devices[d];
                    let kernel = device.kernel::<T>(KernelVariant::Gather)?;
                    let args = KernelArgs::Gather {
                        len: exchange.layout.send_count(d),
                        vals: x.part(d),
                        cols,
                        out: vals,
                    };
                    let gathered = device.enqueue_kernel(Stream::Primary, &kernel, args, &[])?;
                    let staging = std::mem::take(&mut peer.sent);
                    pending.push((
                        d,
                        device.enqueue_read_into(Stream::Transfer, vals, staging, &[gathered]),
                    ));
                }
            }
        }

        for (d, store) in self.stores.iter().enumerate() {
            if let Some(store) = store {
                store.mul_local(x.part(d), y.part(d), alpha, append)?;
            }
        }

        let Some(exchange) = &mut self.exchange else {
            return Ok(());
        };

        for (d, read) in pending {
            let values = read.await?;
            let (beg, end) = (exchange.layout.cidx[d], exchange.layout.cidx[d + 1]);
            exchange.rx[beg..end].copy_from_slice(&values[..end - beg]);
            exchange.peers[d].sent = values;
        }
        log::trace!("Staged {} ghost values", exchange.rx.len());

        for (d, peer) in exchange.peers.iter_mut().enumerate() {
            let (Some(ghost), Some(store)) = (&peer.ghost, &self.stores[d]) else {
                continue;
            };
            for (v, &i) in peer.vals_to_recv.iter_mut().zip(&peer.cols_to_recv) {
                *v = exchange.rx[i];
            }
            let device = &self.devices[d];
            let wait: Vec<D::Event> = peer.last_remote.take().into_iter().collect();
            let uploaded = device.enqueue_write(Stream::Transfer, ghost, &peer.vals_to_recv, &wait)?;
            peer.last_remote = store.mul_remote(ghost, y.part(d), alpha, &uploaded)?;
        }
        Ok(())
    }

    /// `y = A * x`.
    pub async fn mul(&mut self, x: &DistVector<T, D>, y: &mut DistVector<T, D>) -> Result<()> {
        self.multiply(x, y, T::one(), false).await
    }

    pub fn rows(&self) -> usize {
        self.nrows
    }

    pub fn cols(&self) -> usize {
        self.ncols
    }

    pub fn nonzeros(&self) -> usize {
        self.nnz
    }

    pub fn row_partition(&self) -> &[usize] {
        &self.row_part
    }

    pub fn col_partition(&self) -> &[usize] {
        &self.col_part
    }

    /// Columns device `d` reads from other devices.
    pub fn ghost_columns(&self, d: usize) -> &BTreeSet<usize> {
        &self.ghosts[d]
    }

    /// `None` when no values cross devices.
    pub fn exchange_layout(&self) -> Option<&ExchangeLayout> {
        self.exchange.as_ref().map(|e| &e.layout)
    }

    /// `None` for a device with an empty row band.
    pub fn store_format(&self, d: usize) -> Option<StorageFormat> {
        self.stores[d].as_ref().map(|s| s.format())
    }

    pub fn store(&self, d: usize) -> Option<&dyn SparseMatrixStore<T, D>> {
        self.stores[d].as_deref()
    }

    pub fn devices(&self) -> &[Arc<D>] {
        &self.devices
    }
}

impl<T: Real, D: Device> Matrix for SpMat<T, D> {
    type Value = T;

    fn dims(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    fn nonzeros(&self) -> usize {
        self.nnz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CpuDeviceConfig, PartitionConfig};
    use crate::device::CpuDevice;

    fn set(count: usize) -> DeviceSet<CpuDevice> {
        let devices = (0..count)
            .map(|_| CpuDevice::new(CpuDeviceConfig::default()).unwrap())
            .collect();
        DeviceSet::new(devices)
            .unwrap()
            .with_partition(PartitionConfig::with_alignment(1))
    }

    fn tridiagonal(n: usize) -> CsrMatrix<f64> {
        let dense: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| match i.abs_diff(j) {
                        0 => 2.0,
                        1 => -1.0,
                        _ => 0.0,
                    })
                    .collect()
            })
            .collect();
        CsrMatrix::from_dense(&dense).unwrap()
    }

    #[test]
    fn test_tridiagonal_on_two_devices() {
        let set = set(2);
        let mut a = SpMat::from_matrix(&set, &tridiagonal(6)).unwrap();
        assert_eq!(a.row_partition(), &[0, 3, 6]);
        assert_eq!(a.ghost_columns(0), &BTreeSet::from([3]));
        assert_eq!(a.ghost_columns(1), &BTreeSet::from([2]));
        assert_eq!(a.exchange_layout().unwrap().cols_to_send, vec![2, 3]);

        let x = DistVector::from_slice(&set, &[1.0; 6]).unwrap();
        let mut y = DistVector::zeros(&set, 6).unwrap();
        pollster::block_on(a.mul(&x, &mut y)).unwrap();
        assert_eq!(
            pollster::block_on(y.read()).unwrap(),
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]
        );
    }

    #[test]
    fn test_rejects_mismatched_vectors() {
        let set = set(2);
        let mut a = SpMat::from_matrix(&set, &tridiagonal(6)).unwrap();
        let x = DistVector::from_slice(&set, &[1.0; 5]).unwrap();
        let mut y = DistVector::zeros(&set, 6).unwrap();
        let err = pollster::block_on(a.mul(&x, &mut y));
        assert!(matches!(err, Err(SpmvError::InvalidDimensions(_))));
    }

    #[test]
    fn test_validation() {
        let set = set(1);
        let bad_ptr = SpMat::<f64, _>::new(&set, 2, 2, &[0, 2, 1], &[0, 1], &[1.0, 1.0]);
        assert!(matches!(bad_ptr, Err(SpmvError::InvalidMatrix(_))));
        let bad_col = SpMat::<f64, _>::new(&set, 1, 2, &[0, 1], &[2], &[1.0]);
        assert!(matches!(bad_col, Err(SpmvError::InvalidMatrix(_))));
        let bad_vals = SpMat::<f64, _>::new(&set, 1, 2, &[0, 1], &[1], &[]);
        assert!(matches!(bad_vals, Err(SpmvError::InvalidMatrix(_))));
    }

    #[test]
    fn test_empty_row_band_gets_no_store() {
        let set = set(3);
        let a = SpMat::from_matrix(&set, &tridiagonal(2)).unwrap();
        let empty: Vec<usize> = (0..3)
            .filter(|&d| a.row_partition()[d] == a.row_partition()[d + 1])
            .collect();
        assert!(!empty.is_empty());
        for d in empty {
            assert_eq!(a.store_format(d), None);
        }
    }
}
