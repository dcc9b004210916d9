//! Device throughput measurement used to weight the partitions.

use crate::device::{Device, DeviceSet};
use crate::error::{Result, SpmvError};
use crate::sparse_matrix::CsrMatrix;
use crate::spmat::SpMat;
use crate::traits::Real;
use crate::vector::DistVector;
use std::sync::Arc;
use std::time::Instant;

/// Grid edge of the benchmark problem.
pub const DEFAULT_PERF_SIZE: usize = 64;

/// 7-point Laplacian on an `n x n x n` grid with unit Dirichlet rows on the boundary.
pub fn poisson_3d<T: Real>(n: usize) -> Result<CsrMatrix<T>> {
    let cast = |v: usize| {
        T::from(v).ok_or_else(|| SpmvError::Internal(format!("{} is not representable", v)))
    };
    let h2i = cast(n.saturating_sub(1).pow(2))?;
    let diag = cast(6)? * h2i;
    let n3 = n * n * n;
    let interior = n.saturating_sub(2).pow(3);

    let mut row_ptr = Vec::with_capacity(n3 + 1);
    let mut cols = Vec::with_capacity(7 * interior + (n3 - interior));
    let mut vals = Vec::with_capacity(7 * interior + (n3 - interior));
    row_ptr.push(0);

    let mut idx = 0;
    for k in 0..n {
        for j in 0..n {
            for i in 0..n {
                let boundary = [i, j, k].iter().any(|&c| c == 0 || c == n - 1);
                if boundary {
                    cols.push(idx);
                    vals.push(T::one());
                } else {
                    for (c, v) in [
                        (idx - n * n, -h2i),
                        (idx - n, -h2i),
                        (idx - 1, -h2i),
                        (idx, diag),
                        (idx + 1, -h2i),
                        (idx + n, -h2i),
                        (idx + n * n, -h2i),
                    ] {
                        cols.push(c);
                        vals.push(v);
                    }
                }
                row_ptr.push(cols.len());
                idx += 1;
            }
        }
    }

    CsrMatrix::from_csr(n3, n3, vals, cols, row_ptr)
}

/// Multiplies per second on the Poisson problem of edge `size`.
pub async fn device_spmv_perf<D: Device>(device: &Arc<D>, size: usize) -> Result<f64> {
    if size == 0 {
        return Err(SpmvError::InvalidDimensions(
            "benchmark size must be positive".to_string(),
        ));
    }
    let set = DeviceSet::from_shared(vec![Arc::clone(device)])?;
    let matrix = poisson_3d::<f32>(size)?;
    let mut a = SpMat::from_matrix(&set, &matrix)?;
    let x = DistVector::from_slice(&set, &vec![1.0f32; a.cols()])?;
    let mut y = DistVector::zeros(&set, a.rows())?;

    a.mul(&x, &mut y).await?;
    device.finish()?;

    let start = Instant::now();
    a.mul(&x, &mut y).await?;
    device.finish()?;
    let seconds = start.elapsed().as_secs_f64().max(1e-9);

    log::info!(
        "{}: {:.1} multiplies/s on a {}^3 Poisson problem",
        device.info().name,
        1.0 / seconds,
        size
    );
    Ok(1.0 / seconds)
}

impl<D: Device> DeviceSet<D> {
    /// Replaces the weights with the measured throughput of each device.
    pub async fn benchmark_weights(self, size: usize) -> Result<Self> {
        let mut weights = Vec::with_capacity(self.len());
        for device in self.devices() {
            weights.push(device_spmv_perf(device, size).await?);
        }
        self.with_weights(weights)
    }
}
