use super::{zero_fill, BandSplit, HostCsr, HostHell, SparseMatrixStore, StorageFormat, Uploader};
use crate::device::{Device, Stream};
use crate::error::Result;
use crate::kernels::{HellBuffers, KernelArgs, KernelVariant};
use crate::traits::Real;
use std::sync::Arc;

/// Row band stored as hybrid ELL + CSR, for GPU and accelerator devices.
#[derive(Debug)]
pub struct HellStore<T: Real, D: Device> {
    device: Arc<D>,
    rows: usize,
    local: Option<HellBuffers<T, D>>,
    remote: Option<HellBuffers<T, D>>,
    local_nnz: usize,
    remote_nnz: usize,
    ghosts: Vec<usize>,
}

fn upload_hell<T: Real, D: Device>(
    uploader: &mut Uploader<'_, D>,
    label: &str,
    csr: &HostCsr<T>,
) -> Result<HellBuffers<T, D>> {
    let hell = HostHell::from_csr(csr);
    log::trace!(
        "{} part: ELL width {}, {} overflow nonzeros",
        label,
        hell.width,
        hell.overflow.nnz()
    );
    Ok(HellBuffers {
        width: hell.width,
        ell_col: uploader.upload(&format!("{} ell col", label), &hell.ell_col)?,
        ell_val: uploader.upload(&format!("{} ell val", label), &hell.ell_val)?,
        csr: uploader.csr(label, &hell.overflow)?,
    })
}

impl<T: Real, D: Device> HellStore<T, D> {
    pub fn new(device: &Arc<D>, band: &BandSplit<T>) -> Result<Self> {
        let mut uploader = Uploader::new(device.as_ref());
        let local_nnz = band.local.nnz();
        let remote_nnz = band.remote.as_ref().map_or(0, |r| r.nnz());

        let local = match local_nnz {
            0 => None,
            _ => Some(upload_hell(&mut uploader, "local", &band.local)?),
        };
        let remote = match &band.remote {
            Some(remote) if remote_nnz > 0 => Some(upload_hell(&mut uploader, "remote", remote)?),
            _ => None,
        };
        uploader.finish()?;

        log::debug!(
            "{}: HELL band of {} rows, {} local and {} remote nonzeros",
            device.info().name,
            band.rows(),
            local_nnz,
            remote_nnz
        );

        Ok(Self {
            device: Arc::clone(device),
            rows: band.rows(),
            local,
            remote,
            local_nnz,
            remote_nnz,
            ghosts: band.ghosts.clone(),
        })
    }

    /// ELL widths of the local and remote parts.
    pub fn widths(&self) -> (usize, usize) {
        (
            self.local.as_ref().map_or(0, |m| m.width),
            self.remote.as_ref().map_or(0, |m| m.width),
        )
    }

    fn launch(
        &self,
        variant: KernelVariant,
        matrix: &HellBuffers<T, D>,
        x: &D::Buffer<T>,
        y: &D::Buffer<T>,
        alpha: T,
        wait: &[D::Event],
    ) -> Result<D::Event> {
        let kernel = self.device.kernel::<T>(variant)?;
        let args = KernelArgs::Hell {
            rows: self.rows,
            matrix,
            x,
            y,
            alpha,
        };
        self.device.enqueue_kernel(Stream::Primary, &kernel, args, wait)
    }
}

impl<T: Real, D: Device> SparseMatrixStore<T, D> for HellStore<T, D> {
    fn format(&self) -> StorageFormat {
        StorageFormat::Hell
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn local_nonzeros(&self) -> usize {
        self.local_nnz
    }

    fn remote_nonzeros(&self) -> usize {
        self.remote_nnz
    }

    fn ghost_dictionary(&self) -> &[usize] {
        &self.ghosts
    }

    fn mul_local(
        &self,
        x: &D::Buffer<T>,
        y: &D::Buffer<T>,
        alpha: T,
        append: bool,
    ) -> Result<Option<D::Event>> {
        match &self.local {
            Some(local) => self
                .launch(KernelVariant::hell(append), local, x, y, alpha, &[])
                .map(Some),
            None if !append => zero_fill(self.device.as_ref(), y, self.rows).map(Some),
            None => Ok(None),
        }
    }

    fn mul_remote(
        &self,
        x_ghost: &D::Buffer<T>,
        y: &D::Buffer<T>,
        alpha: T,
        wait: &D::Event,
    ) -> Result<Option<D::Event>> {
        match &self.remote {
            Some(remote) => self
                .launch(
                    KernelVariant::HellAdd,
                    remote,
                    x_ghost,
                    y,
                    alpha,
                    std::slice::from_ref(wait),
                )
                .map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuDeviceConfig;
    use crate::device::{CpuDevice, DeviceClass};
    use crate::store::CsrStore;
    use std::collections::BTreeSet;

    fn accelerator() -> Arc<CpuDevice> {
        let config = CpuDeviceConfig::default()
            .with_class(DeviceClass::Accelerator)
            .with_compute_units(3);
        Arc::new(CpuDevice::new(config).unwrap())
    }

    /// Random band with uneven rows so that both the slab and the overflow are used.
    fn random_band(seed: u64) -> (Vec<usize>, Vec<usize>, Vec<f64>, usize) {
        let mut rng = fastrand::Rng::with_seed(seed);
        let n = 40;
        let mut row_ptr = vec![0];
        let (mut cols, mut vals) = (Vec::new(), Vec::new());
        for i in 0..n {
            let len = if i % 5 == 0 { 12 } else { rng.usize(0..4) };
            for _ in 0..len {
                cols.push(rng.usize(0..n));
                vals.push(rng.i32(-8..8) as f64);
            }
            row_ptr.push(cols.len());
        }
        (row_ptr, cols, vals, n)
    }

    fn run<S: SparseMatrixStore<f64, CpuDevice>>(
        device: &CpuDevice,
        store: &S,
        ghosts: &[usize],
        x: &[f64],
        local: std::ops::Range<usize>,
    ) -> Vec<f64> {
        let x_local = device.create_buffer_init("x", &x[local]).unwrap();
        let ghost_vals: Vec<f64> = ghosts.iter().map(|&c| x[c]).collect();
        let x_ghost = device.create_buffer_init("ghost", &ghost_vals).unwrap();
        let y = device.create_buffer::<f64>("y", store.rows()).unwrap();
        let ready = store
            .mul_local(&x_local, &y, 2.0, false)
            .unwrap()
            .unwrap();
        store.mul_remote(&x_ghost, &y, 2.0, &ready).unwrap();
        pollster::block_on(device.enqueue_read(Stream::Primary, &y, &[])).unwrap()
    }

    #[test]
    fn test_hell_matches_csr() {
        let device = accelerator();
        for seed in 0..5 {
            let (row_ptr, cols, vals, n) = random_band(seed);
            let (rows, local) = (10..30, 15..35);
            let ghosts: BTreeSet<usize> = cols[row_ptr[rows.start]..row_ptr[rows.end]]
                .iter()
                .copied()
                .filter(|c| !local.contains(c))
                .collect();
            let band = BandSplit::new(rows.clone(), local.clone(), &ghosts, &row_ptr, &cols, &vals);

            let hell = HellStore::new(&device, &band).unwrap();
            let csr = CsrStore::new(&device, &band).unwrap();
            assert_eq!(hell.format(), StorageFormat::Hell);
            assert_eq!(hell.local_nonzeros(), csr.local_nonzeros());
            assert_eq!(hell.remote_nonzeros(), csr.remote_nonzeros());

            let x: Vec<f64> = (0..n).map(|i| (i % 7) as f64 - 3.0).collect();
            let ghost_list: Vec<usize> = ghosts.iter().copied().collect();
            let from_hell = run(&device, &hell, &ghost_list, &x, local.clone());
            let from_csr = run(&device, &csr, &ghost_list, &x, local.clone());
            assert_eq!(from_hell, from_csr, "seed {}", seed);

            let mut expected = vec![0.0; rows.len()];
            for (k, i) in rows.clone().enumerate() {
                for j in row_ptr[i]..row_ptr[i + 1] {
                    expected[k] += 2.0 * vals[j] * x[cols[j]];
                }
            }
            assert_eq!(from_hell, expected, "seed {}", seed);
        }
    }

    #[test]
    fn test_store_class_selection() {
        let device = accelerator();
        let row_ptr = vec![0, 1, 2];
        let band = BandSplit::new(0..2, 0..2, &BTreeSet::new(), &row_ptr, &[0, 1], &[1.0f64, 1.0]);
        let store = crate::store::create_store(&device, &band).unwrap();
        assert_eq!(store.format(), StorageFormat::Hell);
        let hell = HellStore::new(&device, &band).unwrap();
        assert_eq!(hell.widths(), (1, 0));
    }
}
