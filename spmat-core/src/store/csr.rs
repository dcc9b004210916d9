use super::{zero_fill, BandSplit, SparseMatrixStore, StorageFormat, Uploader};
use crate::device::{Device, Stream};
use crate::error::Result;
use crate::kernels::{CsrBuffers, KernelArgs, KernelVariant};
use crate::traits::Real;
use std::sync::Arc;

/// Row band stored as plain CSR, for host-class devices.
#[derive(Debug)]
pub struct CsrStore<T: Real, D: Device> {
    device: Arc<D>,
    rows: usize,
    local: Option<CsrBuffers<T, D>>,
    remote: Option<CsrBuffers<T, D>>,
    ghosts: Vec<usize>,
}

impl<T: Real, D: Device> CsrStore<T, D> {
    pub fn new(device: &Arc<D>, band: &BandSplit<T>) -> Result<Self> {
        let mut uploader = Uploader::new(device.as_ref());
        let local = match band.local.nnz() {
            0 => None,
            _ => Some(uploader.csr("local", &band.local)?),
        };
        let remote = match &band.remote {
            Some(remote) if remote.nnz() > 0 => Some(uploader.csr("remote", remote)?),
            _ => None,
        };
        uploader.finish()?;

        log::debug!(
            "{}: CSR band of {} rows, {} local and {} remote nonzeros",
            device.info().name,
            band.rows(),
            band.local.nnz(),
            remote.as_ref().map_or(0, |r| r.nnz)
        );

        Ok(Self {
            device: Arc::clone(device),
            rows: band.rows(),
            local,
            remote,
            ghosts: band.ghosts.clone(),
        })
    }

    fn launch(
        &self,
        variant: KernelVariant,
        matrix: &CsrBuffers<T, D>,
        x: &D::Buffer<T>,
        y: &D::Buffer<T>,
        alpha: T,
        wait: &[D::Event],
    ) -> Result<D::Event> {
        let kernel = self.device.kernel::<T>(variant)?;
        let args = KernelArgs::Csr {
            rows: self.rows,
            matrix,
            x,
            y,
            alpha,
        };
        self.device.enqueue_kernel(Stream::Primary, &kernel, args, wait)
    }
}

impl<T: Real, D: Device> SparseMatrixStore<T, D> for CsrStore<T, D> {
    fn format(&self) -> StorageFormat {
        StorageFormat::Csr
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn local_nonzeros(&self) -> usize {
        self.local.as_ref().map_or(0, |m| m.nnz)
    }

    fn remote_nonzeros(&self) -> usize {
        self.remote.as_ref().map_or(0, |m| m.nnz)
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
                .launch(KernelVariant::csr(append), local, x, y, alpha, &[])
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
                    KernelVariant::CsrAdd,
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
