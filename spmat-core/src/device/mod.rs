//! Execution devices.
//!
//! A device owns typed buffers and two in-order streams, `Primary` for
//! compute and `Transfer` for host copies. Commands return events that later
//! commands on either stream can depend on.

mod cpu;
mod gpu;

pub use cpu::{CpuDevice, HostBuffer, HostEvent, HostKernel};
pub use gpu::{GpuBuffer, GpuDevice, GpuKernel};

use crate::config::PartitionConfig;
use crate::error::{Result, SpmvError};
use crate::kernel_cache::{self, KernelCacheEntry, KernelKey};
use crate::kernels::{KernelArgs, KernelVariant};
use crate::partition::partition;
use crate::store::StorageFormat;
use crate::traits::{Element, Real};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Broad kind of a device; decides the matrix storage format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Cpu,
    Gpu,
    Accelerator,
}

impl DeviceClass {
    pub fn storage_format(self) -> StorageFormat {
        match self {
            DeviceClass::Cpu => StorageFormat::Csr,
            DeviceClass::Gpu | DeviceClass::Accelerator => StorageFormat::Hell,
        }
    }
}

/// Identifies the context a device's kernels are compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocates a fresh, process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub class: DeviceClass,
    pub context: ContextId,
    pub compute_units: usize,
}

/// The two in-order command queues of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Primary,
    Transfer,
}

/// Bytes moved between host and device since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_to_device: u64,
    pub bytes_from_device: u64,
    /// Device buffers and transfer staging areas allocated so far.
    pub buffers_created: u64,
}

/// Pending readback of a device buffer.
pub type ReadFuture<E> = BoxFuture<'static, Result<Vec<E>>>;

/// A compute device with its own memory and command streams.
pub trait Device: Debug + Send + Sync + Sized + 'static {
    type Buffer<E: Element>: Debug + Send + Sync;
    type Event: Clone + Debug + Send + Sync;
    type Kernel: Send + Sync + 'static;

    fn info(&self) -> &DeviceInfo;

    /// Allocates a zero-initialised buffer of `len` elements.
    fn create_buffer<E: Element>(&self, label: &str, len: usize) -> Result<Self::Buffer<E>>;

    /// Allocates a buffer holding a copy of `data`.
    fn create_buffer_init<E: Element>(&self, label: &str, data: &[E]) -> Result<Self::Buffer<E>>;

    fn buffer_len<E: Element>(buffer: &Self::Buffer<E>) -> usize;

    /// Whether both handles refer to the same device memory.
    fn same_buffer<E: Element>(a: &Self::Buffer<E>, b: &Self::Buffer<E>) -> bool;

    /// Copies `data` into the front of `buffer` once `wait` has completed.
    fn enqueue_write<E: Element>(
        &self,
        stream: Stream,
        buffer: &Self::Buffer<E>,
        data: &[E],
        wait: &[Self::Event],
    ) -> Result<Self::Event>;

    /// Reads the whole of `buffer` into `out` once `wait` has completed.
    ///
    /// `out` is cleared and handed back through the future, so a caller that
    /// keeps it between reads does not reallocate.
    fn enqueue_read_into<E: Element>(
        &self,
        stream: Stream,
        buffer: &Self::Buffer<E>,
        out: Vec<E>,
        wait: &[Self::Event],
    ) -> ReadFuture<E>;

    /// Reads the whole of `buffer` back once `wait` has completed.
    fn enqueue_read<E: Element>(
        &self,
        stream: Stream,
        buffer: &Self::Buffer<E>,
        wait: &[Self::Event],
    ) -> ReadFuture<E> {
        self.enqueue_read_into(stream, buffer, Vec::new(), wait)
    }

    /// Builds `variant` for element type `T`. Called through the kernel cache.
    fn compile_kernel<T: Real>(&self, variant: KernelVariant)
        -> Result<KernelCacheEntry<Self::Kernel>>;

    fn enqueue_kernel<T: Real>(
        &self,
        stream: Stream,
        kernel: &KernelCacheEntry<Self::Kernel>,
        args: KernelArgs<'_, T, Self>,
        wait: &[Self::Event],
    ) -> Result<Self::Event>;

    /// Blocks until `event` has completed.
    fn wait(&self, event: &Self::Event) -> Result<()>;

    /// Blocks until all commands submitted so far have completed.
    fn finish(&self) -> Result<()>;

    fn transfer_stats(&self) -> TransferStats;

    /// Returns the cached kernel for `variant`, compiling it on first use.
    fn kernel<T: Real>(&self, variant: KernelVariant) -> Result<Arc<KernelCacheEntry<Self::Kernel>>> {
        let key = KernelKey::new::<T>(self.info().context, variant);
        kernel_cache::get_or_compile(key, || self.compile_kernel::<T>(variant))
    }
}

/// The devices a matrix is distributed over, with their relative throughput.
#[derive(Debug)]
pub struct DeviceSet<D: Device> {
    devices: Vec<Arc<D>>,
    weights: Vec<f64>,
    partition: PartitionConfig,
}

impl<D: Device> Clone for DeviceSet<D> {
    fn clone(&self) -> Self {
        Self {
            devices: self.devices.clone(),
            weights: self.weights.clone(),
            partition: self.partition,
        }
    }
}

impl<D: Device> DeviceSet<D> {
    /// Creates a set with equal weights.
    pub fn new(devices: Vec<D>) -> Result<Self> {
        Self::from_shared(devices.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(devices: Vec<Arc<D>>) -> Result<Self> {
        if devices.is_empty() {
            return Err(SpmvError::NoDevices);
        }
        let weights = vec![1.0; devices.len()];
        Ok(Self {
            devices,
            weights,
            partition: PartitionConfig::default(),
        })
    }

    pub fn with_weights(mut self, weights: Vec<f64>) -> Result<Self> {
        if weights.len() != self.devices.len() {
            return Err(SpmvError::InvalidWeights(format!(
                "{} weights given for {} devices",
                weights.len(),
                self.devices.len()
            )));
        }
        // Rejects non-finite and negative weights up front.
        partition(0, &weights, 1)?;
        self.weights = weights;
        Ok(self)
    }

    pub fn with_partition(mut self, partition: PartitionConfig) -> Self {
        self.partition = partition;
        self
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device(&self, d: usize) -> &Arc<D> {
        &self.devices[d]
    }

    pub fn devices(&self) -> &[Arc<D>] {
        &self.devices
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn partition_config(&self) -> PartitionConfig {
        self.partition
    }

    /// Splits `[0, n)` over the devices of this set.
    pub fn partition_of(&self, n: usize) -> Result<Vec<usize>> {
        partition(n, &self.weights, self.partition.alignment)
    }

    /// Waits for every device to drain its streams.
    pub fn finish(&self) -> Result<()> {
        self.devices.iter().try_for_each(|d| d.finish())
    }
}
