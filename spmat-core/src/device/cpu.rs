//! A device backed by host threads.
//!
//! Each stream is a worker thread draining an in-order command queue. A
//! command first blocks on its dependency events, then runs, then signals its
//! own event. Buffers are shared host vectors behind a lock.

use super::{ContextId, Device, DeviceInfo, ReadFuture, Stream, TransferStats};
use crate::config::CpuDeviceConfig;
use crate::error::{Result, SpmvError};
use crate::kernel_cache::KernelCacheEntry;
use crate::kernels::host::{self, HellSlices};
use crate::kernels::{KernelArgs, KernelVariant};
use crate::traits::{Element, Real};
use futures::channel::oneshot;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
    failed: AtomicBool,
}

/// Completion handle of a host command.
#[derive(Debug, Clone, Default)]
pub struct HostEvent(Arc<Completion>);

impl HostEvent {
    fn signal(&self, ok: bool) {
        if !ok {
            self.0.failed.store(true, Ordering::Release);
        }
        *lock(&self.0.done) = true;
        self.0.cond.notify_all();
    }

    /// Blocks until the command has run; returns whether it succeeded.
    fn block(&self) -> bool {
        let mut done = lock(&self.0.done);
        while !*done {
            done = self.0.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
        !self.0.failed.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct HostStream {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    last: Mutex<Option<HostEvent>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostStream {
    fn spawn(name: String) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new().name(name.clone()).spawn(move || {
            for job in receiver {
                job();
            }
        })?;
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            last: Mutex::new(None),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues `work` to run after every event in `wait`.
    ///
    /// A failed dependency skips the command and fails its event too.
    fn submit<F>(&self, wait: &[HostEvent], work: F) -> Result<HostEvent>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let event = HostEvent::default();
        let signal = event.clone();
        let deps = wait.to_vec();
        let name = self.name.clone();

        let job: Job = Box::new(move || {
            let ready = deps.iter().fold(true, |ok, dep| dep.block() && ok);
            let ok = ready
                && match panic::catch_unwind(AssertUnwindSafe(work)) {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        log::error!("{}: command failed: {}", name, e);
                        false
                    }
                    Err(_) => {
                        log::error!("{}: command panicked", name);
                        false
                    }
                };
            signal.signal(ok);
        });

        let sender = lock(&self.sender);
        sender
            .as_ref()
            .ok_or_else(|| SpmvError::DeviceLost(format!("{} is shut down", self.name)))?
            .send(job)
            .map_err(|_| SpmvError::DeviceLost(format!("{} worker exited", self.name)))?;
        *lock(&self.last) = Some(event.clone());
        Ok(event)
    }

    fn finish(&self) -> Result<()> {
        let last = lock(&self.last).clone();
        match last {
            Some(event) if !event.block() => Err(SpmvError::Internal(format!(
                "last command on {} failed",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        lock(&self.sender).take();
        if let Some(worker) = lock(&self.worker).take() {
            if worker.join().is_err() {
                log::error!("{}: worker thread panicked", self.name);
            }
        }
    }
}

/// Host memory shared between the controlling thread and the stream workers.
#[derive(Debug)]
pub struct HostBuffer<E> {
    data: Arc<RwLock<Vec<E>>>,
    len: usize,
    label: Arc<str>,
}

impl<E> Clone for HostBuffer<E> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            len: self.len,
            label: Arc::clone(&self.label),
        }
    }
}

impl<E: Element> HostBuffer<E> {
    fn new(label: &str, data: Vec<E>) -> Self {
        Self {
            len: data.len(),
            data: Arc::new(RwLock::new(data)),
            label: Arc::from(label),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<E>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<E>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Reusable byte vectors holding write data until a stream job copies it in.
#[derive(Debug, Default)]
struct StagingPool(Mutex<Vec<Vec<u8>>>);

impl StagingPool {
    /// Takes a vector able to hold `len` bytes without growing; `None` if a new one is needed.
    fn take(&self, len: usize) -> Option<Vec<u8>> {
        let mut free = lock(&self.0);
        let index = free.iter().position(|v| v.capacity() >= len)?;
        Some(free.swap_remove(index))
    }

    fn put(&self, mut staging: Vec<u8>) {
        staging.clear();
        lock(&self.0).push(staging);
    }
}

/// A host kernel: the routine is picked by variant and monomorphised on `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostKernel {
    pub variant: KernelVariant,
    pub type_name: &'static str,
}

#[derive(Debug)]
pub struct CpuDevice {
    info: DeviceInfo,
    config: CpuDeviceConfig,
    primary: HostStream,
    transfer: HostStream,
    bytes_to_device: AtomicU64,
    bytes_from_device: AtomicU64,
    buffers_created: AtomicU64,
    staging: Arc<StagingPool>,
}

impl CpuDevice {
    /// Creates a device with its own kernel context.
    pub fn new(config: CpuDeviceConfig) -> Result<Self> {
        Self::with_context(config, ContextId::next())
    }

    /// Creates another device sharing this device's context and configuration.
    pub fn sibling(&self) -> Result<Self> {
        Self::with_context(self.config.clone(), self.info.context)
    }

    fn with_context(config: CpuDeviceConfig, context: ContextId) -> Result<Self> {
        let info = DeviceInfo {
            name: config.name.clone(),
            class: config.class,
            context,
            compute_units: config.compute_units.max(1),
        };
        let primary = HostStream::spawn(format!("{}-primary", config.name))?;
        let transfer = HostStream::spawn(format!("{}-transfer", config.name))?;
        log::info!(
            "host device '{}' ({:?}, {} units) on context {:?}",
            info.name,
            info.class,
            info.compute_units,
            info.context
        );
        Ok(Self {
            info,
            config,
            primary,
            transfer,
            bytes_to_device: AtomicU64::new(0),
            bytes_from_device: AtomicU64::new(0),
            buffers_created: AtomicU64::new(0),
            staging: Arc::new(StagingPool::default()),
        })
    }

    pub fn config(&self) -> &CpuDeviceConfig {
        &self.config
    }

    fn stream(&self, stream: Stream) -> &HostStream {
        match stream {
            Stream::Primary => &self.primary,
            Stream::Transfer => &self.transfer,
        }
    }

    fn count_to_device<E>(&self, len: usize) {
        let bytes = (len * std::mem::size_of::<E>()) as u64;
        let total = self.bytes_to_device.fetch_add(bytes, Ordering::Relaxed) + bytes;
        log::trace!("bytes_to_device incremented by {}, now: {}", bytes, total);
    }

    fn count_from_device<E>(&self, len: usize) {
        let bytes = (len * std::mem::size_of::<E>()) as u64;
        let total = self.bytes_from_device.fetch_add(bytes, Ordering::Relaxed) + bytes;
        log::trace!("bytes_from_device incremented by {}, now: {}", bytes, total);
    }

    fn count_allocation(&self, what: &str) {
        let total = self.buffers_created.fetch_add(1, Ordering::Relaxed) + 1;
        log::trace!("allocated {}, {} allocations so far", what, total);
    }

    fn global_size(&self, kernel: &KernelCacheEntry<HostKernel>) -> usize {
        self.info.compute_units * kernel.group_size.max(1)
    }
}

fn check_len<E: Element>(buffer: &HostBuffer<E>, needed: usize) -> Result<()> {
    if buffer.len() < needed {
        return Err(SpmvError::InvalidDimensions(format!(
            "buffer '{}' holds {} elements, {} required",
            buffer.label(),
            buffer.len(),
            needed
        )));
    }
    Ok(())
}

fn check_distinct<E: Element>(input: &HostBuffer<E>, output: &HostBuffer<E>) -> Result<()> {
    if Arc::ptr_eq(&input.data, &output.data) {
        return Err(SpmvError::UnsupportedOperation(format!(
            "input and output both refer to buffer '{}'",
            output.label()
        )));
    }
    Ok(())
}

impl Device for CpuDevice {
    type Buffer<E: Element> = HostBuffer<E>;
    type Event = HostEvent;
    type Kernel = HostKernel;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer<E: Element>(&self, label: &str, len: usize) -> Result<HostBuffer<E>> {
        log::debug!("creating host buffer '{}' of {} elements", label, len);
        self.count_allocation(label);
        Ok(HostBuffer::new(label, vec![E::zeroed(); len]))
    }

    fn create_buffer_init<E: Element>(&self, label: &str, data: &[E]) -> Result<HostBuffer<E>> {
        log::debug!("creating host buffer '{}' with {} elements", label, data.len());
        self.count_to_device::<E>(data.len());
        self.count_allocation(label);
        Ok(HostBuffer::new(label, data.to_vec()))
    }

    fn buffer_len<E: Element>(buffer: &HostBuffer<E>) -> usize {
        buffer.len()
    }

    fn same_buffer<E: Element>(a: &HostBuffer<E>, b: &HostBuffer<E>) -> bool {
        Arc::ptr_eq(&a.data, &b.data)
    }

    fn enqueue_write<E: Element>(
        &self,
        stream: Stream,
        buffer: &HostBuffer<E>,
        data: &[E],
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        check_len(buffer, data.len())?;
        self.count_to_device::<E>(data.len());
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mut staging = match self.staging.take(bytes.len()) {
            Some(staging) => staging,
            None => {
                self.count_allocation("write staging");
                Vec::with_capacity(bytes.len())
            }
        };
        staging.extend_from_slice(bytes);

        let target = buffer.clone();
        let pool = Arc::clone(&self.staging);
        let len = data.len();
        self.stream(stream).submit(wait, move || {
            bytemuck::cast_slice_mut::<E, u8>(&mut target.write()[..len]).copy_from_slice(&staging);
            pool.put(staging);
            Ok(())
        })
    }

    fn enqueue_read_into<E: Element>(
        &self,
        stream: Stream,
        buffer: &HostBuffer<E>,
        mut out: Vec<E>,
        wait: &[HostEvent],
    ) -> ReadFuture<E> {
        if out.capacity() < buffer.len() {
            self.count_allocation("read staging");
            out.reserve_exact(buffer.len() - out.len());
        }
        let (sender, receiver) = oneshot::channel();
        let source = buffer.clone();
        let submitted = self.stream(stream).submit(wait, move || {
            out.clear();
            out.extend_from_slice(&source.read());
            let values = out;
            sender
                .send(values)
                .map_err(|_| SpmvError::Internal("readback receiver dropped".to_string()))
        });
        if submitted.is_ok() {
            self.count_from_device::<E>(buffer.len());
        }

        Box::pin(async move {
            submitted?;
            receiver
                .await
                .map_err(|_| SpmvError::Internal("readback did not complete".to_string()))
        })
    }

    fn compile_kernel<T: Real>(&self, variant: KernelVariant) -> Result<KernelCacheEntry<HostKernel>> {
        Ok(KernelCacheEntry {
            kernel: HostKernel {
                variant,
                type_name: T::TYPE_NAME,
            },
            group_size: self.config.group_size.max(1),
        })
    }

    fn enqueue_kernel<T: Real>(
        &self,
        stream: Stream,
        kernel: &KernelCacheEntry<HostKernel>,
        args: KernelArgs<'_, T, Self>,
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        let variant = kernel.kernel.variant;
        if !args.accepts(variant) || kernel.kernel.type_name != T::TYPE_NAME {
            return Err(SpmvError::KernelMismatch {
                kernel: variant.name(),
                args: args.kind(),
            });
        }
        let global_size = self.global_size(kernel);
        let append = variant.appends();
        log::trace!("{}: {} on {:?}", self.info.name, variant.name(), stream);

        match args {
            KernelArgs::Csr {
                rows,
                matrix,
                x,
                y,
                alpha,
            } => {
                check_distinct(x, y)?;
                check_len(&matrix.row, rows + 1)?;
                check_len(y, rows)?;
                let (row, col, val) = (matrix.row.clone(), matrix.col.clone(), matrix.val.clone());
                let (x, y) = (x.clone(), y.clone());
                self.stream(stream).submit(wait, move || {
                    let (row, col, val, x) = (row.read(), col.read(), val.read(), x.read());
                    let mut y = y.write();
                    host::spmv_csr(rows, global_size, &row, &col, &val, &x, &mut y, alpha, append);
                    Ok(())
                })
            }
            KernelArgs::Hell {
                rows,
                matrix,
                x,
                y,
                alpha,
            } => {
                check_distinct(x, y)?;
                check_len(&matrix.csr.row, rows + 1)?;
                check_len(&matrix.ell_col, rows * matrix.width)?;
                check_len(y, rows)?;
                let width = matrix.width;
                let (ell_col, ell_val) = (matrix.ell_col.clone(), matrix.ell_val.clone());
                let (row, col, val) = (
                    matrix.csr.row.clone(),
                    matrix.csr.col.clone(),
                    matrix.csr.val.clone(),
                );
                let (x, y) = (x.clone(), y.clone());
                self.stream(stream).submit(wait, move || {
                    let (ell_col, ell_val) = (ell_col.read(), ell_val.read());
                    let (row, col, val, x) = (row.read(), col.read(), val.read(), x.read());
                    let slices = HellSlices {
                        width,
                        ell_col: &ell_col,
                        ell_val: &ell_val,
                        row: &row,
                        col: &col,
                        val: &val,
                    };
                    let mut y = y.write();
                    host::spmv_hell(rows, global_size, &slices, &x, &mut y, alpha, append);
                    Ok(())
                })
            }
            KernelArgs::Gather {
                len,
                vals,
                cols,
                out,
            } => {
                check_distinct(vals, out)?;
                check_len(cols, len)?;
                check_len(out, len)?;
                let (vals, cols, out) = (vals.clone(), cols.clone(), out.clone());
                self.stream(stream).submit(wait, move || {
                    let (vals, cols) = (vals.read(), cols.read());
                    host::gather(&vals, &cols[..len], &mut out.write()[..len]);
                    Ok(())
                })
            }
            KernelArgs::Fill { len, y, value } => {
                check_len(y, len)?;
                let y = y.clone();
                self.stream(stream).submit(wait, move || {
                    host::fill(&mut y.write()[..len], value);
                    Ok(())
                })
            }
        }
    }

    fn wait(&self, event: &HostEvent) -> Result<()> {
        if event.block() {
            Ok(())
        } else {
            Err(SpmvError::Internal(format!(
                "command on device '{}' failed",
                self.info.name
            )))
        }
    }

    fn finish(&self) -> Result<()> {
        self.primary.finish()?;
        self.transfer.finish()
    }

    fn transfer_stats(&self) -> TransferStats {
        TransferStats {
            bytes_to_device: self.bytes_to_device.load(Ordering::Relaxed),
            bytes_from_device: self.bytes_from_device.load(Ordering::Relaxed),
            buffers_created: self.buffers_created.load(Ordering::Relaxed),
        }
    }
}
