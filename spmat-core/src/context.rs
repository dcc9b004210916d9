use crate::config::GpuDeviceConfig;
use crate::error::{Result, SpmvError};
use bytemuck::Pod;
use cfg_if::cfg_if;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use wgpu::{util::DeviceExt, PollType};

/// Wrapper for a wgpu adapter's device and queue, including transfer counters.
#[derive(Debug, Clone)]
pub(crate) struct GpuContext {
    pub(crate) device: Arc<wgpu::Device>,
    pub(crate) queue: Arc<wgpu::Queue>,
    pub(crate) adapter_info: wgpu::AdapterInfo,
    /// Workgroup size the kernels are generated with, clamped to the device limits.
    pub(crate) workgroup_size: u32,
    /// Tracks bytes transferred from CPU to GPU.
    pub(crate) bytes_to_gpu: Arc<AtomicU64>,
    /// Tracks bytes transferred from GPU to CPU.
    pub(crate) bytes_from_gpu: Arc<AtomicU64>,
    /// Counts buffers created through this context, staging included.
    pub(crate) buffers_created: Arc<AtomicU64>,
    /// Unmapped readback staging buffers ready for reuse.
    staging: Arc<Mutex<Vec<wgpu::Buffer>>>,
}

fn instance() -> wgpu::Instance {
    wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::PRIMARY,
        ..Default::default()
    })
}

impl GpuContext {
    /// Opens the highest-performance adapter.
    pub(crate) async fn new(config: &GpuDeviceConfig) -> Result<Self> {
        log::info!("Initializing native WGPU context");

        let adapter = instance()
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| SpmvError::WgpuInitError("No suitable native adapter found".to_string()))?;

        Self::from_adapter(adapter, config).await
    }

    /// Opens every adapter of the primary backends.
    pub(crate) async fn enumerate(config: &GpuDeviceConfig) -> Result<Vec<Self>> {
        let mut contexts = Vec::new();
        for adapter in instance().enumerate_adapters(wgpu::Backends::PRIMARY) {
            match Self::from_adapter(adapter, config).await {
                Ok(context) => contexts.push(context),
                Err(e) => log::warn!("Skipping adapter: {}", e),
            }
        }
        Ok(contexts)
    }

    async fn from_adapter(adapter: wgpu::Adapter, config: &GpuDeviceConfig) -> Result<Self> {
        let adapter_info = adapter.get_info();
        log::info!("Selected Adapter: {:?}", adapter_info);
        log::debug!("Adapter Features: {:?}", adapter.features());

        let mut limits = wgpu::Limits::default().using_resolution(adapter.limits());
        // The hybrid multiply binds eight storage buffers.
        limits.max_storage_buffers_per_shader_stage =
            limits.max_storage_buffers_per_shader_stage.max(8);
        log::debug!("Adjusted limits: {:?}", limits);

        let mut required_features = wgpu::Features::empty();
        if config.request_f64 {
            if adapter.features().contains(wgpu::Features::SHADER_F64) {
                required_features |= wgpu::Features::SHADER_F64;
            } else {
                log::warn!("SHADER_F64 is not supported by '{}'", adapter_info.name);
            }
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("spmat device"),
                trace: wgpu::Trace::Off,
                memory_hints: wgpu::MemoryHints::Performance,
                required_features,
                required_limits: limits.clone(),
            })
            .await
            .map_err(|e| SpmvError::WgpuInitError(format!("Failed to request device: {}", e)))?;

        let workgroup_size = config
            .workgroup_size
            .clamp(1, limits.max_compute_workgroup_size_x)
            .min(limits.max_compute_invocations_per_workgroup);

        log::info!(
            "Device ready: '{}', f64 {}, workgroup size {}",
            adapter_info.name,
            device.features().contains(wgpu::Features::SHADER_F64),
            workgroup_size
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            workgroup_size,
            bytes_to_gpu: Arc::new(AtomicU64::new(0)),
            bytes_from_gpu: Arc::new(AtomicU64::new(0)),
            buffers_created: Arc::new(AtomicU64::new(0)),
            staging: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub(crate) fn supports_f64(&self) -> bool {
        self.device.features().contains(wgpu::Features::SHADER_F64)
    }

    /// Creates a buffer with initial data and tracks the transfer size.
    pub(crate) fn create_gpu_buffer_with_data(
        &self,
        label: &str,
        contents: &[u8],
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        let byte_len = contents.len() as u64;
        log::debug!("Creating GPU buffer '{}' with {} bytes", label, byte_len);
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            });
        self.count_to_gpu(byte_len);
        self.count_buffer();
        buffer
    }

    /// Creates a zero-filled buffer. Does not count towards `bytes_to_gpu`.
    pub(crate) fn create_empty_buffer(
        &self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        log::debug!("Creating empty GPU buffer '{}' of size {}", label, size);
        self.count_buffer();
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Takes the smallest pooled staging buffer of at least `size` bytes, or creates one.
    fn take_staging(&self, size: u64) -> wgpu::Buffer {
        let mut free = self.staging.lock().unwrap_or_else(PoisonError::into_inner);
        let best = free
            .iter()
            .enumerate()
            .filter(|(_, b)| b.size() >= size)
            .min_by_key(|(_, b)| b.size())
            .map(|(i, _)| i);
        match best {
            Some(i) => free.swap_remove(i),
            None => {
                drop(free);
                self.create_empty_buffer(
                    "staging_buffer_for_readback",
                    size,
                    wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                )
            }
        }
    }

    /// Queues a write of `data` to the front of `buffer` and submits it.
    pub(crate) fn write_buffer<T: Pod>(
        &self,
        buffer: &wgpu::Buffer,
        data: &[T],
    ) -> Result<wgpu::SubmissionIndex> {
        let byte_len = std::mem::size_of_val(data) as u64;
        if buffer.size() < byte_len {
            return Err(SpmvError::Internal(format!(
                "Target buffer size ({}) is smaller than data size ({})",
                buffer.size(),
                byte_len
            )));
        }
        if byte_len > 0 {
            log::trace!("Writing {} bytes to buffer", byte_len);
            self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
            self.count_to_gpu(byte_len);
        }
        Ok(self.queue.submit(None))
    }

    /// Copies the first `element_count` elements of `buffer` into a staging
    /// buffer and returns a future resolving to them, written into `out`,
    /// once the copy is mapped. The staging buffer goes back to the pool.
    pub(crate) fn read_buffer_to_cpu<T: Pod + Send>(
        &self,
        buffer: &wgpu::Buffer,
        element_count: usize,
        mut out: Vec<T>,
    ) -> Result<impl std::future::Future<Output = Result<Vec<T>>> + Send + 'static> {
        let size_bytes = (element_count * std::mem::size_of::<T>()) as u64;
        if buffer.size() < size_bytes {
            return Err(SpmvError::Internal(format!(
                "GPU buffer size ({}) is smaller than expected size ({})",
                buffer.size(),
                size_bytes
            )));
        }

        // A zero-sized staging buffer cannot be mapped.
        let staging_size = size_bytes.max(wgpu::COPY_BUFFER_ALIGNMENT);
        let staging_buffer = self.take_staging(staging_size);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("read_buffer_encoder"),
            });
        if size_bytes > 0 {
            encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size_bytes);
        }
        let index = self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = futures::channel::oneshot::channel();
        staging_buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                if let Err(e) = sender.send(result) {
                    log::error!("Failed to send map result back: {:?}", e);
                }
            });

        self.bytes_from_gpu.fetch_add(size_bytes, Ordering::Relaxed);
        log::trace!(
            "bytes_from_gpu incremented by {}, now: {}",
            size_bytes,
            self.bytes_from_gpu.load(Ordering::Relaxed)
        );

        let device = Arc::clone(&self.device);
        let pool = Arc::clone(&self.staging);
        Ok(async move {
            cfg_if! {
                if #[cfg(not(target_arch = "wasm32"))] {
                    device
                        .poll(PollType::WaitForSubmissionIndex(index))
                        .map_err(|e| SpmvError::WgpuError(format!("Polling failed: {}", e)))?;
                } else {
                    let _ = (&device, index);
                }
            }

            match receiver.await {
                Ok(Ok(())) => {
                    {
                        let data = staging_buffer.slice(..).get_mapped_range();
                        out.clear();
                        out.extend_from_slice(bytemuck::cast_slice(&data[..size_bytes as usize]));
                    }
                    staging_buffer.unmap();
                    pool.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(staging_buffer);
                    Ok(out)
                }
                Ok(Err(e)) => Err(SpmvError::WgpuError(format!("Buffer mapping failed: {}", e))),
                Err(_) => Err(SpmvError::Internal(
                    "Channel receive error during buffer mapping".to_string(),
                )),
            }
        })
    }

    /// Blocks until the submission `index` has completed.
    pub(crate) fn wait_for(&self, index: &wgpu::SubmissionIndex) -> Result<()> {
        self.device
            .poll(PollType::WaitForSubmissionIndex(index.clone()))
            .map(|_| ())
            .map_err(|e| SpmvError::WgpuError(format!("Polling failed: {}", e)))
    }

    /// Blocks until the queue is idle.
    pub(crate) fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(PollType::Wait)
            .map(|_| ())
            .map_err(|e| SpmvError::WgpuError(format!("Polling failed: {}", e)))
    }

    fn count_to_gpu(&self, byte_len: u64) {
        self.bytes_to_gpu.fetch_add(byte_len, Ordering::Relaxed);
        log::trace!(
            "bytes_to_gpu incremented by {}, now: {}",
            byte_len,
            self.bytes_to_gpu.load(Ordering::Relaxed)
        );
    }

    fn count_buffer(&self) {
        self.buffers_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns bytes to GPU, bytes from GPU and buffers created.
    pub(crate) fn get_transfer_stats(&self) -> (u64, u64, u64) {
        (
            self.bytes_to_gpu.load(Ordering::Relaxed),
            self.bytes_from_gpu.load(Ordering::Relaxed),
            self.buffers_created.load(Ordering::Relaxed),
        )
    }
}
