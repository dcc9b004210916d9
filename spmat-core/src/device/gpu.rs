use super::{ContextId, Device, DeviceClass, DeviceInfo, ReadFuture, Stream, TransferStats};
use crate::config::GpuDeviceConfig;
use crate::context::GpuContext;
use crate::error::{Result, SpmvError};
use crate::kernel_cache::KernelCacheEntry;
use crate::kernels::wgsl::{self, Binding};
use crate::kernels::{KernelArgs, KernelVariant};
use crate::traits::{Element, Real};
use bytemuck::{Pod, Zeroable};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct KernelParams {
    n: u32,
    width: u32,
    _padding: [u32; 2],
}

/// A typed storage buffer on a wgpu device.
#[derive(Debug)]
pub struct GpuBuffer<E> {
    buffer: Arc<wgpu::Buffer>,
    len: usize,
    _marker: PhantomData<fn() -> E>,
}

impl<E> Clone for GpuBuffer<E> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<E> GpuBuffer<E> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_entire_binding(&self) -> wgpu::BindingResource<'_> {
        self.buffer.as_entire_binding()
    }
}

/// A compiled compute pipeline and the layout its bind groups follow.
#[derive(Debug)]
pub struct GpuKernel {
    pub variant: KernelVariant,
    pub type_name: &'static str,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// A wgpu adapter used as a compute device.
///
/// Both streams submit to the adapter's single queue, which executes in
/// submission order, so explicit dependencies are already satisfied.
#[derive(Debug)]
pub struct GpuDevice {
    pub(crate) context: Arc<GpuContext>,
    info: DeviceInfo,
    launch: Mutex<LaunchBuffers>,
}

/// Launch parameters shared by every kernel of a device.
///
/// Rewritten with `queue.write_buffer` before each launch and held locked
/// until the launch is submitted; staged writes land at the start of the
/// next submission, so each launch sees its own values.
#[derive(Debug)]
struct LaunchBuffers {
    params: wgpu::Buffer,
    scalars: wgpu::Buffer,
}

const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

impl GpuDevice {
    /// Opens the best adapter with the default configuration.
    pub async fn new() -> Result<Self> {
        Self::with_config(&GpuDeviceConfig::default()).await
    }

    pub async fn with_config(config: &GpuDeviceConfig) -> Result<Self> {
        let context = GpuContext::new(config).await?;
        Ok(Self::from_context(context, config))
    }

    /// Opens every available adapter.
    pub async fn enumerate(config: &GpuDeviceConfig) -> Result<Vec<Self>> {
        let contexts = GpuContext::enumerate(config).await?;
        Ok(contexts
            .into_iter()
            .map(|context| Self::from_context(context, config))
            .collect())
    }

    #[cfg(feature = "native")]
    pub fn new_blocking(config: &GpuDeviceConfig) -> Result<Self> {
        pollster::block_on(Self::with_config(config))
    }

    fn from_context(context: GpuContext, config: &GpuDeviceConfig) -> Self {
        let class = match context.adapter_info.device_type {
            wgpu::DeviceType::Cpu => DeviceClass::Cpu,
            _ => DeviceClass::Gpu,
        };
        let info = DeviceInfo {
            name: context.adapter_info.name.clone(),
            class,
            context: ContextId::next(),
            compute_units: config.compute_units.max(1),
        };
        log::info!("GpuDevice '{}' created as {:?}", info.name, info.class);
        let launch = LaunchBuffers {
            params: context.create_empty_buffer(
                "kernel params",
                std::mem::size_of::<KernelParams>() as u64,
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            ),
            // Room for one f64.
            scalars: context.create_empty_buffer(
                "kernel scalars",
                8,
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            ),
        };
        Self {
            context: Arc::new(context),
            info,
            launch: Mutex::new(launch),
        }
    }

    fn buffer_size<E>(len: usize) -> u64 {
        let bytes = (len.max(1) * std::mem::size_of::<E>()) as u64;
        bytes.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
    }

    fn dispatch_size(&self, variant: KernelVariant, n: usize) -> u32 {
        let units = self.info.compute_units as u32;
        match variant {
            KernelVariant::Gather | KernelVariant::Fill => {
                let groups = (n as u32).div_ceil(self.context.workgroup_size);
                groups.clamp(1, units)
            }
            _ => units,
        }
    }
}

fn layout_entry(binding: u32, kind: Binding) -> wgpu::BindGroupLayoutEntry {
    let ty = match kind {
        Binding::Uniform => wgpu::BufferBindingType::Uniform,
        Binding::Read => wgpu::BufferBindingType::Storage { read_only: true },
        Binding::ReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
    };
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn check_distinct<E>(input: &GpuBuffer<E>, output: &GpuBuffer<E>) -> Result<()> {
    if Arc::ptr_eq(&input.buffer, &output.buffer) {
        return Err(SpmvError::UnsupportedOperation(
            "input and output refer to the same buffer".to_string(),
        ));
    }
    Ok(())
}

impl Device for GpuDevice {
    type Buffer<E: Element> = GpuBuffer<E>;
    type Event = wgpu::SubmissionIndex;
    type Kernel = GpuKernel;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer<E: Element>(&self, label: &str, len: usize) -> Result<GpuBuffer<E>> {
        let buffer = self
            .context
            .create_empty_buffer(label, Self::buffer_size::<E>(len), STORAGE_USAGE);
        Ok(GpuBuffer {
            buffer: Arc::new(buffer),
            len,
            _marker: PhantomData,
        })
    }

    fn create_buffer_init<E: Element>(&self, label: &str, data: &[E]) -> Result<GpuBuffer<E>> {
        if data.is_empty() {
            return self.create_buffer(label, 0);
        }
        let buffer = self.context.create_gpu_buffer_with_data(
            label,
            bytemuck::cast_slice(data),
            STORAGE_USAGE,
        );
        Ok(GpuBuffer {
            buffer: Arc::new(buffer),
            len: data.len(),
            _marker: PhantomData,
        })
    }

    fn buffer_len<E: Element>(buffer: &GpuBuffer<E>) -> usize {
        buffer.len
    }

    fn same_buffer<E: Element>(a: &GpuBuffer<E>, b: &GpuBuffer<E>) -> bool {
        Arc::ptr_eq(&a.buffer, &b.buffer)
    }

    fn enqueue_write<E: Element>(
        &self,
        _stream: Stream,
        buffer: &GpuBuffer<E>,
        data: &[E],
        _wait: &[wgpu::SubmissionIndex],
    ) -> Result<wgpu::SubmissionIndex> {
        if data.len() > buffer.len {
            return Err(SpmvError::InvalidDimensions(format!(
                "writing {} elements into a buffer of {}",
                data.len(),
                buffer.len
            )));
        }
        self.context.write_buffer(&buffer.buffer, data)
    }

    fn enqueue_read_into<E: Element>(
        &self,
        _stream: Stream,
        buffer: &GpuBuffer<E>,
        out: Vec<E>,
        _wait: &[wgpu::SubmissionIndex],
    ) -> ReadFuture<E> {
        match self.context.read_buffer_to_cpu::<E>(&buffer.buffer, buffer.len, out) {
            Ok(read) => Box::pin(read),
            Err(e) => Box::pin(futures::future::ready(Err(e))),
        }
    }

    fn compile_kernel<T: Real>(&self, variant: KernelVariant) -> Result<KernelCacheEntry<GpuKernel>> {
        if T::TYPE_NAME == "f64" && !self.context.supports_f64() {
            return Err(SpmvError::UnsupportedOperation(format!(
                "'{}' does not support f64 shaders",
                self.info.name
            )));
        }

        let device = &self.context.device;
        let workgroup_size = self.context.workgroup_size;
        let source = wgsl::source(variant, T::TYPE_NAME, workgroup_size);

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(variant.name()),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let entries: Vec<_> = wgsl::bindings(variant)
            .iter()
            .enumerate()
            .map(|(i, &kind)| layout_entry(i as u32, kind))
            .collect();
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(variant.name()),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(variant.name()),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(variant.name()),
            layout: Some(&pipeline_layout),
            module: &shader_module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        if let Some(error) = futures::executor::block_on(device.pop_error_scope()) {
            return Err(SpmvError::ShaderError(format!(
                "{} for {}: {}",
                variant.name(),
                T::TYPE_NAME,
                error
            )));
        }

        Ok(KernelCacheEntry {
            kernel: GpuKernel {
                variant,
                type_name: T::TYPE_NAME,
                pipeline,
                layout,
            },
            group_size: workgroup_size as usize,
        })
    }

    fn enqueue_kernel<T: Real>(
        &self,
        _stream: Stream,
        kernel: &KernelCacheEntry<GpuKernel>,
        args: KernelArgs<'_, T, Self>,
        _wait: &[wgpu::SubmissionIndex],
    ) -> Result<wgpu::SubmissionIndex> {
        let variant = kernel.kernel.variant;
        if !args.accepts(variant) || kernel.kernel.type_name != T::TYPE_NAME {
            return Err(SpmvError::KernelMismatch {
                kernel: variant.name(),
                args: args.kind(),
            });
        }

        let (n, width, scalar, bound): (usize, usize, Option<T>, Vec<&wgpu::Buffer>) = match args {
            KernelArgs::Csr {
                rows,
                matrix,
                x,
                y,
                alpha,
            } => {
                check_distinct(x, y)?;
                let bound = vec![
                    &*matrix.row.buffer,
                    &*matrix.col.buffer,
                    &*matrix.val.buffer,
                    &*x.buffer,
                    &*y.buffer,
                ];
                (rows, 0, Some(alpha), bound)
            }
            KernelArgs::Hell {
                rows,
                matrix,
                x,
                y,
                alpha,
            } => {
                check_distinct(x, y)?;
                let bound = vec![
                    &*matrix.ell_col.buffer,
                    &*matrix.ell_val.buffer,
                    &*matrix.csr.row.buffer,
                    &*matrix.csr.col.buffer,
                    &*matrix.csr.val.buffer,
                    &*x.buffer,
                    &*y.buffer,
                ];
                (rows, matrix.width, Some(alpha), bound)
            }
            KernelArgs::Gather {
                len,
                vals,
                cols,
                out,
            } => {
                check_distinct(vals, out)?;
                (len, 0, None, vec![&*vals.buffer, &*cols.buffer, &*out.buffer])
            }
            KernelArgs::Fill { len, y, value } => (len, 0, Some(value), vec![&*y.buffer]),
        };

        let context = &self.context;
        let params = KernelParams {
            n: n as u32,
            width: width as u32,
            _padding: [0; 2],
        };
        let launch = self.launch.lock().unwrap_or_else(PoisonError::into_inner);
        context
            .queue
            .write_buffer(&launch.params, 0, bytemuck::bytes_of(&params));
        if let Some(s) = scalar {
            context
                .queue
                .write_buffer(&launch.scalars, 0, bytemuck::bytes_of(&s));
        }

        let entries: Vec<wgpu::BindGroupEntry> = std::iter::once(&launch.params)
            .chain(bound)
            .chain(scalar.map(|_| &launch.scalars))
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = context.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(variant.name()),
            layout: &kernel.kernel.layout,
            entries: &entries,
        });

        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(variant.name()),
            });
        if n > 0 {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(variant.name()),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&kernel.kernel.pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(self.dispatch_size(variant, n), 1, 1);
        }
        log::trace!("{}: {} over {} rows", self.info.name, variant.name(), n);
        Ok(context.queue.submit(Some(encoder.finish())))
    }

    fn wait(&self, event: &wgpu::SubmissionIndex) -> Result<()> {
        self.context.wait_for(event)
    }

    fn finish(&self) -> Result<()> {
        self.context.wait_idle()
    }

    fn transfer_stats(&self) -> TransferStats {
        let (bytes_to_device, bytes_from_device, buffers_created) =
            self.context.get_transfer_stats();
        TransferStats {
            bytes_to_device,
            bytes_from_device,
            buffers_created,
        }
    }
}
