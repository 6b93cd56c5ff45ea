//! Accelerator backend on top of WGPU.
//!
//! The device and queue are acquired once per process (via `lazy_static`) and
//! shared by every session. A [`GpuExecutor`] turns a [`FusedKernel`] into a
//! compute pipeline, uploads the kernel's parameters, dispatches it and reads
//! the result back into a host [`Buffer`] of the node's element type.
//!
//! Pipelines are cached by the kernel's structural key, so repeating the same
//! expression over different data skips shader compilation entirely.
//!
//! Device and shader failures surface as [`GraphError::Backend`] carrying the
//! kernel's label, so a failing dispatch can be matched to its expression.
//!
//! Kernels compute in 32 bits: `Float64` inputs are narrowed to `f32` and
//! `Int64` inputs to `i32` before upload, and widened again on readback.

use crate::error::{GraphError, Result};
use crate::fusion::cache::KernelCache;
use crate::fusion::FusedKernel;
use crate::fusion::expr::Ty;
use crate::graph::Graph;
use crate::tensors::{Buffer, DType};
use briny::prelude::Validate;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// The adapter, device and queue shared by every session.
struct Device {
    device: wgpu::Device,
    queue: wgpu::Queue,
    name: String,
}

/// Acquires the default adapter's device, blocking on the async calls.
fn acquire() -> std::result::Result<Device, String> {
    let instance = wgpu::Instance::default();
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
        .map_err(|e| format!("no adapter: {e}"))?;
    let name = adapter.get_info().name;
    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("briny_graph"),
        required_features: wgpu::Features::empty(),
        required_limits: wgpu::Limits::default(),
        memory_hints: wgpu::MemoryHints::Performance,
        trace: wgpu::Trace::default(),
    }))
    .map_err(|e| format!("{name}: no device: {e}"))?;
    Ok(Device { device, queue, name })
}

lazy_static::lazy_static! {
    static ref DEVICE: Option<Device> = match acquire() {
        Ok(device) => {
            log::info!("fused kernels run on {}", device.name);
            Some(device)
        }
        Err(err) => {
            log::warn!("no usable GPU, {err}");
            None
        }
    };
}

/// A backend failure tagged with the kernel it happened in.
fn failed(kernel: &FusedKernel, what: impl std::fmt::Display) -> GraphError {
    GraphError::Backend(format!("kernel {} ({} elements): {what}", kernel.label(), kernel.len))
}

/// Rejects kernels the device cannot bind before anything is compiled.
fn check_limits(kernel: &FusedKernel, limits: &wgpu::Limits) -> Result<()> {
    kernel.validate().map_err(|_| failed(kernel, "generated source does not match its bindings"))?;
    if kernel.bindings() > limits.max_storage_buffers_per_shader_stage as usize {
        return Err(failed(
            kernel,
            format!(
                "binds {} storage buffers, the device allows {}",
                kernel.bindings(),
                limits.max_storage_buffers_per_shader_stage
            ),
        ));
    }
    let bytes = kernel.len.max(1) as u64 * 4;
    if bytes > u64::from(limits.max_storage_buffer_binding_size) {
        return Err(failed(kernel, format!("result of {bytes} bytes exceeds the binding size limit")));
    }
    Ok(())
}

/// A compiled kernel and the layout its bind groups follow.
struct Pipeline {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

/// Runs fused kernels on the shared device.
pub struct GpuExecutor {
    context: &'static Device,
    pipelines: KernelCache<Arc<Pipeline>>,
}

impl GpuExecutor {
    /// `None` when no adapter or device could be acquired.
    pub fn new() -> Option<Self> {
        DEVICE.as_ref().map(|context| Self {
            context,
            pipelines: KernelCache::new(),
        })
    }

    /// Number of distinct pipelines compiled so far.
    pub fn pipelines(&self) -> usize {
        self.pipelines.len()
    }

    /// Compiles `kernel` on a cache miss.
    ///
    /// Shader and pipeline creation run inside a validation error scope, so a
    /// WGSL error surfaces as a [`GraphError::Backend`] naming the kernel.
    fn pipeline(&mut self, kernel: &FusedKernel) -> Result<Arc<Pipeline>> {
        let context = self.context;
        let device = &context.device;
        self.pipelines.get_or_try_insert_with(&kernel.key, || {
            check_limits(kernel, &device.limits())?;
            device.push_error_scope(wgpu::ErrorFilter::Validation);
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("fused"),
                source: wgpu::ShaderSource::Wgsl(kernel.source().into()),
            });
            let count = kernel.bindings();
            let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..count)
                .map(|k| wgpu::BindGroupLayoutEntry {
                    binding: k as u32,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage {
                            read_only: k + 1 < count,
                        },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                })
                .collect();
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("fused_bgl"),
                entries: &entries,
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("fused_pl"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("fused"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                cache: None,
                compilation_options: Default::default(),
            });
            if let Some(err) = pollster::block_on(device.pop_error_scope()) {
                return Err(failed(kernel, err));
            }
            log::debug!("compiled kernel {} with {count} bindings", kernel.label());
            Ok(Arc::new(Pipeline { layout, pipeline }))
        })
    }

    /// Dispatches `kernel` and returns its output as a buffer of `dtype`.
    ///
    /// Every parameter node must already hold a result.
    pub fn run(&mut self, kernel: &FusedKernel, graph: &Graph, dtype: DType) -> Result<Buffer> {
        let pipeline = self.pipeline(kernel)?;
        let context = self.context;
        let (device, queue) = (&context.device, &context.queue);

        let dims: Vec<u8> = kernel.dims.iter().flat_map(|d| d.to_ne_bytes()).collect();
        let mut inputs = vec![device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("dims"),
            contents: &dims,
            usage: wgpu::BufferUsages::STORAGE,
        })];
        for (&p, &ty) in kernel.params.iter().zip(&kernel.param_types) {
            let data = graph
                .result(p)?
                .ok_or_else(|| failed(kernel, format!("parameter {p:?} is not materialized")))?;
            inputs.push(device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("param"),
                contents: &encode(data, ty),
                usage: wgpu::BufferUsages::STORAGE,
            }));
        }

        let size = (kernel.len.max(1) * 4) as u64;
        let output = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("result"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let entries: Vec<wgpu::BindGroupEntry> = inputs
            .iter()
            .chain(std::iter::once(&output))
            .enumerate()
            .map(|(k, buffer)| wgpu::BindGroupEntry {
                binding: k as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("fused_bg"),
            layout: &pipeline.layout,
            entries: &entries,
        });

        let (x, y) = kernel.workgroups();
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("fused_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("fused_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        encoder.copy_buffer_to_buffer(&output, 0, &staging, 0, size);
        queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |mapped| {
            let _ = tx.send(mapped);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| failed(kernel, format!("device poll: {e}")))?;
        rx.recv()
            .map_err(|_| failed(kernel, "readback callback dropped"))?
            .map_err(|e| failed(kernel, format!("readback: {e}")))?;

        let buffer = {
            let bytes = slice.get_mapped_range();
            decode(&bytes[..kernel.len * 4], kernel.out_ty)
        };
        staging.unmap();
        log::debug!("dispatched kernel {} in ({x}, {y}) workgroups", kernel.label());
        Ok(buffer.cast(dtype).into_owned())
    }
}

/// Host data narrowed to the kernel's 32-bit parameter type.
fn encode(data: &Buffer, ty: Ty) -> Vec<u8> {
    let target = if ty == Ty::F32 { DType::Float32 } else { DType::Int32 };
    match &*data.cast(target) {
        Buffer::Float32(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
        Buffer::Int32(v) => v.iter().flat_map(|x| x.to_ne_bytes()).collect(),
        Buffer::Int64(_) | Buffer::Float64(_) => Vec::new(),
    }
}

fn decode(bytes: &[u8], ty: Ty) -> Buffer {
    let words = bytes.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]);
    match ty {
        Ty::F32 => Buffer::Float32(words.map(f32::from_ne_bytes).collect()),
        _ => Buffer::Int32(words.map(i32::from_ne_bytes).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel(len: usize, params: usize) -> FusedKernel {
        let mut source = String::from("fn main() {}\n");
        for k in 0..params + 2 {
            source.push_str(&format!("@group(0) @binding({k})\n"));
        }
        FusedKernel {
            key: format!("test{len}"),
            params: (0..params as u64).map(crate::graph::NodeId).collect(),
            param_types: vec![Ty::F32; params],
            dims: vec![len as u32],
            len,
            out_ty: Ty::F32,
            source: source.into(),
        }
    }

    #[test]
    fn test_limits_reject_oversized_kernels() {
        let limits = wgpu::Limits::default();
        assert!(check_limits(&kernel(16, 2), &limits).is_ok());

        let wide = kernel(16, limits.max_storage_buffers_per_shader_stage as usize);
        let err = check_limits(&wide, &limits).unwrap_err().to_string();
        assert!(err.contains(&wide.label()), "{err}");
        assert!(err.contains("storage buffers"), "{err}");

        let long = kernel(limits.max_storage_buffer_binding_size as usize, 1);
        assert!(matches!(check_limits(&long, &limits), Err(GraphError::Backend(_))));
    }

    #[test]
    fn test_mismatched_source_is_a_backend_error() {
        let mut k = kernel(8, 1);
        k.param_types.clear();
        assert!(matches!(check_limits(&k, &wgpu::Limits::default()), Err(GraphError::Backend(_))));
    }

    #[test]
    fn test_encode_narrows_to_kernel_type() {
        let bytes = encode(&Buffer::Int64(vec![1, -2]), Ty::I32);
        assert_eq!(decode(&bytes, Ty::I32), Buffer::Int32(vec![1, -2]));
        let bytes = encode(&Buffer::Float64(vec![0.5]), Ty::F32);
        assert_eq!(decode(&bytes, Ty::F32), Buffer::Float32(vec![0.5]));
    }
}
