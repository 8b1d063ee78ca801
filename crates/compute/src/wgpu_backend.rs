//! GPU implementation of [`ComputeBackend`] built on [`wgpu`].
//!
//! Bind group and pipeline layouts are built explicitly from the reflected
//! [`ShaderLayout`] rather than inferred by wgpu, so the layout the marshaller
//! validated against is exactly the layout the device sees. Every blocking
//! wait goes through `pollster` and `Maintain::Wait`.

use crate::backend::{
    BufferRequest, ComputeBackend, DeviceInfo, DeviceRequest, DeviceType, DispatchCommand,
};
use crate::layout::{Access, BindingKind, ShaderLayout};
use crate::{Backend, ComputeError, DeviceLimits, MemoryHint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct WgpuBackend {
    instance: wgpu::Instance,
}

impl Default for WgpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WgpuBackend {
    /// Instance over every backend compiled into wgpu, narrowed by
    /// `WGPU_BACKEND` when set.
    #[must_use]
    pub fn new() -> Self {
        let backends = wgpu::util::backend_bits_from_env().unwrap_or_else(wgpu::Backends::all);
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        Self { instance }
    }
}

pub struct WgpuDevice {
    device: wgpu::Device,
    lost: Arc<AtomicBool>,
}

impl WgpuDevice {
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<(), ComputeError> {
        if self.is_lost() {
            return Err(ComputeError::DeviceLost("wgpu device reported loss".into()));
        }
        Ok(())
    }
}

pub struct WgpuPipeline {
    pipeline: wgpu::ComputePipeline,
    /// One layout per group index from 0 to the highest declared group;
    /// gaps hold empty layouts.
    group_layouts: Vec<wgpu::BindGroupLayout>,
}

pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    len: u64,
}

fn backend_bits(backend: Backend) -> wgpu::Backends {
    match backend {
        Backend::All | Backend::Default => wgpu::Backends::all(),
        Backend::Vulkan => wgpu::Backends::VULKAN,
        Backend::OpenGl => wgpu::Backends::GL,
        Backend::Metal => wgpu::Backends::METAL,
        Backend::Dx12 => wgpu::Backends::DX12,
        Backend::WebGpu => wgpu::Backends::BROWSER_WEBGPU,
        Backend::HighestSupport => wgpu::Backends::PRIMARY,
        Backend::LowestSupport => wgpu::Backends::SECONDARY,
    }
}

fn backend_tag(backend: wgpu::Backend) -> Option<Backend> {
    match backend {
        wgpu::Backend::Vulkan => Some(Backend::Vulkan),
        wgpu::Backend::Metal => Some(Backend::Metal),
        wgpu::Backend::Dx12 => Some(Backend::Dx12),
        wgpu::Backend::Gl => Some(Backend::OpenGl),
        wgpu::Backend::BrowserWebGpu => Some(Backend::WebGpu),
        wgpu::Backend::Empty => None,
    }
}

impl From<wgpu::DeviceType> for DeviceType {
    fn from(ty: wgpu::DeviceType) -> Self {
        match ty {
            wgpu::DeviceType::Other => DeviceType::Other,
            wgpu::DeviceType::IntegratedGpu => DeviceType::IntegratedGpu,
            wgpu::DeviceType::DiscreteGpu => DeviceType::DiscreteGpu,
            wgpu::DeviceType::VirtualGpu => DeviceType::VirtualGpu,
            wgpu::DeviceType::Cpu => DeviceType::Cpu,
        }
    }
}

impl From<&wgpu::Limits> for DeviceLimits {
    fn from(limits: &wgpu::Limits) -> Self {
        Self {
            max_bind_groups: limits.max_bind_groups,
            max_bindings_per_bind_group: limits.max_bindings_per_bind_group,
            max_storage_buffers_per_shader_stage: limits.max_storage_buffers_per_shader_stage,
            max_uniform_buffers_per_shader_stage: limits.max_uniform_buffers_per_shader_stage,
            max_uniform_buffer_binding_size: limits.max_uniform_buffer_binding_size,
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
            max_buffer_size: limits.max_buffer_size,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            max_compute_workgroup_storage_size: limits.max_compute_workgroup_storage_size,
            max_compute_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
            max_compute_workgroup_size_x: limits.max_compute_workgroup_size_x,
            max_compute_workgroup_size_y: limits.max_compute_workgroup_size_y,
            max_compute_workgroup_size_z: limits.max_compute_workgroup_size_z,
            max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_push_constant_size: limits.max_push_constant_size,
        }
    }
}

/// Compute limits from `limits`; everything else at the WebGL2 floor so the
/// request never asks for graphics capability it does not use.
fn to_wgpu_limits(limits: &DeviceLimits) -> wgpu::Limits {
    wgpu::Limits {
        max_bind_groups: limits.max_bind_groups,
        max_bindings_per_bind_group: limits.max_bindings_per_bind_group,
        max_storage_buffers_per_shader_stage: limits.max_storage_buffers_per_shader_stage,
        max_uniform_buffers_per_shader_stage: limits.max_uniform_buffers_per_shader_stage,
        max_uniform_buffer_binding_size: limits.max_uniform_buffer_binding_size,
        max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
        max_buffer_size: limits.max_buffer_size,
        min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
        min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
        max_compute_workgroup_storage_size: limits.max_compute_workgroup_storage_size,
        max_compute_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
        max_compute_workgroup_size_x: limits.max_compute_workgroup_size_x,
        max_compute_workgroup_size_y: limits.max_compute_workgroup_size_y,
        max_compute_workgroup_size_z: limits.max_compute_workgroup_size_z,
        max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
        max_push_constant_size: limits.max_push_constant_size,
        ..wgpu::Limits::downlevel_webgl2_defaults()
    }
}

fn memory_hints(hint: &MemoryHint) -> wgpu::MemoryHints {
    match hint {
        MemoryHint::Performance => wgpu::MemoryHints::Performance,
        MemoryHint::MemoryUsage => wgpu::MemoryHints::MemoryUsage,
        MemoryHint::Manual(range) => wgpu::MemoryHints::Manual {
            suballocated_device_memory_block_size: range.clone(),
        },
    }
}

/// Rounds `len` up to the copy alignment, never below one word.
fn padded_size(len: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    len.max(1).div_ceil(align) * align
}

fn layout_entries(layout: &ShaderLayout, group: u32) -> Vec<wgpu::BindGroupLayoutEntry> {
    layout
        .bindings()
        .iter()
        .filter(|(slot, _)| slot.group == group)
        .map(|(slot, decl)| wgpu::BindGroupLayoutEntry {
            binding: slot.binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: match decl.kind {
                    BindingKind::Uniform => wgpu::BufferBindingType::Uniform,
                    BindingKind::Storage => wgpu::BufferBindingType::Storage {
                        read_only: decl.access == Access::Read,
                    },
                },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect()
}

/// Maps the validation and out-of-memory scopes of one submission. Running
/// out of memory leaves the device usable, so it is not reported as loss.
fn submission_error(
    validation: Option<wgpu::Error>,
    out_of_memory: Option<wgpu::Error>,
) -> Result<(), ComputeError> {
    if let Some(err) = validation {
        return Err(ComputeError::BindingMismatch(err.to_string()));
    }
    if let Some(err) = out_of_memory {
        return Err(ComputeError::InvalidArgument(format!("device out of memory: {err}")));
    }
    Ok(())
}

impl ComputeBackend for WgpuBackend {
    type Adapter = wgpu::Adapter;
    type Device = WgpuDevice;
    type Queue = wgpu::Queue;
    type Pipeline = WgpuPipeline;
    type Buffer = WgpuBuffer;

    fn enumerate_adapters(&self, backend: Backend) -> Vec<wgpu::Adapter> {
        self.instance
            .enumerate_adapters(backend_bits(backend))
            .into_iter()
            .filter(|adapter| backend_tag(adapter.get_info().backend).is_some())
            .collect()
    }

    fn adapter_info(&self, adapter: &wgpu::Adapter) -> DeviceInfo {
        let info = adapter.get_info();
        DeviceInfo {
            name: info.name,
            vendor: info.vendor,
            device: info.device,
            device_type: info.device_type.into(),
            driver: info.driver,
            driver_info: info.driver_info,
            backend: backend_tag(info.backend).unwrap_or_default(),
        }
    }

    fn adapter_limits(&self, adapter: &wgpu::Adapter) -> DeviceLimits {
        DeviceLimits::from(&adapter.limits())
    }

    fn create_device(
        &self,
        adapter: &wgpu::Adapter,
        request: &DeviceRequest,
    ) -> Result<(WgpuDevice, wgpu::Queue), ComputeError> {
        let descriptor = wgpu::DeviceDescriptor {
            label: Some(&request.label),
            required_features: wgpu::Features::empty(),
            required_limits: to_wgpu_limits(&request.limits),
            memory_hints: memory_hints(&request.memory),
        };
        let (device, queue) = pollster::block_on(adapter.request_device(&descriptor, None))
            .map_err(|e| ComputeError::DeviceSelection(format!("request_device failed: {e}")))?;

        // The wgpu default handler panics.
        device.on_uncaptured_error(Box::new(|err| {
            tracing::error!("uncaptured wgpu error: {err}");
        }));

        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            flag.store(true, Ordering::SeqCst);
            tracing::warn!(?reason, "wgpu device lost: {message}");
        });

        Ok((WgpuDevice { device, lost }, queue))
    }

    fn compile_pipeline(
        &self,
        device: &WgpuDevice,
        source: &str,
        layout: &ShaderLayout,
    ) -> Result<WgpuPipeline, ComputeError> {
        device.check_alive()?;
        let gpu = &device.device;
        let label = layout.entry_point();

        gpu.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = gpu.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let group_count = layout.groups().last().map_or(0, |&max| max + 1);
        let group_layouts: Vec<wgpu::BindGroupLayout> = (0..group_count)
            .map(|group| {
                gpu.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(label),
                    entries: &layout_entries(layout, group),
                })
            })
            .collect();
        let layout_refs: Vec<&wgpu::BindGroupLayout> = group_layouts.iter().collect();
        let pipeline_layout = gpu.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &layout_refs,
            push_constant_ranges: &[],
        });

        let pipeline = gpu.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: label,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        if let Some(err) = pollster::block_on(gpu.pop_error_scope()) {
            return Err(ComputeError::Compilation(err.to_string()));
        }
        Ok(WgpuPipeline { pipeline, group_layouts })
    }

    fn create_buffer(
        &self,
        device: &WgpuDevice,
        request: &BufferRequest<'_>,
    ) -> Result<WgpuBuffer, ComputeError> {
        device.check_alive()?;
        let usage = match request.kind {
            BindingKind::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            BindingKind::Storage => {
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC
            }
        };
        let label = request.slot.to_string();
        let buffer = device.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&label),
            size: padded_size(request.len),
            usage,
            mapped_at_creation: request.contents.is_some(),
        });
        if let Some(contents) = request.contents {
            buffer.slice(..).get_mapped_range_mut()[..contents.len()].copy_from_slice(contents);
            buffer.unmap();
        }
        Ok(WgpuBuffer { buffer, len: request.len })
    }

    fn submit_and_wait(
        &self,
        device: &WgpuDevice,
        queue: &wgpu::Queue,
        command: &DispatchCommand<'_, Self>,
    ) -> Result<Vec<Vec<u8>>, ComputeError> {
        device.check_alive()?;
        let gpu = &device.device;
        let pipeline = command.pipeline;

        gpu.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        gpu.push_error_scope(wgpu::ErrorFilter::Validation);

        let bind_groups: Vec<wgpu::BindGroup> = pipeline
            .group_layouts
            .iter()
            .zip(0u32..)
            .map(|(group_layout, index)| {
                let entries: Vec<wgpu::BindGroupEntry<'_>> = command
                    .groups
                    .iter()
                    .filter(|group| group.group == index)
                    .flat_map(|group| group.bindings.iter())
                    .map(|binding| wgpu::BindGroupEntry {
                        binding: binding.slot.binding,
                        resource: binding.buffer.buffer.as_entire_binding(),
                    })
                    .collect();
                gpu.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: None,
                    layout: group_layout,
                    entries: &entries,
                })
            })
            .collect();

        let mut encoder = gpu.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            for (index, bind_group) in (0u32..).zip(&bind_groups) {
                pass.set_bind_group(index, bind_group, &[]);
            }
            let [x, y, z] = command.workgroups;
            pass.dispatch_workgroups(x, y, z);
        }

        let staging: Vec<(wgpu::Buffer, u64)> = command
            .read_back()
            .map(|binding| {
                let source = &binding.buffer;
                let size = source.buffer.size();
                let staging = gpu.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("staging"),
                    size,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, size);
                (staging, source.len)
            })
            .collect();

        queue.submit(Some(encoder.finish()));

        let validation = pollster::block_on(gpu.pop_error_scope());
        let out_of_memory = pollster::block_on(gpu.pop_error_scope());
        submission_error(validation, out_of_memory)?;

        let (tx, rx) = std::sync::mpsc::channel();
        for (index, (buffer, _)) in staging.iter().enumerate() {
            let tx = tx.clone();
            buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                // The receiver outlives the poll below.
                let _ = tx.send((index, result));
            });
        }
        drop(tx);
        gpu.poll(wgpu::Maintain::Wait);
        device.check_alive()?;

        let mut mapped = 0;
        for (index, result) in rx.try_iter() {
            result.map_err(|e| ComputeError::DeviceLost(format!("read-back of buffer {index} failed: {e}")))?;
            mapped += 1;
        }
        if mapped != staging.len() {
            return Err(ComputeError::DeviceLost("queue stopped before read-back completed".into()));
        }

        let results = staging
            .iter()
            .map(|(buffer, len)| {
                let bytes = {
                    let view = buffer.slice(..).get_mapped_range();
                    let end = usize::try_from(*len).unwrap_or(view.len()).min(view.len());
                    view[..end].to_vec()
                };
                buffer.unmap();
                bytes
            })
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_limits_match_wgpu() {
        assert_eq!(DeviceLimits::from(&wgpu::Limits::default()), DeviceLimits::default());
        assert_eq!(DeviceLimits::from(&wgpu::Limits::downlevel_defaults()), DeviceLimits::downlevel());
    }

    #[test]
    fn requested_limits_survive_conversion() {
        let limits = DeviceLimits { max_bind_groups: 2, ..DeviceLimits::downlevel() };
        assert_eq!(DeviceLimits::from(&to_wgpu_limits(&limits)), limits);
    }

    #[test]
    fn selectors_map_to_backend_bits() {
        assert_eq!(backend_bits(Backend::LowestSupport), wgpu::Backends::GL);
        assert!(backend_bits(Backend::HighestSupport).contains(wgpu::Backends::VULKAN));
        assert!(!backend_bits(Backend::HighestSupport).contains(wgpu::Backends::GL));
        for backend in Backend::CONCRETE {
            let bits = backend_bits(backend);
            assert_eq!(bits.bits().count_ones(), 1, "{backend}");
        }
    }

    #[test]
    fn out_of_memory_is_retryable() {
        let oom = wgpu::Error::OutOfMemory { source: Box::new(std::io::Error::other("heap exhausted")) };
        let err = submission_error(None, Some(oom)).unwrap_err();
        assert!(matches!(err, ComputeError::InvalidArgument(ref msg) if msg.contains("out of memory")));
        assert!(err.is_retryable());
        assert_eq!(submission_error(None, None), Ok(()));
    }

    #[test]
    fn validation_error_is_a_binding_mismatch() {
        let invalid = wgpu::Error::Validation {
            source: Box::new(std::io::Error::other("bind group entry missing")),
            description: "bind group entry missing".into(),
        };
        assert!(matches!(submission_error(Some(invalid), None), Err(ComputeError::BindingMismatch(_))));
    }

    #[test]
    fn buffers_pad_to_copy_alignment() {
        assert_eq!(padded_size(0), 4);
        assert_eq!(padded_size(5), 8);
        assert_eq!(padded_size(240_000), 240_000);
    }

    #[test]
    fn manual_memory_hint_keeps_range() {
        let hint = memory_hints(&MemoryHint::Manual(16..1024));
        assert!(matches!(
            hint,
            wgpu::MemoryHints::Manual { suballocated_device_memory_block_size } if suballocated_device_memory_block_size == (16..1024)
        ));
    }
}
