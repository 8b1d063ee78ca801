//! CPU stand-in for a GPU backend.
//!
//! Kernel source is still reflected and validated by the caller, but
//! execution is delegated to host kernels bound by entry-point name. The
//! backend counts what it allocates so tests can observe that rejected calls
//! never reach the device.

use super::{BufferRequest, ComputeBackend, DeviceInfo, DeviceRequest, DeviceType, DispatchCommand};
use crate::layout::{BindingSlot, ShaderLayout};
use crate::{Backend, ComputeError, DeviceLimits};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub type HostKernel = Arc<dyn Fn(&mut CpuInvocation<'_>) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MockAdapter {
    pub info: DeviceInfo,
    pub limits: DeviceLimits,
}

impl MockAdapter {
    #[must_use]
    pub fn new(name: &str, device_type: DeviceType, backend: Backend) -> Self {
        Self {
            info: DeviceInfo {
                name: name.to_owned(),
                vendor: 0x1234,
                device: 0x5678,
                device_type,
                driver: "mock".to_owned(),
                driver_info: "host execution".to_owned(),
                backend,
            },
            limits: DeviceLimits::default(),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Debug, Default)]
pub struct MockStats {
    devices_created: AtomicUsize,
    devices_alive: AtomicUsize,
    buffers_created: AtomicUsize,
    submissions: AtomicUsize,
    overlapping_submissions: AtomicUsize,
    overlapping_device_work: AtomicUsize,
}

impl MockStats {
    pub fn devices_created(&self) -> usize {
        self.devices_created.load(Ordering::SeqCst)
    }

    pub fn devices_alive(&self) -> usize {
        self.devices_alive.load(Ordering::SeqCst)
    }

    pub fn buffers_created(&self) -> usize {
        self.buffers_created.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Submissions that started while another was still running on the
    /// same queue.
    pub fn overlapping_submissions(&self) -> usize {
        self.overlapping_submissions.load(Ordering::SeqCst)
    }

    /// Compilations or submissions that started while another one was still
    /// running on the same device.
    pub fn overlapping_device_work(&self) -> usize {
        self.overlapping_device_work.load(Ordering::SeqCst)
    }
}

pub struct MockCpu {
    adapters: Vec<MockAdapter>,
    kernels: HashMap<String, HostKernel>,
    stats: Arc<MockStats>,
    lose_next_op: AtomicBool,
}

impl Default for MockCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCpu {
    /// One discrete Vulkan adapter followed by one integrated OpenGL adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::with_adapters(vec![
            MockAdapter::new("Mock Discrete GPU", DeviceType::DiscreteGpu, Backend::Vulkan),
            MockAdapter::new("Mock Integrated GPU", DeviceType::IntegratedGpu, Backend::OpenGl)
                .with_limits(DeviceLimits::downlevel()),
        ])
    }

    #[must_use]
    pub fn with_adapters(adapters: Vec<MockAdapter>) -> Self {
        Self {
            adapters,
            kernels: HashMap::new(),
            stats: Arc::new(MockStats::default()),
            lose_next_op: AtomicBool::new(false),
        }
    }

    /// Binds a host kernel to every pipeline compiled for `entry_point`.
    #[must_use]
    pub fn with_kernel<F>(mut self, entry_point: &str, kernel: F) -> Self
    where
        F: Fn(&mut CpuInvocation<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.kernels.insert(entry_point.to_owned(), Arc::new(kernel));
        self
    }

    pub fn stats(&self) -> &MockStats {
        &self.stats
    }

    /// The next submission or compilation on any device reports loss and
    /// leaves that device permanently lost.
    pub fn trigger_device_loss(&self) {
        self.lose_next_op.store(true, Ordering::SeqCst);
    }

    fn check_device(&self, device: &MockDevice, during: &str) -> Result<(), ComputeError> {
        if device.is_lost() {
            return Err(ComputeError::DeviceLost(format!("device was lost before {during}")));
        }
        if self.lose_next_op.swap(false, Ordering::SeqCst) {
            device.lost.store(true, Ordering::SeqCst);
            return Err(ComputeError::DeviceLost(format!("device removed during {during}")));
        }
        Ok(())
    }
}

pub struct MockDevice {
    lost: AtomicBool,
    busy: AtomicUsize,
    stats: Arc<MockStats>,
}

impl MockDevice {
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn enter(&self) -> DeviceWork<'_> {
        if self.busy.fetch_add(1, Ordering::SeqCst) > 0 {
            self.stats.overlapping_device_work.fetch_add(1, Ordering::SeqCst);
        }
        DeviceWork(&self.busy)
    }
}

/// Marks the device busy until dropped.
struct DeviceWork<'a>(&'a AtomicUsize);

impl Drop for DeviceWork<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.stats.devices_alive.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockQueue {
    in_flight: AtomicUsize,
}

pub struct MockPipeline {
    entry_point: String,
    kernel: HostKernel,
    workgroup_size: [u32; 3],
}

#[derive(Debug, Clone)]
pub struct MockBuffer {
    words: Vec<u32>,
    len: usize,
}

impl MockBuffer {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }
}

/// Execution context handed to a host kernel: the dispatch grid and the
/// device-side copy of every bound buffer, stored as 4-byte words.
pub struct CpuInvocation<'a> {
    workgroups: [u32; 3],
    workgroup_size: [u32; 3],
    buffers: &'a mut BTreeMap<BindingSlot, MockBuffer>,
}

impl CpuInvocation<'_> {
    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    /// Total invocations along each axis.
    pub fn global_size(&self) -> [u64; 3] {
        [0, 1, 2].map(|axis| u64::from(self.workgroups[axis]) * u64::from(self.workgroup_size[axis]))
    }

    /// Byte length of the buffer bound at `(group, binding)`.
    pub fn len(&self, group: u32, binding: u32) -> Result<usize, String> {
        self.buffer(group, binding).map(|buffer| buffer.len)
    }

    pub fn words(&self, group: u32, binding: u32) -> Result<&[u32], String> {
        self.buffer(group, binding).map(|buffer| buffer.words.as_slice())
    }

    pub fn words_mut(&mut self, group: u32, binding: u32) -> Result<&mut [u32], String> {
        let slot = BindingSlot::new(group, binding);
        self.buffers
            .get_mut(&slot)
            .map(|buffer| buffer.words.as_mut_slice())
            .ok_or_else(|| format!("nothing bound at {slot}"))
    }

    fn buffer(&self, group: u32, binding: u32) -> Result<&MockBuffer, String> {
        let slot = BindingSlot::new(group, binding);
        self.buffers.get(&slot).ok_or_else(|| format!("nothing bound at {slot}"))
    }
}

impl ComputeBackend for MockCpu {
    type Adapter = MockAdapter;
    type Device = MockDevice;
    type Queue = MockQueue;
    type Pipeline = MockPipeline;
    type Buffer = MockBuffer;

    fn enumerate_adapters(&self, backend: Backend) -> Vec<MockAdapter> {
        self.adapters
            .iter()
            .filter(|adapter| backend.includes(adapter.info.backend))
            .cloned()
            .collect()
    }

    fn adapter_info(&self, adapter: &MockAdapter) -> DeviceInfo {
        adapter.info.clone()
    }

    fn adapter_limits(&self, adapter: &MockAdapter) -> DeviceLimits {
        adapter.limits
    }

    fn create_device(
        &self,
        adapter: &MockAdapter,
        request: &DeviceRequest,
    ) -> Result<(MockDevice, MockQueue), ComputeError> {
        request.limits.check_within(&adapter.limits)?;
        self.stats.devices_created.fetch_add(1, Ordering::SeqCst);
        self.stats.devices_alive.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("mock device `{}` created for {}", request.label, adapter.info.name);
        let device = MockDevice {
            lost: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
            stats: Arc::clone(&self.stats),
        };
        Ok((device, MockQueue::default()))
    }

    fn compile_pipeline(
        &self,
        device: &MockDevice,
        _source: &str,
        layout: &ShaderLayout,
    ) -> Result<MockPipeline, ComputeError> {
        let _work = device.enter();
        self.check_device(device, "compilation")?;
        let kernel = self.kernels.get(layout.entry_point()).ok_or_else(|| {
            ComputeError::Compilation(format!(
                "no host kernel bound to entry point `{}`",
                layout.entry_point()
            ))
        })?;
        Ok(MockPipeline {
            entry_point: layout.entry_point().to_owned(),
            kernel: Arc::clone(kernel),
            workgroup_size: layout.workgroup_size(),
        })
    }

    fn create_buffer(
        &self,
        _device: &MockDevice,
        request: &BufferRequest<'_>,
    ) -> Result<MockBuffer, ComputeError> {
        let len = usize::try_from(request.len)
            .map_err(|_| ComputeError::InvalidArgument(format!("{} is too large for the host", request.slot)))?;
        let mut words = vec![0u32; len.div_ceil(4)];
        if let Some(contents) = request.contents {
            bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..contents.len()].copy_from_slice(contents);
        }
        self.stats.buffers_created.fetch_add(1, Ordering::SeqCst);
        Ok(MockBuffer { words, len })
    }

    fn submit_and_wait(
        &self,
        device: &MockDevice,
        queue: &MockQueue,
        command: &DispatchCommand<'_, Self>,
    ) -> Result<Vec<Vec<u8>>, ComputeError> {
        let _work = device.enter();
        self.check_device(device, "submission")?;

        self.stats.submissions.fetch_add(1, Ordering::SeqCst);
        if queue.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.stats.overlapping_submissions.fetch_add(1, Ordering::SeqCst);
        }

        let mut working: BTreeMap<BindingSlot, MockBuffer> = command
            .groups
            .iter()
            .flat_map(|group| group.bindings.iter())
            .map(|binding| (binding.slot, binding.buffer.clone()))
            .collect();
        let pipeline = command.pipeline;
        let outcome = {
            let mut invocation = CpuInvocation {
                workgroups: command.workgroups,
                workgroup_size: pipeline.workgroup_size,
                buffers: &mut working,
            };
            (pipeline.kernel)(&mut invocation)
        };
        queue.in_flight.fetch_sub(1, Ordering::SeqCst);

        outcome.map_err(|msg| {
            ComputeError::BindingMismatch(format!("host kernel `{}` failed: {msg}", pipeline.entry_point))
        })?;

        Ok(command
            .read_back()
            .filter_map(|binding| working.get(&binding.slot))
            .map(|buffer| buffer.bytes().to_vec())
            .collect())
    }
}
