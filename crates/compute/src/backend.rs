//! Narrow capability interface over a graphics backend.
//!
//! The caches, marshaller and dispatch engine only ever talk to a backend
//! through [`ComputeBackend`], which keeps them testable against
//! [`mock_cpu::MockCpu`] without a GPU present.

use crate::layout::{Access, BindingKind, BindingSlot, ShaderLayout};
use crate::{Backend, ComputeError, DeviceLimits, MemoryHint};

#[cfg(feature = "mock")]
pub mod mock_cpu;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceType {
    Other,
    IntegratedGpu,
    DiscreteGpu,
    VirtualGpu,
    Cpu,
}

/// Adapter description as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: DeviceType,
    pub driver: String,
    pub driver_info: String,
    /// Concrete backend the adapter lives on.
    pub backend: Backend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub label: String,
    pub limits: DeviceLimits,
    pub memory: MemoryHint,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferRequest<'a> {
    pub slot: BindingSlot,
    pub kind: BindingKind,
    pub access: Access,
    /// Caller-visible length in bytes; backends may pad the allocation.
    pub len: u64,
    /// Present only for bindings the kernel reads.
    pub contents: Option<&'a [u8]>,
}

#[derive(Debug)]
pub struct GpuBinding<Buf> {
    pub slot: BindingSlot,
    pub access: Access,
    pub len: u64,
    pub buffer: Buf,
}

#[derive(Debug)]
pub struct GpuBindGroup<Buf> {
    pub group: u32,
    pub bindings: Vec<GpuBinding<Buf>>,
}

/// One compute pass: a pipeline, its bind groups in ascending group order
/// (bindings ascending within each group), and the workgroup grid.
pub struct DispatchCommand<'a, B: ComputeBackend + ?Sized> {
    pub pipeline: &'a B::Pipeline,
    pub groups: &'a [GpuBindGroup<B::Buffer>],
    pub workgroups: [u32; 3],
}

impl<'a, B: ComputeBackend + ?Sized> DispatchCommand<'a, B> {
    /// Bindings whose contents must be copied back, in submission order.
    pub fn read_back(&self) -> impl Iterator<Item = &'a GpuBinding<B::Buffer>> {
        self.groups
            .iter()
            .flat_map(|group| group.bindings.iter())
            .filter(|binding| binding.access.reads_back())
    }
}

pub trait ComputeBackend: Send + Sync + 'static {
    type Adapter;
    type Device: Send + Sync;
    type Queue: Send + Sync;
    type Pipeline: Send + Sync;
    type Buffer;

    /// Adapters available on `backend`, in the backend's own order.
    fn enumerate_adapters(&self, backend: Backend) -> Vec<Self::Adapter>;

    fn adapter_info(&self, adapter: &Self::Adapter) -> DeviceInfo;

    fn adapter_limits(&self, adapter: &Self::Adapter) -> DeviceLimits;

    /// Requests a logical device and its queue.
    fn create_device(
        &self,
        adapter: &Self::Adapter,
        request: &DeviceRequest,
    ) -> Result<(Self::Device, Self::Queue), ComputeError>;

    /// Compiles `source` into a pipeline for `layout.entry_point()`, with bind
    /// group layouts matching `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::Compilation`] with the backend diagnostic.
    fn compile_pipeline(
        &self,
        device: &Self::Device,
        source: &str,
        layout: &ShaderLayout,
    ) -> Result<Self::Pipeline, ComputeError>;

    fn create_buffer(
        &self,
        device: &Self::Device,
        request: &BufferRequest<'_>,
    ) -> Result<Self::Buffer, ComputeError>;

    /// Encodes and submits `command`, blocks until the queue signals
    /// completion, and returns the bytes of every binding in
    /// [`DispatchCommand::read_back`] order, each truncated to its `len`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceLost`] if the device is lost during
    /// submission or while waiting.
    fn submit_and_wait(
        &self,
        device: &Self::Device,
        queue: &Self::Queue,
        command: &DispatchCommand<'_, Self>,
    ) -> Result<Vec<Vec<u8>>, ComputeError>;
}
