//! The caller-owned context that ties the caches and the dispatch engine
//! together behind a flat, handle-based surface.
//!
//! Administrative calls (create, register, free) serialize on one lock.
//! `compute` only holds that lock long enough to resolve its handles, so
//! dispatches against different descriptors run concurrently, while the
//! descriptor's own submission lock keeps one queue from interleaving.

use crate::backend::ComputeBackend;
use crate::binding::BindGroup;
use crate::cache::ResourceCache;
use crate::devices::{self, GpuDevices};
use crate::dispatch::DispatchEngine;
use crate::handle::{KernelHandle, ResourceHandle};
use crate::{error, Backend, ComputeError, ComputingConfig, CustomSettings};
use parking_lot::Mutex;

/// A dispatch request: workgroup counts plus the kernel and resource to run
/// them on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kernel {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub kernel_code_index: Option<KernelHandle>,
    pub config_index: Option<ResourceHandle>,
}

impl Kernel {
    #[must_use]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z, kernel_code_index: None, config_index: None }
    }

    #[must_use]
    pub const fn with_config(mut self, config: ResourceHandle) -> Self {
        self.config_index = Some(config);
        self
    }

    #[must_use]
    pub const fn with_kernel_code(mut self, kernel: KernelHandle) -> Self {
        self.kernel_code_index = Some(kernel);
        self
    }

    #[must_use]
    pub const fn workgroups(&self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

pub struct ComputeRuntime<B: ComputeBackend> {
    backend: B,
    cache: Mutex<ResourceCache<B>>,
}

impl<B: ComputeBackend> ComputeRuntime<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, cache: Mutex::new(ResourceCache::default()) }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// # Errors
    ///
    /// See [`ResourceCache::create`].
    pub fn create_computing_gpu_resources(
        &self,
        config: &ComputingConfig,
        custom: &CustomSettings,
    ) -> Result<ResourceHandle, ComputeError> {
        self.cache.lock().create(&self.backend, config, custom)
    }

    /// Creates a descriptor from [`ComputingConfig::default`]. Every call mints
    /// a new handle; identical configs are not shared.
    pub fn create_default(&self) -> Result<ResourceHandle, ComputeError> {
        self.create_computing_gpu_resources(&ComputingConfig::default(), &CustomSettings::default())
    }

    /// Points `kernel` at a freshly created default descriptor.
    pub fn set_kernel_default_config(&self, kernel: &mut Kernel) -> Result<ResourceHandle, ComputeError> {
        let handle = self.create_default()?;
        kernel.config_index = Some(handle);
        Ok(handle)
    }

    /// Compiles `source` under `resource`. On device loss the resource is
    /// tombstoned, as in [`compute`](Self::compute).
    pub fn register_computing_kernel_code(
        &self,
        resource: ResourceHandle,
        source: &str,
        entry_point: &str,
    ) -> Result<KernelHandle, ComputeError> {
        let mut cache = self.cache.lock();
        let result = cache.get(resource)?.register_kernel(&self.backend, source, entry_point);
        if let Err(ComputeError::DeviceLost(_)) = &result {
            cache.free(resource)?;
        }
        result
    }

    /// Drops every kernel compiled under `resource`. The descriptor itself
    /// stays usable for new registrations.
    pub fn free_compute_kernel_codes(&self, resource: ResourceHandle) -> Result<(), ComputeError> {
        let cache = self.cache.lock();
        cache.get(resource)?.clear_kernels();
        Ok(())
    }

    /// Tombstones `resource` and every kernel under it.
    pub fn free_computing_gpu_resources(&self, resource: ResourceHandle) -> Result<(), ComputeError> {
        self.cache.lock().free(resource)
    }

    /// Releases every live descriptor.
    pub fn free_compute_cache(&self) {
        self.cache.lock().clear();
    }

    /// # Errors
    ///
    /// - [`ComputeError::InvalidIndex`] when either handle is missing, stale,
    ///   or the kernel belongs to another resource.
    /// - Everything [`DispatchEngine::dispatch`] reports. On device loss the
    ///   resource is tombstoned.
    pub fn compute(&self, kernel: &Kernel, groups: &mut [BindGroup<'_>]) -> Result<(), ComputeError> {
        let resource = kernel
            .config_index
            .ok_or_else(|| ComputeError::InvalidIndex("kernel has no resource config".into()))?;
        let code = kernel
            .kernel_code_index
            .ok_or_else(|| ComputeError::InvalidIndex("kernel has no kernel code".into()))?;

        let (descriptor, entry) = {
            let cache = self.cache.lock();
            let descriptor = cache.get(resource)?.clone();
            let entry = descriptor.kernel(code)?;
            (descriptor, entry)
        };

        let result = DispatchEngine::new(&self.backend, &descriptor).dispatch(&entry, kernel.workgroups(), groups);
        if let Err(ComputeError::DeviceLost(_)) = &result {
            // Another caller may already have freed it.
            let _ = self.cache.lock().free(resource);
        }
        result
    }

    /// [`compute`](Self::compute) collapsed to `0` or a negative error code.
    pub fn compute_status(&self, kernel: &Kernel, groups: &mut [BindGroup<'_>]) -> i32 {
        let result = self.compute(kernel, groups);
        if let Err(err) = &result {
            tracing::debug!("compute failed: {err}");
        }
        error::status(&result)
    }

    pub fn get_computing_gpu_infos(&self, backend: Backend) -> GpuDevices {
        devices::list(&self.backend, backend)
    }

    #[allow(clippy::needless_pass_by_value)]
    pub fn free_gpu_devices_infos(&self, devices: GpuDevices) {
        drop(devices);
    }

    /// Descriptors currently live.
    pub fn live_resources(&self) -> usize {
        self.cache.lock().live()
    }
}
