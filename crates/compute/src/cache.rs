//! Append-only cache of resource descriptors.

use crate::backend::{ComputeBackend, DeviceInfo, DeviceRequest, DeviceType};
use crate::handle::{HandleTable, KernelHandle, ResourceHandle};
use crate::kernel_cache::{KernelCodeCache, KernelEntry};
use crate::{ComputeError, ComputingConfig, CustomSettings, DeviceLimits, MemoryHint, PowerPreference};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A device and queue plus everything compiled against them.
pub struct ResourceDescriptor<B: ComputeBackend> {
    handle: ResourceHandle,
    info: DeviceInfo,
    limits: DeviceLimits,
    device: B::Device,
    queue: B::Queue,
    kernels: RwLock<KernelCodeCache<B>>,
    submission: Mutex<()>,
    lost: AtomicBool,
}

impl<B: ComputeBackend> ResourceDescriptor<B> {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Limits the device was created with.
    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn queue(&self) -> &B::Queue {
        &self.queue
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            tracing::warn!("{} ({}) lost its device", self.handle, self.info.name);
        }
    }

    /// Serializes submissions to this descriptor's queue.
    pub(crate) fn lock_submission(&self) -> MutexGuard<'_, ()> {
        self.submission.lock()
    }

    /// Compiles `source` against this device and appends it to the kernel
    /// cache. Compilation holds the submission lock: backend error scopes are
    /// per device, so a concurrent dispatch must not see them.
    ///
    /// # Errors
    ///
    /// See [`KernelCodeCache::register`]. A [`ComputeError::DeviceLost`]
    /// also marks the descriptor lost.
    pub fn register_kernel(
        &self,
        backend: &B,
        source: &str,
        entry_point: &str,
    ) -> Result<KernelHandle, ComputeError> {
        if self.is_lost() {
            return Err(ComputeError::DeviceLost(format!("{} lost its device", self.handle)));
        }
        let _submission = self.lock_submission();
        let result = self
            .kernels
            .write()
            .register(backend, &self.device, &self.limits, source, entry_point);
        if let Err(ComputeError::DeviceLost(_)) = &result {
            self.mark_lost();
        }
        result
    }

    pub fn kernel(&self, handle: KernelHandle) -> Result<Arc<KernelEntry<B>>, ComputeError> {
        self.kernels.read().get(handle)
    }

    /// Tombstones every kernel; the descriptor stays live.
    pub fn clear_kernels(&self) -> usize {
        self.kernels.write().clear()
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.read().live()
    }
}

pub struct ResourceCache<B: ComputeBackend> {
    table: HandleTable<Arc<ResourceDescriptor<B>>>,
}

impl<B: ComputeBackend> Default for ResourceCache<B> {
    fn default() -> Self {
        Self { table: HandleTable::default() }
    }
}

impl<B: ComputeBackend> ResourceCache<B> {
    /// Selects an adapter, creates a device on it and appends the descriptor.
    ///
    /// # Errors
    ///
    /// - [`ComputeError::UnsupportedLimits`] for an inverted custom memory
    ///   range (checked before the backend is touched) or limits the adapter
    ///   cannot satisfy.
    /// - [`ComputeError::DeviceSelection`] when no adapter matches.
    pub fn create(
        &mut self,
        backend: &B,
        config: &ComputingConfig,
        custom: &CustomSettings,
    ) -> Result<ResourceHandle, ComputeError> {
        let memory = MemoryHint::resolve(config.memory, &custom.memory)?;
        let limits = DeviceLimits::for_speed(config.speed, &custom.speed);

        let adapters = backend.enumerate_adapters(config.backend);
        let infos: Vec<DeviceInfo> = adapters.iter().map(|a| backend.adapter_info(a)).collect();
        let chosen = select_adapter(&infos, config)?;
        let adapter = &adapters[chosen];
        let info = infos[chosen].clone();

        if let Err(err) = limits.check_within(&backend.adapter_limits(adapter)) {
            tracing::warn!("{} cannot satisfy {:?} speed limits: {err}", info.name, config.speed);
            return Err(err);
        }

        let index = self.table.issued();
        let request = DeviceRequest { label: format!("resource#{index}"), limits, memory };
        let (device, queue) = backend.create_device(adapter, &request)?;

        let (index, generation) = self.table.insert_with(|index, generation| {
            let handle = ResourceHandle::new(index, generation);
            Arc::new(ResourceDescriptor {
                handle,
                info,
                limits,
                device,
                queue,
                kernels: RwLock::new(KernelCodeCache::new(handle)),
                submission: Mutex::new(()),
                lost: AtomicBool::new(false),
            })
        });
        let handle = ResourceHandle::new(index, generation);
        tracing::info!(
            "created {handle} on {} ({}, {:?})",
            infos[chosen].name,
            infos[chosen].backend,
            infos[chosen].device_type
        );
        Ok(handle)
    }

    pub fn get(&self, handle: ResourceHandle) -> Result<&Arc<ResourceDescriptor<B>>, ComputeError> {
        self.table
            .get(handle.index(), handle.generation())
            .ok_or_else(|| ComputeError::InvalidIndex(format!("{handle} is not a live resource")))
    }

    /// Tombstones the descriptor. Its device is released once the last
    /// in-flight dispatch drops its reference.
    pub fn free(&mut self, handle: ResourceHandle) -> Result<(), ComputeError> {
        let descriptor = self
            .table
            .remove(handle.index(), handle.generation())
            .ok_or_else(|| ComputeError::InvalidIndex(format!("{handle} is not a live resource")))?;
        tracing::info!("freed {handle} with {} kernel(s)", descriptor.kernel_count());
        Ok(())
    }

    /// Frees every live descriptor and returns how many there were.
    pub fn clear(&mut self) -> usize {
        let freed = self.table.clear().len();
        if freed > 0 {
            tracing::info!("freed {freed} resource(s)");
        }
        freed
    }

    pub fn live(&self) -> usize {
        self.table.live()
    }
}

/// Position of the preferred adapter in `infos`.
fn select_adapter(infos: &[DeviceInfo], config: &ComputingConfig) -> Result<usize, ComputeError> {
    if infos.is_empty() {
        return Err(ComputeError::DeviceSelection(format!(
            "no adapters available on backend `{}`",
            config.backend
        )));
    }
    if let Some(index) = config.device_index {
        return if index < infos.len() {
            Ok(index)
        } else {
            Err(ComputeError::DeviceSelection(format!(
                "device index {index} is out of range: backend `{}` has {} adapter(s)",
                config.backend,
                infos.len()
            )))
        };
    }
    let best = infos
        .iter()
        .enumerate()
        .min_by_key(|(_, info)| power_rank(config.power, info.device_type))
        .map_or(0, |(index, _)| index);
    Ok(best)
}

/// Lower ranks are preferred. Ties keep adapter order.
fn power_rank(power: PowerPreference, device_type: DeviceType) -> u8 {
    match (power, device_type) {
        (PowerPreference::None, _)
        | (PowerPreference::HighPerformance, DeviceType::DiscreteGpu)
        | (PowerPreference::LowPower, DeviceType::IntegratedGpu) => 0,
        (PowerPreference::HighPerformance, DeviceType::IntegratedGpu)
        | (PowerPreference::LowPower, DeviceType::DiscreteGpu) => 1,
        (_, DeviceType::VirtualGpu) => 2,
        (_, DeviceType::Cpu) => 3,
        (_, DeviceType::Other) => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backend;

    fn info(device_type: DeviceType) -> DeviceInfo {
        DeviceInfo {
            name: format!("{device_type:?}"),
            vendor: 0,
            device: 0,
            device_type,
            driver: String::new(),
            driver_info: String::new(),
            backend: Backend::Vulkan,
        }
    }

    #[test]
    fn power_preference_ranks_device_types() {
        let infos = [info(DeviceType::Cpu), info(DeviceType::IntegratedGpu), info(DeviceType::DiscreteGpu)];
        let mut config = ComputingConfig::default();
        assert_eq!(select_adapter(&infos, &config), Ok(2));

        config.power = PowerPreference::LowPower;
        assert_eq!(select_adapter(&infos, &config), Ok(1));

        config.power = PowerPreference::None;
        assert_eq!(select_adapter(&infos, &config), Ok(0));
    }

    #[test]
    fn ties_keep_listing_order() {
        let infos = [info(DeviceType::VirtualGpu), info(DeviceType::VirtualGpu)];
        assert_eq!(select_adapter(&infos, &ComputingConfig::default()), Ok(0));
    }

    #[test]
    fn explicit_index_must_be_in_range() {
        let infos = [info(DeviceType::Cpu), info(DeviceType::DiscreteGpu)];
        let config = ComputingConfig { device_index: Some(0), ..ComputingConfig::default() };
        assert_eq!(select_adapter(&infos, &config), Ok(0));

        let config = ComputingConfig { device_index: Some(2), ..ComputingConfig::default() };
        assert!(matches!(select_adapter(&infos, &config), Err(ComputeError::DeviceSelection(_))));
    }

    #[test]
    fn no_adapters_is_a_selection_error() {
        assert!(matches!(
            select_adapter(&[], &ComputingConfig::default()),
            Err(ComputeError::DeviceSelection(_))
        ));
    }
}
