//! Live adapter listing, independent of the caches.

use crate::backend::{ComputeBackend, DeviceInfo};
use crate::Backend;
use std::ops::Deref;

/// Adapters reported by one [`list`] call. Owned by the caller until handed
/// back to `free_gpu_devices_infos` or dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GpuDevices {
    infos: Vec<DeviceInfo>,
}

impl GpuDevices {
    pub fn into_vec(self) -> Vec<DeviceInfo> {
        self.infos
    }
}

impl Deref for GpuDevices {
    type Target = [DeviceInfo];

    fn deref(&self) -> &[DeviceInfo] {
        &self.infos
    }
}

impl IntoIterator for GpuDevices {
    type Item = DeviceInfo;
    type IntoIter = std::vec::IntoIter<DeviceInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.infos.into_iter()
    }
}

impl<'a> IntoIterator for &'a GpuDevices {
    type Item = &'a DeviceInfo;
    type IntoIter = std::slice::Iter<'a, DeviceInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.infos.iter()
    }
}

pub fn list<B: ComputeBackend>(backend: &B, selector: Backend) -> GpuDevices {
    let infos: Vec<DeviceInfo> = backend
        .enumerate_adapters(selector)
        .iter()
        .map(|adapter| backend.adapter_info(adapter))
        .collect();
    tracing::debug!("{} adapter(s) on backend `{selector}`", infos.len());
    GpuDevices { infos }
}
