#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc, clippy::must_use_candidate)]

//! Index-addressed cache of GPU devices and compiled compute kernels, with a
//! synchronous dispatch protocol on top.
//!
//! ```no_run
//! # #[cfg(feature = "gpu")]
//! # fn main() -> Result<(), kernel_dispatch::ComputeError> {
//! use kernel_dispatch::{BindGroup, DataBinder, Kernel};
//!
//! let runtime = kernel_dispatch::default_runtime();
//! let resource = runtime.create_default()?;
//! let code = runtime.register_computing_kernel_code(resource, "/* wgsl */", "main")?;
//!
//! let mut out = vec![0u8; 16];
//! let input = vec![1u8; 16];
//! let mut groups = [BindGroup::new(
//!     0,
//!     vec![DataBinder::read_write(0, &mut out), DataBinder::read(1, &input)],
//! )];
//! let kernel = Kernel::new(1, 1, 1).with_config(resource).with_kernel_code(code);
//! runtime.compute(&kernel, &mut groups)?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "gpu"))]
//! # fn main() {}
//! ```

pub mod backend;
pub mod binding;
pub mod cache;
pub mod config;
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod handle;
#[cfg(feature = "mock")]
pub mod kernels;
pub mod kernel_cache;
pub mod layout;
pub mod runtime;
#[cfg(feature = "gpu")]
pub mod wgpu_backend;

pub use backend::{ComputeBackend, DeviceInfo, DeviceType};
pub use binding::{BindGroup, BufferView, DataBinder};
pub use config::{
    legacy_device_index, Backend, ComputingConfig, CustomSettings, DeviceLimits, MemoryHint, MemoryRange,
    MemorySetting, PowerPreference, SpeedSetting,
};
pub use devices::GpuDevices;
pub use error::{status, ComputeError};
pub use handle::{KernelHandle, ResourceHandle};
pub use runtime::{ComputeRuntime, Kernel};

#[cfg(feature = "mock")]
pub use backend::mock_cpu::MockCpu;
#[cfg(feature = "gpu")]
pub use wgpu_backend::WgpuBackend;

/// Runtime over every wgpu backend available on this machine.
#[cfg(feature = "gpu")]
#[must_use]
pub fn default_runtime() -> ComputeRuntime<WgpuBackend> {
    ComputeRuntime::new(WgpuBackend::new())
}
