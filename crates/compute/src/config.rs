//! Resource configuration: backend/power/speed/memory preferences, custom
//! limits, and environment overrides.

use crate::ComputeError;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

pub const ENV_BACKEND: &str = "KERNEL_DISPATCH_BACKEND";
pub const ENV_POWER: &str = "KERNEL_DISPATCH_POWER";
pub const ENV_SPEED: &str = "KERNEL_DISPATCH_SPEED";
pub const ENV_MEMORY: &str = "KERNEL_DISPATCH_MEMORY";
pub const ENV_DEVICE: &str = "KERNEL_DISPATCH_DEVICE";

/// Graphics API family to pull adapters from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Backend {
    All,
    #[default]
    Default,
    Vulkan,
    OpenGl,
    Metal,
    Dx12,
    WebGpu,
    /// Vulkan, Metal, DX12 and browser WebGPU.
    HighestSupport,
    /// OpenGL only.
    LowestSupport,
}

impl Backend {
    /// Backends an adapter can actually report.
    pub const CONCRETE: [Backend; 5] = [
        Backend::Vulkan,
        Backend::OpenGl,
        Backend::Metal,
        Backend::Dx12,
        Backend::WebGpu,
    ];

    /// Whether an adapter on the concrete backend `adapter` satisfies this
    /// selector.
    #[must_use]
    pub fn includes(self, adapter: Backend) -> bool {
        match self {
            Backend::All | Backend::Default => true,
            Backend::HighestSupport => matches!(
                adapter,
                Backend::Vulkan | Backend::Metal | Backend::Dx12 | Backend::WebGpu
            ),
            Backend::LowestSupport => adapter == Backend::OpenGl,
            concrete => concrete == adapter,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::All => "all",
            Backend::Default => "default",
            Backend::Vulkan => "vulkan",
            Backend::OpenGl => "gl",
            Backend::Metal => "metal",
            Backend::Dx12 => "dx12",
            Backend::WebGpu => "webgpu",
            Backend::HighestSupport => "primary",
            Backend::LowestSupport => "secondary",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Backend::All),
            "default" => Ok(Backend::Default),
            "vulkan" | "vk" => Ok(Backend::Vulkan),
            "gl" | "opengl" | "gles" => Ok(Backend::OpenGl),
            "metal" | "mtl" => Ok(Backend::Metal),
            "dx12" | "d3d12" => Ok(Backend::Dx12),
            "webgpu" => Ok(Backend::WebGpu),
            "primary" | "highest" => Ok(Backend::HighestSupport),
            "secondary" | "lowest" => Ok(Backend::LowestSupport),
            other => Err(ComputeError::InvalidArgument(format!("unknown backend `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerPreference {
    None,
    LowPower,
    #[default]
    HighPerformance,
}

impl fmt::Display for PowerPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerPreference::None => "none",
            PowerPreference::LowPower => "low",
            PowerPreference::HighPerformance => "high",
        })
    }
}

impl FromStr for PowerPreference {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(PowerPreference::None),
            "low" | "low-power" | "lowpower" => Ok(PowerPreference::LowPower),
            "high" | "high-performance" | "highperformance" => Ok(PowerPreference::HighPerformance),
            other => Err(ComputeError::InvalidArgument(format!("unknown power preference `{other}`"))),
        }
    }
}

/// How much of the adapter's capability the device requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpeedSetting {
    /// WebGL2-level limits. Compute is unavailable at this tier.
    Lowest,
    #[default]
    Low,
    Default,
    /// Use `CustomSettings::speed` verbatim.
    Custom,
}

impl fmt::Display for SpeedSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpeedSetting::Lowest => "lowest",
            SpeedSetting::Low => "low",
            SpeedSetting::Default => "default",
            SpeedSetting::Custom => "custom",
        })
    }
}

impl FromStr for SpeedSetting {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lowest" => Ok(SpeedSetting::Lowest),
            "low" => Ok(SpeedSetting::Low),
            "default" => Ok(SpeedSetting::Default),
            "custom" => Ok(SpeedSetting::Custom),
            other => Err(ComputeError::InvalidArgument(format!("unknown speed setting `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemorySetting {
    PreferPerformance,
    #[default]
    PreferMemory,
    /// Use `CustomSettings::memory` as the suballocation block range.
    Custom,
}

impl fmt::Display for MemorySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemorySetting::PreferPerformance => "performance",
            MemorySetting::PreferMemory => "memory",
            MemorySetting::Custom => "custom",
        })
    }
}

impl FromStr for MemorySetting {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "performance" => Ok(MemorySetting::PreferPerformance),
            "memory" => Ok(MemorySetting::PreferMemory),
            "custom" => Ok(MemorySetting::Custom),
            other => Err(ComputeError::InvalidArgument(format!("unknown memory setting `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComputingConfig {
    pub backend: Backend,
    pub power: PowerPreference,
    pub speed: SpeedSetting,
    pub memory: MemorySetting,
    /// Position of the adapter within the backend's adapter list. `None`
    /// selects automatically by power preference.
    pub device_index: Option<usize>,
}

impl ComputingConfig {
    /// Default config with any `KERNEL_DISPATCH_*` environment overrides
    /// applied.
    pub fn from_env() -> Result<Self, ComputeError> {
        let mut config = Self::default();
        if let Some(value) = env_var(ENV_BACKEND) {
            config.backend = value.parse()?;
        }
        if let Some(value) = env_var(ENV_POWER) {
            config.power = value.parse()?;
        }
        if let Some(value) = env_var(ENV_SPEED) {
            config.speed = value.parse()?;
        }
        if let Some(value) = env_var(ENV_MEMORY) {
            config.memory = value.parse()?;
        }
        if let Some(value) = env_var(ENV_DEVICE) {
            let raw: i64 = value.trim().parse().map_err(|_| {
                ComputeError::InvalidArgument(format!("{ENV_DEVICE} must be an integer, got `{value}`"))
            })?;
            config.device_index = legacy_device_index(raw);
        }
        Ok(config)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Negative legacy ordinals mean "pick automatically".
#[must_use]
pub fn legacy_device_index(raw: i64) -> Option<usize> {
    usize::try_from(raw).ok()
}

/// Suballocation block size range in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryRange {
    pub min: u64,
    pub max: u64,
}

impl MemoryRange {
    pub fn validate(&self) -> Result<Range<u64>, ComputeError> {
        if self.min > self.max {
            return Err(ComputeError::UnsupportedLimits {
                limit: "custom_memory.min",
                requested: self.min,
                supported: self.max,
            });
        }
        Ok(self.min..self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CustomSettings {
    /// Limits requested when `speed` is [`SpeedSetting::Custom`].
    pub speed: DeviceLimits,
    /// Block range used when `memory` is [`MemorySetting::Custom`].
    pub memory: MemoryRange,
}

/// The compute-relevant subset of device limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceLimits {
    pub max_bind_groups: u32,
    pub max_bindings_per_bind_group: u32,
    pub max_storage_buffers_per_shader_stage: u32,
    pub max_uniform_buffers_per_shader_stage: u32,
    pub max_uniform_buffer_binding_size: u32,
    pub max_storage_buffer_binding_size: u32,
    pub max_buffer_size: u64,
    pub min_uniform_buffer_offset_alignment: u32,
    pub min_storage_buffer_offset_alignment: u32,
    pub max_compute_workgroup_storage_size: u32,
    pub max_compute_invocations_per_workgroup: u32,
    pub max_compute_workgroup_size_x: u32,
    pub max_compute_workgroup_size_y: u32,
    pub max_compute_workgroup_size_z: u32,
    pub max_compute_workgroups_per_dimension: u32,
    pub max_push_constant_size: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_bind_groups: 4,
            max_bindings_per_bind_group: 1000,
            max_storage_buffers_per_shader_stage: 8,
            max_uniform_buffers_per_shader_stage: 12,
            max_uniform_buffer_binding_size: 64 << 10,
            max_storage_buffer_binding_size: 128 << 20,
            max_buffer_size: 256 << 20,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 256,
            max_compute_workgroup_storage_size: 16384,
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            max_compute_workgroups_per_dimension: 65535,
            max_push_constant_size: 0,
        }
    }
}

impl DeviceLimits {
    /// Limits every downlevel (GLES3 / D3D11-class) adapter supports.
    #[must_use]
    pub fn downlevel() -> Self {
        Self {
            max_storage_buffers_per_shader_stage: 4,
            max_uniform_buffer_binding_size: 16 << 10,
            max_compute_workgroup_storage_size: 16352,
            ..Self::default()
        }
    }

    /// WebGL2-level limits: no storage buffers and no compute.
    #[must_use]
    pub fn downlevel_webgl2() -> Self {
        Self {
            max_storage_buffers_per_shader_stage: 0,
            max_storage_buffer_binding_size: 0,
            max_compute_workgroup_storage_size: 0,
            max_compute_invocations_per_workgroup: 0,
            max_compute_workgroup_size_x: 0,
            max_compute_workgroup_size_y: 0,
            max_compute_workgroup_size_z: 0,
            max_compute_workgroups_per_dimension: 0,
            ..Self::downlevel()
        }
    }

    /// Limits requested for a given speed setting.
    #[must_use]
    pub fn for_speed(speed: SpeedSetting, custom: &DeviceLimits) -> Self {
        match speed {
            SpeedSetting::Lowest => Self::downlevel_webgl2(),
            SpeedSetting::Low => Self::downlevel(),
            SpeedSetting::Default => Self::default(),
            SpeedSetting::Custom => *custom,
        }
    }

    /// Fails with the first limit in `self` that `supported` cannot satisfy.
    /// Maxima must not exceed the supported value; alignments must not be
    /// finer than it.
    pub fn check_within(&self, supported: &DeviceLimits) -> Result<(), ComputeError> {
        let maxima = [
            ("max_bind_groups", u64::from(self.max_bind_groups), u64::from(supported.max_bind_groups)),
            (
                "max_bindings_per_bind_group",
                u64::from(self.max_bindings_per_bind_group),
                u64::from(supported.max_bindings_per_bind_group),
            ),
            (
                "max_storage_buffers_per_shader_stage",
                u64::from(self.max_storage_buffers_per_shader_stage),
                u64::from(supported.max_storage_buffers_per_shader_stage),
            ),
            (
                "max_uniform_buffers_per_shader_stage",
                u64::from(self.max_uniform_buffers_per_shader_stage),
                u64::from(supported.max_uniform_buffers_per_shader_stage),
            ),
            (
                "max_uniform_buffer_binding_size",
                u64::from(self.max_uniform_buffer_binding_size),
                u64::from(supported.max_uniform_buffer_binding_size),
            ),
            (
                "max_storage_buffer_binding_size",
                u64::from(self.max_storage_buffer_binding_size),
                u64::from(supported.max_storage_buffer_binding_size),
            ),
            ("max_buffer_size", self.max_buffer_size, supported.max_buffer_size),
            (
                "max_compute_workgroup_storage_size",
                u64::from(self.max_compute_workgroup_storage_size),
                u64::from(supported.max_compute_workgroup_storage_size),
            ),
            (
                "max_compute_invocations_per_workgroup",
                u64::from(self.max_compute_invocations_per_workgroup),
                u64::from(supported.max_compute_invocations_per_workgroup),
            ),
            (
                "max_compute_workgroup_size_x",
                u64::from(self.max_compute_workgroup_size_x),
                u64::from(supported.max_compute_workgroup_size_x),
            ),
            (
                "max_compute_workgroup_size_y",
                u64::from(self.max_compute_workgroup_size_y),
                u64::from(supported.max_compute_workgroup_size_y),
            ),
            (
                "max_compute_workgroup_size_z",
                u64::from(self.max_compute_workgroup_size_z),
                u64::from(supported.max_compute_workgroup_size_z),
            ),
            (
                "max_compute_workgroups_per_dimension",
                u64::from(self.max_compute_workgroups_per_dimension),
                u64::from(supported.max_compute_workgroups_per_dimension),
            ),
            (
                "max_push_constant_size",
                u64::from(self.max_push_constant_size),
                u64::from(supported.max_push_constant_size),
            ),
        ];
        for (limit, requested, allowed) in maxima {
            if requested > allowed {
                return Err(ComputeError::UnsupportedLimits { limit, requested, supported: allowed });
            }
        }

        let alignments = [
            (
                "min_uniform_buffer_offset_alignment",
                u64::from(self.min_uniform_buffer_offset_alignment),
                u64::from(supported.min_uniform_buffer_offset_alignment),
            ),
            (
                "min_storage_buffer_offset_alignment",
                u64::from(self.min_storage_buffer_offset_alignment),
                u64::from(supported.min_storage_buffer_offset_alignment),
            ),
        ];
        for (limit, requested, allowed) in alignments {
            if requested < allowed {
                return Err(ComputeError::UnsupportedLimits { limit, requested, supported: allowed });
            }
        }
        Ok(())
    }
}

/// Memory allocation strategy handed to the backend when creating a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryHint {
    Performance,
    MemoryUsage,
    Manual(Range<u64>),
}

impl MemoryHint {
    pub fn resolve(memory: MemorySetting, custom: &MemoryRange) -> Result<Self, ComputeError> {
        match memory {
            MemorySetting::PreferPerformance => Ok(MemoryHint::Performance),
            MemorySetting::PreferMemory => Ok(MemoryHint::MemoryUsage),
            MemorySetting::Custom => custom.validate().map(MemoryHint::Manual),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_selectors() {
        assert!(Backend::All.includes(Backend::OpenGl));
        assert!(Backend::HighestSupport.includes(Backend::Metal));
        assert!(!Backend::HighestSupport.includes(Backend::OpenGl));
        assert!(Backend::LowestSupport.includes(Backend::OpenGl));
        assert!(!Backend::Vulkan.includes(Backend::Dx12));
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("VK".parse::<Backend>(), Ok(Backend::Vulkan));
        assert_eq!(" high ".parse::<PowerPreference>(), Ok(PowerPreference::HighPerformance));
        assert_eq!("Custom".parse::<SpeedSetting>(), Ok(SpeedSetting::Custom));
        assert!(matches!("fast".parse::<MemorySetting>(), Err(ComputeError::InvalidArgument(_))));
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for backend in Backend::CONCRETE {
            assert_eq!(backend.to_string().parse::<Backend>(), Ok(backend));
        }
    }

    #[test]
    fn negative_legacy_index_is_automatic() {
        assert_eq!(legacy_device_index(-1), None);
        assert_eq!(legacy_device_index(2), Some(2));
    }

    #[test]
    fn inverted_memory_range_is_rejected() {
        let range = MemoryRange { min: 1024, max: 16 };
        let err = MemoryHint::resolve(MemorySetting::Custom, &range).unwrap_err();
        assert!(matches!(err, ComputeError::UnsupportedLimits { limit: "custom_memory.min", .. }));
        assert_eq!(
            MemoryHint::resolve(MemorySetting::PreferMemory, &range),
            Ok(MemoryHint::MemoryUsage)
        );
    }

    #[test]
    fn presets_nest() {
        let full = DeviceLimits::default();
        assert!(DeviceLimits::downlevel().check_within(&full).is_ok());
        assert!(DeviceLimits::downlevel_webgl2().check_within(&DeviceLimits::downlevel()).is_ok());
        assert!(full.check_within(&DeviceLimits::downlevel()).is_err());
    }

    #[test]
    fn check_within_names_first_violation() {
        let supported = DeviceLimits::default();
        let requested = DeviceLimits { max_compute_workgroup_size_z: 1024, ..supported };
        let err = requested.check_within(&supported).unwrap_err();
        assert_eq!(
            err,
            ComputeError::UnsupportedLimits {
                limit: "max_compute_workgroup_size_z",
                requested: 1024,
                supported: 64,
            }
        );
    }

    #[test]
    fn finer_alignment_than_supported_fails() {
        let supported = DeviceLimits::default();
        let requested = DeviceLimits { min_storage_buffer_offset_alignment: 64, ..supported };
        assert!(matches!(
            requested.check_within(&supported),
            Err(ComputeError::UnsupportedLimits { limit: "min_storage_buffer_offset_alignment", .. })
        ));
    }

    #[test]
    fn custom_speed_uses_custom_limits() {
        let custom = DeviceLimits { max_bind_groups: 2, ..DeviceLimits::default() };
        assert_eq!(DeviceLimits::for_speed(SpeedSetting::Custom, &custom).max_bind_groups, 2);
        assert_eq!(DeviceLimits::for_speed(SpeedSetting::Low, &custom), DeviceLimits::downlevel());
    }
}
