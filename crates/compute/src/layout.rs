//! Binding layout reflected from kernel source.
//!
//! The layout is captured once at registration and kept with the kernel
//! entry; the marshaller validates caller-supplied groups against it and the
//! backend builds its bind group layouts from it.

use crate::{ComputeError, DeviceLimits};
use std::collections::BTreeMap;
use std::fmt;

/// `@group(g) @binding(b)` address. Orders by group, then binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingSlot {
    pub group: u32,
    pub binding: u32,
}

impl BindingSlot {
    #[must_use]
    pub const fn new(group: u32, binding: u32) -> Self {
        Self { group, binding }
    }
}

impl fmt::Display for BindingSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@group({}) @binding({})", self.group, self.binding)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    /// Host bytes are uploaded before dispatch.
    #[must_use]
    pub const fn uploads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    /// Device bytes are copied back after dispatch.
    #[must_use]
    pub const fn reads_back(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Storage,
    Uniform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDecl {
    pub kind: BindingKind,
    pub access: Access,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderLayout {
    entry_point: String,
    workgroup_size: [u32; 3],
    bindings: BTreeMap<BindingSlot, BindingDecl>,
}

impl ShaderLayout {
    pub fn new(
        entry_point: impl Into<String>,
        workgroup_size: [u32; 3],
        bindings: impl IntoIterator<Item = (BindingSlot, BindingDecl)>,
    ) -> Self {
        Self {
            entry_point: entry_point.into(),
            workgroup_size,
            bindings: bindings.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    #[must_use]
    pub const fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    #[must_use]
    pub fn bindings(&self) -> &BTreeMap<BindingSlot, BindingDecl> {
        &self.bindings
    }

    #[must_use]
    pub fn binding(&self, slot: BindingSlot) -> Option<&BindingDecl> {
        self.bindings.get(&slot)
    }

    /// Declared group indices, ascending and deduplicated.
    #[must_use]
    pub fn groups(&self) -> Vec<u32> {
        let mut groups: Vec<u32> = self.bindings.keys().map(|slot| slot.group).collect();
        groups.dedup();
        groups
    }

    /// Rejects declarations the device cannot bind or run.
    pub fn check_limits(&self, limits: &DeviceLimits) -> Result<(), ComputeError> {
        let unsupported = |what: String| -> Result<(), ComputeError> {
            Err(ComputeError::Compilation(format!("{what} is unsupported by the device")))
        };

        for slot in self.bindings.keys() {
            if slot.group >= limits.max_bind_groups {
                return unsupported(format!("{slot} (max_bind_groups = {})", limits.max_bind_groups));
            }
            if slot.binding >= limits.max_bindings_per_bind_group {
                return unsupported(format!(
                    "{slot} (max_bindings_per_bind_group = {})",
                    limits.max_bindings_per_bind_group
                ));
            }
        }

        let count = |kind| self.bindings.values().filter(|decl| decl.kind == kind).count();
        let storage = count(BindingKind::Storage);
        if storage > limits.max_storage_buffers_per_shader_stage as usize {
            return unsupported(format!(
                "{storage} storage buffers (max_storage_buffers_per_shader_stage = {})",
                limits.max_storage_buffers_per_shader_stage
            ));
        }
        let uniform = count(BindingKind::Uniform);
        if uniform > limits.max_uniform_buffers_per_shader_stage as usize {
            return unsupported(format!(
                "{uniform} uniform buffers (max_uniform_buffers_per_shader_stage = {})",
                limits.max_uniform_buffers_per_shader_stage
            ));
        }

        let [x, y, z] = self.workgroup_size;
        let per_axis = [
            (x, limits.max_compute_workgroup_size_x, "x"),
            (y, limits.max_compute_workgroup_size_y, "y"),
            (z, limits.max_compute_workgroup_size_z, "z"),
        ];
        for (size, max, axis) in per_axis {
            if size > max {
                return unsupported(format!("workgroup size {size} along {axis} (max {max})"));
            }
        }
        let invocations = u64::from(x) * u64::from(y) * u64::from(z);
        if invocations > u64::from(limits.max_compute_invocations_per_workgroup) {
            return unsupported(format!(
                "{invocations} invocations per workgroup (max {})",
                limits.max_compute_invocations_per_workgroup
            ));
        }
        Ok(())
    }
}

/// Parses and validates WGSL, then captures the compute entry point's
/// workgroup size and every buffer binding the module declares.
pub fn reflect(source: &str, entry_point: &str) -> Result<ShaderLayout, ComputeError> {
    if entry_point.is_empty() {
        return Err(ComputeError::Compilation("entry point name is empty".into()));
    }

    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| ComputeError::Compilation(e.emit_to_string(source)))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator
        .validate(&module)
        .map_err(|e| ComputeError::Compilation(e.emit_to_string(source)))?;

    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.name == entry_point)
        .ok_or_else(|| ComputeError::Compilation(format!("entry point `{entry_point}` not found")))?;
    if entry.stage != naga::ShaderStage::Compute {
        return Err(ComputeError::Compilation(format!(
            "entry point `{entry_point}` is a {:?} shader, not a compute shader",
            entry.stage
        )));
    }

    let mut bindings = BTreeMap::new();
    for (_, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else {
            continue;
        };
        let slot = BindingSlot::new(binding.group, binding.binding);
        let (kind, access) = match var.space {
            naga::AddressSpace::Storage { access } => (BindingKind::Storage, storage_access(access)),
            naga::AddressSpace::Uniform => (BindingKind::Uniform, Access::Read),
            other => {
                return Err(ComputeError::Compilation(format!(
                    "{slot} lives in {other:?} space; only storage and uniform buffers can be bound"
                )))
            }
        };
        let decl = BindingDecl { kind, access, name: var.name.clone() };
        if bindings.insert(slot, decl).is_some() {
            return Err(ComputeError::Compilation(format!("{slot} is declared more than once")));
        }
    }

    Ok(ShaderLayout {
        entry_point: entry_point.to_owned(),
        workgroup_size: entry.workgroup_size,
        bindings,
    })
}

fn storage_access(access: naga::StorageAccess) -> Access {
    let load = access.contains(naga::StorageAccess::LOAD);
    let store = access.contains(naga::StorageAccess::STORE);
    match (load, store) {
        (true, true) => Access::ReadWrite,
        (false, true) => Access::Write,
        _ => Access::Read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD: &str = r"
        @group(0) @binding(0) var<storage, read_write> out_data: array<u32>;
        @group(0) @binding(1) var<storage, read> in_data: array<u32>;

        @compute @workgroup_size(10, 1, 1)
        fn main(@builtin(global_invocation_id) global_id: vec3<u32>) {
            let idx = global_id.x % 60000u;
            out_data[idx] = out_data[idx] + in_data[idx];
        }
    ";

    #[test]
    fn reflects_bindings_and_workgroup_size() {
        let layout = reflect(ADD, "main").unwrap();
        assert_eq!(layout.workgroup_size(), [10, 1, 1]);
        assert_eq!(layout.groups(), vec![0]);

        let out = layout.binding(BindingSlot::new(0, 0)).unwrap();
        assert_eq!((out.kind, out.access), (BindingKind::Storage, Access::ReadWrite));
        assert_eq!(out.name.as_deref(), Some("out_data"));

        let input = layout.binding(BindingSlot::new(0, 1)).unwrap();
        assert_eq!(input.access, Access::Read);
    }

    #[test]
    fn uniforms_are_read_only() {
        let src = r"
            struct Params { scale: u32 }
            @group(1) @binding(3) var<uniform> params: Params;
            @group(0) @binding(0) var<storage, read_write> data: array<u32>;

            @compute @workgroup_size(1)
            fn run(@builtin(global_invocation_id) id: vec3<u32>) {
                data[id.x] = data[id.x] * params.scale;
            }
        ";
        let layout = reflect(src, "run").unwrap();
        let params = layout.binding(BindingSlot::new(1, 3)).unwrap();
        assert_eq!((params.kind, params.access), (BindingKind::Uniform, Access::Read));
        assert_eq!(layout.groups(), vec![0, 1]);
    }

    #[test]
    fn unknown_entry_point_is_a_compilation_error() {
        let err = reflect(ADD, "missing").unwrap_err();
        assert!(matches!(err, ComputeError::Compilation(msg) if msg.contains("missing")));
    }

    #[test]
    fn syntax_error_carries_diagnostic() {
        let err = reflect("fn main( {", "main").unwrap_err();
        assert!(matches!(err, ComputeError::Compilation(msg) if !msg.is_empty()));
    }

    #[test]
    fn texture_bindings_are_rejected() {
        let src = r"
            @group(0) @binding(0) var tex: texture_2d<f32>;
            @compute @workgroup_size(1)
            fn main() {
                let dims = textureDimensions(tex);
            }
        ";
        assert!(matches!(reflect(src, "main"), Err(ComputeError::Compilation(_))));
    }

    #[test]
    fn access_flags_map_to_modes() {
        assert_eq!(storage_access(naga::StorageAccess::LOAD), Access::Read);
        assert_eq!(storage_access(naga::StorageAccess::STORE), Access::Write);
        assert_eq!(storage_access(naga::StorageAccess::all()), Access::ReadWrite);
        assert!(Access::Write.reads_back() && !Access::Write.uploads());
        assert!(Access::Read.uploads() && !Access::Read.reads_back());
    }

    #[test]
    fn check_limits_rejects_oversized_workgroups() {
        let layout = ShaderLayout::new("main", [512, 1, 1], []);
        let err = layout.check_limits(&DeviceLimits::default()).unwrap_err();
        assert!(matches!(err, ComputeError::Compilation(msg) if msg.contains("along x")));
    }

    #[test]
    fn check_limits_rejects_out_of_range_group() {
        let decl = BindingDecl { kind: BindingKind::Storage, access: Access::Read, name: None };
        let layout = ShaderLayout::new("main", [1, 1, 1], [(BindingSlot::new(4, 0), decl)]);
        assert!(layout.check_limits(&DeviceLimits::default()).is_err());
    }

    #[test]
    fn check_limits_counts_storage_buffers() {
        let decl = BindingDecl { kind: BindingKind::Storage, access: Access::Read, name: None };
        let bindings = (0..5).map(|b| (BindingSlot::new(0, b), decl.clone()));
        let layout = ShaderLayout::new("main", [1, 1, 1], bindings);
        assert!(layout.check_limits(&DeviceLimits::default()).is_ok());
        assert!(layout.check_limits(&DeviceLimits::downlevel()).is_err());
    }
}
