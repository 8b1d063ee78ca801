//! Host buffers grouped by `@group`, and their translation into backend
//! buffers.
//!
//! The caller never states an access mode: it comes from the shader. The
//! caller only decides whether it lends a buffer shared or exclusively, and a
//! binding the shader writes must be lent exclusively so its result has
//! somewhere to land.

use crate::backend::{BufferRequest, ComputeBackend, GpuBindGroup, GpuBinding};
use crate::layout::{Access, BindingKind, BindingSlot, ShaderLayout};
use crate::{ComputeError, DeviceLimits};
use std::collections::BTreeMap;

pub enum HostBuffer<'a> {
    Shared(&'a [u8]),
    Exclusive(&'a mut [u8]),
}

impl HostBuffer<'_> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            HostBuffer::Shared(bytes) => bytes,
            HostBuffer::Exclusive(bytes) => bytes,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, HostBuffer::Exclusive(_))
    }
}

/// One host buffer lent to one `@binding` slot.
pub struct DataBinder<'a> {
    bind: u32,
    buffer: HostBuffer<'a>,
}

impl<'a> DataBinder<'a> {
    /// For bindings the kernel only reads.
    #[must_use]
    pub fn read(bind: u32, bytes: &'a [u8]) -> Self {
        Self { bind, buffer: HostBuffer::Shared(bytes) }
    }

    /// For bindings the kernel may write; results are copied back into
    /// `bytes` after a successful dispatch.
    #[must_use]
    pub fn read_write(bind: u32, bytes: &'a mut [u8]) -> Self {
        Self { bind, buffer: HostBuffer::Exclusive(bytes) }
    }

    #[must_use]
    pub fn bind(&self) -> u32 {
        self.bind
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffer(&self) -> &HostBuffer<'a> {
        &self.buffer
    }
}

pub struct BindGroup<'a> {
    group: u32,
    binders: Vec<DataBinder<'a>>,
}

impl<'a> BindGroup<'a> {
    #[must_use]
    pub fn new(group: u32, binders: Vec<DataBinder<'a>>) -> Self {
        Self { group, binders }
    }

    #[must_use]
    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn binders(&self) -> &[DataBinder<'a>] {
        &self.binders
    }
}

/// Caller-owned destination for a binding the kernel writes.
pub struct BufferView<'a> {
    slot: BindingSlot,
    access: Access,
    target: &'a mut [u8],
}

impl BufferView<'_> {
    pub fn slot(&self) -> BindingSlot {
        self.slot
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    /// Fails without touching the target unless `bytes` has its exact length.
    pub fn accepts(&self, bytes: &[u8]) -> Result<(), ComputeError> {
        if bytes.len() != self.target.len() {
            return Err(ComputeError::BindingMismatch(format!(
                "{} read back {} bytes into a {}-byte host buffer",
                self.slot,
                bytes.len(),
                self.target.len()
            )));
        }
        Ok(())
    }

    pub fn write_back(&mut self, bytes: &[u8]) -> Result<(), ComputeError> {
        self.accepts(bytes)?;
        self.target.copy_from_slice(bytes);
        Ok(())
    }
}

/// Backend bind groups ready for submission, plus the views results are
/// written back through. Both follow ascending `(group, binding)` order.
pub struct Marshalled<'g, B: ComputeBackend> {
    pub groups: Vec<GpuBindGroup<B::Buffer>>,
    pub views: Vec<BufferView<'g>>,
}

fn mismatch(msg: String) -> ComputeError {
    ComputeError::BindingMismatch(msg)
}

/// Checks every binder against `layout` and `limits` without touching the
/// backend. Returns the binders keyed by slot.
fn validate<'b, 'h>(
    layout: &ShaderLayout,
    limits: &DeviceLimits,
    groups: &'b [BindGroup<'h>],
) -> Result<BTreeMap<BindingSlot, &'b DataBinder<'h>>, ComputeError> {
    let mut group_ids: Vec<u32> = groups.iter().map(|group| group.group).collect();
    group_ids.sort_unstable();
    if let Some(pair) = group_ids.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(mismatch(format!("@group({}) is supplied more than once", pair[0])));
    }

    let mut supplied = BTreeMap::new();
    let mut ordered: Vec<(BindingSlot, &DataBinder<'h>)> = groups
        .iter()
        .flat_map(|group| {
            group.binders.iter().map(move |binder| (BindingSlot::new(group.group, binder.bind), binder))
        })
        .collect();
    ordered.sort_by_key(|(slot, _)| *slot);

    for (slot, binder) in ordered {
        let Some(decl) = layout.binding(slot) else {
            return Err(mismatch(format!("{slot} is not declared by `{}`", layout.entry_point())));
        };
        if supplied.insert(slot, binder).is_some() {
            return Err(mismatch(format!("{slot} is supplied more than once")));
        }
        if binder.is_empty() {
            return Err(mismatch(format!("{slot} is bound to an empty buffer")));
        }
        if decl.access.reads_back() && !binder.buffer.is_exclusive() {
            return Err(mismatch(format!("{slot} is written by the kernel but was lent read-only")));
        }

        let len = binder.len() as u64;
        let (limit, max) = match decl.kind {
            BindingKind::Storage => (
                "max_storage_buffer_binding_size",
                u64::from(limits.max_storage_buffer_binding_size),
            ),
            BindingKind::Uniform => (
                "max_uniform_buffer_binding_size",
                u64::from(limits.max_uniform_buffer_binding_size),
            ),
        };
        if len > max {
            return Err(ComputeError::UnsupportedLimits { limit, requested: len, supported: max });
        }
        if len > limits.max_buffer_size {
            return Err(ComputeError::UnsupportedLimits {
                limit: "max_buffer_size",
                requested: len,
                supported: limits.max_buffer_size,
            });
        }
    }

    if let Some(missing) = layout.bindings().keys().find(|slot| !supplied.contains_key(slot)) {
        return Err(mismatch(format!(
            "{missing} is declared by `{}` but not supplied",
            layout.entry_point()
        )));
    }
    Ok(supplied)
}

/// Validates `groups` against `layout`, then creates one backend buffer per
/// declared binding, uploading host bytes wherever the kernel reads them.
///
/// # Errors
///
/// [`ComputeError::BindingMismatch`] or [`ComputeError::UnsupportedLimits`]
/// before any buffer is created; otherwise whatever the backend reports.
pub fn marshal<'g, B: ComputeBackend>(
    backend: &B,
    device: &B::Device,
    layout: &ShaderLayout,
    limits: &DeviceLimits,
    groups: &'g mut [BindGroup<'_>],
) -> Result<Marshalled<'g, B>, ComputeError> {
    let mut gpu_groups: Vec<GpuBindGroup<B::Buffer>> = Vec::new();
    {
        let supplied = validate(layout, limits, groups)?;
        for (slot, decl) in layout.bindings() {
            let binder = supplied
                .get(slot)
                .ok_or_else(|| mismatch(format!("{slot} is declared but not supplied")))?;
            let request = BufferRequest {
                slot: *slot,
                kind: decl.kind,
                access: decl.access,
                len: binder.len() as u64,
                contents: decl.access.uploads().then(|| binder.buffer.bytes()),
            };
            let buffer = backend.create_buffer(device, &request)?;
            let binding = GpuBinding { slot: *slot, access: decl.access, len: request.len, buffer };
            match gpu_groups.last_mut() {
                Some(group) if group.group == slot.group => group.bindings.push(binding),
                _ => gpu_groups.push(GpuBindGroup { group: slot.group, bindings: vec![binding] }),
            }
        }
    }

    let mut views: Vec<BufferView<'g>> = groups
        .iter_mut()
        .flat_map(|group| {
            let id = group.group;
            group.binders.iter_mut().map(move |binder| (BindingSlot::new(id, binder.bind), binder))
        })
        .filter_map(|(slot, binder)| {
            let access = layout.binding(slot)?.access;
            match &mut binder.buffer {
                HostBuffer::Exclusive(target) if access.reads_back() => {
                    Some(BufferView { slot, access, target: &mut **target })
                }
                _ => None,
            }
        })
        .collect();
    views.sort_by_key(|view| view.slot);

    Ok(Marshalled { groups: gpu_groups, views })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BindingDecl;

    fn add_layout() -> ShaderLayout {
        let decl = |access| BindingDecl { kind: BindingKind::Storage, access, name: None };
        ShaderLayout::new(
            "main",
            [10, 1, 1],
            [
                (BindingSlot::new(0, 0), decl(Access::ReadWrite)),
                (BindingSlot::new(0, 1), decl(Access::Read)),
            ],
        )
    }

    fn check(groups: &[BindGroup<'_>]) -> Result<Vec<BindingSlot>, ComputeError> {
        validate(&add_layout(), &DeviceLimits::default(), groups).map(|map| map.into_keys().collect())
    }

    #[test]
    fn accepts_matching_layout_in_any_order() {
        let mut out = [0u8; 8];
        let input = [0u8; 8];
        let groups = [BindGroup::new(0, vec![DataBinder::read(1, &input), DataBinder::read_write(0, &mut out)])];
        assert_eq!(check(&groups), Ok(vec![BindingSlot::new(0, 0), BindingSlot::new(0, 1)]));
    }

    #[test]
    fn rejects_undeclared_slot() {
        let mut out = [0u8; 8];
        let input = [0u8; 8];
        let extra = [0u8; 4];
        let groups = [BindGroup::new(
            0,
            vec![DataBinder::read_write(0, &mut out), DataBinder::read(1, &input), DataBinder::read(2, &extra)],
        )];
        assert!(matches!(check(&groups), Err(ComputeError::BindingMismatch(msg)) if msg.contains("@binding(2)")));
    }

    #[test]
    fn rejects_missing_slot() {
        let mut out = [0u8; 8];
        let groups = [BindGroup::new(0, vec![DataBinder::read_write(0, &mut out)])];
        assert!(matches!(check(&groups), Err(ComputeError::BindingMismatch(msg)) if msg.contains("not supplied")));
    }

    #[test]
    fn rejects_duplicate_group_and_slot() {
        let input = [0u8; 8];
        let groups = [
            BindGroup::new(0, vec![DataBinder::read(1, &input)]),
            BindGroup::new(0, vec![DataBinder::read(1, &input)]),
        ];
        assert!(matches!(check(&groups), Err(ComputeError::BindingMismatch(msg)) if msg.contains("@group(0)")));

        let groups = [BindGroup::new(0, vec![DataBinder::read(1, &input), DataBinder::read(1, &input)])];
        assert!(matches!(check(&groups), Err(ComputeError::BindingMismatch(msg)) if msg.contains("more than once")));
    }

    #[test]
    fn writable_binding_must_be_exclusive() {
        let out = [0u8; 8];
        let input = [0u8; 8];
        let groups = [BindGroup::new(0, vec![DataBinder::read(0, &out), DataBinder::read(1, &input)])];
        assert!(matches!(check(&groups), Err(ComputeError::BindingMismatch(msg)) if msg.contains("read-only")));
    }

    #[test]
    fn rejects_empty_buffer() {
        let mut out = [0u8; 0];
        let input = [0u8; 8];
        let groups = [BindGroup::new(0, vec![DataBinder::read_write(0, &mut out), DataBinder::read(1, &input)])];
        assert!(matches!(check(&groups), Err(ComputeError::BindingMismatch(msg)) if msg.contains("empty")));
    }

    #[test]
    fn oversized_buffer_is_a_limit_error() {
        let limits = DeviceLimits { max_storage_buffer_binding_size: 4, ..DeviceLimits::default() };
        let mut out = [0u8; 8];
        let input = [0u8; 4];
        let groups = [BindGroup::new(0, vec![DataBinder::read_write(0, &mut out), DataBinder::read(1, &input)])];
        assert!(matches!(
            validate(&add_layout(), &limits, &groups),
            Err(ComputeError::UnsupportedLimits { limit: "max_storage_buffer_binding_size", requested: 8, .. })
        ));
    }

    #[test]
    fn view_write_back_is_length_checked() {
        let mut target = [1u8; 4];
        let mut view = BufferView { slot: BindingSlot::new(0, 0), access: Access::ReadWrite, target: &mut target };
        assert!(view.write_back(&[9; 3]).is_err());
        view.write_back(&[2; 4]).unwrap();
        assert_eq!(target, [2; 4]);
    }
}
