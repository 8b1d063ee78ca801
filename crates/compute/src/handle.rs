//! Generational handles over append-only tables.
//!
//! Slots are never reused: a freed slot stays tombstoned forever and its
//! generation is bumped, so a stale handle can only ever resolve to "invalid".

use std::fmt;

/// Handle to a cached resource descriptor (device + queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle {
    index: usize,
    generation: u32,
}

impl ResourceHandle {
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource#{}v{}", self.index, self.generation)
    }
}

/// Handle to a compiled kernel. Indices are local to the owning resource,
/// which the handle carries along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelHandle {
    resource: ResourceHandle,
    index: usize,
    generation: u32,
}

impl KernelHandle {
    #[must_use]
    pub const fn resource(&self) -> ResourceHandle {
        self.resource
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/kernel#{}v{}", self.resource, self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub(crate) struct HandleTable<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> HandleTable<T> {
    /// Appends `value` and returns its `(index, generation)`.
    pub(crate) fn insert(&mut self, value: T) -> (usize, u32) {
        let index = self.slots.len();
        self.slots.push(Slot { generation: 0, value: Some(value) });
        (index, 0)
    }

    /// Like [`insert`](Self::insert), but builds the value from the
    /// `(index, generation)` it is about to occupy.
    pub(crate) fn insert_with(&mut self, make: impl FnOnce(usize, u32) -> T) -> (usize, u32) {
        let value = make(self.slots.len(), 0);
        self.insert(value)
    }

    pub(crate) fn get(&self, index: usize, generation: u32) -> Option<&T> {
        self.slots
            .get(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn remove(&mut self, index: usize, generation: u32) -> Option<T> {
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(value)
    }

    /// Tombstones every live slot and hands back the removed values.
    pub(crate) fn clear(&mut self) -> Vec<T> {
        self.slots
            .iter_mut()
            .filter_map(|slot| {
                let value = slot.value.take()?;
                slot.generation = slot.generation.wrapping_add(1);
                Some(value)
            })
            .collect()
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }

    /// Number of indices ever issued.
    pub(crate) fn issued(&self) -> usize {
        self.slots.len()
    }
}

impl ResourceHandle {
    pub(crate) const fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl KernelHandle {
    pub(crate) const fn new(resource: ResourceHandle, index: usize, generation: u32) -> Self {
        Self { resource, index, generation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_monotonic_and_never_reused() {
        let mut table = HandleTable::default();
        let (a, ga) = table.insert("a");
        let (b, _) = table.insert("b");
        assert_eq!((a, b), (0, 1));

        assert_eq!(table.remove(a, ga), Some("a"));
        let (c, _) = table.insert("c");
        assert_eq!(c, 2);
        assert_eq!(table.issued(), 3);
        assert_eq!(table.live(), 2);
    }

    #[test]
    fn stale_handle_resolves_to_nothing() {
        let mut table = HandleTable::default();
        let (index, generation) = table.insert(7);
        assert_eq!(table.get(index, generation), Some(&7));
        table.remove(index, generation);
        assert_eq!(table.get(index, generation), None);
        assert_eq!(table.get(index, generation + 1), None);
        assert_eq!(table.remove(index, generation), None);
    }

    #[test]
    fn clear_tombstones_everything() {
        let mut table = HandleTable::default();
        let first = table.insert(1);
        table.insert(2);
        assert_eq!(table.clear(), vec![1, 2]);
        assert_eq!(table.live(), 0);
        assert_eq!(table.get(first.0, first.1), None);
        assert_eq!(table.insert(3).0, 2);
    }

    #[test]
    fn out_of_range_lookup_is_none() {
        let table: HandleTable<u8> = HandleTable::default();
        assert_eq!(table.get(42, 0), None);
    }

    #[test]
    fn display_includes_owner() {
        let resource = ResourceHandle::new(3, 0);
        let kernel = KernelHandle::new(resource, 1, 0);
        assert_eq!(kernel.to_string(), "resource#3v0/kernel#1v0");
    }
}
