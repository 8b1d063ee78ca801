//! Per-descriptor store of compiled kernels.

use crate::backend::ComputeBackend;
use crate::handle::{HandleTable, KernelHandle, ResourceHandle};
use crate::layout::{self, ShaderLayout};
use crate::{ComputeError, DeviceLimits};
use std::sync::Arc;

pub struct KernelEntry<B: ComputeBackend> {
    handle: KernelHandle,
    source: String,
    layout: ShaderLayout,
    pipeline: B::Pipeline,
}

impl<B: ComputeBackend> KernelEntry<B> {
    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entry_point(&self) -> &str {
        self.layout.entry_point()
    }

    /// Binding layout reflected at registration.
    pub fn layout(&self) -> &ShaderLayout {
        &self.layout
    }

    pub fn pipeline(&self) -> &B::Pipeline {
        &self.pipeline
    }
}

pub struct KernelCodeCache<B: ComputeBackend> {
    owner: ResourceHandle,
    table: HandleTable<Arc<KernelEntry<B>>>,
}

impl<B: ComputeBackend> KernelCodeCache<B> {
    pub fn new(owner: ResourceHandle) -> Self {
        Self { owner, table: HandleTable::default() }
    }

    /// Reflects, checks and compiles `source`, then appends the entry. Nothing
    /// is appended unless every step succeeds.
    pub fn register(
        &mut self,
        backend: &B,
        device: &B::Device,
        limits: &DeviceLimits,
        source: &str,
        entry_point: &str,
    ) -> Result<KernelHandle, ComputeError> {
        let layout = layout::reflect(source, entry_point)?;
        layout.check_limits(limits)?;
        let pipeline = backend.compile_pipeline(device, source, &layout)?;

        let owner = self.owner;
        let (index, generation) = self.table.insert_with(|index, generation| {
            Arc::new(KernelEntry {
                handle: KernelHandle::new(owner, index, generation),
                source: source.to_owned(),
                layout,
                pipeline,
            })
        });
        let handle = KernelHandle::new(owner, index, generation);
        tracing::debug!("registered {handle} (`{entry_point}`)");
        Ok(handle)
    }

    pub fn get(&self, handle: KernelHandle) -> Result<Arc<KernelEntry<B>>, ComputeError> {
        if handle.resource() != self.owner {
            return Err(ComputeError::InvalidIndex(format!(
                "{handle} does not belong to {}",
                self.owner
            )));
        }
        self.table
            .get(handle.index(), handle.generation())
            .cloned()
            .ok_or_else(|| ComputeError::InvalidIndex(format!("{handle} is not a live kernel")))
    }

    pub fn clear(&mut self) -> usize {
        let freed = self.table.clear().len();
        tracing::debug!("freed {freed} kernel(s) under {}", self.owner);
        freed
    }

    pub fn live(&self) -> usize {
        self.table.live()
    }
}
