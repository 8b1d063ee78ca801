//! One synchronous compute round trip: validate, upload, dispatch, wait,
//! write back.

use crate::backend::{ComputeBackend, DispatchCommand};
use crate::binding::{self, BindGroup};
use crate::cache::ResourceDescriptor;
use crate::kernel_cache::KernelEntry;
use crate::{ComputeError, DeviceLimits};

pub struct DispatchEngine<'a, B: ComputeBackend> {
    backend: &'a B,
    descriptor: &'a ResourceDescriptor<B>,
}

impl<'a, B: ComputeBackend> DispatchEngine<'a, B> {
    pub fn new(backend: &'a B, descriptor: &'a ResourceDescriptor<B>) -> Self {
        Self { backend, descriptor }
    }

    /// Runs `kernel` over `workgroups` with `groups` bound, blocking until the
    /// device finishes. Writable bindings are copied back into the caller's
    /// buffers only if every step succeeded.
    ///
    /// # Errors
    ///
    /// - [`ComputeError::InvalidArgument`] for a zero workgroup count.
    /// - [`ComputeError::UnsupportedLimits`] for a count above the device limit.
    /// - [`ComputeError::BindingMismatch`] when `groups` disagrees with the
    ///   kernel's declared layout.
    /// - [`ComputeError::DeviceLost`] if the device goes away; the descriptor is
    ///   marked lost.
    pub fn dispatch(
        &self,
        kernel: &KernelEntry<B>,
        workgroups: [u32; 3],
        groups: &mut [BindGroup<'_>],
    ) -> Result<(), ComputeError> {
        let descriptor = self.descriptor;
        if descriptor.is_lost() {
            return Err(ComputeError::DeviceLost(format!("{} lost its device", descriptor.handle())));
        }
        check_workgroups(workgroups, descriptor.limits())?;

        let _submission = descriptor.lock_submission();
        let mut marshalled = binding::marshal(
            self.backend,
            descriptor.device(),
            kernel.layout(),
            descriptor.limits(),
            groups,
        )?;

        let command = DispatchCommand::<B> {
            pipeline: kernel.pipeline(),
            groups: &marshalled.groups,
            workgroups,
        };
        tracing::debug!(
            "dispatching {} over {workgroups:?} on {}",
            kernel.handle(),
            descriptor.handle()
        );
        let results = match self.backend.submit_and_wait(descriptor.device(), descriptor.queue(), &command) {
            Ok(results) => results,
            Err(err @ ComputeError::DeviceLost(_)) => {
                descriptor.mark_lost();
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if results.len() != marshalled.views.len() {
            return Err(ComputeError::BindingMismatch(format!(
                "backend returned {} read-back buffers for {} writable bindings",
                results.len(),
                marshalled.views.len()
            )));
        }
        for (view, bytes) in marshalled.views.iter().zip(&results) {
            view.accepts(bytes)?;
        }
        for (view, bytes) in marshalled.views.iter_mut().zip(&results) {
            view.write_back(bytes)?;
        }
        Ok(())
    }
}

fn check_workgroups(workgroups: [u32; 3], limits: &DeviceLimits) -> Result<(), ComputeError> {
    if workgroups.contains(&0) {
        return Err(ComputeError::InvalidArgument(format!(
            "workgroup counts must be positive, got {workgroups:?}"
        )));
    }
    let max = limits.max_compute_workgroups_per_dimension;
    if let Some(&count) = workgroups.iter().find(|&&count| count > max) {
        return Err(ComputeError::UnsupportedLimits {
            limit: "max_compute_workgroups_per_dimension",
            requested: u64::from(count),
            supported: u64::from(max),
        });
    }
    Ok(())
}
