use crate::backend::mock_cpu::CpuInvocation;

/// Host twin of `add_assign.wgsl`: `out[idx] += in[idx]` with
/// `idx = global_id.x % len`, where `out` is `@group(0) @binding(0)` and
/// `in` is `@group(0) @binding(1)`.
///
/// Every invocation of the grid runs, so dispatching more than one workgroup
/// along y or z adds `in` more than once, exactly as the device would.
pub fn add_assign_u32(inv: &mut CpuInvocation<'_>) -> Result<(), String> {
    let input = inv.words(0, 1)?.to_vec();
    let len = inv.len(0, 0)? / 4;
    if len == 0 {
        return Ok(());
    }
    if input.len() < len {
        return Err(format!("input holds {} words, output {len}", input.len()));
    }

    let [gx, gy, gz] = inv.global_size();
    let out = inv.words_mut(0, 0)?;
    for _ in 0..gy * gz {
        for x in 0..gx {
            // Lossless: the remainder is below `len`.
            #[allow(clippy::cast_possible_truncation)]
            let idx = (x % len as u64) as usize;
            out[idx] = out[idx].wrapping_add(input[idx]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock_cpu::MockCpu;
    use crate::backend::{
        BufferRequest, ComputeBackend, DeviceRequest, DispatchCommand, GpuBindGroup, GpuBinding,
    };
    use crate::layout::{Access, BindingKind, BindingSlot, ShaderLayout};
    use crate::{Backend, DeviceLimits, MemoryHint};

    fn run(out: &[u32], input: &[u32], workgroups: [u32; 3]) -> Vec<u32> {
        let cpu = MockCpu::new().with_kernel("main", add_assign_u32);
        let adapter = &cpu.enumerate_adapters(Backend::Vulkan)[0];
        let request = DeviceRequest {
            label: "add".into(),
            limits: DeviceLimits::default(),
            memory: MemoryHint::Performance,
        };
        let (device, queue) = cpu.create_device(adapter, &request).unwrap();
        let pipeline = cpu
            .compile_pipeline(&device, "", &ShaderLayout::new("main", [10, 1, 1], []))
            .unwrap();

        let bind = |binding, access, bytes: &[u8]| {
            let slot = BindingSlot::new(0, binding);
            let req = BufferRequest {
                slot,
                kind: BindingKind::Storage,
                access,
                len: bytes.len() as u64,
                contents: Some(bytes),
            };
            GpuBinding { slot, access, len: req.len, buffer: cpu.create_buffer(&device, &req).unwrap() }
        };
        let groups = [GpuBindGroup {
            group: 0,
            bindings: vec![
                bind(0, Access::ReadWrite, bytemuck::cast_slice(out)),
                bind(1, Access::Read, bytemuck::cast_slice(input)),
            ],
        }];
        let command = DispatchCommand::<MockCpu> { pipeline: &pipeline, groups: &groups, workgroups };
        let bytes = cpu.submit_and_wait(&device, &queue, &command).unwrap();
        bytemuck::cast_slice::<u8, u32>(&bytes[0]).to_vec()
    }

    #[test]
    fn adds_elementwise() {
        let out: Vec<u32> = (1..=10).collect();
        let input: Vec<u32> = (1..=10).map(|v| v * 10).collect();
        let expected: Vec<u32> = (1..=10).map(|v| v * 11).collect();
        assert_eq!(run(&out, &input, [1, 1, 1]), expected);
    }

    #[test]
    fn extra_invocations_wrap_around() {
        // 10 invocations over 4 elements: indices 0 and 1 are hit three times.
        assert_eq!(run(&[0; 4], &[1; 4], [1, 1, 1]), vec![3, 3, 2, 2]);
    }

    #[test]
    fn short_grid_leaves_tail_untouched() {
        let out = vec![1u32; 25];
        let result = run(&out, &vec![1; 25], [2, 1, 1]);
        assert!(result[..20].iter().all(|&v| v == 2));
        assert!(result[20..].iter().all(|&v| v == 1));
    }

    #[test]
    fn addition_wraps_on_overflow() {
        assert_eq!(run(&[u32::MAX; 10], &[2; 10], [1, 1, 1]), vec![1; 10]);
    }
}
