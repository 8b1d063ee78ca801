// Runs against whatever adapter the machine has; skips when there is none.

#[cfg(feature = "gpu")]
mod wgpu_tests {
    use kernel_dispatch::{
        BindGroup, ComputeError, ComputeRuntime, DataBinder, Kernel, ResourceHandle, WgpuBackend,
    };

    const ADD_ASSIGN: &str = include_str!("../../../shaders/add_assign.wgsl");

    fn runtime_with_device() -> Option<(ComputeRuntime<WgpuBackend>, ResourceHandle)> {
        let runtime = kernel_dispatch::default_runtime();
        match runtime.create_default() {
            Ok(resource) => Some((runtime, resource)),
            Err(err) => {
                eprintln!("skipping: no usable adapter ({err})");
                None
            }
        }
    }

    #[test]
    fn add_assign_matches_host() {
        let Some((runtime, resource)) = runtime_with_device() else {
            return;
        };
        let code = runtime.register_computing_kernel_code(resource, ADD_ASSIGN, "main").unwrap();

        let mut out = vec![1u32; 60_000];
        let input = vec![1u32; 60_000];
        let kernel = Kernel::new(6_000, 1, 1).with_config(resource).with_kernel_code(code);
        let mut groups = [BindGroup::new(
            0,
            vec![
                DataBinder::read_write(0, bytemuck::cast_slice_mut(&mut out)),
                DataBinder::read(1, bytemuck::cast_slice(&input)),
            ],
        )];
        runtime.compute(&kernel, &mut groups).unwrap();
        drop(groups);

        for idx in [0, 4, 50_000, 59_999] {
            assert_eq!(out[idx], 2, "index {idx}");
        }
    }

    #[test]
    fn repeated_dispatch_is_deterministic() {
        let Some((runtime, resource)) = runtime_with_device() else {
            return;
        };
        let code = runtime.register_computing_kernel_code(resource, ADD_ASSIGN, "main").unwrap();
        let input: Vec<u32> = (0..20).collect();

        let run = || {
            let mut out: Vec<u32> = (0..20).rev().collect();
            let kernel = Kernel::new(2, 1, 1).with_config(resource).with_kernel_code(code);
            let mut groups = [BindGroup::new(
                0,
                vec![
                    DataBinder::read_write(0, bytemuck::cast_slice_mut(&mut out)),
                    DataBinder::read(1, bytemuck::cast_slice(&input)),
                ],
            )];
            runtime.compute(&kernel, &mut groups).unwrap();
            drop(groups);
            out
        };
        let first = run();
        assert_eq!(first, run());
        assert!(first.iter().all(|&v| v == 19));
    }

    #[test]
    fn bad_shader_is_a_compilation_error() {
        let Some((runtime, resource)) = runtime_with_device() else {
            return;
        };
        assert!(matches!(
            runtime.register_computing_kernel_code(resource, "@compute fn main( {", "main"),
            Err(ComputeError::Compilation(_))
        ));
    }

    #[test]
    fn lists_at_least_the_selected_adapter() {
        let Some((runtime, _)) = runtime_with_device() else {
            return;
        };
        let devices = runtime.get_computing_gpu_infos(kernel_dispatch::Backend::All);
        assert!(!devices.is_empty());
        runtime.free_gpu_devices_infos(devices);
    }
}
