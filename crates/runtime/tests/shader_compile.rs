use std::fs;
use std::path::Path;

fn validate_wgsl_shader(shader_path_str: &str) -> naga::Module {
    let shader_path = Path::new(shader_path_str);
    let shader_source = match fs::read_to_string(shader_path) {
        Ok(s) => s,
        Err(e) => panic!("Failed to read shader file {shader_path:?}: {e}"),
    };

    let module = match naga::front::wgsl::parse_str(&shader_source) {
        Ok(m) => m,
        Err(e) => panic!(
            "WGSL parsing error in {shader_path:?}:\n{}",
            e.emit_to_string(&shader_source)
        ),
    };

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    if let Err(e) = validator.validate(&module) {
        panic!(
            "WGSL validation error in {shader_path:?}:\n{}",
            e.emit_to_string(&shader_source)
        );
    }
    module
}

#[test]
fn add_assign_shader_compiles() {
    let module = validate_wgsl_shader("../../shaders/add_assign.wgsl");
    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.name == "main")
        .expect("add_assign.wgsl has no `main` entry point");
    assert_eq!(entry.stage, naga::ShaderStage::Compute);
    assert_eq!(entry.workgroup_size, [10, 1, 1]);
}

#[test]
fn add_assign_layout_matches_driver() {
    let source = fs::read_to_string("../../shaders/add_assign.wgsl").unwrap();
    let layout = kernel_dispatch::layout::reflect(&source, "main").unwrap();
    let slots: Vec<String> = layout.bindings().keys().map(ToString::to_string).collect();
    assert_eq!(slots, ["@group(0) @binding(0)", "@group(0) @binding(1)"]);
}
