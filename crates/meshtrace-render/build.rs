//! Compiles the ray tracing program from WGSL to SPIR-V.

use std::path::PathBuf;

use naga::back::spv;
use naga::valid::{Capabilities, ValidationFlags, Validator};

const SHADER: &str = "shaders/raytrace.wgsl";

fn main() {
    println!("cargo:rerun-if-changed={SHADER}");

    let source = std::fs::read_to_string(SHADER)
        .unwrap_or_else(|e| panic!("failed to read {SHADER}: {e}"));
    let module = naga::front::wgsl::parse_str(&source)
        .unwrap_or_else(|e| panic!("{}", e.emit_to_string(&source)));

    let info = Validator::new(
        ValidationFlags::all(),
        Capabilities::RAY_QUERY | Capabilities::PUSH_CONSTANT,
    )
    .validate(&module)
    .unwrap_or_else(|e| panic!("{SHADER} failed validation: {e:?}"));

    let options = spv::Options {
        lang_version: (1, 4),
        ..spv::Options::default()
    };
    let pipeline = spv::PipelineOptions {
        shader_stage: naga::ShaderStage::Compute,
        entry_point: "main".to_string(),
    };
    let words = spv::write_vec(&module, &info, &options, Some(&pipeline))
        .unwrap_or_else(|e| panic!("SPIR-V generation for {SHADER} failed: {e}"));

    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let out = PathBuf::from(std::env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo"))
        .join("raytrace.spv");
    std::fs::write(&out, bytes).unwrap_or_else(|e| panic!("failed to write {}: {e}", out.display()));
}
