//! Compute programs and their push constants.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use meshtrace_core::{RenderConfig, TileSize};

use crate::binding::BindingLayout;
use crate::context::GpuContext;
use crate::error::{RenderError, RenderResult, VkResultExt};

/// SPIR-V of the built-in ray tracing program, compiled from
/// `shaders/raytrace.wgsl` by the build script.
pub static RAYTRACE_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/raytrace.spv"));

/// Push constants of the ray tracing program.
///
/// Layout matches `Params` in `raytrace.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PushConstants {
    pub width: u32,
    pub height: u32,
    pub shading: u32,
    _pad: u32,
    /// xyz = eye position, w = vertical slope.
    pub camera: [f32; 4],
    /// xyz = background colour.
    pub background: [f32; 4],
}

impl PushConstants {
    /// Size in bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;

    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            shading: config.shading.shader_value(),
            _pad: 0,
            camera: Vec4::from((config.camera.origin, config.camera.vertical_slope)).to_array(),
            background: config.background.extend(0.0).to_array(),
        }
    }
}

/// A compute pipeline bound to a [`BindingLayout`].
pub struct ComputeProgram {
    ctx: Arc<GpuContext>,
    layout: Arc<BindingLayout>,
    module: vk::ShaderModule,
    pipeline: vk::Pipeline,
    tile: TileSize,
}

impl ComputeProgram {
    /// The ray tracing program built into the crate.
    pub fn builtin(ctx: Arc<GpuContext>, layout: Arc<BindingLayout>) -> RenderResult<Self> {
        Self::from_spirv(ctx, layout, RAYTRACE_SPV, TileSize::SHADER)
    }

    /// Loads a SPIR-V file whose `main` entry point uses `tile` as its
    /// workgroup size.
    pub fn from_file(
        ctx: Arc<GpuContext>,
        layout: Arc<BindingLayout>,
        path: &Path,
        tile: TileSize,
    ) -> RenderResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| RenderError::InvalidShader(format!("{}: {e}", path.display())))?;
        log::info!("loading compute program from {}", path.display());
        Self::from_spirv(ctx, layout, &bytes, tile)
    }

    /// Creates the pipeline from SPIR-V bytes.
    #[allow(unsafe_code)]
    pub fn from_spirv(
        ctx: Arc<GpuContext>,
        layout: Arc<BindingLayout>,
        spirv: &[u8],
        tile: TileSize,
    ) -> RenderResult<Self> {
        let words = ash::util::read_spv(&mut Cursor::new(spirv))
            .map_err(|e| RenderError::InvalidShader(e.to_string()))?;
        let device = ctx.device();
        let module = unsafe {
            device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&words), None)
        }
        .op("vkCreateShaderModule")?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout.pipeline_layout());
        let pipeline =
            match unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[info], None) } {
                Ok(pipelines) => pipelines[0],
                Err((_, result)) => {
                    unsafe { device.destroy_shader_module(module, None) };
                    return Err(RenderError::Vulkan {
                        op: "vkCreateComputePipelines",
                        result,
                    });
                }
            };

        Ok(Self {
            ctx,
            layout,
            module,
            pipeline,
            tile,
        })
    }

    /// The layout the program was created against.
    pub fn layout(&self) -> &BindingLayout {
        &self.layout
    }

    /// Workgroup footprint.
    pub fn tile(&self) -> TileSize {
        self.tile
    }

    pub(crate) fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }
}

impl Drop for ComputeProgram {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use meshtrace_core::ShadingMode;

    #[test]
    fn test_push_constant_layout() {
        assert_eq!(PushConstants::SIZE, 48);
        assert_eq!(std::mem::offset_of!(PushConstants, camera), 16);
        assert_eq!(std::mem::offset_of!(PushConstants, background), 32);
    }

    #[test]
    fn test_from_config() {
        let config = RenderConfig {
            shading: ShadingMode::GeometricNormal,
            background: Vec3::new(0.1, 0.2, 0.3),
            ..RenderConfig::default()
        };
        let pc = PushConstants::from_config(&config);
        assert_eq!((pc.width, pc.height), (800, 600));
        assert_eq!(pc.shading, 1);
        assert_eq!(pc.camera, [-0.001, 1.0, 6.0, 0.2]);
        assert_eq!(pc.background, [0.1, 0.2, 0.3, 0.0]);
    }

    #[test]
    fn test_builtin_spirv_is_words() {
        assert_eq!(RAYTRACE_SPV.len() % 4, 0);
        let words = ash::util::read_spv(&mut Cursor::new(RAYTRACE_SPV)).unwrap();
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn test_truncated_spirv_is_rejected() {
        assert!(ash::util::read_spv(&mut Cursor::new(&RAYTRACE_SPV[..6])).is_err());
    }
}
