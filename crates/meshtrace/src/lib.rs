//! meshtrace: offscreen GPU ray tracing of triangle meshes.
//!
//! A [`Renderer`] uploads a mesh, builds a two-level hardware acceleration
//! structure over it, dispatches one ray per pixel from a compute shader
//! and reads the radiance back after an explicit write-to-host barrier.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshtrace::*;
//!
//! fn main() -> Result<()> {
//!     let ctx = Arc::new(GpuContext::new(&ContextConfig::default())?);
//!     let renderer = Renderer::new(ctx, RenderConfig::default())?;
//!     let mesh = load_obj("scenes/CornellBox-Original-Merged.obj")?;
//!     let image = renderer.render(&mesh)?;
//!     write_image("out.hdr", &image)?;
//!     Ok(())
//! }
//! ```

// Documentation lints - internal functions don't need exhaustive panic/error docs
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod obj;
pub mod output;

use std::sync::Arc;

use meshtrace_core::{
    BlasIndex, BoundResource, BufferDesc, BufferId, BufferUsage, DispatchGrid, LayoutDecl,
    MemoryVisibility, TriangleGeometry, INDEX_SLOT, OUTPUT_SLOT, TLAS_SLOT, VERTEX_SLOT,
};
use meshtrace_render::{
    dispatch, insert_write_to_host_barrier, AccelerationStructureBuilder, BindingLayer,
    BufferManager, CommandExecutor, ComputeProgram, PushConstants,
};

pub use error::{MeshtraceError, Result};
pub use obj::load_obj;
pub use output::{write_image, RadianceImage};

// Re-export the layers underneath the facade
pub use meshtrace_core::{
    Affine3A, BuildFlags, CameraConfig, ContextConfig, CoreError, DegeneratePolicy, InstanceDesc,
    Mesh, ReferenceTracer, RenderConfig, ShadingMode, TileSize, Vec3,
};
pub use meshtrace_render::{GpuContext, RenderError};

/// Word written over the whole output before dispatch: a quiet NaN with a
/// payload the shader never produces.
pub const POISON_WORD: u32 = 0x7FC0_DEAD;

/// Renders meshes with one device and one configuration.
pub struct Renderer {
    ctx: Arc<GpuContext>,
    config: RenderConfig,
}

impl Renderer {
    /// Validates `config` against the device context.
    pub fn new(ctx: Arc<GpuContext>, config: RenderConfig) -> Result<Self> {
        config.validate()?;
        log::info!(
            "renderer: {}x{} on {}, {:?} shading",
            config.width,
            config.height,
            ctx.device_name(),
            config.shading
        );
        Ok(Self { ctx, config })
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    /// Traces `mesh` under a single identity instance.
    ///
    /// Every GPU object the render creates is destroyed before returning,
    /// on success and on error.
    pub fn render(&self, mesh: &Mesh) -> Result<RadianceImage> {
        self.render_instances(mesh, &[InstanceDesc::new(BlasIndex(0))])
    }

    /// Traces `mesh` placed once per instance. Every instance must refer to
    /// BLAS 0, the structure built over `mesh`.
    pub fn render_instances(&self, mesh: &Mesh, instances: &[InstanceDesc]) -> Result<RadianceImage> {
        let config = &self.config;
        config.degenerate_policy.apply(mesh)?;

        let executor = CommandExecutor::new(Arc::clone(&self.ctx))?;
        let mut buffers = BufferManager::new(Arc::clone(&self.ctx));
        let mut accel = AccelerationStructureBuilder::new(Arc::clone(&self.ctx));
        let bindings = BindingLayer::new(Arc::clone(&self.ctx));

        // Upload: both buffers share one sequence.
        let input_usage =
            BufferUsage::STORAGE | BufferUsage::BUILD_INPUT | BufferUsage::DEVICE_ADDRESS;
        let seq = executor.begin_one_shot()?;
        let vertices = buffers.upload_initialized(&seq, "vertices", mesh.vertex_bytes(), input_usage)?;
        let indices = buffers.upload_initialized(&seq, "indices", mesh.index_bytes(), input_usage)?;
        executor.submit_and_wait(seq)?;
        buffers.finalize_and_release_staging(&executor)?;
        log::info!(
            "uploaded {} vertices ({} bytes) and {} triangles ({} bytes)",
            mesh.vertex_count(),
            mesh.vertex_bytes().len(),
            mesh.triangle_count(),
            mesh.index_bytes().len()
        );

        // Acceleration structures.
        let geometry = TriangleGeometry::from_mesh(mesh, vertices, indices);
        let blas = accel.build_bottom_level(&executor, &mut buffers, &[geometry], config.build_flags)?;
        let tlas = accel.build_top_level(&executor, &mut buffers, instances, config.build_flags)?;

        // Output and bindings.
        let output = buffers.create_buffer(BufferDesc::new(
            "radiance",
            config.output_size(),
            BufferUsage::STORAGE,
            MemoryVisibility::HostVisible,
        ))?;
        if config.poison_output {
            buffers.map(output, &executor)?.fill_words(POISON_WORD);
        }

        let layout = Arc::new(
            bindings.declare_layout(LayoutDecl::ray_tracing().slots().to_vec(), PushConstants::SIZE)?,
        );
        let mut set = bindings.allocate_binding_set(&layout)?;
        for (slot, resource) in [
            (OUTPUT_SLOT, BoundResource::Buffer(output)),
            (TLAS_SLOT, BoundResource::Tlas(tlas)),
            (VERTEX_SLOT, BoundResource::Buffer(vertices)),
            (INDEX_SLOT, BoundResource::Buffer(indices)),
        ] {
            bindings.bind(&mut set, slot, resource, &mut buffers, &mut accel)?;
        }
        let program = match &config.shader_path {
            Some(path) => {
                ComputeProgram::from_file(Arc::clone(&self.ctx), Arc::clone(&layout), path, config.tile)?
            }
            None => ComputeProgram::builtin(Arc::clone(&self.ctx), Arc::clone(&layout))?,
        };

        // Dispatch and barrier share one sequence.
        let grid = DispatchGrid::covering(config.width, config.height, config.tile);
        log::info!("dispatching {grid}");
        let push = PushConstants::from_config(config);
        let seq = executor.begin_one_shot()?;
        dispatch(&seq, &program, &mut set, grid, bytemuck::bytes_of(&push), &mut buffers)?;
        insert_write_to_host_barrier(&seq, &mut buffers, &[output])?;
        executor.submit_and_wait(seq)?;

        let data: Vec<f32> = buffers.map(output, &executor)?.to_vec();
        if config.poison_output {
            check_overwritten(&data)?;
        }

        // Teardown in reverse dependency order.
        drop(program);
        bindings.destroy_set(set, &mut buffers, &mut accel)?;
        drop(layout);
        accel.destroy_tlas(tlas, &mut buffers)?;
        accel.destroy_blas(blas, &mut buffers)?;
        for id in [output, vertices, indices] {
            buffers.destroy(id)?;
        }
        log::debug!("render complete, {} buffer(s) left", buffers.len());

        RadianceImage::new(config.width, config.height, data)
    }

    /// Uploads `data` and reads it back through the device.
    ///
    /// Exercises the staging and readback paths without building anything.
    pub fn round_trip(&self, data: &[u8]) -> Result<Vec<u8>> {
        let executor = CommandExecutor::new(Arc::clone(&self.ctx))?;
        let mut buffers = BufferManager::new(Arc::clone(&self.ctx));
        let seq = executor.begin_one_shot()?;
        let id: BufferId =
            buffers.upload_initialized(&seq, "round trip", data, BufferUsage::TRANSFER_SRC)?;
        executor.submit_and_wait(seq)?;
        buffers.finalize_and_release_staging(&executor)?;
        let bytes = buffers.read_back(id, &executor)?;
        buffers.destroy(id)?;
        Ok(bytes)
    }
}

/// Fails if any output word still holds [`POISON_WORD`].
fn check_overwritten(data: &[f32]) -> Result<()> {
    let count = data.iter().filter(|v| v.to_bits() == POISON_WORD).count();
    if count > 0 {
        return Err(RenderError::OutputNotOverwritten { count }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poison_is_nan() {
        assert!(f32::from_bits(POISON_WORD).is_nan());
    }

    #[test]
    fn test_check_overwritten() {
        let mut data = vec![0.25f32; 12];
        assert!(check_overwritten(&data).is_ok());
        data[3] = f32::from_bits(POISON_WORD);
        data[7] = f32::from_bits(POISON_WORD);
        let err = check_overwritten(&data).unwrap_err();
        assert!(matches!(
            err,
            MeshtraceError::Render(RenderError::OutputNotOverwritten { count: 2 })
        ));
    }

    #[test]
    fn test_other_nans_count_as_written() {
        assert!(check_overwritten(&[f32::NAN, 1.0, 0.0]).is_ok());
    }
}
