//! Recording compute dispatches and the write-to-host barrier.

use ash::vk;
use meshtrace_core::{BufferId, CoreError, DispatchGrid};

use crate::binding::{layout_mismatch, BindingSet};
use crate::buffer::BufferManager;
use crate::command::OneShot;
use crate::error::RenderResult;
use crate::program::ComputeProgram;

/// Records `program` over `grid` into `seq`.
///
/// The set must be complete and allocated from the program's layout, and
/// `push_constants` must fill the layout's push constant range exactly. The
/// set is frozen by its first dispatch. Every bound buffer is tagged as
/// written by `seq`, so host-visible ones need
/// [`insert_write_to_host_barrier`] before they can be mapped.
#[allow(unsafe_code)]
pub fn dispatch(
    seq: &OneShot<'_>,
    program: &ComputeProgram,
    set: &mut BindingSet,
    grid: DispatchGrid,
    push_constants: &[u8],
    buffers: &mut BufferManager,
) -> RenderResult<()> {
    let layout = program.layout();
    if set.set_layout() != layout.set_layout() {
        return Err(layout_mismatch(layout.decl(), set.state().layout()).into());
    }
    set.state().ensure_complete()?;
    if grid.tile != program.tile() {
        return Err(CoreError::InvalidConfig(format!(
            "grid tile {}x{} does not match the program's {}x{} workgroup",
            grid.tile.width,
            grid.tile.height,
            program.tile().width,
            program.tile().height
        ))
        .into());
    }
    if push_constants.len() != layout.push_constant_size() as usize {
        return Err(CoreError::InvalidConfig(format!(
            "{} push constant bytes supplied, layout reserves {}",
            push_constants.len(),
            layout.push_constant_size()
        ))
        .into());
    }

    let device = seq.device();
    let cmd = seq.command_buffer();
    unsafe {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, program.pipeline());
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::COMPUTE,
            layout.pipeline_layout(),
            0,
            &[set.descriptor_set()],
            &[],
        );
        if !push_constants.is_empty() {
            device.cmd_push_constants(
                cmd,
                layout.pipeline_layout(),
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constants,
            );
        }
        device.cmd_dispatch(cmd, grid.groups_x, grid.groups_y, 1);
    }

    set.state_mut().mark_used();
    let written: Vec<BufferId> = set.state().buffers().collect();
    for id in written {
        buffers.record_device_write(id, seq.id())?;
    }
    log::debug!("sequence {}: dispatch {grid}", seq.id());
    Ok(())
}

/// Makes compute-shader writes to `targets` visible to host reads once
/// `seq` has executed.
///
/// Each target must be host-visible and written by a dispatch in `seq`.
pub fn insert_write_to_host_barrier(
    seq: &OneShot<'_>,
    buffers: &mut BufferManager,
    targets: &[BufferId],
) -> RenderResult<()> {
    seq.memory_barrier(
        vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::AccessFlags::SHADER_WRITE,
        vk::PipelineStageFlags::HOST,
        vk::AccessFlags::HOST_READ,
    );
    for &id in targets {
        buffers.record_host_barrier(id, seq.id())?;
    }
    Ok(())
}
