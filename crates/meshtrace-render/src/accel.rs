//! Two-level acceleration structure construction.
//!
//! Bottom-level structures are built one sequence each over resident
//! triangle buffers. A top-level build uploads its packed instance records,
//! orders the upload before the build with a barrier, and builds, all in a
//! single sequence.

use std::sync::Arc;

use ash::vk;
use meshtrace_core::{
    validate_geometries, validate_geometry_sizes, validate_instances, BlasIndex, BufferDesc,
    BufferId, BufferUsage, BuildFlags, BuildState, CoreError, HandleTable, InstanceDesc,
    InstanceRecord, MemoryVisibility, TlasId, TlasKind, TriangleGeometry,
};

use crate::buffer::BufferManager;
use crate::command::{CommandExecutor, OneShot};
use crate::context::GpuContext;
use crate::error::{RenderResult, VkResultExt};

/// Device address of a built bottom-level structure.
///
/// Only the builder creates these; the address stays valid until the
/// structure is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasAddress {
    index: BlasIndex,
    raw: vk::DeviceAddress,
}

impl BlasAddress {
    /// The structure this address belongs to.
    pub fn index(self) -> BlasIndex {
        self.index
    }

    pub(crate) fn raw(self) -> vk::DeviceAddress {
        self.raw
    }
}

struct Blas {
    handle: vk::AccelerationStructureKHR,
    storage: BufferId,
    address: vk::DeviceAddress,
    state: BuildState,
    // Live top-level structures that reference this one.
    users: u32,
}

struct Tlas {
    handle: vk::AccelerationStructureKHR,
    storage: BufferId,
    instances: BufferId,
    blases: Vec<BlasIndex>,
    state: BuildState,
}

/// A created but not yet built structure with its scratch memory.
struct Pending {
    handle: vk::AccelerationStructureKHR,
    storage: BufferId,
    scratch: BufferId,
    scratch_address: vk::DeviceAddress,
}

/// Builds and owns bottom- and top-level acceleration structures.
pub struct AccelerationStructureBuilder {
    ctx: Arc<GpuContext>,
    blases: Vec<Blas>,
    tlases: HandleTable<TlasKind, Tlas>,
}

fn vk_build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    match flags {
        BuildFlags::PreferFastTrace => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        BuildFlags::PreferFastBuild => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
    }
}

/// Rounds `address` up to a multiple of `alignment` (a power of two).
pub fn align_up(address: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (address + alignment - 1) & !(alignment - 1)
}

impl AccelerationStructureBuilder {
    /// Creates an empty builder.
    pub fn new(ctx: Arc<GpuContext>) -> Self {
        Self {
            ctx,
            blases: Vec::new(),
            tlases: HandleTable::new(),
        }
    }

    /// Builds a bottom-level structure over triangle geometries.
    ///
    /// Every geometry is validated, and every buffer it names must be
    /// resident with build-input usage and large enough for the declared
    /// counts, before any device call is made.
    #[allow(clippy::cast_possible_truncation)]
    pub fn build_bottom_level(
        &mut self,
        executor: &CommandExecutor,
        buffers: &mut BufferManager,
        geometries: &[TriangleGeometry],
        flags: BuildFlags,
    ) -> RenderResult<BlasIndex> {
        validate_geometries(geometries)?;
        validate_geometry_sizes(geometries, |id| buffers.desc(id).map(|d| d.size))?;
        {
            let tracker = executor.tracker();
            for g in geometries {
                buffers.require_build_input(g.vertex_buffer, &tracker)?;
                buffers.require_build_input(g.index_buffer, &tracker)?;
                if let Some(transform) = g.transform_buffer {
                    buffers.require_build_input(transform, &tracker)?;
                }
            }
        }

        let mut vk_geometries = Vec::with_capacity(geometries.len());
        for g in geometries {
            let transform_data = match g.transform_buffer {
                Some(id) => vk::DeviceOrHostAddressConstKHR {
                    device_address: buffers.device_address(id)?,
                },
                None => vk::DeviceOrHostAddressConstKHR::default(),
            };
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: buffers.device_address(g.vertex_buffer)?,
                })
                .vertex_stride(g.vertex_stride)
                .max_vertex(g.max_vertex())
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: buffers.device_address(g.index_buffer)?,
                })
                .transform_data(transform_data);
            let geometry_flags = if g.opaque {
                vk::GeometryFlagsKHR::OPAQUE
            } else {
                vk::GeometryFlagsKHR::empty()
            };
            vk_geometries.push(
                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .flags(geometry_flags),
            );
        }
        let ranges: Vec<_> = geometries
            .iter()
            .map(|g| vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(g.triangle_count()))
            .collect();
        let counts: Vec<u32> = geometries.iter().map(TriangleGeometry::triangle_count).collect();

        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk_build_flags(flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&vk_geometries);

        let index = BlasIndex(self.blases.len() as u32);
        let pending = self.create_pending(buffers, &info, &counts, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)?;
        let mut state = BuildState::Unbuilt;

        let result = execute_build(executor, &mut state, |seq| {
            let info = info
                .dst_acceleration_structure(pending.handle)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: pending.scratch_address,
                });
            self.record_build(seq, info, &ranges);
            Ok(())
        });

        buffers.destroy(pending.scratch)?;
        if let Err(e) = result {
            self.destroy_structure(pending.handle);
            buffers.destroy(pending.storage)?;
            return Err(e);
        }

        let address = self.structure_address(pending.handle);
        let triangles: u32 = counts.iter().sum();
        log::info!(
            "BLAS {}: {} geometr{} / {triangles} triangles, {} bytes",
            index.0,
            geometries.len(),
            if geometries.len() == 1 { "y" } else { "ies" },
            buffers.desc(pending.storage)?.size
        );
        self.blases.push(Blas {
            handle: pending.handle,
            storage: pending.storage,
            address,
            state,
            users: 0,
        });
        Ok(index)
    }

    /// Builds a top-level structure over instances of built bottom-level
    /// structures.
    ///
    /// Every instance's BLAS index must name a built structure of this
    /// builder; out-of-range indices are rejected, never clamped.
    #[allow(clippy::cast_possible_truncation)]
    pub fn build_top_level(
        &mut self,
        executor: &CommandExecutor,
        buffers: &mut BufferManager,
        instances: &[InstanceDesc],
        flags: BuildFlags,
    ) -> RenderResult<TlasId> {
        let states: Vec<BuildState> = self.blases.iter().map(|b| b.state).collect();
        validate_instances(instances, &states)?;
        let records = instances
            .iter()
            .enumerate()
            .map(|(i, desc)| {
                let address = self.blas_address(desc.blas)?;
                Ok(InstanceRecord::pack(i, desc, address.raw())?)
            })
            .collect::<RenderResult<Vec<_>>>()?;

        let count = records.len() as u32;
        let size_geometry = [instances_geometry(0)];
        let size_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk_build_flags(flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&size_geometry);
        let pending =
            self.create_pending(buffers, &size_info, &[count], vk::AccelerationStructureTypeKHR::TOP_LEVEL)?;
        let mut state = BuildState::Unbuilt;
        let mut instance_buffer = None;

        let result = execute_build(executor, &mut state, |seq| {
            let id = buffers.upload_initialized(
                seq,
                "TLAS instances",
                bytemuck::cast_slice(&records),
                BufferUsage::BUILD_INPUT | BufferUsage::DEVICE_ADDRESS,
            )?;
            instance_buffer = Some(id);
            seq.memory_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            );

            let geometry = [instances_geometry(buffers.device_address(id)?)];
            let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
                .flags(vk_build_flags(flags))
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(&geometry)
                .dst_acceleration_structure(pending.handle)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: pending.scratch_address,
                });
            let range = [vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count)];
            self.record_build(seq, info, &range);
            Ok(id)
        });

        // The staging copy belongs to the build's own sequence, which has
        // either executed or been abandoned at this point.
        buffers.finalize_and_release_staging(executor)?;
        buffers.destroy(pending.scratch)?;
        let instances_id = match result {
            Ok(id) => id,
            Err(e) => {
                if let Some(id) = instance_buffer {
                    buffers.destroy(id)?;
                }
                self.destroy_structure(pending.handle);
                buffers.destroy(pending.storage)?;
                return Err(e);
            }
        };

        let blases: Vec<BlasIndex> = instances.iter().map(|i| i.blas).collect();
        for b in &blases {
            self.blases[b.0 as usize].users += 1;
        }
        log::info!(
            "TLAS: {count} instance(s), {} bytes",
            buffers.desc(pending.storage)?.size
        );
        Ok(self.tlases.insert(Tlas {
            handle: pending.handle,
            storage: pending.storage,
            instances: instances_id,
            blases,
            state,
        }))
    }

    #[allow(unsafe_code)]
    fn record_build(
        &self,
        seq: &OneShot<'_>,
        info: vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) {
        unsafe {
            self.ctx
                .accel()
                .cmd_build_acceleration_structures(seq.command_buffer(), &[info], &[ranges]);
        }
    }

    /// Queries sizes and allocates the structure and its scratch memory.
    #[allow(unsafe_code)]
    fn create_pending(
        &self,
        buffers: &mut BufferManager,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        counts: &[u32],
        ty: vk::AccelerationStructureTypeKHR,
    ) -> RenderResult<Pending> {
        let accel = self.ctx.accel();
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            accel.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                info,
                counts,
                &mut sizes,
            );
        }
        let level = if ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            "TLAS"
        } else {
            "BLAS"
        };

        let storage = buffers.create_buffer(BufferDesc::new(
            format!("{level} storage"),
            sizes.acceleration_structure_size,
            BufferUsage::ACCELERATION_STORAGE | BufferUsage::DEVICE_ADDRESS,
            MemoryVisibility::DeviceLocal,
        ))?;
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffers.raw_buffer(storage)?)
            .size(sizes.acceleration_structure_size)
            .ty(ty);
        let handle = match unsafe { accel.create_acceleration_structure(&create_info, None) }
            .op("vkCreateAccelerationStructureKHR")
        {
            Ok(h) => h,
            Err(e) => {
                buffers.destroy(storage)?;
                return Err(e);
            }
        };

        let alignment = self.ctx.scratch_alignment();
        let scratch = match buffers.create_buffer(BufferDesc::new(
            format!("{level} scratch"),
            sizes.build_scratch_size + alignment,
            BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS,
            MemoryVisibility::DeviceLocal,
        )) {
            Ok(id) => id,
            Err(e) => {
                self.destroy_structure(handle);
                buffers.destroy(storage)?;
                return Err(e);
            }
        };
        let scratch_address = align_up(buffers.device_address(scratch)?, alignment);

        Ok(Pending {
            handle,
            storage,
            scratch,
            scratch_address,
        })
    }

    #[allow(unsafe_code)]
    fn structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        unsafe { self.ctx.accel().get_acceleration_structure_device_address(&info) }
    }

    #[allow(unsafe_code)]
    fn destroy_structure(&self, handle: vk::AccelerationStructureKHR) {
        unsafe { self.ctx.accel().destroy_acceleration_structure(handle, None) };
    }

    fn blas(&self, index: BlasIndex) -> RenderResult<&Blas> {
        match self.blases.get(index.0 as usize) {
            Some(b) if b.state != BuildState::Destroyed => Ok(b),
            _ => Err(stale_blas(index).into()),
        }
    }

    /// Device address of a built bottom-level structure.
    pub fn blas_address(&self, index: BlasIndex) -> RenderResult<BlasAddress> {
        let blas = self.blas(index)?;
        if !blas.state.is_built() {
            return Err(CoreError::BlasNotBuilt {
                instance: 0,
                blas: index.0,
                state: blas.state.name(),
            }
            .into());
        }
        Ok(BlasAddress {
            index,
            raw: blas.address,
        })
    }

    /// Build state of a bottom-level structure.
    pub fn blas_state(&self, index: BlasIndex) -> Option<BuildState> {
        self.blases.get(index.0 as usize).map(|b| b.state)
    }

    /// Number of bottom-level structures ever built, including destroyed ones.
    pub fn blas_count(&self) -> usize {
        self.blases.len()
    }

    /// Build state of a top-level structure.
    pub fn tlas_state(&self, id: TlasId) -> RenderResult<BuildState> {
        Ok(self.tlases.get(id)?.state)
    }

    /// Destroys a bottom-level structure.
    ///
    /// Fails with `InUse` while a live top-level structure references it and
    /// with `StaleHandle` if it was already destroyed.
    pub fn destroy_blas(&mut self, index: BlasIndex, buffers: &mut BufferManager) -> RenderResult<()> {
        let blas = self.blas(index)?;
        if blas.users > 0 {
            return Err(CoreError::InUse {
                kind: "BLAS",
                index: index.0,
                dependents: blas.users,
            }
            .into());
        }
        let (handle, storage) = (blas.handle, blas.storage);
        self.blases[index.0 as usize].state.destroy()?;
        self.destroy_structure(handle);
        buffers.destroy(storage)?;
        log::debug!("BLAS {} destroyed", index.0);
        Ok(())
    }

    /// Destroys a top-level structure and its instance buffer.
    ///
    /// Fails with `InUse` while a binding set references it and with
    /// `StaleHandle` if it was already destroyed.
    pub fn destroy_tlas(&mut self, id: TlasId, buffers: &mut BufferManager) -> RenderResult<()> {
        let mut tlas = self.tlases.remove(id)?;
        tlas.state.destroy()?;
        self.destroy_structure(tlas.handle);
        buffers.destroy(tlas.storage)?;
        buffers.destroy(tlas.instances)?;
        for b in tlas.blases {
            let blas = &mut self.blases[b.0 as usize];
            blas.users = blas.users.saturating_sub(1);
        }
        log::debug!("TLAS {id:?} destroyed");
        Ok(())
    }

    pub(crate) fn tlas_handle(&self, id: TlasId) -> RenderResult<vk::AccelerationStructureKHR> {
        Ok(self.tlases.get(id)?.handle)
    }

    pub(crate) fn retain_tlas(&mut self, id: TlasId) -> RenderResult<()> {
        Ok(self.tlases.retain(id)?)
    }

    pub(crate) fn release_tlas(&mut self, id: TlasId) -> RenderResult<()> {
        Ok(self.tlases.release(id)?)
    }
}

impl Drop for AccelerationStructureBuilder {
    fn drop(&mut self) {
        let tlases = self.tlases.drain();
        let live_blases: Vec<_> = self
            .blases
            .iter()
            .filter(|b| b.state != BuildState::Destroyed)
            .map(|b| b.handle)
            .collect();
        if !tlases.is_empty() || !live_blases.is_empty() {
            log::warn!(
                "releasing {} TLAS and {} BLAS still alive at teardown",
                tlases.len(),
                live_blases.len()
            );
        }
        for tlas in tlases {
            self.destroy_structure(tlas.handle);
        }
        for handle in live_blases {
            self.destroy_structure(handle);
        }
    }
}

/// Records one build in its own sequence and waits for it, moving `state`
/// through `Building` to `Built`.
fn execute_build<T>(
    executor: &CommandExecutor,
    state: &mut BuildState,
    record: impl FnOnce(&OneShot<'_>) -> RenderResult<T>,
) -> RenderResult<T> {
    let seq = executor.begin_one_shot()?;
    state.begin(seq.id())?;
    let value = record(&seq)?;
    executor.submit_and_wait(seq)?;
    state.finish()?;
    Ok(value)
}

fn instances_geometry(address: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: address,
                }),
        })
        .flags(vk::GeometryFlagsKHR::OPAQUE)
}

fn stale_blas(index: BlasIndex) -> CoreError {
    CoreError::StaleHandle {
        kind: "BLAS",
        index: index.0,
        generation: 0,
    }
}
