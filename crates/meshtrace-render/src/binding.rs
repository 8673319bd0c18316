//! Descriptor-set layouts and binding sets.

use std::sync::Arc;

use ash::vk;
use meshtrace_core::{
    BindingSetState, BoundResource, BufferUsage, CoreError, LayoutDecl, ResourceKind,
    ShaderStages, SlotDecl,
};

use crate::accel::AccelerationStructureBuilder;
use crate::buffer::BufferManager;
use crate::context::GpuContext;
use crate::error::{RenderResult, VkResultExt};

fn descriptor_type(kind: ResourceKind) -> vk::DescriptorType {
    match kind {
        ResourceKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        ResourceKind::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    }
}

fn stage_flags(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::ShaderStageFlags::COMPUTE;
    }
    flags
}

/// A descriptor-set layout and the pipeline layout built on it.
pub struct BindingLayout {
    ctx: Arc<GpuContext>,
    decl: LayoutDecl,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    push_constant_size: u32,
}

impl BindingLayout {
    /// The declared slots.
    pub fn decl(&self) -> &LayoutDecl {
        &self.decl
    }

    /// Bytes of compute push constants the layout reserves.
    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    pub(crate) fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub(crate) fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }
}

impl Drop for BindingLayout {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// One descriptor set and the resources attached to it.
///
/// Every bound resource is retained by its owner until the set is destroyed
/// with [`BindingLayer::destroy_set`].
pub struct BindingSet {
    ctx: Arc<GpuContext>,
    state: BindingSetState,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

impl BindingSet {
    /// Slot contents and usage state.
    pub fn state(&self) -> &BindingSetState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut BindingSetState {
        &mut self.state
    }

    pub(crate) fn descriptor_set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub(crate) fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }
}

impl Drop for BindingSet {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe { self.ctx.device().destroy_descriptor_pool(self.pool, None) };
    }
}

/// Creates layouts and binding sets and keeps resource references honest.
pub struct BindingLayer {
    ctx: Arc<GpuContext>,
}

impl BindingLayer {
    pub fn new(ctx: Arc<GpuContext>) -> Self {
        Self { ctx }
    }

    /// Declares a layout from its slots.
    ///
    /// `push_constant_size` bytes of compute push constants are reserved at
    /// offset 0; pass 0 for none.
    #[allow(unsafe_code)]
    pub fn declare_layout(
        &self,
        slots: Vec<SlotDecl>,
        push_constant_size: u32,
    ) -> RenderResult<BindingLayout> {
        let decl = LayoutDecl::new(slots)?;
        let device = self.ctx.device();

        let bindings: Vec<_> = decl
            .slots()
            .iter()
            .map(|s| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(s.slot)
                    .descriptor_type(descriptor_type(s.kind))
                    .descriptor_count(1)
                    .stage_flags(stage_flags(s.stages))
            })
            .collect();
        let set_layout = unsafe {
            device.create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
                None,
            )
        }
        .op("vkCreateDescriptorSetLayout")?;

        let set_layouts = [set_layout];
        let ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_size)];
        let mut info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        if push_constant_size > 0 {
            info = info.push_constant_ranges(&ranges);
        }
        let pipeline_layout = match unsafe { device.create_pipeline_layout(&info, None) }
            .op("vkCreatePipelineLayout")
        {
            Ok(l) => l,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e);
            }
        };

        log::debug!(
            "binding layout: {} slot(s), {push_constant_size} push constant bytes",
            decl.slots().len()
        );
        Ok(BindingLayout {
            ctx: Arc::clone(&self.ctx),
            decl,
            set_layout,
            pipeline_layout,
            push_constant_size,
        })
    }

    /// Allocates an empty binding set from its own pool.
    #[allow(unsafe_code)]
    pub fn allocate_binding_set(&self, layout: &BindingLayout) -> RenderResult<BindingSet> {
        let device = self.ctx.device();
        let sizes: Vec<_> = [ResourceKind::StorageBuffer, ResourceKind::AccelerationStructure]
            .into_iter()
            .filter_map(|kind| {
                let count = layout.decl.count_of(kind);
                (count > 0).then(|| {
                    vk::DescriptorPoolSize::default()
                        .ty(descriptor_type(kind))
                        .descriptor_count(count)
                })
            })
            .collect();
        let pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(1)
                    .pool_sizes(&sizes),
                None,
            )
        }
        .op("vkCreateDescriptorPool")?;

        let set_layouts = [layout.set_layout];
        let set = match unsafe {
            device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(&set_layouts),
            )
        }
        .op("vkAllocateDescriptorSets")
        {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe { device.destroy_descriptor_pool(pool, None) };
                return Err(e);
            }
        };

        Ok(BindingSet {
            ctx: Arc::clone(&self.ctx),
            state: BindingSetState::new(layout.decl.clone()),
            set_layout: layout.set_layout,
            pool,
            set,
        })
    }

    /// Attaches a resource to a slot.
    ///
    /// Buffers need `STORAGE` usage; top-level structures must be built.
    /// The new resource is retained and any resource it replaces released.
    #[allow(unsafe_code)]
    pub fn bind(
        &self,
        set: &mut BindingSet,
        slot: u32,
        resource: BoundResource,
        buffers: &mut BufferManager,
        accel: &mut AccelerationStructureBuilder,
    ) -> RenderResult<()> {
        // Resolve first so a failed bind leaves no reference behind.
        let target = match resource {
            BoundResource::Buffer(id) => {
                buffers.require_usage(id, BufferUsage::STORAGE)?;
                Target::Buffer(buffers.raw_buffer(id)?)
            }
            BoundResource::Tlas(id) => Target::Tlas(accel.tlas_handle(id)?),
        };
        retain(resource, buffers, accel)?;
        let replaced = match set.state.bind(slot, resource) {
            Ok(r) => r,
            Err(e) => {
                release(resource, buffers, accel)?;
                return Err(e.into());
            }
        };

        let device = self.ctx.device();
        match target {
            Target::Buffer(buffer) => {
                let info = [vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(0)
                    .range(vk::WHOLE_SIZE)];
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set.set)
                    .dst_binding(slot)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&info);
                unsafe { device.update_descriptor_sets(&[write], &[]) };
            }
            Target::Tlas(handle) => {
                let handles = [handle];
                let mut as_write = vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(&handles);
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set.set)
                    .dst_binding(slot)
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .push_next(&mut as_write)
                    .descriptor_count(1);
                unsafe { device.update_descriptor_sets(&[write], &[]) };
            }
        }

        if let Some(old) = replaced {
            release(old, buffers, accel)?;
        }
        log::trace!("slot {slot} <- {resource:?}");
        Ok(())
    }

    /// Destroys a set and releases every resource it references.
    pub fn destroy_set(
        &self,
        set: BindingSet,
        buffers: &mut BufferManager,
        accel: &mut AccelerationStructureBuilder,
    ) -> RenderResult<()> {
        let bound: Vec<BoundResource> = set
            .state
            .layout()
            .slots()
            .iter()
            .filter_map(|s| set.state.resource(s.slot))
            .collect();
        drop(set);
        for resource in bound {
            release(resource, buffers, accel)?;
        }
        Ok(())
    }
}

enum Target {
    Buffer(vk::Buffer),
    Tlas(vk::AccelerationStructureKHR),
}

fn retain(
    resource: BoundResource,
    buffers: &mut BufferManager,
    accel: &mut AccelerationStructureBuilder,
) -> RenderResult<()> {
    match resource {
        BoundResource::Buffer(id) => buffers.retain(id),
        BoundResource::Tlas(id) => accel.retain_tlas(id),
    }
}

fn release(
    resource: BoundResource,
    buffers: &mut BufferManager,
    accel: &mut AccelerationStructureBuilder,
) -> RenderResult<()> {
    match resource {
        BoundResource::Buffer(id) => buffers.release(id),
        BoundResource::Tlas(id) => accel.release_tlas(id),
    }
}

/// Error for a set allocated from a different layout than the program's.
pub(crate) fn layout_mismatch(expected: &LayoutDecl, actual: &LayoutDecl) -> CoreError {
    CoreError::InvalidLayout(format!(
        "binding set declares {} slot(s), program expects {}",
        actual.slots().len(),
        expected.slots().len()
    ))
}
