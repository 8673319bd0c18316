//! Dedicated buffer allocations.

use ash::vk;
use meshtrace_core::{BufferUsage, MemoryVisibility};

use crate::context::GpuContext;
use crate::error::{allocation_error, RenderError, RenderResult, VkResultExt};

/// Property sets tried in order for each visibility class.
fn preferred_properties(visibility: MemoryVisibility) -> &'static [vk::MemoryPropertyFlags] {
    const HOST: [vk::MemoryPropertyFlags; 2] = [
        vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
                | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw()
                | vk::MemoryPropertyFlags::HOST_CACHED.as_raw(),
        ),
        vk::MemoryPropertyFlags::from_raw(
            vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
                | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
        ),
    ];
    const DEVICE: [vk::MemoryPropertyFlags; 1] = [vk::MemoryPropertyFlags::DEVICE_LOCAL];
    match visibility {
        MemoryVisibility::HostVisible => &HOST,
        MemoryVisibility::DeviceLocal => &DEVICE,
    }
}

/// First memory type allowed by `type_bits` that has every flag in `required`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..properties.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && properties.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// Picks a memory type for `visibility`, trying cached host memory before
/// plain coherent host memory.
pub fn select_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    visibility: MemoryVisibility,
) -> Option<(u32, vk::MemoryPropertyFlags)> {
    preferred_properties(visibility)
        .iter()
        .find_map(|&flags| find_memory_type(properties, type_bits, flags).map(|i| (i, flags)))
}

/// Vulkan usage flags for a buffer usage set.
pub fn vk_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::BUILD_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::DEVICE_ADDRESS) {
        flags |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    if usage.contains(BufferUsage::ACCELERATION_STORAGE) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    flags
}

/// A buffer and the memory bound to it.
#[derive(Debug)]
pub struct RawBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: u64,
}

impl RawBuffer {
    /// Creates a buffer with its own memory allocation.
    #[allow(unsafe_code)]
    pub fn new(
        ctx: &GpuContext,
        size: u64,
        usage: BufferUsage,
        visibility: MemoryVisibility,
    ) -> RenderResult<Self> {
        let device = ctx.device();
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk_usage(usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&info, None) }
            .map_err(|e| allocation_error("vkCreateBuffer", size, usage, e))?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let Some((type_index, properties)) = select_memory_type(
            ctx.memory_properties(),
            requirements.memory_type_bits,
            visibility,
        ) else {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(RenderError::NoSuitableMemoryType {
                usage: format!("{usage:?}"),
                properties: preferred_properties(visibility)
                    .last()
                    .copied()
                    .unwrap_or_default(),
            });
        };

        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        if usage.contains(BufferUsage::DEVICE_ADDRESS) {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(allocation_error("vkAllocateMemory", requirements.size, usage, e));
            }
        };
        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(RenderError::Vulkan {
                op: "vkBindBufferMemory",
                result: e,
            });
        }

        log::debug!(
            "allocated {size} bytes for {usage:?} in memory type {type_index} ({properties:?})"
        );
        Ok(Self {
            buffer,
            memory,
            size,
        })
    }

    /// Device address of the buffer. Requires `DEVICE_ADDRESS` usage.
    #[allow(unsafe_code)]
    pub fn device_address(&self, ctx: &GpuContext) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.buffer);
        unsafe { ctx.device().get_buffer_device_address(&info) }
    }

    /// Maps the whole allocation.
    #[allow(unsafe_code)]
    pub fn map(&self, ctx: &GpuContext) -> RenderResult<*mut u8> {
        let ptr = unsafe {
            ctx.device()
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
        }
        .op("vkMapMemory")?;
        Ok(ptr.cast())
    }

    /// Unmaps the allocation.
    #[allow(unsafe_code)]
    pub fn unmap(&self, ctx: &GpuContext) {
        unsafe { ctx.device().unmap_memory(self.memory) };
    }

    /// Copies `data` into a host-visible allocation.
    #[allow(unsafe_code)]
    pub fn write(&self, ctx: &GpuContext, data: &[u8]) -> RenderResult<()> {
        debug_assert!(data.len() as u64 <= self.size);
        let ptr = self.map(ctx)?;
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        self.unmap(ctx);
        Ok(())
    }

    /// Copies the whole host-visible allocation out.
    #[allow(unsafe_code, clippy::cast_possible_truncation)]
    pub fn read(&self, ctx: &GpuContext) -> RenderResult<Vec<u8>> {
        let ptr = self.map(ctx)?;
        let bytes = unsafe { std::slice::from_raw_parts(ptr, self.size as usize) }.to_vec();
        self.unmap(ctx);
        Ok(bytes)
    }

    /// Frees the buffer and its memory. The device must no longer use it.
    #[allow(unsafe_code)]
    pub fn destroy(self, ctx: &GpuContext) {
        unsafe {
            ctx.device().destroy_buffer(self.buffer, None);
            ctx.device().free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    const VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const CACHED: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_CACHED;
    const LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    #[test]
    fn test_host_prefers_cached() {
        let props = properties(&[LOCAL, VISIBLE | COHERENT, VISIBLE | COHERENT | CACHED]);
        let (index, flags) = select_memory_type(&props, 0b111, MemoryVisibility::HostVisible).unwrap();
        assert_eq!(index, 2);
        assert!(flags.contains(CACHED));
    }

    #[test]
    fn test_host_falls_back_to_coherent() {
        let props = properties(&[LOCAL, VISIBLE | COHERENT, VISIBLE | COHERENT | CACHED]);
        // Type 2 is not allowed by the buffer's requirements.
        let (index, _) = select_memory_type(&props, 0b011, MemoryVisibility::HostVisible).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn test_no_match() {
        let props = properties(&[LOCAL, VISIBLE]);
        assert!(select_memory_type(&props, 0b11, MemoryVisibility::HostVisible).is_none());
        assert_eq!(
            select_memory_type(&props, 0b11, MemoryVisibility::DeviceLocal).map(|(i, _)| i),
            Some(0)
        );
    }

    #[test]
    fn test_usage_translation() {
        let flags = vk_usage(BufferUsage::BUILD_INPUT | BufferUsage::DEVICE_ADDRESS);
        assert_eq!(
            flags,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        );
        assert!(vk_usage(BufferUsage::empty()).is_empty());
    }

    proptest! {
        #[test]
        fn prop_selected_type_is_allowed_and_satisfies(
            raw_types in proptest::collection::vec(0u32..16, 1..12),
            type_bits in any::<u32>(),
        ) {
            let types: Vec<_> = raw_types.iter().map(|&r| vk::MemoryPropertyFlags::from_raw(r)).collect();
            let props = properties(&types);
            for visibility in [MemoryVisibility::HostVisible, MemoryVisibility::DeviceLocal] {
                if let Some((index, flags)) = select_memory_type(&props, type_bits, visibility) {
                    prop_assert!(type_bits & (1 << index) != 0);
                    prop_assert!(types[index as usize].contains(flags));
                }
            }
        }
    }
}
