//! Instance, device and queue bootstrap.

use std::ffi::{CStr, CString};

use ash::vk;
use meshtrace_core::ContextConfig;

use crate::error::{RenderError, RenderResult, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const REQUIRED_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_query::NAME,
    ash::khr::deferred_host_operations::NAME,
];

/// A logical device with one graphics/compute/transfer queue and the
/// acceleration-structure extension loaded.
///
/// Every other component holds an `Arc<GpuContext>`, so the device outlives
/// all objects created from it.
pub struct GpuContext {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    accel: ash::khr::acceleration_structure::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    scratch_alignment: u64,
    device_name: String,
}

struct Candidate {
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    name: String,
}

impl GpuContext {
    /// Creates the instance and device.
    ///
    /// Fails with [`RenderError::LoaderUnavailable`] when no Vulkan loader is
    /// installed and [`RenderError::NoSuitableDevice`] when no device supports
    /// ray queries.
    #[allow(unsafe_code)]
    pub fn new(config: &ContextConfig) -> RenderResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RenderError::LoaderUnavailable(e.to_string()))?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|_| RenderError::LoaderUnavailable("application name contains NUL".into()))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .engine_name(c"meshtrace")
            .api_version(vk::API_VERSION_1_2);

        let mut layers = Vec::new();
        if config.validation {
            if validation_available(&entry) {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                log::warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
            }
        }

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .map_err(|e| match e {
                vk::Result::ERROR_INCOMPATIBLE_DRIVER => {
                    RenderError::LoaderUnavailable("no Vulkan 1.2 driver".into())
                }
                result => RenderError::Vulkan {
                    op: "vkCreateInstance",
                    result,
                },
            })?;

        match Self::with_instance(entry, instance) {
            Ok(ctx) => Ok(ctx),
            Err((instance, err)) => {
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    #[allow(unsafe_code)]
    fn with_instance(
        entry: ash::Entry,
        instance: ash::Instance,
    ) -> Result<Self, (ash::Instance, RenderError)> {
        let candidate = match pick_device(&instance) {
            Ok(c) => c,
            Err(e) => return Err((instance, e)),
        };

        let priorities = [1.0f32];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(candidate.queue_family_index)
            .queue_priorities(&priorities)];
        let extensions: Vec<*const std::ffi::c_char> =
            REQUIRED_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();

        let mut ray_query = vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);
        let mut accel_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
        let mut bda =
            vk::PhysicalDeviceBufferDeviceAddressFeatures::default().buffer_device_address(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut bda)
            .push_next(&mut accel_features)
            .push_next(&mut ray_query);

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device =
            match unsafe { instance.create_device(candidate.physical_device, &device_info, None) } {
                Ok(d) => d,
                Err(result) => {
                    return Err((
                        instance,
                        RenderError::Vulkan {
                            op: "vkCreateDevice",
                            result,
                        },
                    ))
                }
            };

        let queue = unsafe { device.get_device_queue(candidate.queue_family_index, 0) };
        let accel = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(candidate.physical_device) };

        let mut as_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut as_properties);
        unsafe {
            instance.get_physical_device_properties2(candidate.physical_device, &mut properties2);
        }
        let scratch_alignment =
            u64::from(as_properties.min_acceleration_structure_scratch_offset_alignment).max(1);

        log::info!(
            "using {} (queue family {}, scratch alignment {scratch_alignment})",
            candidate.name,
            candidate.queue_family_index
        );

        Ok(Self {
            _entry: entry,
            instance,
            physical_device: candidate.physical_device,
            device,
            queue,
            queue_family_index: candidate.queue_family_index,
            accel,
            memory_properties,
            scratch_alignment,
            device_name: candidate.name,
        })
    }

    /// The logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The physical device the logical device was created on.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// The single queue all work is submitted to.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Family of [`GpuContext::queue`].
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Acceleration-structure extension entry points.
    pub fn accel(&self) -> &ash::khr::acceleration_structure::Device {
        &self.accel
    }

    /// Cached memory heaps and types.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Required alignment of build scratch addresses.
    pub fn scratch_alignment(&self) -> u64 {
        self.scratch_alignment
    }

    /// Human-readable device name.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Blocks until the device has finished all work.
    #[allow(unsafe_code)]
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.op("vkDeviceWaitIdle")
    }
}

impl Drop for GpuContext {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("vkDeviceWaitIdle failed during teardown: {e}");
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("device", &self.device_name)
            .field("queue_family_index", &self.queue_family_index)
            .finish_non_exhaustive()
    }
}

#[allow(unsafe_code)]
fn validation_available(entry: &ash::Entry) -> bool {
    unsafe { entry.enumerate_instance_layer_properties() }
        .unwrap_or_default()
        .iter()
        .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER))
}

/// First physical device that supports every extension and feature the
/// pipeline needs.
#[allow(unsafe_code)]
fn pick_device(instance: &ash::Instance) -> RenderResult<Candidate> {
    let devices =
        unsafe { instance.enumerate_physical_devices() }.op("vkEnumeratePhysicalDevices")?;
    if devices.is_empty() {
        return Err(RenderError::NoSuitableDevice(
            "no Vulkan physical devices".into(),
        ));
    }

    let mut reasons = Vec::new();
    for pd in devices {
        let properties = unsafe { instance.get_physical_device_properties(pd) };
        let name = properties
            .device_name_as_c_str()
            .map_or_else(|_| "unknown device".to_string(), |n| n.to_string_lossy().into_owned());
        match check_device(instance, pd) {
            Ok(queue_family_index) => {
                return Ok(Candidate {
                    physical_device: pd,
                    queue_family_index,
                    name,
                })
            }
            Err(reason) => {
                log::debug!("skipping {name}: {reason}");
                reasons.push(format!("{name}: {reason}"));
            }
        }
    }
    Err(RenderError::NoSuitableDevice(reasons.join("; ")))
}

#[allow(unsafe_code)]
fn check_device(instance: &ash::Instance, pd: vk::PhysicalDevice) -> Result<u32, String> {
    let properties = unsafe { instance.get_physical_device_properties(pd) };
    if properties.api_version < vk::API_VERSION_1_2 {
        return Err("Vulkan 1.2 not supported".into());
    }

    let extensions = unsafe { instance.enumerate_device_extension_properties(pd) }
        .map_err(|e| format!("cannot enumerate extensions: {e}"))?;
    for required in REQUIRED_EXTENSIONS {
        if !extensions
            .iter()
            .any(|e| e.extension_name_as_c_str().is_ok_and(|n| n == required))
        {
            return Err(format!("missing {}", required.to_string_lossy()));
        }
    }

    let mut ray_query = vk::PhysicalDeviceRayQueryFeaturesKHR::default();
    let mut accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut bda = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut bda)
        .push_next(&mut accel)
        .push_next(&mut ray_query);
    unsafe { instance.get_physical_device_features2(pd, &mut features2) };
    if bda.buffer_device_address == vk::FALSE {
        return Err("bufferDeviceAddress not supported".into());
    }
    if accel.acceleration_structure == vk::FALSE {
        return Err("accelerationStructure not supported".into());
    }
    if ray_query.ray_query == vk::FALSE {
        return Err("rayQuery not supported".into());
    }

    let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;
    unsafe { instance.get_physical_device_queue_family_properties(pd) }
        .iter()
        .position(|q| q.queue_flags.contains(wanted))
        .map(|i| u32::try_from(i).unwrap_or(u32::MAX))
        .ok_or_else(|| "no graphics/compute/transfer queue family".to_string())
}
