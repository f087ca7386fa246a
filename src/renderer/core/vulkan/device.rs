use std::ffi::{c_char, CStr};
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;

/// Physical device and the queue family every queue of the renderer comes from
pub struct SelectedDevice {
    pub physical: vk::PhysicalDevice,
    pub queue_family: u32,
    pub queue_count: u32,
    pub properties: vk::PhysicalDeviceProperties,
}

/// Direct queues must do graphics, copies and presentation, so one family that supports all of
/// them is required.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Result<SelectedDevice> {
    let req_device_exts = required_device_extensions();
    let devices = unsafe { instance.enumerate_physical_devices()? };

    devices
        .into_iter()
        // Filter out devices that do not contain the required device extensions
        .filter(|device| {
            let supported_extensions = unsafe {
                instance.enumerate_device_extension_properties(*device)
            }.unwrap_or_default();

            req_device_exts.iter().all(|req_ext| {
                supported_extensions
                    .iter()
                    .any(|sup_ext| sup_ext.extension_name_as_c_str().is_ok_and(|name| name == *req_ext))
            })
        })
        .filter(|device| RequiredDeviceFeatures::query(instance, *device).has_all())
        // Filter out devices without a graphics queue that can present
        .filter_map(|device| {
            let props = unsafe { instance.get_physical_device_queue_family_properties(device) };
            let (index, family) = props.iter().enumerate().find(|(i, q)| {
                let supports_graphics = q.queue_flags.contains(vk::QueueFlags::GRAPHICS);
                let supports_present = unsafe {
                    surface_loader.get_physical_device_surface_support(device, *i as u32, surface)
                }.unwrap_or(false);
                supports_graphics && supports_present
            })?;
            Some((device, index as u32, family.queue_count))
        })
        .map(|(device, queue_family, queue_count)| SelectedDevice {
            physical: device,
            queue_family,
            queue_count,
            properties: unsafe { instance.get_physical_device_properties(device) },
        })
        .min_by_key(|selected| match selected.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            vk::PhysicalDeviceType::CPU => 3,
            vk::PhysicalDeviceType::OTHER => 4,
            _ => 5,
        })
        .ok_or_eyre("No suitable physical device found")
}

/// Creates the logical device with up to `max_queues` queues of the selected family.
pub fn create_logical_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
    max_queues: u32,
) -> Result<(ash::Device, Vec<vk::Queue>)> {
    let queue_count = selected.queue_count.clamp(1, max_queues);
    let queue_priorities = vec![1.0; queue_count as usize];
    let queue_create_infos = [
        vk::DeviceQueueCreateInfo::default()
            .queue_family_index(selected.queue_family)
            .queue_priorities(&queue_priorities),
    ];

    let enabled_extension_names = required_device_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect::<Vec<*const c_char>>();

    let mut enabled_features = RequiredDeviceFeatures::enabled();
    let device = {
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .features(enabled_features.core)
            .push_next(&mut enabled_features.vulkan12)
            .push_next(&mut enabled_features.vulkan13);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&enabled_extension_names)
            .push_next(&mut features);

        unsafe { instance.create_device(selected.physical, &device_create_info, None)? }
    };

    let queues = (0..queue_count)
        .map(|index| unsafe { device.get_device_queue(selected.queue_family, index) })
        .collect();

    Ok((device, queues))
}

fn required_device_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::swapchain::NAME,

        #[cfg(target_os = "macos")]
        ash::khr::portability_subset::NAME,
    ]
}

struct RequiredDeviceFeatures {
    core: vk::PhysicalDeviceFeatures,
    vulkan12: vk::PhysicalDeviceVulkan12Features<'static>,
    vulkan13: vk::PhysicalDeviceVulkan13Features<'static>,
}

impl RequiredDeviceFeatures {
    fn enabled() -> Self {
        Self {
            core: vk::PhysicalDeviceFeatures::default()
                .shader_storage_buffer_array_dynamic_indexing(true)
                .shader_sampled_image_array_dynamic_indexing(true),
            vulkan12: vk::PhysicalDeviceVulkan12Features::default()
                .timeline_semaphore(true)
                .descriptor_indexing(true)
                .runtime_descriptor_array(true)
                .descriptor_binding_partially_bound(true)
                .descriptor_binding_storage_buffer_update_after_bind(true)
                .descriptor_binding_sampled_image_update_after_bind(true),
            vulkan13: vk::PhysicalDeviceVulkan13Features::default()
                .dynamic_rendering(true)
                .synchronization2(true),
        }
    }

    fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::default();
        let core = {
            let mut features = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut vulkan12)
                .push_next(&mut vulkan13);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
            features.features
        };

        // Drop the chain pointers, they refer to the locals above.
        vulkan12.p_next = std::ptr::null_mut();
        vulkan13.p_next = std::ptr::null_mut();
        Self { core, vulkan12, vulkan13 }
    }

    fn has_all(&self) -> bool {
        self.core.shader_storage_buffer_array_dynamic_indexing == vk::TRUE
            && self.core.shader_sampled_image_array_dynamic_indexing == vk::TRUE
            && self.vulkan12.timeline_semaphore == vk::TRUE
            && self.vulkan12.descriptor_indexing == vk::TRUE
            && self.vulkan12.runtime_descriptor_array == vk::TRUE
            && self.vulkan12.descriptor_binding_partially_bound == vk::TRUE
            && self.vulkan12.descriptor_binding_storage_buffer_update_after_bind == vk::TRUE
            && self.vulkan12.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
            && self.vulkan13.dynamic_rendering == vk::TRUE
            && self.vulkan13.synchronization2 == vk::TRUE
    }
}

/// Descriptor slots a shader-visible heap may hold, bounded by what the device can bind at once.
pub fn shader_visible_descriptor_limit(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Result<u32> {
    let mut indexing = vk::PhysicalDeviceDescriptorIndexingProperties::default();
    {
        let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut indexing);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut props) };
    }
    let limit = indexing
        .max_per_stage_descriptor_update_after_bind_storage_buffers
        .min(indexing.max_per_stage_descriptor_update_after_bind_sampled_images)
        .min(1 << 16);
    if limit == 0 {
        return Err(eyre!("Device cannot bind update-after-bind descriptors"));
    }
    Ok(limit)
}
