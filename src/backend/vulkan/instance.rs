//! Instance, physical device and logical device creation

use std::ffi::CStr;

use ash::khr::{surface, swapchain};
use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::error::{RenderError, RenderResult};

use super::debug;

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

fn init_error(what: &str, e: impl std::fmt::Debug) -> RenderError {
    RenderError::Initialization(format!("{what}: {e:?}"))
}

/// Validation messenger kept alive alongside the instance
pub struct DebugMessenger {
    pub utils: ash::ext::debug_utils::Instance,
    pub messenger: vk::DebugUtilsMessengerEXT,
}

/// Create an instance able to present to `display`
///
/// Validation layers are enabled in debug builds when installed.
pub fn create_instance(
    entry: &ash::Entry,
    display: RawDisplayHandle,
) -> RenderResult<(ash::Instance, Option<DebugMessenger>)> {
    let validation = cfg!(debug_assertions) && has_validation_layer(entry);

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"Prism")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Prism Render")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut extensions = ash_window::enumerate_required_extensions(display)
        .map_err(|e| init_error("surface extensions", e))?
        .to_vec();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    let layers = if validation {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);
    let instance =
        unsafe { entry.create_instance(&create_info, None) }.map_err(|e| init_error("instance", e))?;

    let messenger = if validation {
        let utils = ash::ext::debug_utils::Instance::new(entry, &instance);
        match debug::create_debug_messenger(&utils) {
            Ok(messenger) => Some(DebugMessenger { utils, messenger }),
            Err(e) => {
                log::warn!("Validation enabled without a messenger: {e}");
                None
            }
        }
    } else {
        None
    };
    log::info!("Vulkan instance created (validation: {validation})");
    Ok((instance, messenger))
}

fn has_validation_layer(entry: &ash::Entry) -> bool {
    let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    layers.iter().any(|layer| {
        layer
            .layer_name_as_c_str()
            .is_ok_and(|name| name == VALIDATION_LAYER_NAME)
    })
}

/// Queue family with graphics and present support
pub fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface_fn: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = unsafe {
            surface_fn
                .get_physical_device_surface_support(physical_device, index, surface)
                .unwrap_or(false)
        };
        (graphics && present).then_some(index)
    })
}

/// Pick a device that can present, preferring discrete GPUs
pub fn pick_physical_device(
    instance: &ash::Instance,
    surface_fn: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> RenderResult<(vk::PhysicalDevice, u32)> {
    let devices =
        unsafe { instance.enumerate_physical_devices() }.map_err(|e| init_error("physical devices", e))?;

    let mut candidates: Vec<_> = devices
        .into_iter()
        .filter_map(|device| {
            find_queue_family(instance, device, surface_fn, surface).map(|family| (device, family))
        })
        .collect();
    candidates.sort_by_key(|(device, _)| {
        let properties = unsafe { instance.get_physical_device_properties(*device) };
        match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
            _ => 2,
        }
    });

    let (device, family) = candidates
        .into_iter()
        .next()
        .ok_or_else(|| RenderError::Initialization("no Vulkan device can present to the window".into()))?;
    let properties = unsafe { instance.get_physical_device_properties(device) };
    log::info!(
        "Using Vulkan device {:?}",
        properties.device_name_as_c_str().unwrap_or(c"unknown")
    );
    Ok((device, family))
}

/// Logical device with a single graphics queue and the swap-chain extension
pub fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> RenderResult<ash::Device> {
    let priorities = [1.0f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities);

    let supported = unsafe { instance.get_physical_device_features(physical_device) };
    let features = vk::PhysicalDeviceFeatures::default().fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE);

    let extensions = [swapchain::NAME.as_ptr()];
    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extensions)
        .enabled_features(&features);

    unsafe { instance.create_device(physical_device, &device_info, None) }.map_err(|e| init_error("device", e))
}
