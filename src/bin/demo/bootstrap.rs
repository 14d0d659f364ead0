//! Instance, physical device and logical device setup for the demo window.

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

use anyhow::{Result, anyhow};
use ash::vk;
use ash::vk::Handle;
use ash::{Entry, Instance};
use log::*;
use thiserror::Error;
use winit::window::Window;

use frameforge::gpu::{AshDevice, AshSurface};

use crate::vk_window::{create_surface, get_required_instance_extensions};

//==================================================================================================
// SECTION: Constants
//==================================================================================================

const VALIDATION_ENABLED: bool = cfg!(debug_assertions);

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";
const DEVICE_EXTENSIONS: &[&CStr] = &[c"VK_KHR_swapchain"];

//==================================================================================================
// SECTION: Queue Families
//==================================================================================================

#[derive(Clone, Copy, Debug)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilyIndices {
    fn get(
        instance: &Instance,
        surface_instance: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let properties =
            // SAFETY: `instance` and `physical_device` are valid.
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let graphics = properties
            .iter()
            .position(|p| p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|i| i as u32);

        let mut present = None;
        for index in 0..properties.len() as u32 {
            // SAFETY: `physical_device`, `index` and `surface` are valid.
            let supported = unsafe {
                surface_instance.get_physical_device_surface_support(
                    physical_device,
                    index,
                    surface,
                )?
            };
            if supported {
                present = Some(index);
                break;
            }
        }

        match (graphics, present) {
            (Some(graphics), Some(present)) => Ok(Self { graphics, present }),
            _ => Err(anyhow!(SuitabilityError::Static(
                "Missing required queue families."
            ))),
        }
    }
}

/// Error type for physical device suitability checks.
#[derive(Debug, Error)]
pub enum SuitabilityError {
    #[error("Static error: {0}")]
    Static(&'static str),
    #[error("Dynamic error: {0}")]
    Dynamic(String),
}

//==================================================================================================
// SECTION: GpuContext
//==================================================================================================

/// Everything below the frame orchestrator: instance, device, queues and the window surface.
pub struct GpuContext {
    pub entry: Entry,
    pub instance: Instance,
    messenger: vk::DebugUtilsMessengerEXT,
    pub physical_device: vk::PhysicalDevice,
    pub device: AshDevice,
    pub surface: AshSurface,
    pub queue_families: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
}

impl GpuContext {
    pub fn create(window: &Window) -> Result<Self> {
        // SAFETY: the Vulkan loader is only used through `entry` for the lifetime of the context.
        let entry =
            unsafe { Entry::load().map_err(|e| anyhow!("Failed to load Vulkan entry: {}", e))? };

        let (instance, messenger) = create_instance(window, &entry)?;
        // SAFETY: the window outlives the surface; `GpuContext::destroy` runs before it is dropped.
        let surface = unsafe { create_surface(&instance, &entry, window, window)? };
        let surface_instance = ash::khr::surface::Instance::new(&entry, &instance);

        let physical_device = pick_physical_device(&instance, &surface_instance, surface)?;
        let queue_families =
            QueueFamilyIndices::get(&instance, &surface_instance, surface, physical_device)?;
        let device = create_logical_device(&instance, physical_device, queue_families)?;

        // SAFETY: both queue families were requested with one queue each.
        let (graphics_queue, present_queue) = unsafe {
            (
                device.get_device_queue(queue_families.graphics, 0),
                device.get_device_queue(queue_families.present, 0),
            )
        };

        let surface = AshSurface::new(
            &entry,
            &instance,
            &device,
            physical_device,
            surface,
            &[queue_families.graphics, queue_families.present],
        );
        let device = AshDevice::new(&instance, physical_device, device)?;

        Ok(Self {
            entry,
            instance,
            messenger,
            physical_device,
            device,
            surface,
            queue_families,
            graphics_queue,
            present_queue,
        })
    }

    pub fn raw_device(&self) -> &ash::Device {
        self.device.raw()
    }

    /// Device, surface, messenger, instance. Every GPU object must already be destroyed.
    pub fn destroy(&mut self) {
        // SAFETY: the caller has released every object created from the device.
        unsafe { self.device.raw().destroy_device(None) };
        self.surface.destroy_surface();
        if VALIDATION_ENABLED && !self.messenger.is_null() {
            let debug_utils_instance =
                ash::ext::debug_utils::Instance::new(&self.entry, &self.instance);
            // SAFETY: the messenger was created from this instance.
            unsafe { debug_utils_instance.destroy_debug_utils_messenger(self.messenger, None) };
            self.messenger = vk::DebugUtilsMessengerEXT::null();
        }
        // SAFETY: every child object of the instance is gone.
        unsafe { self.instance.destroy_instance(None) };
        info!("Vulkan context destroyed.");
    }
}

//==================================================================================================
// SECTION: Instance and Debug Setup
//==================================================================================================

fn create_instance(
    window: &Window,
    entry: &Entry,
) -> Result<(Instance, vk::DebugUtilsMessengerEXT)> {
    let app_name = CString::new("frameforge demo")?;
    let engine_name = CString::new("frameforge")?;

    let application_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    // SAFETY: `CStr::from_ptr` relies on Vulkan providing NUL-terminated layer names.
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? }
        .iter()
        .map(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) }.to_owned())
        .collect::<Vec<_>>();

    if VALIDATION_ENABLED
        && !available_layers
            .iter()
            .any(|layer| layer.as_c_str() == VALIDATION_LAYER_NAME)
    {
        return Err(anyhow!("Validation layer requested but not supported."));
    }

    let mut extension_ptrs: Vec<*const c_char> = get_required_instance_extensions(window)?
        .iter()
        .map(|e| e.as_ptr())
        .collect();
    if VALIDATION_ENABLED {
        extension_ptrs.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let layer_ptrs = if VALIDATION_ENABLED {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let mut create_info = vk::InstanceCreateInfo::default()
        .application_info(&application_info)
        .enabled_layer_names(&layer_ptrs)
        .enabled_extension_names(&extension_ptrs);
    if VALIDATION_ENABLED {
        create_info = create_info.push_next(&mut debug_info);
    }

    // SAFETY: every pointer in `create_info` outlives the call.
    let instance = unsafe { entry.create_instance(&create_info, None)? };

    let messenger = if VALIDATION_ENABLED {
        let debug_utils_instance = ash::ext::debug_utils::Instance::new(entry, &instance);
        // SAFETY: `debug_info` is fully initialised and the instance is live.
        unsafe { debug_utils_instance.create_debug_utils_messenger(&debug_info, None)? }
    } else {
        vk::DebugUtilsMessengerEXT::null()
    };

    Ok((instance, messenger))
}

extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: Vulkan passes valid callback data with a NUL-terminated message.
    let callback_data = unsafe { &*data };
    let message = unsafe { CStr::from_ptr(callback_data.p_message).to_string_lossy() };

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        error!("({:?}) Validation Layer: {}", type_, message);
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        warn!("({:?}) Validation Layer: {}", type_, message);
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        debug!("({:?}) Validation Layer: {}", type_, message);
    } else {
        trace!("({:?}) Validation Layer: {}", type_, message);
    }
    vk::FALSE
}

//==================================================================================================
// SECTION: Physical Device and Logical Device
//==================================================================================================

fn pick_physical_device(
    instance: &Instance,
    surface_instance: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<vk::PhysicalDevice> {
    // SAFETY: the instance is live.
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };
    if physical_devices.is_empty() {
        return Err(anyhow!("Failed to find GPUs with Vulkan support."));
    }

    for physical_device in physical_devices {
        // SAFETY: `device_name` is NUL-terminated.
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name =
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy() };

        match check_physical_device_suitability(
            instance,
            surface_instance,
            surface,
            physical_device,
        ) {
            Ok(()) => {
                info!("Selected physical device (`{}`).", device_name);
                return Ok(physical_device);
            }
            Err(error) => warn!("Skipping physical device (`{}`): {}", device_name, error),
        }
    }
    Err(anyhow!("Failed to find a suitable physical device."))
}

fn check_physical_device_suitability(
    instance: &Instance,
    surface_instance: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    QueueFamilyIndices::get(instance, surface_instance, surface, physical_device)?;
    check_physical_device_extensions(instance, physical_device)?;

    // SAFETY: surface and physical device are live.
    let (formats, present_modes) = unsafe {
        (
            surface_instance.get_physical_device_surface_formats(physical_device, surface)?,
            surface_instance.get_physical_device_surface_present_modes(physical_device, surface)?,
        )
    };
    if formats.is_empty() || present_modes.is_empty() {
        return Err(anyhow!(SuitabilityError::Static(
            "Insufficient swapchain support."
        )));
    }

    // SAFETY: physical device is live.
    let format_properties = unsafe {
        instance.get_physical_device_format_properties(
            physical_device,
            frameforge::hdr::HDR_FORMAT,
        )
    };
    let needed = vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::SAMPLED_IMAGE;
    if !format_properties.optimal_tiling_features.contains(needed) {
        return Err(anyhow!(SuitabilityError::Static(
            "HDR format is not renderable and sampleable."
        )));
    }

    // The composite loops over the bloom sampler array.
    // SAFETY: physical device is live.
    let features = unsafe { instance.get_physical_device_features(physical_device) };
    if features.shader_sampled_image_array_dynamic_indexing != vk::TRUE {
        return Err(anyhow!(SuitabilityError::Static(
            "Sampled image array dynamic indexing not supported."
        )));
    }
    Ok(())
}

fn check_physical_device_extensions(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<()> {
    // SAFETY: `CStr::from_ptr` relies on Vulkan providing NUL-terminated extension names.
    let available_extensions =
        unsafe { instance.enumerate_device_extension_properties(physical_device)? }
            .iter()
            .map(|e| unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }.to_owned())
            .collect::<HashSet<_>>();

    for &required_ext in DEVICE_EXTENSIONS {
        if !available_extensions.contains(required_ext) {
            return Err(anyhow!(SuitabilityError::Dynamic(format!(
                "Missing required device extension: {}",
                required_ext.to_string_lossy()
            ))));
        }
    }
    Ok(())
}

fn create_logical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    indices: QueueFamilyIndices,
) -> Result<ash::Device> {
    let mut unique_indices = HashSet::new();
    unique_indices.insert(indices.graphics);
    unique_indices.insert(indices.present);

    let queue_priorities = &[1.0];
    let queue_infos = unique_indices
        .iter()
        .map(|i| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(*i)
                .queue_priorities(queue_priorities)
        })
        .collect::<Vec<_>>();

    let extension_ptrs: Vec<*const c_char> =
        DEVICE_EXTENSIONS.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default();
    let mut features_chain = vk::PhysicalDeviceFeatures2::default()
        .features(
            vk::PhysicalDeviceFeatures::default().shader_sampled_image_array_dynamic_indexing(true),
        )
        .push_next(&mut vulkan_1_2_features)
        .push_next(&mut vulkan_1_3_features);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_ptrs)
        .push_next(&mut features_chain);

    // SAFETY: physical device is live and `create_info` outlives the call.
    let device = unsafe { instance.create_device(physical_device, &create_info, None)? };
    Ok(device)
}
