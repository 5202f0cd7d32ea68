//! Instance, surface and physical device selection

use std::ffi::{c_char, CStr, CString};

use ash::khr::surface;
use ash::vk;
use log::{debug, info, warn};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::config::RendererConfig;
use crate::error::{RenderError, RenderResult};

/// Vulkan instance plus the window surface and the physical device that can
/// render to it. Destroys the surface and instance on drop.
pub struct VulkanContext {
    entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    device_name: String,
}

const ENGINE_NAME: &CStr = c"vk-render-core";

fn init_error(context: &str, err: impl std::fmt::Display) -> RenderError {
    RenderError::InitializationFailed(format!("{context}: {err}"))
}

impl VulkanContext {
    pub fn new(window: &winit::window::Window, config: &RendererConfig) -> RenderResult<Self> {
        unsafe {
            let entry = ash::Entry::load().map_err(|e| init_error("load Vulkan loader", e))?;

            let app_name = CString::new(config.app_name.as_str())
                .map_err(|e| init_error("application name", e))?;
            let app_info = vk::ApplicationInfo::default()
                .application_name(&app_name)
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(ENGINE_NAME)
                .engine_version(vk::make_api_version(0, 1, 0, 0))
                .api_version(vk::API_VERSION_1_2);

            let display_handle = window
                .display_handle()
                .map_err(|e| init_error("display handle", e))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| init_error("window handle", e))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| init_error("required surface extensions", e))?
                .to_vec();

            let layers = Self::available_layers(&entry, &config.validation_layers);
            let layer_ptrs: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(&extensions)
                .enabled_layer_names(&layer_ptrs);

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| RenderError::native("create instance", e))?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = match ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            ) {
                Ok(surface) => surface,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(RenderError::native("create surface", e));
                }
            };

            let picked = Self::pick_physical_device(&instance, &surface_fn, surface);
            let (physical_device, queue_family) = match picked {
                Ok(Some(picked)) => picked,
                Ok(None) => {
                    surface_fn.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                    return Err(RenderError::InitializationFailed(
                        "no physical device can render to the window surface".into(),
                    ));
                }
                Err(e) => {
                    surface_fn.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                    return Err(RenderError::native("enumerate physical devices", e));
                }
            };

            let properties = instance.get_physical_device_properties(physical_device);
            let device_name = properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown device".to_string());
            info!("Using {device_name} (queue family {queue_family})");

            Ok(Self {
                entry,
                instance,
                surface_fn,
                surface,
                physical_device,
                queue_family,
                device_name,
            })
        }
    }

    /// Keep only the requested layers the loader actually provides.
    fn available_layers(entry: &ash::Entry, requested: &[String]) -> Vec<CString> {
        if requested.is_empty() {
            return Vec::new();
        }
        let available = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
        requested
            .iter()
            .filter_map(|name| {
                let found = available.iter().any(|layer| {
                    layer
                        .layer_name_as_c_str()
                        .is_ok_and(|l| l.to_bytes() == name.as_bytes())
                });
                if !found {
                    warn!("Validation layer {name} is not available");
                    return None;
                }
                debug!("Enabling layer {name}");
                CString::new(name.as_str()).ok()
            })
            .collect()
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> ash::prelude::VkResult<Option<(vk::PhysicalDevice, u32)>> {
        let physical_devices = unsafe { instance.enumerate_physical_devices()? };
        Ok(physical_devices.into_iter().find_map(|pd| {
            Self::find_queue_family(instance, pd, surface_fn, surface).map(|family| (pd, family))
        }))
    }

    /// First queue family that supports graphics and can present to `surface`.
    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        queue_families.iter().enumerate().find_map(|(index, family)| {
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };
            (supports_graphics && supports_surface).then_some(index as u32)
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn surface_fn(&self) -> &surface::Instance {
        &self.surface_fn
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
