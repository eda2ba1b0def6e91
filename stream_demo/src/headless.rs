//! Window-less Vulkan bring-up
//!
//! Creates an instance, picks the first physical device with a graphics or
//! transfer queue and opens one queue on it. Validation and object naming are
//! enabled in debug builds when the loader offers them.

use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::extensions::ext::DebugUtils;
use ash::vk;
use ash::{Entry, Instance};
use gpu_stream::{GpuError, GpuResult, VulkanDevice};

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Instance, device and queue owned for the lifetime of the demo
///
/// Everything created on [`HeadlessVulkan::device`] must be dropped before
/// this value.
pub struct HeadlessVulkan {
    _entry: Entry,
    instance: Instance,
    device: Arc<VulkanDevice>,
    queue: vk::Queue,
    queue_family: u32,
    debug_messenger: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl HeadlessVulkan {
    pub fn new(app_name: &str) -> GpuResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| GpuError::InitializationFailed(format!("Failed to load Vulkan: {:?}", e)))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|e| GpuError::InitializationFailed(format!("Invalid application name: {}", e)))?;
        let engine_name_cstr = CString::new("gpu_stream").unwrap_or_default();
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let debug = cfg!(debug_assertions) && Self::debug_utils_available(&entry);
        let validation = cfg!(debug_assertions) && Self::validation_available(&entry);

        let mut extensions = Vec::new();
        if debug {
            extensions.push(DebugUtils::name().as_ptr());
        }
        let layer_names: Vec<CString> = if validation {
            vec![CString::new(VALIDATION_LAYER).unwrap_or_default()]
        } else {
            Vec::new()
        };
        let layer_ptrs: Vec<*const std::os::raw::c_char> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(GpuError::Api)?;

        let debug_messenger = if debug {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    log::warn!("Debug messenger unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (physical_device, queue_family) = match Self::select_device(&instance) {
            Ok(selected) => selected,
            Err(e) => {
                Self::destroy_instance(&instance, &debug_messenger);
                return Err(e);
            }
        };

        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&priorities)
            .build()];
        let device_info = vk::DeviceCreateInfo::builder().queue_create_infos(&queue_infos);

        let raw_device = match unsafe { instance.create_device(physical_device, &device_info, None) } {
            Ok(device) => device,
            Err(e) => {
                Self::destroy_instance(&instance, &debug_messenger);
                return Err(GpuError::Api(e));
            }
        };
        let queue = unsafe { raw_device.get_device_queue(queue_family, 0) };

        let mut device = VulkanDevice::new(&instance, physical_device, raw_device);
        if debug {
            device = device.with_debug_utils(DebugUtils::new(&entry, &instance));
        }

        Ok(Self {
            _entry: entry,
            instance,
            device: Arc::new(device),
            queue,
            queue_family,
            debug_messenger,
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    fn debug_utils_available(entry: &Entry) -> bool {
        entry
            .enumerate_instance_extension_properties(None)
            .map(|extensions| {
                extensions
                    .iter()
                    .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == DebugUtils::name())
            })
            .unwrap_or(false)
    }

    fn validation_available(entry: &Entry) -> bool {
        entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers.iter().any(|layer| {
                    unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }.to_str() == Ok(VALIDATION_LAYER)
                })
            })
            .unwrap_or(false)
    }

    fn setup_debug_messenger(debug_utils: &DebugUtils) -> GpuResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }.map_err(GpuError::Api)
    }

    /// First device with a queue family supporting graphics, else transfer
    fn select_device(instance: &Instance) -> GpuResult<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }.map_err(GpuError::Api)?;

        for device in devices {
            let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
            let family = families
                .iter()
                .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .or_else(|| {
                    families
                        .iter()
                        .position(|f| f.queue_flags.contains(vk::QueueFlags::TRANSFER))
                });

            if let Some(family) = family {
                let properties = unsafe { instance.get_physical_device_properties(device) };
                log::info!(
                    "Selected GPU: {} (queue family {})",
                    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
                    family
                );
                return Ok((device, family as u32));
            }
        }

        Err(GpuError::InitializationFailed("No GPU with a graphics or transfer queue found".to_string()))
    }

    fn destroy_instance(instance: &Instance, debug_messenger: &Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>) {
        unsafe {
            if let Some((debug_utils, messenger)) = debug_messenger {
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }
            instance.destroy_instance(None);
        }
    }
}

impl Drop for HeadlessVulkan {
    fn drop(&mut self) {
        if Arc::strong_count(&self.device) > 1 {
            log::error!("Vulkan device still shared at teardown, leaking it");
            return;
        }
        unsafe {
            let _ = self.device.raw().device_wait_idle();
            self.device.raw().destroy_device(None);
        }
        Self::destroy_instance(&self.instance, &self.debug_messenger);
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = *callback_data;
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}
