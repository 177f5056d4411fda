// SPDX-License-Identifier: CEPL-1.0
use std::ffi::{c_void, CStr, CString};

use anyhow::{Context, Result};
use ash::ext::debug_utils;
use ash::khr::surface;
use ash::{vk, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info, trace, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const ENGINE_NAME: &CStr = c"Stratus";

/// Instance-scoped Vulkan objects: loader entry, instance, window surface and
/// the optional validation messenger.
pub struct InstanceContext {
    pub entry: Entry,
    pub instance: Instance,
    pub surface_loader: surface::Instance,
    pub surface: vk::SurfaceKHR,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let msg = CStr::from_ptr((*data).p_message).to_string_lossy();
    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("[vk {types:?}] {msg}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[vk {types:?}] {msg}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => debug!("[vk {types:?}] {msg}"),
        _ => trace!("[vk {types:?}] {msg}"),
    }
    vk::FALSE
}

unsafe fn has_validation_layer(entry: &Entry) -> bool {
    match entry.enumerate_instance_layer_properties() {
        Ok(layers) => layers
            .iter()
            .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER),
        Err(_) => false,
    }
}

unsafe fn create_instance(
    entry: &Entry,
    app_name: &str,
    display: &dyn HasDisplayHandle,
    validation: bool,
) -> Result<Instance> {
    let app = CString::new(app_name).unwrap_or_else(|_| CString::from(ENGINE_NAME));

    let app_info = vk::ApplicationInfo {
        s_type: vk::StructureType::APPLICATION_INFO,
        p_application_name: app.as_ptr(),
        application_version: vk::make_api_version(0, 1, 0, 0),
        p_engine_name: ENGINE_NAME.as_ptr(),
        engine_version: vk::make_api_version(0, 1, 0, 0),
        api_version: vk::API_VERSION_1_2,
        ..Default::default()
    };

    let display_raw = display
        .display_handle()
        .map_err(|e| anyhow::anyhow!("display_handle: {e}"))?
        .as_raw();
    let mut extensions = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?
        .to_vec();
    if validation {
        extensions.push(debug_utils::NAME.as_ptr());
    }

    let layers = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    Ok(entry
        .create_instance(&create_info, None)
        .context("create_instance")?)
}

unsafe fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader
        .create_debug_utils_messenger(&ci, None)
        .context("create_debug_utils_messenger")?;
    Ok((loader, messenger))
}

impl InstanceContext {
    /// Creates the instance, then the surface from that instance. Physical
    /// devices must be queried against this surface afterwards.
    ///
    /// # Safety
    /// The window behind `window`/`display` must outlive the returned context.
    pub unsafe fn new(
        app_name: &str,
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        validation: bool,
    ) -> Result<Self> {
        let dh = display
            .display_handle()
            .map_err(|e| anyhow::anyhow!("display_handle: {e}"))?
            .as_raw();
        let wh = window
            .window_handle()
            .map_err(|e| anyhow::anyhow!("window_handle: {e}"))?
            .as_raw();

        let entry = Entry::linked();

        let validation = if validation && !has_validation_layer(&entry) {
            warn!("vk: validation requested but VK_LAYER_KHRONOS_validation is not installed");
            false
        } else {
            validation
        };

        let instance = create_instance(&entry, app_name, display, validation)?;

        let messenger = if validation {
            match create_debug_messenger(&entry, &instance) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("vk: debug messenger unavailable: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        let surface = match ash_window::create_surface(&entry, &instance, dh, wh, None) {
            Ok(s) => s,
            Err(e) => {
                if let Some((loader, handle)) = &messenger {
                    loader.destroy_debug_utils_messenger(*handle, None);
                }
                instance.destroy_instance(None);
                return Err(anyhow::anyhow!("create_surface: {e}"));
            }
        };
        let surface_loader = surface::Instance::new(&entry, &instance);

        let validation = messenger.is_some();
        info!("vk: instance ready (validation={validation})");
        Ok(Self {
            entry,
            instance,
            surface_loader,
            surface,
            debug: messenger,
        })
    }
}

impl Drop for InstanceContext {
    fn drop(&mut self) {
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        debug!("vk: surface and instance destroyed");
    }
}
