use std::ffi::{c_char, c_void, CStr, CString};
use ash::vk;
use color_eyre::eyre::eyre;
use color_eyre::Result;

const KHRONOS_VALIDATION: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Builds the Vulkan instance. Setters consume the builder.
pub struct InstanceBuilder {
    application_name: CString,
    application_version: (u32, u32, u32),
    extensions: Vec<CString>,
    validation_layers: Vec<CString>,
    debug_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
}

impl Default for InstanceBuilder {
    fn default() -> Self {
        Self {
            application_name: c"vkframe".to_owned(),
            application_version: (0, 1, 0),
            extensions: Vec::new(),
            validation_layers: Vec::new(),
            debug_severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        }
    }
}

impl InstanceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn application_name(mut self, name: CString) -> Self {
        self.application_name = name;
        self
    }

    pub fn application_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    pub fn extensions<I>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = CString>,
    {
        for ext in extensions {
            if !self.extensions.contains(&ext) {
                self.extensions.push(ext);
            }
        }
        self
    }

    /// Requests the Khronos validation layer with synchronization validation
    pub fn default_validation_layers(mut self, enable: bool) -> Self {
        self.validation_layers.clear();
        if enable {
            self.validation_layers.push(KHRONOS_VALIDATION.to_owned());
        }
        self
    }

    pub fn debug_severity(mut self, severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        self.debug_severity = severity;
        self
    }

    pub fn validation_enabled(&self) -> bool {
        !self.validation_layers.is_empty()
    }

    /// Every extension the instance will be created with
    pub fn enabled_extensions(&self) -> Vec<CString> {
        let mut exts = self.extensions.clone();
        let mut require = |ext: &CStr| {
            if !exts.iter().any(|e| e.as_c_str() == ext) {
                exts.push(ext.to_owned());
            }
        };
        if self.validation_enabled() {
            require(ash::ext::debug_utils::NAME);
            require(ash::ext::validation_features::NAME);
        }
        #[cfg(target_os = "macos")]
        {
            require(ash::khr::portability_enumeration::NAME);
            require(ash::khr::get_physical_device_properties2::NAME);
        }
        exts
    }

    pub fn build(self, entry: ash::Entry) -> Result<RenderInstance> {
        if self.validation_enabled() {
            let supported = unsafe { entry.enumerate_instance_layer_properties()? };
            let supported = supported
                .iter()
                .filter_map(|props| props.layer_name_as_c_str().ok())
                .collect::<Vec<_>>();
            let missing = missing_layers(&self.validation_layers, &supported);
            if !missing.is_empty() {
                return Err(eyre!("Validation layers not supported: {:?}", missing));
            }
        }

        let (major, minor, patch) = self.application_version;
        let application_info = vk::ApplicationInfo::default()
            .application_name(&self.application_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(c"vkframe")
            .api_version(vk::API_VERSION_1_3);

        let enabled_layer_names = self
            .validation_layers
            .iter()
            .map(|layer| layer.as_ptr())
            .collect::<Vec<*const c_char>>();
        let extensions = self.enabled_extensions();
        let enabled_extension_names = extensions
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();

        let enabled_validation_features = [vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION];
        let mut validation_features = vk::ValidationFeaturesEXT::default()
            .enabled_validation_features(&enabled_validation_features);
        let mut debug_info = debug_utils_messenger_create_info(self.debug_severity);

        let mut instance_info = vk::InstanceCreateInfo::default()
            .application_info(&application_info)
            .enabled_layer_names(&enabled_layer_names)
            .enabled_extension_names(&enabled_extension_names);
        if self.validation_enabled() {
            instance_info = instance_info
                .push_next(&mut validation_features)
                .push_next(&mut debug_info);
        }

        #[cfg(target_os = "macos")]
        let instance_info = instance_info
            .flags(vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR);

        let instance = unsafe { entry.create_instance(&instance_info, None)? };
        log::info!(
            "Vulkan instance created for {:?} {}.{}.{} (validation: {})",
            self.application_name,
            major,
            minor,
            patch,
            self.validation_enabled(),
        );

        let mut render_instance = RenderInstance {
            entry,
            instance,
            debug_utils: None,
        };

        if self.validation_enabled() {
            let loader = ash::ext::debug_utils::Instance::new(&render_instance.entry, &render_instance.instance);
            let messenger = unsafe {
                loader.create_debug_utils_messenger(
                    &debug_utils_messenger_create_info(self.debug_severity),
                    None,
                )?
            };
            render_instance.debug_utils = Some((messenger, loader));
        }

        Ok(render_instance)
    }
}

/// Initializes Vulkan and keeps the Vulkan instance alive
pub struct RenderInstance {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
}

impl RenderInstance {
    pub fn has_debug_messenger(&self) -> bool {
        self.debug_utils.is_some()
    }
}

impl Drop for RenderInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((messenger, loader)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn missing_layers(requested: &[CString], supported: &[&CStr]) -> Vec<CString> {
    requested
        .iter()
        .filter(|layer| !supported.contains(&layer.as_c_str()))
        .cloned()
        .collect()
}

fn debug_utils_messenger_create_info(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
) -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    let message_type = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severity)
        .message_type(message_type)
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let category = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "general",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "performance",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "validation",
        _ => "unknown",
    };
    let data = unsafe { &*p_callback_data };
    let message = unsafe { data.message_as_c_str() }
        .map(|msg| msg.to_string_lossy())
        .unwrap_or_default();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => log::trace!("[{}] {}", category, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("[{}] {}", category, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[{}] {}", category, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[{}] {}", category, message),
        _ => log::warn!("[{}] {}", category, message),
    }

    vk::FALSE
}
