use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::eyre::OptionExt;
use color_eyre::Result;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use crate::renderer::contexts::device_ctx::instance::RenderInstance;
use crate::renderer::contexts::device_ctx::queue::{find_universal_family, Queue};
use crate::renderer::internals::swapchain::choose_depth_format;

const DESCRIPTORS_PER_TYPE: u32 = 1024;
const MAX_DESCRIPTOR_SETS: u32 = 1024;

pub struct DeviceRequirements<'a> {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: &'a ash::khr::surface::Instance,
    pub extensions: &'a [CString],
    pub use_integrated_gpu: bool,
}

/// Main structure for the renderer
pub struct RenderDevice {
    pub logical: Arc<ash::Device>,
    pub physical: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub queue: Queue,
    pub depth_format: vk::Format,

    memory_allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,
    descriptor_pool: vk::DescriptorPool,
}

impl RenderDevice {
    pub fn new(
        instance: &RenderInstance,
        requirements: &DeviceRequirements,
    ) -> Result<Self> {
        let extensions = Self::get_required_device_extensions(requirements.extensions);
        let (physical_device, queue_family_index) = Self::select_physical_device(
            &instance.instance,
            requirements,
            &extensions,
        )?;

        let properties = unsafe {
            instance.instance.get_physical_device_properties(physical_device)
        };
        log::info!(
            "Using {:?} ({:?})",
            properties.device_name_as_c_str().unwrap_or(c"unknown"),
            properties.device_type,
        );

        let (logical_device, queue) = Self::create_logical_device(
            &instance.instance,
            physical_device,
            queue_family_index,
            &extensions,
        )?;

        let memory_allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: logical_device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: true,
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let memory_allocator = match memory_allocator {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe { logical_device.destroy_device(None) };
                return Err(err.into());
            }
        };

        let depth_format = choose_depth_format(|format| {
            let props = unsafe {
                instance
                    .instance
                    .get_physical_device_format_properties(physical_device, format)
            };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        });

        // Owns the device from here on so every early return cleans up
        let mut dev = Self {
            logical: Arc::new(logical_device),
            physical: physical_device,
            properties,
            queue,
            depth_format: vk::Format::UNDEFINED,

            memory_allocator: ManuallyDrop::new(Arc::new(Mutex::new(memory_allocator))),
            descriptor_pool: vk::DescriptorPool::null(),
        };
        dev.depth_format = depth_format?;
        dev.descriptor_pool = Self::create_descriptor_pool(&dev.logical)?;

        Ok(dev)
    }

    pub fn memory_allocator(&self) -> Arc<Mutex<Allocator>> {
        Arc::clone(&self.memory_allocator)
    }

    pub fn descriptor_pool(&self) -> vk::DescriptorPool {
        self.descriptor_pool
    }

    /// Both a valid timestamp period and timestamp bits on our queue
    pub fn supports_timestamps(&self) -> bool {
        self.properties.limits.timestamp_compute_and_graphics == vk::TRUE
            && self.properties.limits.timestamp_period > 0.0
            && self.queue.supports_timestamps()
    }

    fn select_physical_device(
        instance: &ash::Instance,
        requirements: &DeviceRequirements,
        extensions: &[&CStr],
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices()? };

        devices
            .into_iter()
            // Filter out devices below Vulkan 1.3
            .filter(|device| {
                let props = unsafe { instance.get_physical_device_properties(*device) };
                let supported = supports_vulkan_1_3(props.api_version);
                if !supported {
                    log::warn!(
                        "Skipping {:?}: Vulkan {}.{} is below 1.3",
                        props.device_name_as_c_str().unwrap_or(c"unknown"),
                        vk::api_version_major(props.api_version),
                        vk::api_version_minor(props.api_version),
                    );
                }
                supported
            })
            // Filter out devices that do not contain the required device extensions
            .filter(|device| {
                let supported = unsafe {
                    instance
                        .enumerate_device_extension_properties(*device)
                        .unwrap_or_default()
                };
                let supported = supported
                    .iter()
                    .filter_map(|ext| ext.extension_name_as_c_str().ok())
                    .collect::<Vec<_>>();
                let missing = missing_extensions(extensions, &supported);
                for ext in &missing {
                    log::warn!("Device extension not supported: {:?}", ext);
                }
                missing.is_empty()
            })
            // Filter out devices without a graphics + compute + present family
            .filter_map(|device| {
                let families = unsafe {
                    instance.get_physical_device_queue_family_properties(device)
                };
                find_universal_family(&families, |index| unsafe {
                    requirements
                        .surface_loader
                        .get_physical_device_surface_support(device, index, requirements.surface)
                        .unwrap_or(false)
                })
                .map(|index| (device, index))
            })
            .min_by_key(|(device, _)| {
                let props = unsafe { instance.get_physical_device_properties(*device) };
                device_type_rank(props.device_type, requirements.use_integrated_gpu)
            })
            .ok_or_eyre("No suitable physical device found")
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
        extensions: &[&CStr],
    ) -> Result<(ash::Device, Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)];

        let enabled_extension_names = extensions
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&enabled_extension_names)
            .enabled_features(&features)
            .push_next(&mut vulkan13_features);

        let device = unsafe {
            instance.create_device(physical_device, &device_create_info, None)?
        };

        let queue = unsafe {
            let handle = device.get_device_queue(queue_family_index, 0);
            let properties = instance
                .get_physical_device_queue_family_properties(physical_device)
                .get(queue_family_index as usize)
                .copied()
                .unwrap_or_default();
            Queue::new(queue_family_index, handle, properties)
        };

        Ok((device, queue))
    }

    fn create_descriptor_pool(device: &ash::Device) -> Result<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::STORAGE_IMAGE,
        ]
        .map(|ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: DESCRIPTORS_PER_TYPE,
        });
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(MAX_DESCRIPTOR_SETS)
            .pool_sizes(&pool_sizes);
        Ok(unsafe { device.create_descriptor_pool(&pool_info, None)? })
    }

    fn get_required_device_extensions(extra: &[CString]) -> Vec<&CStr> {
        let mut exts = vec![
            ash::khr::swapchain::NAME,

            #[cfg(target_os = "macos")]
            ash::khr::portability_subset::NAME,
        ];
        for ext in extra {
            if !exts.contains(&ext.as_c_str()) {
                exts.push(ext.as_c_str());
            }
        }
        exts
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.logical.device_wait_idle() {
                log::error!("Failed to wait for device idle: {}", err);
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                self.logical.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            // Every buffer and image holding a clone must be gone by now
            if Arc::strong_count(&self.memory_allocator) > 1 {
                log::warn!("Memory allocator still shared at device teardown");
            }
            ManuallyDrop::drop(&mut self.memory_allocator);
            self.logical.destroy_device(None);
        }
    }
}

/// Lower is better
fn device_type_rank(device_type: vk::PhysicalDeviceType, prefer_integrated: bool) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU if prefer_integrated => 1,
        vk::PhysicalDeviceType::INTEGRATED_GPU if prefer_integrated => 0,
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        vk::PhysicalDeviceType::OTHER => 4,
        _ => 5,
    }
}

fn supports_vulkan_1_3(api_version: u32) -> bool {
    api_version >= vk::API_VERSION_1_3
}

fn missing_extensions<'a>(required: &[&'a CStr], supported: &[&CStr]) -> Vec<&'a CStr> {
    required
        .iter()
        .filter(|ext| !supported.contains(*ext))
        .copied()
        .collect()
}
