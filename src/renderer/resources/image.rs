use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::eyre::Result;
use color_eyre::eyre::eyre;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator},
    MemoryLocation,
};

pub struct ImageCreateInfo {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub name: String,
}

pub struct Image {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,
    pub usage: vk::ImageUsageFlags,

    allocation: Option<Allocation>, // GPU-only memory block
    memory_allocator: Arc<Mutex<Allocator>>,
    device: Arc<ash::Device>,
}

impl Image {
    // NOTE: The contents of the returned image are undefined. Transition it
    // through the barrier batcher before the first use.
    pub fn new(
        create_info: &ImageCreateInfo,
        memory_allocator: Arc<Mutex<Allocator>>,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        let image = {
            let info = vk::ImageCreateInfo::default()
                .format(create_info.format)
                .usage(create_info.usage)
                .extent(vk::Extent3D {
                    width: create_info.extent.width,
                    height: create_info.extent.height,
                    depth: 1,
                })
                .image_type(vk::ImageType::TYPE_2D)
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            unsafe { device.create_image(&info, None)? }
        };

        // Owns the handle from here on so every early return cleans up
        let mut this = Self {
            image,
            view: vk::ImageView::null(),
            format: create_info.format,
            extent: create_info.extent,
            aspect: create_info.aspect,
            usage: create_info.usage,

            allocation: None,
            memory_allocator,
            device,
        };

        let reqs = unsafe { this.device.get_image_memory_requirements(image) };
        let allocation = this
            .memory_allocator
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .allocate(&AllocationCreateDesc {
                name: &create_info.name,
                requirements: reqs,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::DedicatedImage(image),
            })?;
        unsafe {
            this.device.bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }
        this.allocation = Some(allocation);

        this.view = {
            let info = vk::ImageViewCreateInfo::default()
                .view_type(vk::ImageViewType::TYPE_2D)
                .image(image)
                .format(create_info.format)
                .subresource_range(vk::ImageSubresourceRange {
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                    aspect_mask: create_info.aspect,
                });
            unsafe { this.device.create_image_view(&info, None)? }
        };

        Ok(this)
    }

    /// A color image that can be drawn to, written by compute, and blitted to the swapchain
    pub fn new_render_target(
        width: u32,
        height: u32,
        format: vk::Format,
        memory_allocator: Arc<Mutex<Allocator>>,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        let create_info = ImageCreateInfo {
            format,
            extent: vk::Extent2D { width, height },
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            name: "Render Target".into(),
        };
        Self::new(&create_info, memory_allocator, device)
    }

    /// Create a special type of image used for depth buffer
    pub fn new_depth_image(
        width: u32,
        height: u32,
        format: vk::Format,
        memory_allocator: Arc<Mutex<Allocator>>,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        let aspect = match format {
            vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::DEPTH,
        };
        let create_info = ImageCreateInfo {
            format,
            extent: vk::Extent2D { width, height },
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect,
            name: "Depth Target".into(),
        };
        Self::new(&create_info, memory_allocator, device)
    }

    /// Create a special type of image likely used by compute shaders
    pub fn new_storage_image(
        width: u32,
        height: u32,
        memory_allocator: Arc<Mutex<Allocator>>,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        let create_info = ImageCreateInfo {
            format: vk::Format::R16G16B16A16_SFLOAT,
            extent: vk::Extent2D { width, height },
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            name: "Storage Image".into(),
        };
        Self::new(&create_info, memory_allocator, device)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.destroy_image_view(self.view, None);
            }
        }
        if let Some(allocation) = self.allocation.take() {
            match self.memory_allocator.lock() {
                Ok(mut allocator) => {
                    if let Err(err) = allocator.free(allocation) {
                        log::error!("Failed to free image memory: {}", err);
                    }
                }
                Err(err) => log::error!("Memory allocator poisoned: {}", err),
            }
        }
        unsafe {
            self.device.destroy_image(self.image, None);
        }
    }
}
