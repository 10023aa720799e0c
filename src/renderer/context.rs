use std::sync::{Arc, Mutex};
use ash::vk;
use bytemuck::Pod;
use color_eyre::Result;
use color_eyre::eyre::{eyre, WrapErr};
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::Allocator;
use crate::renderer::config::{DestroyBuffersFn, RenderConfig};
use crate::renderer::contexts::device_ctx::device::{DeviceRequirements, RenderDevice};
use crate::renderer::contexts::device_ctx::instance::{InstanceBuilder, RenderInstance};
use crate::renderer::contexts::frame_ctx::{FrameBackend, FrameState, RenderFrameContext};
use crate::renderer::contexts::frame_ctx::presenter::{PresenterCreateInfo, VulkanPresenter};
use crate::renderer::internals::barrier::ResourceState;
use crate::renderer::internals::swapchain::SwapchainFormats;
use crate::renderer::internals::transient::{BufferRange, TransientRegion, UniformBuffer};
use crate::renderer::resources::buffer::Buffer;
use crate::renderer::resources::image::Image;

/// Responsibilities:
/// - Bring up the instance, device and presenter from a `RenderConfig`
/// - Expose the frame loop, barriers and uploads to the application
/// - Create images and buffers that the barrier batcher knows about
///
/// Fields drop top to bottom: frames, device, instance.
pub struct GraphicsContext {
    frames: RenderFrameContext<VulkanPresenter>,
    on_destroy_buffers: DestroyBuffersFn,
    device: RenderDevice,
    instance: RenderInstance,
}

impl GraphicsContext {
    pub fn init(config: RenderConfig) -> Result<Self> {
        config.validate()?;
        let RenderConfig {
            window_size,
            create_surface,
            on_resize,
            on_destroy_buffers,
            instance_extensions,
            device_extensions,
            use_validation,
            use_integrated_gpu,
            vsync,
            width,
            height,
            frames_in_flight,
            scratch_buffer_size,
            uniform_arena_size,
            application_name,
            application_version: (major, minor, patch),
        } = config;

        let instance = InstanceBuilder::new()
            .application_name(application_name)
            .application_version(major, minor, patch)
            .extensions(instance_extensions)
            .default_validation_layers(use_validation)
            .build(ash::Entry::linked())
            .wrap_err("Failed to create Vulkan instance")?;

        let surface_loader = ash::khr::surface::Instance::new(&instance.entry, &instance.instance);
        let surface = create_surface(&instance.entry, &instance.instance)
            .wrap_err("Failed to create window surface")?;

        let device = RenderDevice::new(
            &instance,
            &DeviceRequirements {
                surface,
                surface_loader: &surface_loader,
                extensions: &device_extensions,
                use_integrated_gpu,
            },
        );
        let device = match device {
            Ok(device) => device,
            Err(err) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(err.wrap_err("Failed to create Vulkan device"));
            }
        };

        let swapchain_loader = Arc::new(ash::khr::swapchain::Device::new(
            &instance.instance,
            &device.logical,
        ));
        let supports_timestamps = device.supports_timestamps();
        if !supports_timestamps {
            log::info!("Timestamp queries unsupported, GPU frame times disabled");
        }

        let presenter = VulkanPresenter::new(
            PresenterCreateInfo {
                surface,
                surface_loader,
                swapchain_loader,
                physical: device.physical,
                queue: device.queue.handle,
                queue_family_index: device.queue.family_index,
                timestamp_period: device.properties.limits.timestamp_period,
                supports_timestamps,
                non_coherent_atom_size: device.properties.limits.non_coherent_atom_size,
                vsync,
                width,
                height,
                frames_in_flight,
                scratch_buffer_size,
                uniform_arena_size,
                window_size,
                on_resize,
            },
            device.memory_allocator(),
            device.logical.clone(),
        )?;

        let frames = RenderFrameContext::new(
            presenter,
            frames_in_flight,
            scratch_buffer_size,
            uniform_arena_size,
        );
        log::info!(
            "Graphics context ready: {} frames in flight, {} KiB scratch per frame",
            frames.frames_in_flight(),
            scratch_buffer_size / 1024,
        );

        Ok(Self {
            frames,
            on_destroy_buffers,
            device,
            instance,
        })
    }

    /// Tears everything down. Equivalent to dropping the context.
    pub fn deinit(self) {
        drop(self);
    }

    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device.logical
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance.instance
    }

    pub fn memory_allocator(&self) -> Arc<Mutex<Allocator>> {
        self.device.memory_allocator()
    }

    pub fn descriptor_pool(&self) -> vk::DescriptorPool {
        self.device.descriptor_pool()
    }

    /// Command buffer of the frame slot currently in use
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.frames.backend().command_buffer(self.frames.current_slot())
    }

    pub fn swapchain_formats(&self) -> SwapchainFormats {
        let surface = self.frames.backend().swapchain_format().unwrap_or_default();
        SwapchainFormats {
            color: surface.format,
            color_space: surface.color_space,
            depth: self.device.depth_format,
        }
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.frames.backend().swapchain_extent()
    }

    pub fn frame_index(&self) -> u64 {
        self.frames.frame_index()
    }

    pub fn frame_state(&self) -> FrameState {
        self.frames.state()
    }

    pub fn gpu_frame_time_ms(&self) -> Option<f64> {
        self.frames.backend().gpu_frame_time_ms()
    }

    pub fn frames(&self) -> &RenderFrameContext<VulkanPresenter> {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut RenderFrameContext<VulkanPresenter> {
        &mut self.frames
    }

    // Frame loop

    pub fn begin_frame(&mut self) -> Result<bool> {
        self.frames.begin_frame()
    }

    pub fn present_image(&mut self, image: &Image) -> Result<()> {
        self.frames.present_image(image.image, image.extent)
    }

    pub fn begin_pre_frame(&mut self) -> Result<()> {
        self.frames.begin_pre_frame()
    }

    pub fn end_pre_frame(&mut self) -> Result<()> {
        self.frames.end_pre_frame()
    }

    pub fn resize(&mut self) -> Result<()> {
        self.frames.resize()
    }

    // Barriers

    pub fn track_image(&mut self, image: &Image, reset_each_frame: bool) {
        self.frames
            .barriers_mut()
            .track_image(image.image, image.aspect, reset_each_frame);
    }

    pub fn forget_image(&mut self, image: &Image) {
        self.frames.barriers_mut().forget_image(image.image);
    }

    pub fn image_barrier(
        &mut self,
        image: &Image,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
        new_layout: vk::ImageLayout,
    ) -> Result<bool> {
        self.frames.image_barrier(image.image, dst_stage, dst_access, new_layout)
    }

    pub fn image_barrier_from(
        &mut self,
        image: &Image,
        src: ResourceState,
        dst: ResourceState,
    ) -> Result<bool> {
        self.frames.image_barrier_from(image.image, src, dst)
    }

    pub fn buffer_barrier(
        &mut self,
        buffer: &BufferRange,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> bool {
        self.frames.buffer_barrier(buffer, dst_stage, dst_access)
    }

    pub fn flush_barriers(&mut self) -> bool {
        self.frames.flush_barriers()
    }

    // Uploads

    pub fn upload_to_scratch<T: Pod>(&mut self, data: &[T]) -> Result<TransientRegion> {
        self.frames.upload_to_scratch(bytemuck::cast_slice(data))
    }

    pub fn upload_to_gpu_buffer<T: Pod>(
        &mut self,
        dst: &Buffer,
        dst_offset: u64,
        data: &[T],
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> Result<()> {
        self.frames.upload_to_gpu_buffer(
            &dst.range(),
            dst_offset,
            bytemuck::cast_slice(data),
            dst_stage,
            dst_access,
        )
    }

    pub fn create_uniform_buffer<T: Pod>(&mut self) -> Result<UniformBuffer> {
        self.frames.create_uniform_buffer(size_of::<T>() as u64)
    }

    pub fn upload_to_uniform_buffer<T: Pod>(
        &mut self,
        uniform: &UniformBuffer,
        value: &T,
    ) -> Result<()> {
        self.frames.upload_to_uniform_buffer(uniform, bytemuck::bytes_of(value))
    }

    // Resources

    /// Color image in the swapchain's format unless `format` says otherwise.
    /// Its recorded state is reset at the start of every frame.
    pub fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
        format: Option<vk::Format>,
    ) -> Result<Image> {
        let format = format.unwrap_or(self.swapchain_formats().color);
        let image = Image::new_render_target(
            width,
            height,
            format,
            self.memory_allocator(),
            self.device.logical.clone(),
        )?;
        self.track_image(&image, true);
        Ok(image)
    }

    pub fn create_depth_target(&mut self, width: u32, height: u32) -> Result<Image> {
        let image = Image::new_depth_image(
            width,
            height,
            self.device.depth_format,
            self.memory_allocator(),
            self.device.logical.clone(),
        )?;
        self.track_image(&image, true);
        Ok(image)
    }

    /// Storage images keep their contents, and their recorded state, across frames
    pub fn create_storage_image(&mut self, width: u32, height: u32) -> Result<Image> {
        let image = Image::new_storage_image(
            width,
            height,
            self.memory_allocator(),
            self.device.logical.clone(),
        )?;
        self.track_image(&image, false);
        Ok(image)
    }

    pub fn create_gpu_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Buffer> {
        Buffer::new(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            name,
            MemoryLocation::GpuOnly,
            self.memory_allocator(),
            self.device.logical.clone(),
        )
    }

    /// Waits for the device, then unregisters and releases the image
    pub fn destroy_image(&mut self, image: Image) -> Result<()> {
        self.frames.backend_mut().wait_idle()?;
        self.forget_image(&image);
        drop(image);
        Ok(())
    }

    /// Waits for the device, then forgets every recorded state of the buffer
    pub fn destroy_buffer(&mut self, buffer: Buffer) -> Result<()> {
        self.frames.backend_mut().wait_idle()?;
        self.frames.barriers_mut().forget_buffer(buffer.buffer);
        drop(buffer);
        Ok(())
    }

    // Pipelines

    /// Transitions the attachments, flushes every queued barrier and opens a
    /// dynamic rendering scope covering the whole color target. The color
    /// attachment is cleared when `clear_color` is set and loaded otherwise.
    /// Depth is always cleared to 1.0.
    pub fn begin_render_pipeline(
        &mut self,
        pipeline: vk::Pipeline,
        color: &Image,
        depth: Option<&Image>,
        clear_color: Option<[f32; 4]>,
    ) -> Result<()> {
        self.require_recording("begin_render_pipeline")?;

        self.image_barrier(
            color,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )?;
        if let Some(depth) = depth {
            self.image_barrier(
                depth,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )?;
        }
        self.flush_barriers();

        let (load_op, clear_value) = match clear_color {
            Some(float32) => (
                vk::AttachmentLoadOp::CLEAR,
                vk::ClearValue { color: vk::ClearColorValue { float32 } },
            ),
            None => (vk::AttachmentLoadOp::LOAD, vk::ClearValue::default()),
        };
        let color_attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(color.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(load_op)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear_value)];
        let depth_attachment = depth.map(|depth| {
            vk::RenderingAttachmentInfo::default()
                .image_view(depth.view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                })
        });

        let render_area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: color.extent,
        };
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: color.extent.width as f32,
            height: color.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        let cmd = self.command_buffer();
        let device = &self.device.logical;
        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
        }
        Ok(())
    }

    pub fn end_render_pipeline(&mut self) -> Result<()> {
        self.require_recording("end_render_pipeline")?;
        unsafe {
            self.device.logical.cmd_end_rendering(self.command_buffer());
        }
        Ok(())
    }

    /// Flushes every queued barrier and binds `pipeline` for dispatches
    pub fn begin_compute_pipeline(&mut self, pipeline: vk::Pipeline) -> Result<()> {
        self.require_recording("begin_compute_pipeline")?;
        self.flush_barriers();
        unsafe {
            self.device.logical.cmd_bind_pipeline(
                self.command_buffer(),
                vk::PipelineBindPoint::COMPUTE,
                pipeline,
            );
        }
        Ok(())
    }

    fn require_recording(&self, op: &str) -> Result<()> {
        match self.frames.state() {
            FrameState::Recording | FrameState::PreFrame => Ok(()),
            state => Err(eyre!("{} called while {:?}", op, state)),
        }
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        if let Err(err) = self.frames.backend_mut().wait_idle() {
            log::error!("Failed to wait for device idle: {:#}", err);
        }
        (self.on_destroy_buffers)();
        log::info!("Graphics context destroyed after {} frames", self.frames.frame_index());
    }
}
