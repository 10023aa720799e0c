use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{eyre, OptionExt, WrapErr};
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::Allocator;
use crate::renderer::config::{ResizeFn, VSyncMode, WindowSizeFn};
use crate::renderer::contexts::frame_ctx::{AcquireOutcome, FrameBackend, PresentOutcome, SubmitKind};
use crate::renderer::contexts::frame_ctx::frame::{FrameSlot, TIMESTAMPS_PER_FRAME};
use crate::renderer::internals::barrier::BarrierBatch;
use crate::renderer::internals::swapchain::Swapchain;
use crate::renderer::internals::transient::TransientRegion;
use crate::renderer::resources::buffer::Buffer;
use crate::renderer::vk::util::{blit_image_to_image, copy_buffer_region};

/// Everything `VulkanPresenter::new` needs besides the device
pub struct PresenterCreateInfo {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    pub swapchain_loader: Arc<ash::khr::swapchain::Device>,
    pub physical: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub timestamp_period: f32,
    pub supports_timestamps: bool,
    pub non_coherent_atom_size: u64,

    pub vsync: VSyncMode,
    pub width: u32,
    pub height: u32,
    pub frames_in_flight: usize,
    pub scratch_buffer_size: u64,
    pub uniform_arena_size: u64,

    pub window_size: WindowSizeFn,
    pub on_resize: ResizeFn,
}

/// Responsibilities:
/// - Own the frame slots, the swapchain and the surface
/// - Translate the frame loop's requests into queue and swapchain calls
pub struct VulkanPresenter {
    slots: Vec<FrameSlot>,
    uniform_arena: Buffer,
    swapchain: Option<Swapchain>,
    swapchain_loader: Arc<ash::khr::swapchain::Device>,
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,

    physical: vk::PhysicalDevice,
    queue: vk::Queue,
    vsync: VSyncMode,
    timestamp_period: f32,
    non_coherent_atom_size: u64,
    last_gpu_time_ns: Option<f64>,

    window_size: WindowSizeFn,
    on_resize: ResizeFn,

    device: Arc<ash::Device>,
}

impl VulkanPresenter {
    /// Takes ownership of the surface. It is destroyed with the presenter,
    /// including when creation fails.
    pub fn new(
        info: PresenterCreateInfo,
        memory_allocator: Arc<Mutex<Allocator>>,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        let PresenterCreateInfo {
            surface,
            surface_loader,
            swapchain_loader,
            physical,
            queue,
            queue_family_index,
            timestamp_period,
            supports_timestamps,
            non_coherent_atom_size,
            vsync,
            width,
            height,
            frames_in_flight,
            scratch_buffer_size,
            uniform_arena_size,
            window_size,
            on_resize,
        } = info;

        let uniform_arena = match Buffer::new(
            uniform_arena_size,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            "Uniform Arena",
            MemoryLocation::GpuOnly,
            memory_allocator.clone(),
            device.clone(),
        ) {
            Ok(buffer) => buffer,
            Err(err) => {
                unsafe { surface_loader.destroy_surface(surface, None) };
                return Err(err);
            }
        };

        let mut presenter = Self {
            slots: Vec::with_capacity(frames_in_flight),
            uniform_arena,
            swapchain: None,
            swapchain_loader,
            surface,
            surface_loader,

            physical,
            queue,
            vsync,
            timestamp_period,
            non_coherent_atom_size,
            last_gpu_time_ns: None,

            window_size,
            on_resize,

            device,
        };

        for index in 0..frames_in_flight {
            let slot = FrameSlot::new(
                index,
                queue_family_index,
                scratch_buffer_size,
                supports_timestamps,
                memory_allocator.clone(),
                presenter.device.clone(),
            )?;
            presenter.slots.push(slot);
        }

        let swapchain = Swapchain::new(
            presenter.surface,
            &presenter.surface_loader,
            presenter.swapchain_loader.clone(),
            presenter.physical,
            presenter.vsync,
            width,
            height,
            vk::SwapchainKHR::null(),
        )
        .wrap_err("Failed to create the initial swapchain")?;
        presenter.swapchain = Some(swapchain);

        Ok(presenter)
    }

    pub fn command_buffer(&self, slot: usize) -> vk::CommandBuffer {
        self.slots[slot].command_buffer
    }

    pub fn swapchain_format(&self) -> Option<vk::SurfaceFormatKHR> {
        self.swapchain.as_ref().map(|swapchain| swapchain.format)
    }

    /// GPU time of the most recently retired frame in milliseconds
    pub fn gpu_frame_time_ms(&self) -> Option<f64> {
        self.last_gpu_time_ns.map(|ns| ns / 1_000_000.0)
    }
}

impl FrameBackend for VulkanPresenter {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let frame = &mut self.slots[slot];
        let waited = unsafe {
            self.device.wait_for_fences(&[frame.render_fence], true, u64::MAX)
        };
        match waited {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) | Err(vk::Result::ERROR_DEVICE_LOST) => {
                log::error!("Frame fence for slot {} never signaled", slot);
                return Err(eyre!("Device lost while waiting for frame slot {}", slot));
            }
            Err(err) => return Err(err).wrap_err("Failed to wait for frame fence"),
        }

        if let Some(ns) = frame.read_timestamps(self.timestamp_period)? {
            self.last_gpu_time_ns = Some(ns);
        }
        Ok(())
    }

    fn begin_commands(&mut self, slot: usize) -> Result<()> {
        let frame = &self.slots[slot];
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device.reset_command_pool(frame.command_pool, vk::CommandPoolResetFlags::empty())?;
            self.device.begin_command_buffer(frame.command_buffer, &begin_info)?;
            if let Some(query_pool) = frame.query_pool {
                self.device.cmd_reset_query_pool(
                    frame.command_buffer,
                    query_pool,
                    0,
                    TIMESTAMPS_PER_FRAME,
                );
                self.device.cmd_write_timestamp2(
                    frame.command_buffer,
                    vk::PipelineStageFlags2::TOP_OF_PIPE,
                    query_pool,
                    0,
                );
            }
        }
        Ok(())
    }

    fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(AcquireOutcome::NoSwapchain);
        };
        let semaphore = self.slots[slot].acquire_semaphore;
        if semaphore == vk::Semaphore::null() {
            return Ok(AcquireOutcome::NoSwapchain);
        }

        let acquired = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain.handle,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };
        match acquired {
            Ok((index, false)) => Ok(AcquireOutcome::Acquired(index)),
            // The semaphore is left pending, the rebuild replaces it
            Ok((_, true)) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(err) => Err(err).wrap_err("Failed to acquire swapchain image"),
        }
    }

    fn swapchain_images(&self) -> &[vk::Image] {
        self.swapchain
            .as_ref()
            .map_or(&[][..], |swapchain| swapchain.images.as_slice())
    }

    fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain
            .as_ref()
            .map_or(vk::Extent2D::default(), |swapchain| swapchain.extent)
    }

    fn uniform_arena(&self) -> vk::Buffer {
        self.uniform_arena.buffer
    }

    fn window_size(&mut self) -> (u32, u32) {
        (self.window_size)()
    }

    fn record_barriers(&mut self, slot: usize, batch: &BarrierBatch) {
        batch.record(&self.device, self.slots[slot].command_buffer);
    }

    fn record_blit(
        &mut self,
        slot: usize,
        src: vk::Image,
        src_extent: vk::Extent2D,
        dst: vk::Image,
        dst_extent: vk::Extent2D,
    ) {
        blit_image_to_image(
            self.slots[slot].command_buffer,
            src,
            dst,
            src_extent,
            dst_extent,
            &self.device,
        );
    }

    fn record_scratch_copy(
        &mut self,
        slot: usize,
        src: TransientRegion,
        dst: vk::Buffer,
        dst_offset: u64,
    ) {
        let frame = &self.slots[slot];
        copy_buffer_region(
            frame.command_buffer,
            frame.scratch_buffer.buffer,
            src.offset,
            dst,
            dst_offset,
            src.size,
            &self.device,
        );
    }

    fn write_scratch(&mut self, slot: usize, offset: u64, data: &[u8]) -> Result<()> {
        let scratch = &mut self.slots[slot].scratch_buffer;
        scratch.write(data, offset as usize)?;
        scratch.flush(offset, data.len() as u64, self.non_coherent_atom_size)
    }

    fn submit(&mut self, slot: usize, kind: SubmitKind) -> Result<()> {
        let frame = &mut self.slots[slot];
        unsafe {
            if let Some(query_pool) = frame.query_pool {
                self.device.cmd_write_timestamp2(
                    frame.command_buffer,
                    vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                    query_pool,
                    1,
                );
                frame.timestamps_written = true;
            }
            self.device.end_command_buffer(frame.command_buffer)?;
            self.device.reset_fences(&[frame.render_fence])?;
        }

        let command_buffer_infos = [vk::CommandBufferSubmitInfo::default()
            .command_buffer(frame.command_buffer)];
        let wait_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.acquire_semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.release_semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];

        let submit_info = vk::SubmitInfo2::default().command_buffer_infos(&command_buffer_infos);
        let submit_info = match kind {
            SubmitKind::Frame => submit_info
                .wait_semaphore_infos(&wait_infos)
                .signal_semaphore_infos(&signal_infos),
            SubmitKind::OneShot => submit_info,
        };

        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit_info], frame.render_fence)
                .wrap_err("Failed to submit frame")?;
        }
        Ok(())
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        let swapchain = self.swapchain.as_ref().ok_or_eyre("No swapchain to present to")?;
        let wait_semaphores = [self.slots[slot].release_semaphore];
        let swapchains = [swapchain.handle];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let presented = unsafe {
            self.swapchain_loader.queue_present(self.queue, &present_info)
        };
        match presented {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::OutOfDate),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(err) => Err(err).wrap_err("Failed to present swapchain image"),
        }
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        // Drain twice, some drivers still hold the old images after the first wait
        for _ in 0..2 {
            unsafe {
                self.device.device_wait_idle()?;
                self.device.queue_wait_idle(self.queue)?;
            }
        }

        let old = self.swapchain.take();
        let old_handle = old
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |swapchain| swapchain.handle);
        let created = Swapchain::new(
            self.surface,
            &self.surface_loader,
            self.swapchain_loader.clone(),
            self.physical,
            self.vsync,
            width,
            height,
            old_handle,
        );
        drop(old);
        let swapchain = created?;

        // An out-of-date acquire or present may have left these signaled
        for frame in self.slots.iter_mut() {
            frame.recreate_semaphores()?;
        }

        let extent = swapchain.extent;
        self.swapchain = Some(swapchain);
        (self.on_resize)(extent.width, extent.height);
        Ok(())
    }
}

impl Drop for VulkanPresenter {
    fn drop(&mut self) {
        unsafe {
            if let Err(err) = self.device.device_wait_idle() {
                log::error!("Failed to wait for device idle: {}", err);
            }
        }
        self.swapchain = None;
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
