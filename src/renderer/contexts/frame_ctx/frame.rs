use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::Result;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::Allocator;
use crate::renderer::resources::buffer::Buffer;

/// Two timestamps per frame: top and bottom of the command buffer
pub const TIMESTAMPS_PER_FRAME: u32 = 2;

/// One of the N rotating execution contexts. Nothing in a slot is touched
/// again until `render_fence` has signaled.
pub struct FrameSlot {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,

    // Signaled by the presentation engine when the acquired image is ready.
    pub acquire_semaphore: vk::Semaphore,

    // Signaled when rendering is done and the image may be presented.
    pub release_semaphore: vk::Semaphore,

    // Signals when all rendering commands have finished execution.
    pub render_fence: vk::Fence,

    pub scratch_buffer: Buffer,
    pub query_pool: Option<vk::QueryPool>,
    pub timestamps_written: bool,

    device: Arc<ash::Device>,
}

impl FrameSlot {
    pub fn new(
        index: usize,
        queue_family_index: u32,
        scratch_size: u64,
        with_timestamps: bool,
        memory_allocator: Arc<Mutex<Allocator>>,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        let scratch_buffer = Buffer::new(
            scratch_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            &format!("Frame {} Scratch Buffer", index),
            MemoryLocation::CpuToGpu,
            memory_allocator,
            device.clone(),
        )?;
        // Start from an all-null slot so Drop can clean up after a partial failure
        let mut slot = Self {
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            acquire_semaphore: vk::Semaphore::null(),
            release_semaphore: vk::Semaphore::null(),
            render_fence: vk::Fence::null(),
            scratch_buffer,
            query_pool: None,
            timestamps_written: false,
            device,
        };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        slot.command_pool = unsafe {
            slot.device.create_command_pool(&pool_info, None)?
        };

        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(slot.command_pool)
            .command_buffer_count(1)
            .level(vk::CommandBufferLevel::PRIMARY);
        slot.command_buffer = unsafe {
            slot.device.allocate_command_buffers(&command_buffer_info)?[0]
        };

        // Created signaled so the very first wait returns at once
        slot.render_fence = unsafe {
            slot.device.create_fence(
                &vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED),
                None,
            )?
        };
        slot.recreate_semaphores()?;

        if with_timestamps {
            let query_info = vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::TIMESTAMP)
                .query_count(TIMESTAMPS_PER_FRAME);
            slot.query_pool = Some(unsafe {
                slot.device.create_query_pool(&query_info, None)?
            });
        }

        Ok(slot)
    }

    /// Replaces both semaphores with fresh unsignaled ones. Only valid while
    /// the device is idle.
    pub fn recreate_semaphores(&mut self) -> Result<()> {
        self.destroy_semaphores();
        unsafe {
            self.acquire_semaphore = self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
            self.release_semaphore = self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?;
        }
        Ok(())
    }

    fn destroy_semaphores(&mut self) {
        unsafe {
            if self.acquire_semaphore != vk::Semaphore::null() {
                self.device.destroy_semaphore(self.acquire_semaphore, None);
                self.acquire_semaphore = vk::Semaphore::null();
            }
            if self.release_semaphore != vk::Semaphore::null() {
                self.device.destroy_semaphore(self.release_semaphore, None);
                self.release_semaphore = vk::Semaphore::null();
            }
        }
    }

    /// GPU time of the last frame recorded in this slot, in nanoseconds.
    /// Only meaningful after the slot's fence has signaled.
    pub fn read_timestamps(&mut self, timestamp_period: f32) -> Result<Option<f64>> {
        let Some(query_pool) = self.query_pool else {
            return Ok(None);
        };
        if !self.timestamps_written {
            return Ok(None);
        }
        let mut ticks = [0u64; TIMESTAMPS_PER_FRAME as usize];
        unsafe {
            self.device.get_query_pool_results(
                query_pool,
                0,
                &mut ticks,
                vk::QueryResultFlags::TYPE_64,
            )?;
        }
        self.timestamps_written = false;
        let elapsed = ticks[1].saturating_sub(ticks[0]);
        Ok(Some(elapsed as f64 * timestamp_period as f64))
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        self.destroy_semaphores();
        unsafe {
            if let Some(query_pool) = self.query_pool.take() {
                self.device.destroy_query_pool(query_pool, None);
            }
            if self.render_fence != vk::Fence::null() {
                self.device.destroy_fence(self.render_fence, None);
            }
            // Frees the command buffer with it
            if self.command_pool != vk::CommandPool::null() {
                self.device.destroy_command_pool(self.command_pool, None);
            }
        }
    }
}
