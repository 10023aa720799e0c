use std::sync::{Arc, Mutex};
use ash::vk;
use color_eyre::eyre::Result;
use color_eyre::eyre::{eyre, OptionExt};
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator},
    MemoryLocation,
};
use crate::renderer::internals::transient::BufferRange;

pub struct Buffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,

    allocation: Option<Allocation>,
    memory_allocator: Arc<Mutex<Allocator>>,
    device: Arc<ash::Device>,
}

impl Buffer {
    pub fn new(
        size: u64,
        usage: vk::BufferUsageFlags,
        name: &str,
        mem_loc: MemoryLocation,
        mem_allocator: Arc<Mutex<Allocator>>,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        let buffer = {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            unsafe { device.create_buffer(&buffer_info, None)? }
        };

        let requirements = unsafe {
            device.get_buffer_memory_requirements(buffer)
        };
        let allocation = mem_allocator
            .lock()
            .map_err(|e| eyre!(e.to_string()))
            .and_then(|mut allocator| {
                Ok(allocator.allocate(&AllocationCreateDesc {
                    name,
                    requirements,
                    location: mem_loc,
                    linear: true,
                    allocation_scheme: AllocationScheme::DedicatedBuffer(buffer),
                })?)
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let bound = unsafe {
            device.bind_buffer_memory(
                buffer,
                allocation.memory(),
                allocation.offset(),
            )
        };

        // From here on the Drop impl releases everything
        let this = Self {
            buffer,
            size,
            usage,

            allocation: Some(allocation),
            memory_allocator: mem_allocator,
            device,
        };
        bound?;

        Ok(this)
    }

    pub fn range(&self) -> BufferRange {
        BufferRange {
            buffer: self.buffer,
            offset: 0,
            size: self.size,
        }
    }

    pub fn write(
        &mut self,
        data: &[u8],
        start_offset: usize,
    ) -> Result<presser::CopyRecord> {
        let allocation = self
            .allocation
            .as_mut()
            .ok_or_eyre("Buffer has no allocation")?;
        Ok(presser::copy_from_slice_to_offset(
            data,
            allocation,
            start_offset,
        )?)
    }

    /// Makes host writes to `[offset, offset + size)` visible to the device.
    /// Host-coherent memory needs nothing.
    pub fn flush(
        &self,
        offset: u64,
        size: u64,
        non_coherent_atom_size: u64,
    ) -> Result<()> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_eyre("Buffer has no allocation")?;
        if allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            return Ok(());
        }

        let atom = non_coherent_atom_size.max(1);
        let start = allocation.offset() + offset;
        let aligned_start = start - start % atom;
        let end = (start + size).div_ceil(atom) * atom;
        let size = if end >= allocation.offset() + allocation.size() {
            vk::WHOLE_SIZE
        } else {
            end - aligned_start
        };
        let range = vk::MappedMemoryRange::default()
            .memory(unsafe { allocation.memory() })
            .offset(aligned_start)
            .size(size);
        unsafe {
            self.device.flush_mapped_memory_ranges(&[range])?;
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            match self.memory_allocator.lock() {
                Ok(mut allocator) => {
                    if let Err(err) = allocator.free(allocation) {
                        log::error!("Failed to free buffer memory: {}", err);
                    }
                }
                Err(err) => log::error!("Memory allocator poisoned: {}", err),
            }
        }
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
        }
    }
}
