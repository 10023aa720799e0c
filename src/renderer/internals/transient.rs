use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::eyre;

/// Every transient sub-allocation starts on this boundary
pub const TRANSIENT_ALIGNMENT: u64 = 256;

pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// A byte range inside one of the transient buffers
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct TransientRegion {
    pub offset: u64,
    pub size: u64,
}

impl TransientRegion {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Write cursor into the per-slot scratch buffer of the frame being recorded.
///
/// The cursor goes back to zero once per frame. A region handed out by
/// `allocate` is only valid until the next `reset`, which is what lets every
/// frame slot reuse its scratch buffer after its fence has signaled.
pub struct ScratchRing {
    capacity: u64,
    offset: u64,
    frame_index: u64,
}

impl ScratchRing {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            offset: 0,
            frame_index: 0,
        }
    }

    pub fn reset(&mut self, frame_index: u64) {
        self.offset = 0;
        self.frame_index = frame_index;
    }

    pub fn allocate(&mut self, size: u64) -> Result<TransientRegion> {
        let rounded = align_up(size, TRANSIENT_ALIGNMENT);
        if self.offset + rounded > self.capacity {
            log::error!(
                "Scratch budget exceeded in frame {}: {} + {} > {}",
                self.frame_index,
                self.offset,
                rounded,
                self.capacity,
            );
            return Err(eyre!(
                "Scratch buffer overflow: {} bytes requested with {} of {} bytes in use",
                size,
                self.offset,
                self.capacity,
            ));
        }

        let region = TransientRegion {
            offset: self.offset,
            size,
        };
        self.offset += rounded;

        Ok(region)
    }

    pub fn used(&self) -> u64 {
        self.offset
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }
}

/// Permanent bump allocator over the uniform buffer. Nothing handed out is
/// ever returned.
pub struct UniformArena {
    capacity: u64,
    offset: u64,
}

impl UniformArena {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            offset: 0,
        }
    }

    pub fn allocate(&mut self, size: u64) -> Result<TransientRegion> {
        let rounded = align_up(size.max(1), TRANSIENT_ALIGNMENT);
        if self.offset + rounded > self.capacity {
            log::error!(
                "Uniform arena exhausted: {} + {} > {}",
                self.offset,
                rounded,
                self.capacity,
            );
            return Err(eyre!(
                "Uniform arena of {} bytes cannot fit another {} bytes",
                self.capacity,
                rounded,
            ));
        }

        let region = TransientRegion {
            offset: self.offset,
            size: rounded,
        };
        self.offset += rounded;

        Ok(region)
    }

    pub fn used(&self) -> u64 {
        self.offset
    }
}

/// A sub-range of a GPU buffer. Used both for whole buffers and for
/// uniform arena sub-allocations.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
}

pub type UniformBuffer = BufferRange;
