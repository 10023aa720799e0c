use std::collections::HashMap;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use smallvec::SmallVec;
use crate::renderer::internals::transient::BufferRange;

/// Last known GPU-visible state of an image or buffer
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct ResourceState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl ResourceState {
    /// Contents are discarded. The source stage is kept wide so a transition
    /// out of this state still waits for whatever used the memory before.
    pub const UNDEFINED: Self = Self {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::NONE,
        layout: vk::ImageLayout::UNDEFINED,
    };

    pub const fn new(
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> Self {
        Self {
            stage,
            access,
            layout,
        }
    }

    pub const fn buffer(
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) -> Self {
        Self::new(stage, access, vk::ImageLayout::UNDEFINED)
    }

    fn same_access(&self, other: &ResourceState) -> bool {
        self.access == other.access && self.layout == other.layout
    }
}

struct TrackedImage {
    aspect: vk::ImageAspectFlags,
    state: ResourceState,
    // Render targets and swapchain images lose their contents every frame
    reset_each_frame: bool,
}

/// One batch of barriers, recorded as a single dependency command
#[derive(Default)]
pub struct BarrierBatch {
    pub image_barriers: SmallVec<[vk::ImageMemoryBarrier2<'static>; 16]>,
    pub buffer_barriers: SmallVec<[vk::BufferMemoryBarrier2<'static>; 16]>,
}

impl BarrierBatch {
    pub fn is_empty(&self) -> bool {
        self.image_barriers.is_empty() && self.buffer_barriers.is_empty()
    }

    pub fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        let dep_info = vk::DependencyInfo::default()
            .image_memory_barriers(&self.image_barriers)
            .buffer_memory_barriers(&self.buffer_barriers);
        unsafe {
            device.cmd_pipeline_barrier2(cmd, &dep_info);
        }
    }
}

/// Collects image and buffer state transitions until they are flushed.
///
/// The recorded state of a resource is updated as soon as a transition is
/// queued, so it describes the state the resource will have *after* the next
/// flush. This holds because recording is single threaded and every command
/// that reads a transitioned resource is preceded by a flush. If recording
/// ever becomes multi threaded the record has to be split into a pending and
/// a committed state.
#[derive(Default)]
pub struct BarrierBatcher {
    images: HashMap<vk::Image, TrackedImage>,
    buffers: HashMap<(vk::Buffer, u64), ResourceState>,
    pending: BarrierBatch,
}

impl BarrierBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking an image in the undefined state. Tracking an image
    /// again overwrites whatever was recorded for the handle.
    pub fn track_image(
        &mut self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        reset_each_frame: bool,
    ) {
        self.images.insert(image, TrackedImage {
            aspect,
            state: ResourceState::UNDEFINED,
            reset_each_frame,
        });
    }

    pub fn forget_image(&mut self, image: vk::Image) {
        self.images.remove(&image);
        self.pending.image_barriers.retain(|b| b.image != image);
    }

    pub fn forget_buffer(&mut self, buffer: vk::Buffer) {
        self.buffers.retain(|(b, _), _| *b != buffer);
        self.pending.buffer_barriers.retain(|b| b.buffer != buffer);
    }

    pub fn image_state(&self, image: vk::Image) -> Option<ResourceState> {
        self.images.get(&image).map(|tracked| tracked.state)
    }

    pub fn buffer_state(&self, buffer: &BufferRange) -> Option<ResourceState> {
        self.buffers.get(&(buffer.buffer, buffer.offset)).copied()
    }

    /// Forget the contents of every render target, used when a frame starts
    pub fn reset_frame_images(&mut self) {
        for tracked in self.images.values_mut() {
            if tracked.reset_each_frame {
                tracked.state = ResourceState::UNDEFINED;
            }
        }
    }

    /// Queue a transition from the recorded state of `image`.
    /// Returns `false` when the image already is in the requested state.
    pub fn image_barrier(
        &mut self,
        image: vk::Image,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
        new_layout: vk::ImageLayout,
    ) -> Result<bool> {
        let src = self
            .image_state(image)
            .ok_or_eyre(format!("Barrier on untracked image {:?}", image))?;
        self.image_barrier_from(
            image,
            src,
            ResourceState::new(dst_stage, dst_access, new_layout),
        )
    }

    /// Queue a transition with an explicit source state, ignoring the record
    pub fn image_barrier_from(
        &mut self,
        image: vk::Image,
        src: ResourceState,
        dst: ResourceState,
    ) -> Result<bool> {
        let tracked = self
            .images
            .get_mut(&image)
            .ok_or_eyre(format!("Barrier on untracked image {:?}", image))?;

        if src.same_access(&dst) {
            return Ok(false);
        }

        if let Some(queued) = self
            .pending
            .image_barriers
            .iter_mut()
            .find(|b| b.image == image)
        {
            // Two transitions of one image in one batch are unordered,
            // so fold the second into the first
            queued.dst_stage_mask = dst.stage;
            queued.dst_access_mask = dst.access;
            queued.new_layout = dst.layout;
        } else {
            self.pending.image_barriers.push(
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(src.stage)
                    .src_access_mask(src.access)
                    .dst_stage_mask(dst.stage)
                    .dst_access_mask(dst.access)
                    .old_layout(src.layout)
                    .new_layout(dst.layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(tracked.aspect)
                            .base_mip_level(0)
                            .level_count(vk::REMAINING_MIP_LEVELS)
                            .base_array_layer(0)
                            .layer_count(vk::REMAINING_ARRAY_LAYERS),
                    ),
            );
        }

        tracked.state = dst;
        Ok(true)
    }

    /// Queue a transition of the whole range
    pub fn buffer_barrier(
        &mut self,
        buffer: &BufferRange,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> bool {
        self.buffer_range_barrier(buffer, 0, buffer.size, dst_stage, dst_access)
    }

    /// Queue a transition of `size` bytes starting `offset` bytes into the range.
    /// The state record is kept per range, not per byte.
    pub fn buffer_range_barrier(
        &mut self,
        buffer: &BufferRange,
        offset: u64,
        size: u64,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> bool {
        let key = (buffer.buffer, buffer.offset);
        let src = self
            .buffers
            .get(&key)
            .copied()
            .unwrap_or(ResourceState::buffer(
                vk::PipelineStageFlags2::NONE,
                vk::AccessFlags2::NONE,
            ));
        let dst = ResourceState::buffer(dst_stage, dst_access);

        if src.same_access(&dst) {
            return false;
        }

        let abs_offset = buffer.offset + offset;
        if let Some(queued) = self
            .pending
            .buffer_barriers
            .iter_mut()
            .find(|b| b.buffer == buffer.buffer && b.offset == abs_offset && b.size == size)
        {
            queued.dst_stage_mask = dst.stage;
            queued.dst_access_mask = dst.access;
        } else {
            self.pending.buffer_barriers.push(
                vk::BufferMemoryBarrier2::default()
                    .src_stage_mask(src.stage)
                    .src_access_mask(src.access)
                    .dst_stage_mask(dst.stage)
                    .dst_access_mask(dst.access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(buffer.buffer)
                    .offset(abs_offset)
                    .size(size),
            );
        }

        self.buffers.insert(key, dst);
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_image_barriers(&self) -> usize {
        self.pending.image_barriers.len()
    }

    pub fn pending_buffer_barriers(&self) -> usize {
        self.pending.buffer_barriers.len()
    }

    /// Hand out everything queued so far, or `None` when nothing is queued
    pub fn take_batch(&mut self) -> Option<BarrierBatch> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn image(raw: u64) -> vk::Image {
        vk::Image::from_raw(raw)
    }

    fn batcher_with_image(raw: u64) -> BarrierBatcher {
        let mut batcher = BarrierBatcher::new();
        batcher.track_image(image(raw), vk::ImageAspectFlags::COLOR, true);
        batcher
    }

    #[test]
    fn transition_updates_record_immediately() {
        let mut batcher = batcher_with_image(1);
        let queued = batcher
            .image_barrier(
                image(1),
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )
            .unwrap();

        assert!(queued);
        assert_eq!(batcher.pending_image_barriers(), 1);
        assert_eq!(
            batcher.image_state(image(1)).unwrap().layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
    }

    #[test]
    fn identical_state_is_a_no_op() {
        let mut batcher = batcher_with_image(1);
        let state = ResourceState::new(
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        let queued = batcher.image_barrier_from(image(1), state, state).unwrap();
        assert!(!queued);
        assert!(batcher.take_batch().is_none());
    }

    #[test]
    fn repeating_a_transition_queues_it_once() {
        let mut batcher = batcher_with_image(1);
        for _ in 0..3 {
            batcher
                .image_barrier(
                    image(1),
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_READ,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                )
                .unwrap();
        }
        assert_eq!(batcher.pending_image_barriers(), 1);
    }

    #[test]
    fn second_transition_before_flush_is_folded() {
        let mut batcher = batcher_with_image(1);
        batcher
            .image_barrier(
                image(1),
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )
            .unwrap();
        batcher
            .image_barrier(
                image(1),
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .unwrap();

        let batch = batcher.take_batch().unwrap();
        assert_eq!(batch.image_barriers.len(), 1);
        let barrier = &batch.image_barriers[0];
        assert_eq!(barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn take_batch_clears_pending_sets() {
        let mut batcher = batcher_with_image(1);
        let range = BufferRange {
            buffer: vk::Buffer::from_raw(9),
            offset: 256,
            size: 64,
        };
        batcher
            .image_barrier(
                image(1),
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )
            .unwrap();
        assert!(batcher.buffer_barrier(
            &range,
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        ));

        let batch = batcher.take_batch().unwrap();
        assert_eq!(batch.image_barriers.len(), 1);
        assert_eq!(batch.buffer_barriers.len(), 1);
        assert_eq!(batch.buffer_barriers[0].offset, 256);
        assert!(!batcher.has_pending());
        assert!(batcher.take_batch().is_none());
    }

    #[test]
    fn buffer_with_unchanged_access_is_skipped() {
        let mut batcher = BarrierBatcher::new();
        let range = BufferRange {
            buffer: vk::Buffer::from_raw(3),
            offset: 0,
            size: 1024,
        };
        assert!(batcher.buffer_barrier(
            &range,
            vk::PipelineStageFlags2::VERTEX_SHADER,
            vk::AccessFlags2::UNIFORM_READ,
        ));
        batcher.take_batch();

        assert!(!batcher.buffer_barrier(
            &range,
            vk::PipelineStageFlags2::VERTEX_SHADER,
            vk::AccessFlags2::UNIFORM_READ,
        ));
        assert!(batcher.take_batch().is_none());
    }

    #[test]
    fn untracked_image_is_an_error() {
        let mut batcher = BarrierBatcher::new();
        let result = batcher.image_barrier(
            image(42),
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert!(result.is_err());
    }

    #[test]
    fn frame_reset_only_touches_render_targets() {
        let mut batcher = batcher_with_image(1);
        batcher.track_image(image(2), vk::ImageAspectFlags::COLOR, false);
        for raw in [1, 2] {
            batcher
                .image_barrier(
                    image(raw),
                    vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
                .unwrap();
        }
        batcher.take_batch();

        batcher.reset_frame_images();
        assert_eq!(batcher.image_state(image(1)), Some(ResourceState::UNDEFINED));
        assert_eq!(
            batcher.image_state(image(2)).unwrap().layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn forgetting_an_image_drops_its_pending_barrier() {
        let mut batcher = batcher_with_image(1);
        batcher
            .image_barrier(
                image(1),
                vk::PipelineStageFlags2::TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )
            .unwrap();
        batcher.forget_image(image(1));
        assert!(batcher.image_state(image(1)).is_none());
        assert!(batcher.take_batch().is_none());
    }
}
