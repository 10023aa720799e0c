pub mod frame;
pub mod presenter;

use ash::vk;
use ash::vk::Handle;
use color_eyre::Result;
use color_eyre::eyre::{eyre, OptionExt};
use crate::renderer::internals::barrier::{BarrierBatch, BarrierBatcher, ResourceState};
use crate::renderer::internals::swapchain::wait_for_window_size;
use crate::renderer::internals::transient::{BufferRange, ScratchRing, TransientRegion, UniformArena, UniformBuffer};

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum AcquireOutcome {
    Acquired(u32),
    /// Out of date or suboptimal, the swapchain has to be rebuilt
    OutOfDate,
    /// No swapchain (or no acquire semaphore) exists yet
    NoSwapchain,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PresentOutcome {
    Presented,
    OutOfDate,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SubmitKind {
    /// Waits on the acquire semaphore and signals the release semaphore
    Frame,
    /// No swapchain involvement
    OneShot,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum FrameState {
    Uninitialized,
    Idle,
    PreFrame,
    Recording,
    Resizing,
}

/// The device-side half of the frame loop: fences, semaphores, command
/// buffers, the swapchain and the per-slot scratch memory.
///
/// Slots are indices in `0..frames_in_flight`.
pub trait FrameBackend {
    /// Blocks until the last submission made from `slot` has retired
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    /// Resets the slot's command buffer and begins one-time recording
    fn begin_commands(&mut self, slot: usize) -> Result<()>;
    fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome>;

    fn swapchain_images(&self) -> &[vk::Image];
    fn swapchain_extent(&self) -> vk::Extent2D;
    fn uniform_arena(&self) -> vk::Buffer;
    fn window_size(&mut self) -> (u32, u32);

    fn record_barriers(&mut self, slot: usize, batch: &BarrierBatch);
    fn record_blit(
        &mut self,
        slot: usize,
        src: vk::Image,
        src_extent: vk::Extent2D,
        dst: vk::Image,
        dst_extent: vk::Extent2D,
    );
    fn record_scratch_copy(
        &mut self,
        slot: usize,
        src: TransientRegion,
        dst: vk::Buffer,
        dst_offset: u64,
    );
    /// Copies `data` into the slot's host-visible scratch buffer
    fn write_scratch(&mut self, slot: usize, offset: u64, data: &[u8]) -> Result<()>;

    /// Ends recording, resets the slot's fence and submits
    fn submit(&mut self, slot: usize, kind: SubmitKind) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;
    fn wait_idle(&mut self) -> Result<()>;
    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()>;
}

/// Responsibilities:
/// - Pace frames over the frame slots
/// - Own the barrier batcher and the transient allocators
/// - Drive acquire, present and swapchain rebuilds
pub struct RenderFrameContext<B: FrameBackend> {
    backend: B,
    state: FrameState,
    frames_in_flight: usize,
    frame_index: u64,
    image_index: Option<u32>,
    swapchain_images: Vec<vk::Image>,
    /// Window size the swapchain was last built for, before surface clamping
    requested_size: (u32, u32),

    barriers: BarrierBatcher,
    scratch: ScratchRing,
    uniforms: UniformArena,
}

impl<B: FrameBackend> RenderFrameContext<B> {
    pub fn new(
        backend: B,
        frames_in_flight: usize,
        scratch_buffer_size: u64,
        uniform_arena_size: u64,
    ) -> Self {
        let mut ctx = Self {
            backend,
            state: FrameState::Uninitialized,
            frames_in_flight: frames_in_flight.max(1),
            frame_index: 0,
            image_index: None,
            swapchain_images: Vec::new(),
            requested_size: (0, 0),

            barriers: BarrierBatcher::new(),
            scratch: ScratchRing::new(scratch_buffer_size),
            uniforms: UniformArena::new(uniform_arena_size),
        };
        let extent = ctx.backend.swapchain_extent();
        ctx.requested_size = (extent.width, extent.height);
        ctx.track_swapchain_images();
        if !ctx.swapchain_images.is_empty() {
            ctx.state = FrameState::Idle;
        }
        ctx
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn barriers(&self) -> &BarrierBatcher {
        &self.barriers
    }

    pub fn barriers_mut(&mut self) -> &mut BarrierBatcher {
        &mut self.barriers
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn slot_for(&self, frame_index: u64) -> usize {
        (frame_index % self.frames_in_flight as u64) as usize
    }

    pub fn current_slot(&self) -> usize {
        self.slot_for(self.frame_index)
    }

    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    pub fn scratch_used(&self) -> u64 {
        self.scratch.used()
    }

    /// Starts a frame. `Ok(false)` means the frame was dropped because the
    /// swapchain is missing or had to be rebuilt, and the caller should simply
    /// try again with the next frame.
    pub fn begin_frame(&mut self) -> Result<bool> {
        if self.state != FrameState::Idle {
            return Err(eyre!("begin_frame called while {:?}", self.state));
        }

        self.frame_index += 1;
        let slot = self.current_slot();
        self.scratch.reset(self.frame_index);

        self.backend.wait_for_slot(slot)?;
        self.backend.begin_commands(slot)?;
        self.barriers.reset_frame_images();
        self.state = FrameState::Recording;

        log::trace!("Frame {} recording in slot {}", self.frame_index, slot);

        match self.backend.acquire_next_image(slot)? {
            AcquireOutcome::Acquired(image_index) => {
                self.image_index = Some(image_index);
                Ok(true)
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("Swapchain out of date on acquire, dropping frame {}", self.frame_index);
                self.rebuild_swapchain();
                Ok(false)
            }
            AcquireOutcome::NoSwapchain => {
                log::warn!("No swapchain to acquire from, dropping frame {}", self.frame_index);
                self.rebuild_swapchain();
                Ok(false)
            }
        }
    }

    /// Blits `image` into the acquired swapchain image, submits the frame and presents it
    pub fn present_image(&mut self, image: vk::Image, extent: vk::Extent2D) -> Result<()> {
        if self.state != FrameState::Recording {
            return Err(eyre!("present_image called while {:?}", self.state));
        }
        let slot = self.current_slot();
        let image_index = self
            .image_index
            .ok_or_eyre("No swapchain image acquired for this frame")?;
        let swapchain_image = *self
            .swapchain_images
            .get(image_index as usize)
            .ok_or_eyre(format!("Swapchain image index {} out of range", image_index))?;
        if self.barriers.image_state(image).is_none() {
            return Err(eyre!("Cannot present untracked image {:#x}", image.as_raw()));
        }
        // Nothing below can fail before the submit
        self.image_index = None;

        self.flush_barriers();

        self.barriers.image_barrier(
            swapchain_image,
            vk::PipelineStageFlags2::BLIT,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        self.barriers.image_barrier(
            image,
            vk::PipelineStageFlags2::BLIT,
            vk::AccessFlags2::TRANSFER_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )?;
        self.flush_barriers();

        let swapchain_extent = self.backend.swapchain_extent();
        self.backend.record_blit(slot, image, extent, swapchain_image, swapchain_extent);

        self.barriers.image_barrier(
            swapchain_image,
            vk::PipelineStageFlags2::NONE,
            vk::AccessFlags2::NONE,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )?;
        self.flush_barriers();

        self.backend.submit(slot, SubmitKind::Frame)?;
        self.state = FrameState::Idle;

        let outcome = self.backend.present(slot, image_index)?;
        let window = self.backend.window_size();
        let current = self.backend.swapchain_extent();

        if outcome == PresentOutcome::OutOfDate {
            log::debug!("Swapchain out of date on present");
            self.rebuild_swapchain();
        } else if window != self.requested_size {
            log::debug!(
                "Window is {}x{} but swapchain is {}x{}",
                window.0,
                window.1,
                current.width,
                current.height,
            );
            self.rebuild_swapchain();
        }

        Ok(())
    }

    /// Opens a one-shot recording scope for setup work before the frame loop
    pub fn begin_pre_frame(&mut self) -> Result<()> {
        if self.state != FrameState::Idle {
            return Err(eyre!("begin_pre_frame called while {:?}", self.state));
        }
        let slot = self.current_slot();
        self.backend.wait_for_slot(slot)?;
        self.scratch.reset(self.frame_index);
        self.backend.begin_commands(slot)?;
        self.state = FrameState::PreFrame;
        Ok(())
    }

    /// Submits the setup work and blocks until the device is idle
    pub fn end_pre_frame(&mut self) -> Result<()> {
        if self.state != FrameState::PreFrame {
            return Err(eyre!("end_pre_frame called while {:?}", self.state));
        }
        let slot = self.current_slot();
        self.flush_barriers();
        self.backend.submit(slot, SubmitKind::OneShot)?;
        self.backend.wait_idle()?;
        self.scratch.reset(self.frame_index);
        self.state = FrameState::Idle;
        Ok(())
    }

    /// Rebuilds the swapchain for the current window size. Blocks while the
    /// window is minimized.
    pub fn resize(&mut self) -> Result<()> {
        self.state = FrameState::Resizing;
        self.image_index = None;

        let backend = &mut self.backend;
        let (width, height) = wait_for_window_size(|| backend.window_size());
        self.backend.recreate_swapchain(width, height)?;
        self.requested_size = (width, height);
        self.track_swapchain_images();

        log::debug!("Swapchain rebuilt at {}x{}", width, height);
        self.state = FrameState::Idle;
        Ok(())
    }

    // A rebuild that fails mid-loop leaves no swapchain behind. The next
    // acquire reports NoSwapchain and lands back here.
    fn rebuild_swapchain(&mut self) {
        if let Err(err) = self.resize() {
            log::warn!("Swapchain rebuild failed, retrying next frame: {:#}", err);
            self.image_index = None;
            self.state = FrameState::Idle;
        }
    }

    fn track_swapchain_images(&mut self) {
        for image in self.swapchain_images.drain(..) {
            self.barriers.forget_image(image);
        }
        self.swapchain_images = self.backend.swapchain_images().to_vec();
        for image in &self.swapchain_images {
            self.barriers.track_image(*image, vk::ImageAspectFlags::COLOR, true);
        }
    }

    fn recording_slot(&self) -> Result<usize> {
        match self.state {
            FrameState::Recording | FrameState::PreFrame => Ok(self.current_slot()),
            state => Err(eyre!("No command recording is open ({:?})", state)),
        }
    }

    /// Records every queued barrier as one dependency command.
    /// Returns `false` when nothing was queued.
    pub fn flush_barriers(&mut self) -> bool {
        let Ok(slot) = self.recording_slot() else {
            return false;
        };
        match self.barriers.take_batch() {
            Some(batch) => {
                self.backend.record_barriers(slot, &batch);
                true
            }
            None => false,
        }
    }

    pub fn image_barrier(
        &mut self,
        image: vk::Image,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
        new_layout: vk::ImageLayout,
    ) -> Result<bool> {
        self.barriers.image_barrier(image, dst_stage, dst_access, new_layout)
    }

    pub fn image_barrier_from(
        &mut self,
        image: vk::Image,
        src: ResourceState,
        dst: ResourceState,
    ) -> Result<bool> {
        self.barriers.image_barrier_from(image, src, dst)
    }

    pub fn buffer_barrier(
        &mut self,
        buffer: &BufferRange,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> bool {
        self.barriers.buffer_barrier(buffer, dst_stage, dst_access)
    }

    /// Copies `data` into the scratch buffer of the recording frame
    pub fn upload_to_scratch(&mut self, data: &[u8]) -> Result<TransientRegion> {
        let slot = self.recording_slot()?;
        let region = self.scratch.allocate(data.len() as u64)?;
        self.backend.write_scratch(slot, region.offset, data)?;
        Ok(region)
    }

    /// Stages `data` and records a copy into `dst` at `dst_offset`. The
    /// destination range is left in `dst_stage`/`dst_access` after the next flush.
    pub fn upload_to_gpu_buffer(
        &mut self,
        dst: &BufferRange,
        dst_offset: u64,
        data: &[u8],
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> Result<()> {
        let size = data.len() as u64;
        if dst_offset.checked_add(size).is_none_or(|end| end > dst.size) {
            return Err(eyre!(
                "Upload of {} bytes at offset {} overruns a {} byte buffer",
                size,
                dst_offset,
                dst.size,
            ));
        }

        let slot = self.recording_slot()?;
        let region = self.upload_to_scratch(data)?;

        self.barriers.buffer_range_barrier(
            dst,
            dst_offset,
            size,
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::TRANSFER_WRITE,
        );
        self.flush_barriers();

        self.backend.record_scratch_copy(slot, region, dst.buffer, dst.offset + dst_offset);

        self.barriers.buffer_range_barrier(dst, dst_offset, size, dst_stage, dst_access);
        Ok(())
    }

    pub fn upload_to_uniform_buffer(
        &mut self,
        uniform: &UniformBuffer,
        data: &[u8],
    ) -> Result<()> {
        self.upload_to_gpu_buffer(
            uniform,
            0,
            data,
            vk::PipelineStageFlags2::VERTEX_SHADER
                | vk::PipelineStageFlags2::FRAGMENT_SHADER
                | vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::UNIFORM_READ,
        )
    }

    /// Carves a permanent range out of the uniform arena
    pub fn create_uniform_buffer(&mut self, size: u64) -> Result<UniformBuffer> {
        let region = self.uniforms.allocate(size)?;
        Ok(BufferRange {
            buffer: self.backend.uniform_arena(),
            offset: region.offset,
            size: region.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const SLOTS: usize = 4;

    #[derive(Debug, PartialEq, Clone)]
    enum Call {
        Wait(usize),
        Begin(usize),
        Acquire(usize),
        Barriers(usize, usize),
        Blit(vk::Image, vk::Image),
        Copy(TransientRegion, u64),
        Submit(usize, SubmitKind),
        Present(u32),
        Recreate(u32, u32),
        WaitIdle,
    }

    #[derive(Default, Clone, Copy)]
    struct MockFence {
        signaled: bool,
        submitted_frame: Option<u64>,
    }

    struct MockBackend {
        fences: Vec<MockFence>,
        images: Vec<vk::Image>,
        next_image_handle: u64,
        next_image_index: u32,
        extent: vk::Extent2D,
        window_sizes: VecDeque<(u32, u32)>,
        window: (u32, u32),
        acquire_results: VecDeque<AcquireOutcome>,
        present_results: VecDeque<PresentOutcome>,
        scratch: Vec<u8>,
        failing_rebuilds: usize,
        max_extent: Option<vk::Extent2D>,
        submit_counter: u64,
        retired: Vec<u64>,
        calls: Vec<Call>,
    }

    impl MockBackend {
        fn new(width: u32, height: u32) -> Self {
            let mut backend = Self {
                fences: vec![MockFence { signaled: true, submitted_frame: None }; SLOTS],
                images: Vec::new(),
                next_image_handle: 100,
                next_image_index: 0,
                extent: vk::Extent2D { width, height },
                window_sizes: VecDeque::new(),
                window: (width, height),
                acquire_results: VecDeque::new(),
                present_results: VecDeque::new(),
                scratch: vec![0; 64 * 1024],
                failing_rebuilds: 0,
                max_extent: None,
                submit_counter: 0,
                retired: Vec::new(),
                calls: Vec::new(),
            };
            backend.build_images();
            backend
        }

        fn build_images(&mut self) {
            self.images = (0..3)
                .map(|_| {
                    self.next_image_handle += 1;
                    vk::Image::from_raw(self.next_image_handle)
                })
                .collect();
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            let fence = &mut self.fences[slot];
            if !fence.signaled {
                // The "GPU" finishes the work as soon as someone waits on it
                fence.signaled = true;
                if let Some(frame) = fence.submitted_frame {
                    self.retired.push(frame);
                }
            }
            self.calls.push(Call::Wait(slot));
            Ok(())
        }

        fn begin_commands(&mut self, slot: usize) -> Result<()> {
            assert!(self.fences[slot].signaled, "slot {} reused before its fence signaled", slot);
            self.calls.push(Call::Begin(slot));
            Ok(())
        }

        fn acquire_next_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            self.calls.push(Call::Acquire(slot));
            if self.images.is_empty() {
                return Ok(AcquireOutcome::NoSwapchain);
            }
            let outcome = self.acquire_results.pop_front().unwrap_or_else(|| {
                let index = self.next_image_index;
                self.next_image_index = (index + 1) % self.images.len() as u32;
                AcquireOutcome::Acquired(index)
            });
            Ok(outcome)
        }

        fn swapchain_images(&self) -> &[vk::Image] {
            &self.images
        }

        fn swapchain_extent(&self) -> vk::Extent2D {
            self.extent
        }

        fn uniform_arena(&self) -> vk::Buffer {
            vk::Buffer::from_raw(7)
        }

        fn window_size(&mut self) -> (u32, u32) {
            if let Some(size) = self.window_sizes.pop_front() {
                self.window = size;
            }
            self.window
        }

        fn record_barriers(&mut self, _slot: usize, batch: &BarrierBatch) {
            self.calls.push(Call::Barriers(
                batch.image_barriers.len(),
                batch.buffer_barriers.len(),
            ));
        }

        fn record_blit(
            &mut self,
            _slot: usize,
            src: vk::Image,
            _src_extent: vk::Extent2D,
            dst: vk::Image,
            _dst_extent: vk::Extent2D,
        ) {
            self.calls.push(Call::Blit(src, dst));
        }

        fn record_scratch_copy(
            &mut self,
            _slot: usize,
            src: TransientRegion,
            _dst: vk::Buffer,
            dst_offset: u64,
        ) {
            self.calls.push(Call::Copy(src, dst_offset));
        }

        fn write_scratch(&mut self, _slot: usize, offset: u64, data: &[u8]) -> Result<()> {
            let start = offset as usize;
            self.scratch[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn submit(&mut self, slot: usize, kind: SubmitKind) -> Result<()> {
            self.submit_counter += 1;
            self.fences[slot] = MockFence {
                signaled: false,
                submitted_frame: Some(self.submit_counter),
            };
            self.calls.push(Call::Submit(slot, kind));
            Ok(())
        }

        fn present(&mut self, _slot: usize, image_index: u32) -> Result<PresentOutcome> {
            self.calls.push(Call::Present(image_index));
            Ok(self.present_results.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn wait_idle(&mut self) -> Result<()> {
            for fence in self.fences.iter_mut() {
                fence.signaled = true;
            }
            self.calls.push(Call::WaitIdle);
            Ok(())
        }

        fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
            self.calls.push(Call::Recreate(width, height));
            if self.failing_rebuilds > 0 {
                self.failing_rebuilds -= 1;
                self.images.clear();
                return Err(eyre!("surface lost"));
            }
            self.extent = match self.max_extent {
                Some(max) => vk::Extent2D {
                    width: width.min(max.width),
                    height: height.min(max.height),
                },
                None => vk::Extent2D { width, height },
            };
            self.next_image_index = 0;
            self.build_images();
            Ok(())
        }
    }

    fn context(width: u32, height: u32) -> RenderFrameContext<MockBackend> {
        RenderFrameContext::new(MockBackend::new(width, height), SLOTS, 16 * 1024, 64 * 1024)
    }

    fn render_target(ctx: &mut RenderFrameContext<MockBackend>) -> vk::Image {
        let image = vk::Image::from_raw(1);
        ctx.barriers_mut().track_image(image, vk::ImageAspectFlags::COLOR, true);
        image
    }

    fn run_frame(ctx: &mut RenderFrameContext<MockBackend>, image: vk::Image) {
        assert!(ctx.begin_frame().unwrap());
        let extent = ctx.backend().swapchain_extent();
        ctx.present_image(image, extent).unwrap();
    }

    #[test]
    fn slots_are_reused_only_after_retirement() {
        let mut ctx = context(640, 480);
        let image = render_target(&mut ctx);

        let mut slots = Vec::new();
        for _ in 0..(SLOTS * 3 + 1) {
            run_frame(&mut ctx, image);
            slots.push(ctx.current_slot());
        }

        for k in 0..slots.len() - SLOTS {
            assert_eq!(slots[k], slots[k + SLOTS]);
        }
        // Frame k's submission must have retired before frame k + N started
        for k in 1..=(slots.len() - SLOTS) as u64 {
            assert!(ctx.backend().retired.contains(&k));
        }
    }

    #[test]
    fn wait_precedes_begin_and_acquire() {
        let mut ctx = context(640, 480);
        let image = render_target(&mut ctx);
        run_frame(&mut ctx, image);

        let calls = &ctx.backend().calls;
        assert_eq!(calls[0], Call::Wait(1));
        assert_eq!(calls[1], Call::Begin(1));
        assert_eq!(calls[2], Call::Acquire(1));
    }

    #[test]
    fn present_flushes_before_blit_and_submits_once() {
        let mut ctx = context(640, 480);
        let image = render_target(&mut ctx);
        assert!(ctx.begin_frame().unwrap());
        ctx.image_barrier(
            image,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        )
        .unwrap();
        ctx.present_image(image, vk::Extent2D { width: 640, height: 480 }).unwrap();

        let calls = &ctx.backend().calls;
        let blit = calls.iter().position(|c| matches!(c, Call::Blit(..))).unwrap();
        let submit = calls.iter().position(|c| matches!(c, Call::Submit(..))).unwrap();
        let barriers_before_blit = calls[..blit]
            .iter()
            .filter(|c| matches!(c, Call::Barriers(..)))
            .count();
        // The caller's transition, then the copy transitions
        assert_eq!(barriers_before_blit, 2);
        assert!(matches!(calls[blit + 1], Call::Barriers(1, 0)));
        assert!(submit > blit);
        assert_eq!(calls.iter().filter(|c| matches!(c, Call::Submit(..))).count(), 1);
        assert!(!ctx.barriers().has_pending());
        assert_eq!(ctx.state(), FrameState::Idle);
    }

    #[test]
    fn flush_with_nothing_pending_records_nothing() {
        let mut ctx = context(640, 480);
        let image = render_target(&mut ctx);
        assert!(ctx.begin_frame().unwrap());

        let state = ctx.barriers().image_state(image).unwrap();
        assert!(!ctx.image_barrier_from(image, state, state).unwrap());
        assert!(!ctx.flush_barriers());
        assert!(!ctx.backend().calls.iter().any(|c| matches!(c, Call::Barriers(..))));
    }

    #[test]
    fn scratch_budget_is_per_frame() {
        let mut ctx = context(640, 480);
        let image = render_target(&mut ctx);
        assert!(ctx.begin_frame().unwrap());

        let data = vec![1u8; 4096];
        for i in 0..4 {
            let region = ctx.upload_to_scratch(&data).unwrap();
            assert_eq!(region.offset, i * 4096);
        }
        assert!(ctx.upload_to_scratch(&[0u8; 1]).is_err());
        ctx.present_image(image, vk::Extent2D { width: 640, height: 480 }).unwrap();

        assert!(ctx.begin_frame().unwrap());
        assert_eq!(ctx.scratch_used(), 0);
        assert_eq!(ctx.upload_to_scratch(&data).unwrap().offset, 0);
    }

    #[test]
    fn uploads_outside_recording_fail() {
        let mut ctx = context(640, 480);
        assert!(ctx.upload_to_scratch(&[1, 2, 3]).is_err());
    }

    #[test]
    fn begin_frame_twice_is_rejected() {
        let mut ctx = context(640, 480);
        assert!(ctx.begin_frame().unwrap());
        assert!(ctx.begin_frame().is_err());
    }

    #[test]
    fn frame_with_uniform_upload_advances_index() {
        let mut ctx = context(1280, 720);
        let image = render_target(&mut ctx);
        let start = ctx.frame_index();

        assert!(ctx.begin_frame().unwrap());
        let uniform = ctx.create_uniform_buffer(64).unwrap();
        let data = [0xABu8; 64];
        ctx.upload_to_uniform_buffer(&uniform, &data).unwrap();
        ctx.present_image(image, vk::Extent2D { width: 1280, height: 720 }).unwrap();

        assert_eq!(ctx.frame_index(), start + 1);
        assert_eq!(&ctx.backend().scratch[..64], &data);
        let copy = ctx
            .backend()
            .calls
            .iter()
            .find_map(|c| match c {
                Call::Copy(region, offset) => Some((*region, *offset)),
                _ => None,
            })
            .unwrap();
        assert_eq!(copy.0, TransientRegion { offset: 0, size: 64 });
        assert_eq!(copy.1, uniform.offset);
        assert_eq!(
            ctx.barriers().buffer_state(&uniform).unwrap().access,
            vk::AccessFlags2::UNIFORM_READ
        );
        assert!(ctx.backend().calls.contains(&Call::Present(0)));
    }

    #[test]
    fn out_of_date_acquire_drops_frame_and_rebuilds() {
        let mut ctx = context(1280, 720);
        let image = render_target(&mut ctx);
        run_frame(&mut ctx, image);

        ctx.backend_mut().acquire_results.push_back(AcquireOutcome::OutOfDate);
        ctx.backend_mut().window = (1920, 1080);

        assert!(!ctx.begin_frame().unwrap());
        assert_eq!(ctx.state(), FrameState::Idle);
        assert!(ctx.backend().calls.contains(&Call::Recreate(1920, 1080)));

        assert!(ctx.begin_frame().unwrap());
        assert_eq!(
            ctx.backend().swapchain_extent(),
            vk::Extent2D { width: 1920, height: 1080 }
        );
        ctx.present_image(image, vk::Extent2D { width: 1280, height: 720 }).unwrap();
        assert_eq!(ctx.state(), FrameState::Idle);
    }

    #[test]
    fn size_mismatch_after_present_rebuilds() {
        let mut ctx = context(800, 600);
        let image = render_target(&mut ctx);
        assert!(ctx.begin_frame().unwrap());
        ctx.backend_mut().window = (1024, 768);
        ctx.present_image(image, vk::Extent2D { width: 800, height: 600 }).unwrap();

        assert!(ctx.backend().calls.contains(&Call::Recreate(1024, 768)));
        assert_eq!(ctx.state(), FrameState::Idle);
    }

    #[test]
    fn out_of_date_present_rebuilds() {
        let mut ctx = context(800, 600);
        let image = render_target(&mut ctx);
        ctx.backend_mut().present_results.push_back(PresentOutcome::OutOfDate);
        run_frame(&mut ctx, image);
        assert!(ctx.backend().calls.contains(&Call::Recreate(800, 600)));
    }

    #[test]
    fn resize_waits_for_non_zero_window() {
        let mut ctx = context(800, 600);
        ctx.backend_mut().window_sizes.extend([(0, 0), (0, 0), (640, 0), (640, 360)]);
        ctx.resize().unwrap();

        assert_eq!(ctx.backend().swapchain_extent(), vk::Extent2D { width: 640, height: 360 });
        assert!(ctx.backend().window_sizes.is_empty());
    }

    #[test]
    fn rebuild_replaces_tracked_swapchain_images() {
        let mut ctx = context(800, 600);
        let old = ctx.backend().swapchain_images().to_vec();
        ctx.resize().unwrap();

        for image in old {
            assert!(ctx.barriers().image_state(image).is_none());
        }
        for image in ctx.backend().swapchain_images() {
            assert_eq!(ctx.barriers().image_state(*image), Some(ResourceState::UNDEFINED));
        }
    }

    #[test]
    fn missing_swapchain_drops_frame_and_rebuilds() {
        let mut ctx = context(800, 600);
        ctx.backend_mut().acquire_results.push_back(AcquireOutcome::NoSwapchain);
        assert!(!ctx.begin_frame().unwrap());
        assert_eq!(ctx.state(), FrameState::Idle);
        assert!(ctx.backend().calls.contains(&Call::Recreate(800, 600)));
        assert!(ctx.begin_frame().unwrap());
    }

    #[test]
    fn failed_rebuild_is_retried_next_frame() {
        let mut ctx = context(800, 600);
        let image = render_target(&mut ctx);
        ctx.backend_mut().failing_rebuilds = 1;
        ctx.backend_mut().acquire_results.push_back(AcquireOutcome::OutOfDate);

        assert!(!ctx.begin_frame().unwrap());
        assert_eq!(ctx.state(), FrameState::Idle);
        assert!(ctx.backend().swapchain_images().is_empty());

        // No swapchain on this acquire, the rebuild goes through this time
        assert!(!ctx.begin_frame().unwrap());
        let rebuilds = ctx
            .backend()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Recreate(..)))
            .count();
        assert_eq!(rebuilds, 2);

        run_frame(&mut ctx, image);
        assert_eq!(ctx.state(), FrameState::Idle);
    }

    #[test]
    fn pre_frame_submits_and_waits_idle() {
        let mut ctx = context(800, 600);
        let buffer = BufferRange {
            buffer: vk::Buffer::from_raw(55),
            offset: 0,
            size: 1024,
        };

        ctx.begin_pre_frame().unwrap();
        ctx.upload_to_gpu_buffer(
            &buffer,
            128,
            &[5u8; 256],
            vk::PipelineStageFlags2::VERTEX_INPUT,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        )
        .unwrap();
        ctx.end_pre_frame().unwrap();

        let calls = &ctx.backend().calls;
        let submit = calls
            .iter()
            .position(|c| *c == Call::Submit(0, SubmitKind::OneShot))
            .unwrap();
        assert_eq!(calls[submit + 1], Call::WaitIdle);
        // The post-copy transition is flushed before the submit
        assert!(matches!(calls[submit - 1], Call::Barriers(0, 1)));
        assert_eq!(ctx.state(), FrameState::Idle);
        assert_eq!(ctx.frame_index(), 0);
    }

    #[test]
    fn upload_past_buffer_end_is_rejected() {
        let mut ctx = context(800, 600);
        let buffer = BufferRange {
            buffer: vk::Buffer::from_raw(55),
            offset: 0,
            size: 64,
        };
        assert!(ctx.begin_frame().unwrap());
        let result = ctx.upload_to_gpu_buffer(
            &buffer,
            32,
            &[0u8; 64],
            vk::PipelineStageFlags2::VERTEX_INPUT,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        );
        assert!(result.is_err());
    }

    #[test]
    fn untracked_present_leaves_frame_presentable() {
        let mut ctx = context(800, 600);
        let image = render_target(&mut ctx);
        assert!(ctx.begin_frame().unwrap());

        let stray = vk::Image::from_raw(999);
        assert!(ctx.present_image(stray, vk::Extent2D { width: 800, height: 600 }).is_err());
        assert_eq!(ctx.state(), FrameState::Recording);
        assert_eq!(ctx.image_index(), Some(0));
        assert!(!ctx.barriers().has_pending());

        ctx.present_image(image, vk::Extent2D { width: 800, height: 600 }).unwrap();
        assert_eq!(ctx.state(), FrameState::Idle);
        assert!(ctx.backend().calls.contains(&Call::Present(0)));
        assert!(ctx.begin_frame().unwrap());
    }

    #[test]
    fn clamped_extent_rebuilds_only_once() {
        let mut ctx = context(1600, 900);
        let image = render_target(&mut ctx);
        ctx.backend_mut().max_extent = Some(vk::Extent2D { width: 1600, height: 900 });
        ctx.backend_mut().window = (1920, 1080);

        for _ in 0..5 {
            if ctx.begin_frame().unwrap() {
                ctx.present_image(image, vk::Extent2D { width: 1600, height: 900 }).unwrap();
            }
        }

        let rebuilds: Vec<_> = ctx
            .backend()
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Recreate(..)))
            .cloned()
            .collect();
        assert_eq!(rebuilds, vec![Call::Recreate(1920, 1080)]);
        assert_eq!(
            ctx.backend().swapchain_extent(),
            vk::Extent2D { width: 1600, height: 900 }
        );
    }

    #[test]
    fn upload_offset_overflow_is_rejected() {
        let mut ctx = context(800, 600);
        let buffer = BufferRange {
            buffer: vk::Buffer::from_raw(55),
            offset: 0,
            size: 64,
        };
        assert!(ctx.begin_frame().unwrap());
        let result = ctx.upload_to_gpu_buffer(
            &buffer,
            u64::MAX - 8,
            &[0u8; 16],
            vk::PipelineStageFlags2::VERTEX_INPUT,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        );
        assert!(result.is_err());
        assert_eq!(ctx.scratch_used(), 0);
    }
}
