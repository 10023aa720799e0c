use std::cell::Cell;
use std::ffi::CStr;
use std::rc::Rc;
use std::sync::Arc;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use color_eyre::Result;
use glam::Vec4;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;
use vkframe::renderer::internals::transient::UniformBuffer;
use vkframe::renderer::resources::buffer::Buffer;
use vkframe::renderer::resources::image::Image;
use vkframe::{GraphicsContext, RenderConfig, VSyncMode};

const PALETTE: [Vec4; 4] = [
    Vec4::new(0.91, 0.30, 0.24, 1.0),
    Vec4::new(0.95, 0.77, 0.06, 1.0),
    Vec4::new(0.18, 0.80, 0.44, 1.0),
    Vec4::new(0.20, 0.60, 0.86, 1.0),
];

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct FrameUniforms {
    tint: Vec4,
    time: f32,
    _padding: [f32; 3],
}

/// Clears an offscreen target to a color cycling through a palette and
/// presents it. Exercises the whole frame loop without any shaders.
pub struct Demo {
    // Must drop before the context
    target: Option<Image>,
    palette: Option<Buffer>,
    uniforms: UniformBuffer,
    resized: Rc<Cell<Option<(u32, u32)>>>,
    ctx: GraphicsContext,
}

impl Demo {
    pub fn new(window: Arc<Window>, vsync: VSyncMode) -> Result<Self> {
        let size = window.inner_size();
        let resized = Rc::new(Cell::new(None));

        let instance_extensions = ash_window::enumerate_required_extensions(
            window.display_handle()?.as_raw(),
        )?
        .iter()
        .map(|ext| unsafe { CStr::from_ptr(*ext) }.to_owned())
        .collect();

        let size_window = window.clone();
        let surface_window = window.clone();
        let resize_flag = resized.clone();

        let config = RenderConfig {
            window_size: Box::new(move || {
                let size = size_window.inner_size();
                (size.width, size.height)
            }),
            create_surface: Box::new(move |entry, instance| {
                let surface = unsafe {
                    ash_window::create_surface(
                        entry,
                        instance,
                        surface_window.display_handle()?.as_raw(),
                        surface_window.window_handle()?.as_raw(),
                        None,
                    )?
                };
                Ok(surface)
            }),
            on_resize: Box::new(move |width, height| {
                resize_flag.set(Some((width, height)));
            }),
            on_destroy_buffers: Box::new(|| {
                log::debug!("Releasing demo resources");
            }),
            instance_extensions,
            use_validation: cfg!(debug_assertions),
            vsync,
            width: size.width,
            height: size.height,
            application_name: c"vkframe demo".to_owned(),
            ..Default::default()
        };

        let mut ctx = GraphicsContext::init(config)?;
        let extent = ctx.swapchain_extent();
        let target = ctx.create_render_target(extent.width, extent.height, None)?;
        let uniforms = ctx.create_uniform_buffer::<FrameUniforms>()?;

        let palette = ctx.create_gpu_buffer(
            size_of_val(&PALETTE) as u64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            "Palette",
        )?;
        ctx.begin_pre_frame()?;
        ctx.upload_to_gpu_buffer(
            &palette,
            0,
            &PALETTE,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_READ,
        )?;
        ctx.end_pre_frame()?;

        Ok(Self {
            target: Some(target),
            palette: Some(palette),
            uniforms,
            resized,
            ctx,
        })
    }

    pub fn draw(&mut self, time_secs: f32) -> Result<()> {
        if let Some((width, height)) = self.resized.take() {
            self.recreate_target(width, height)?;
        }

        let Some(target) = self.target.as_ref() else {
            return Ok(());
        };
        if !self.ctx.begin_frame()? {
            return Ok(());
        }

        let phase = time_secs * 0.5;
        let index = phase as usize % PALETTE.len();
        let next = (index + 1) % PALETTE.len();
        let tint = PALETTE[index].lerp(PALETTE[next], phase.fract());

        self.ctx.upload_to_uniform_buffer(
            &self.uniforms,
            &FrameUniforms {
                tint,
                time: time_secs,
                _padding: [0.0; 3],
            },
        )?;

        self.ctx.image_barrier(
            target,
            vk::PipelineStageFlags2::CLEAR,
            vk::AccessFlags2::TRANSFER_WRITE,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        self.ctx.flush_barriers();

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.ctx.device().cmd_clear_color_image(
                self.ctx.command_buffer(),
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: tint.to_array() },
                &[range],
            );
        }

        self.ctx.present_image(target)?;

        if self.ctx.frame_index() % 240 == 0 {
            if let Some(ms) = self.ctx.gpu_frame_time_ms() {
                log::info!("Frame {}: {:.3} ms on the GPU", self.ctx.frame_index(), ms);
            }
        }
        Ok(())
    }

    fn recreate_target(&mut self, width: u32, height: u32) -> Result<()> {
        if let Some(old) = self.target.take() {
            self.ctx.destroy_image(old)?;
        }
        self.target = Some(self.ctx.create_render_target(width, height, None)?);
        log::debug!("Render target recreated at {}x{}", width, height);
        Ok(())
    }
}

impl Drop for Demo {
    fn drop(&mut self) {
        if let Some(palette) = self.palette.take() {
            if let Err(err) = self.ctx.destroy_buffer(palette) {
                log::error!("Failed to destroy palette: {:#}", err);
            }
        }
        if let Some(target) = self.target.take() {
            if let Err(err) = self.ctx.destroy_image(target) {
                log::error!("Failed to destroy render target: {:#}", err);
            }
        }
    }
}
