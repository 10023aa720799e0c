use std::ffi::CString;
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::eyre;

pub type WindowSizeFn = Box<dyn FnMut() -> (u32, u32)>;
pub type CreateSurfaceFn = Box<dyn FnOnce(&ash::Entry, &ash::Instance) -> Result<vk::SurfaceKHR>>;
pub type ResizeFn = Box<dyn FnMut(u32, u32)>;
pub type DestroyBuffersFn = Box<dyn FnMut()>;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub enum VSyncMode {
    #[default]
    Fifo,
    Immediate,
    Mailbox,
}

/// Contains configuration options for the renderer like the resolution, vsync, and other settings
pub struct RenderConfig {
    pub window_size: WindowSizeFn,
    pub create_surface: CreateSurfaceFn,
    pub on_resize: ResizeFn,
    pub on_destroy_buffers: DestroyBuffersFn,

    pub instance_extensions: Vec<CString>,
    pub device_extensions: Vec<CString>,
    pub use_validation: bool,
    pub use_integrated_gpu: bool,

    pub vsync: VSyncMode,
    pub width: u32,
    pub height: u32,

    pub frames_in_flight: usize,
    pub scratch_buffer_size: u64,
    pub uniform_arena_size: u64,

    pub application_name: CString,
    pub application_version: (u32, u32, u32),
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            window_size: Box::new(|| (0, 0)),
            create_surface: Box::new(|_, _| Err(eyre!("No surface creation callback configured"))),
            on_resize: Box::new(|_, _| {}),
            on_destroy_buffers: Box::new(|| {}),

            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
            use_validation: cfg!(debug_assertions),
            use_integrated_gpu: false,

            vsync: VSyncMode::default(),
            width: 1280,
            height: 720,

            frames_in_flight: 4,
            scratch_buffer_size: 32 * 1024 * 1024,
            uniform_arena_size: 16 * 1024 * 1024,

            application_name: c"vkframe".to_owned(),
            application_version: (0, 0, 1),
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(eyre!("frames_in_flight must be at least 1"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(eyre!("Initial size {}x{} has a zero dimension", self.width, self.height));
        }
        if self.scratch_buffer_size == 0 || self.uniform_arena_size == 0 {
            return Err(eyre!("Transient buffer sizes must be non-zero"));
        }
        Ok(())
    }
}
