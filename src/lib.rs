pub mod renderer;

pub use renderer::config::{RenderConfig, VSyncMode};
pub use renderer::context::GraphicsContext;
