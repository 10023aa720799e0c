mod app;

use color_eyre::Result;
use winit::event_loop::EventLoop;
use vkframe::VSyncMode;
use app::App;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let vsync = match std::env::args().nth(1).as_deref() {
        Some("--immediate") => VSyncMode::Immediate,
        Some("--mailbox") => VSyncMode::Mailbox,
        _ => VSyncMode::Fifo,
    };

    let event_loop = EventLoop::new()?;
    let mut app = App::new(vsync);
    event_loop.run_app(&mut app)?;

    Ok(())
}
