mod demo;

use std::sync::Arc;
use std::time::Instant;
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};
use vkframe::VSyncMode;
use crate::app::demo::Demo;

pub struct App {
    // Dropped before the window it presents to
    demo: Option<Demo>,
    window: Option<Arc<Window>>,
    vsync: VSyncMode,

    // State
    start_time: Instant,
    request_redraws: bool,
    close_requested: bool,
}

impl App {
    pub fn new(vsync: VSyncMode) -> Self {
        Self {
            demo: None,
            window: None,
            vsync,

            start_time: Instant::now(),
            request_redraws: true,
            close_requested: false,
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let attributes = Window::default_attributes()
                .with_title("vkframe")
                .with_inner_size(LogicalSize::new(1280, 720));
            match event_loop.create_window(attributes) {
                Ok(window) => self.window = Some(Arc::new(window)),
                Err(err) => {
                    log::error!("Failed to create window: {}", err);
                    event_loop.exit();
                    return;
                }
            }
        }

        if self.demo.is_none() {
            if let Some(window) = self.window.clone() {
                match Demo::new(window, self.vsync) {
                    Ok(demo) => self.demo = Some(demo),
                    Err(err) => {
                        log::error!("Failed to initialize graphics: {:?}", err);
                        event_loop.exit();
                    }
                }
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if self.window.as_ref().map(|window| window.id()) != Some(window_id) {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::RedrawRequested => {
                let time_secs = self.start_time.elapsed().as_secs_f32();
                if let Some(demo) = self.demo.as_mut() {
                    if let Err(err) = demo.draw(time_secs) {
                        log::error!("Frame failed: {:?}", err);
                        event_loop.exit();
                    }
                }
            }
            WindowEvent::KeyboardInput {
                event:
                KeyEvent {
                    logical_key: key,
                    state: ElementState::Pressed,
                    ..
                },
                ..
            } => match key.as_ref() {
                Key::Character("r") => {
                    self.request_redraws = !self.request_redraws;
                    log::info!("request_redraws: {}", self.request_redraws);
                }
                Key::Named(NamedKey::Escape) => {
                    self.close_requested = true;
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.request_redraws {
            if let Some(window) = self.window.as_ref() {
                window.request_redraw();
            }
        }

        if self.close_requested {
            // Tear down graphics while the window still exists
            self.demo = None;
            event_loop.exit();
        }
    }
}
