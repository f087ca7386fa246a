pub mod game;
pub mod headless;
mod input_state;

use std::sync::Arc;
use std::time::Instant;
use color_eyre::Result;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowId};
use crate::app::game::Game;
use crate::app::input_state::InputState;
use crate::renderer::config::RenderConfig;
use crate::renderer::core::vulkan::VulkanDevice;
use crate::renderer::Renderer;

pub struct App {
    window: Option<Arc<Window>>,
    renderer: Option<Renderer>,
    game: Option<Game>,
    config: RenderConfig,

    // State
    input_state: InputState,
    minimized: bool,
    close_requested: bool,
    error: Option<color_eyre::Report>,
}

impl App {
    pub fn new() -> Result<Self> {
        Ok(Self {
            window: None,
            renderer: None,
            game: None,
            config: RenderConfig::default(),

            input_state: InputState::default(),
            minimized: false,
            close_requested: false,
            error: None,
        })
    }

    /// Runs the event loop until the window closes, then shuts the renderer down.
    pub fn run(mut self) -> Result<()> {
        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Poll);
        event_loop.run_app(&mut self)?;

        let shutdown = self.shutdown();
        match self.error.take() {
            Some(e) => Err(e),
            None => shutdown,
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Arc::new(event_loop.create_window(
            Window::default_attributes()
                .with_title("vesta")
                .with_inner_size(PhysicalSize::new(1280, 720)),
        )?);
        let size = window.inner_size();

        let device = Arc::new(VulkanDevice::new(window.clone(), self.config.enable_validation)?);
        let format = device.surface_format()?;
        let mut renderer = Renderer::new(device, self.config.clone(), format, size.width.max(1), size.height.max(1))?;
        let game = Game::new(&mut renderer)?;

        self.window = Some(window);
        self.renderer = Some(renderer);
        self.game = Some(game);
        Ok(())
    }

    fn resize(&mut self, size: PhysicalSize<u32>) -> Result<()> {
        self.minimized = size.width == 0 || size.height == 0;
        if self.minimized {
            return Ok(());
        }
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.update_window_size(size.width, size.height)?;
        }
        Ok(())
    }

    fn redraw(&mut self) -> Result<()> {
        if self.minimized {
            return Ok(());
        }
        let (Some(renderer), Some(game)) = (self.renderer.as_mut(), self.game.as_mut()) else {
            return Ok(());
        };
        game.set_camera_offset(self.input_state.camera_offset());
        game.update(renderer, Instant::now())?;
        game.render(renderer)
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(mut renderer) = self.renderer.take() else {
            return Ok(());
        };
        if let Some(game) = self.game.take() {
            game.destroy(&mut renderer)?;
        }
        renderer.shutdown()?;
        // The device is gone with the renderer; the window may close now.
        self.window = None;
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: color_eyre::Report) {
        log::error!("{:#}", e);
        self.error.get_or_insert(e);
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_none() {
            if let Err(e) = self.init(event_loop) {
                self.fail(event_loop, e);
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent
    ) {
        if self.window.as_ref().is_none_or(|window| window.id() != window_id) {
            return;
        }

        self.input_state.process_window_events(&event);

        let result = match event {
            WindowEvent::CloseRequested => {
                self.close_requested = true;
                Ok(())
            }
            WindowEvent::Resized(new_size) => self.resize(new_size),
            WindowEvent::RedrawRequested => self.redraw(),
            WindowEvent::KeyboardInput {
                event:
                KeyEvent {
                    logical_key: Key::Named(NamedKey::Escape),
                    state: ElementState::Pressed,
                    ..
                },
                ..
            } => {
                self.close_requested = true;
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.close_requested {
            event_loop.exit();
            return;
        }
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}
