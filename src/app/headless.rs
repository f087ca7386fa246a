use std::sync::Arc;
use std::time::{Duration, Instant};
use color_eyre::Result;
use crate::app::game::Game;
use crate::renderer::config::RenderConfig;
use crate::renderer::core::headless::HeadlessDevice;
use crate::renderer::core::Format;
use crate::renderer::Renderer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const FRAME_TIME: Duration = Duration::from_millis(16);

/// Runs the demo game for `frames` frames on the simulated device, without a window.
pub fn run(frames: u32) -> Result<()> {
    let device = Arc::new(HeadlessDevice::new());
    let config = RenderConfig {
        enable_validation: false,
        ..Default::default()
    };
    let mut renderer = Renderer::new(device.clone(), config, Format::Bgra8Unorm, WIDTH, HEIGHT)?;
    let mut game = Game::new(&mut renderer)?;

    // Simulated clock, so every frame runs a game update.
    let start = Instant::now();
    for frame in 0..frames {
        game.update(&mut renderer, start + FRAME_TIME * frame)?;
        game.render(&mut renderer)?;
    }

    game.destroy(&mut renderer)?;
    renderer.shutdown()?;

    let stats = device.stats()?;
    log::info!(
        "Headless run finished: {} frames, {} lists, {} draws, {} texture copies",
        frames,
        stats.executed_lists,
        stats.draws,
        stats.texture_copies
    );
    Ok(())
}
