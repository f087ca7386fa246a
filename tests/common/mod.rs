#![allow(dead_code)]

use std::sync::Arc;
use color_eyre::Result;
use vesta::renderer::config::RenderConfig;
use vesta::renderer::core::headless::HeadlessDevice;
use vesta::renderer::core::Format;
use vesta::renderer::Renderer;

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;

pub fn small_config() -> RenderConfig {
    RenderConfig {
        max_draw_count_per_frame: 16,
        max_descriptor_count: 64,
        enable_validation: false,
        ..Default::default()
    }
}

pub fn renderer_with(config: RenderConfig) -> (Arc<HeadlessDevice>, Renderer) {
    let device = Arc::new(HeadlessDevice::new());
    let renderer = Renderer::new(device.clone(), config, Format::Bgra8Unorm, WIDTH, HEIGHT).unwrap();
    (device, renderer)
}

pub fn renderer() -> (Arc<HeadlessDevice>, Renderer) {
    renderer_with(small_config())
}

/// Runs one full begin/end/present cycle with `draw` recording in between.
pub fn frame(renderer: &mut Renderer, draw: impl FnOnce(&mut Renderer) -> Result<()>) {
    renderer.begin_render().unwrap();
    draw(renderer).unwrap();
    renderer.end_render().unwrap();
    renderer.present().unwrap();
}
