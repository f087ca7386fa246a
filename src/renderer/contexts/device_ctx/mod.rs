pub mod target;

use std::sync::Arc;
use color_eyre::Result;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::target::RenderTarget;
use crate::renderer::core::{Format, QueueId, RenderDevice};

/// Responsibilities:
/// - Hold the device every other context creates objects through
/// - Own the main queue frames are submitted to
/// - Own the presentation target
pub struct RenderDeviceContext {
    pub device: Arc<dyn RenderDevice>,
    pub queue: QueueId,
    pub target: RenderTarget,
}

impl RenderDeviceContext {
    pub fn new(
        config: &RenderConfig,
        format: Format,
        width: u32,
        height: u32,
        device: Arc<dyn RenderDevice>,
    ) -> Result<Self> {
        let queue = device.create_queue()?;
        let target = RenderTarget::new(config, queue, format, width, height, device.clone())?;
        log::info!("Created {} device context ({}x{})", device.backend_name(), width, height);

        Ok(Self {
            device,
            queue,
            target,
        })
    }
}

impl Drop for RenderDeviceContext {
    fn drop(&mut self) {
        if let Err(e) = self.target.destroy() {
            log::error!("Failed to destroy render target: {}", e);
        }
        if let Err(e) = self.device.destroy_queue(self.queue) {
            log::error!("Failed to destroy main queue: {}", e);
        }
    }
}
