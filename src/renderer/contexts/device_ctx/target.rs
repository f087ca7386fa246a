use std::sync::Arc;
use color_eyre::Result;
use crate::renderer::config::RenderConfig;
use crate::renderer::core::{
    Format, QueueId, RenderDevice, ResourceState, ScissorRect, SwapchainDesc, SwapchainId, TextureDesc,
    TextureId, TextureUsage, Viewport,
};

/// Presentation target of the renderer: swap chain, depth buffer and the full-window viewport
pub struct RenderTarget {
    pub swapchain: SwapchainId,
    pub format: Format,
    pub depth: TextureId,
    pub width: u32,
    pub height: u32,
    pub viewport: Viewport,
    pub scissor: ScissorRect,

    device: Arc<dyn RenderDevice>,
}

impl RenderTarget {
    pub const DEPTH_FORMAT: Format = Format::Depth32Float;

    pub fn new(
        config: &RenderConfig,
        queue: QueueId,
        format: Format,
        width: u32,
        height: u32,
        device: Arc<dyn RenderDevice>,
    ) -> Result<Self> {
        let swapchain = device.create_swapchain(queue, &SwapchainDesc {
            width,
            height,
            buffer_count: config.swap_chain_frame_count,
            format,
            allow_tearing: !config.vsync,
        })?;
        let depth = create_depth(device.as_ref(), width, height)?;

        Ok(Self {
            swapchain,
            format,
            depth,
            width,
            height,
            viewport: viewport(width, height),
            scissor: scissor(width, height),
            device,
        })
    }

    pub fn back_buffer(&self) -> Result<TextureId> {
        let index = self.device.current_back_buffer_index(self.swapchain)?;
        self.device.swapchain_buffer(self.swapchain, index)
    }

    /// Recreates the back buffers and the depth buffer. No frame may still reference them.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.device.destroy_texture(self.depth)?;
        self.device.resize_swapchain(self.swapchain, width, height)?;
        self.depth = create_depth(self.device.as_ref(), width, height)?;

        self.width = width;
        self.height = height;
        self.viewport = viewport(width, height);
        self.scissor = scissor(width, height);
        Ok(())
    }

    pub fn present(&self, vsync: bool) -> Result<()> {
        let sync_interval = if vsync { 1 } else { 0 };
        self.device.present(self.swapchain, sync_interval, !vsync)
    }

    pub fn destroy(&self) -> Result<()> {
        self.device.destroy_texture(self.depth)?;
        self.device.destroy_swapchain(self.swapchain)
    }
}

fn create_depth(device: &dyn RenderDevice, width: u32, height: u32) -> Result<TextureId> {
    device.create_texture(&TextureDesc {
        width,
        height,
        format: RenderTarget::DEPTH_FORMAT,
        usage: TextureUsage::DepthStencil,
        initial_state: ResourceState::DepthWrite,
        name: "Depth buffer".to_string(),
    })
}

fn viewport(width: u32, height: u32) -> Viewport {
    Viewport {
        x: 0.0,
        y: 0.0,
        width: width as f32,
        height: height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

fn scissor(width: u32, height: u32) -> ScissorRect {
    ScissorRect {
        left: 0,
        top: 0,
        right: width as i32,
        bottom: height as i32,
    }
}
