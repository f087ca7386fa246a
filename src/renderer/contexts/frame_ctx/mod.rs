pub mod frame;

use std::sync::Arc;
use color_eyre::Result;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::frame_ctx::frame::FrameContext;
use crate::renderer::core::{FenceId, QueueId, RenderDevice};

/// Responsibilities:
/// - Own the ring of frame contexts and the main-queue fence
/// - Tag each submitted frame with the fence value that retires it
/// - Be the only place that blocks on the main queue: before a context is reused, on deletes,
///   on resize and at shutdown
pub struct RenderFrameContext {
    frames: Vec<FrameContext>,
    current: usize,

    fence: FenceId,
    fence_value: u64,
    queue: QueueId,

    device: Arc<dyn RenderDevice>,
}

impl RenderFrameContext {
    pub fn new(
        config: &RenderConfig,
        queue: QueueId,
        device: Arc<dyn RenderDevice>,
    ) -> Result<Self> {
        let frames = (0..config.pending_frame_count())
            .map(|_| FrameContext::new(config, device.clone()))
            .collect::<Result<Vec<_>>>()?;
        let fence = device.create_fence(0)?;

        Ok(Self {
            frames,
            current: 0,
            fence,
            fence_value: 0,
            queue,
            device,
        })
    }

    pub fn current(&self) -> &FrameContext {
        &self.frames[self.current]
    }

    pub fn current_mut(&mut self) -> &mut FrameContext {
        &mut self.frames[self.current]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    /// Fence value each context was last tagged with, in ring order.
    pub fn last_fence_values(&self) -> Vec<u64> {
        self.frames.iter().map(|frame| frame.last_fence_value).collect()
    }

    /// Signals the next fence value behind everything submitted so far and tags the current
    /// context with it.
    pub fn set_fence(&mut self) -> Result<u64> {
        self.fence_value += 1;
        self.device.signal(self.queue, self.fence, self.fence_value)?;
        self.frames[self.current].last_fence_value = self.fence_value;
        Ok(self.fence_value)
    }

    pub fn wait_for_fence_value(&self, value: u64) -> Result<()> {
        if self.device.fence_completed_value(self.fence)? < value {
            log::trace!("Waiting for fence value {}", value);
            self.device.wait_for_fence(self.fence, value)?;
        }
        Ok(())
    }

    /// Moves to the next context once the GPU is done with it, then resets its pools.
    pub fn advance(&mut self) -> Result<()> {
        let next = (self.current + 1) % self.frames.len();
        self.wait_for_fence_value(self.frames[next].last_fence_value)?;
        self.frames[next].reset_pools();
        self.current = next;
        Ok(())
    }

    /// Blocks until every context's last submission retired.
    pub fn wait_for_all(&self) -> Result<()> {
        for frame in &self.frames {
            self.wait_for_fence_value(frame.last_fence_value)?;
        }
        Ok(())
    }

    /// Signals a fresh value and waits for all contexts, leaving the main queue idle.
    pub fn wait_for_gpu_idle(&mut self) -> Result<()> {
        self.set_fence()?;
        self.wait_for_all()
    }
}

impl Drop for RenderFrameContext {
    fn drop(&mut self) {
        self.frames.clear();
        if let Err(e) = self.device.destroy_fence(self.fence) {
            log::error!("Failed to destroy frame fence: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::core::headless::HeadlessDevice;

    fn ring(device: &Arc<HeadlessDevice>) -> (QueueId, RenderFrameContext) {
        let queue = device.create_queue().unwrap();
        let frames = RenderFrameContext::new(&RenderConfig {
            max_draw_count_per_frame: 4,
            ..Default::default()
        }, queue, device.clone()).unwrap();
        (queue, frames)
    }

    #[test]
    fn advance_waits_for_the_slot_it_reuses() {
        let device = Arc::new(HeadlessDevice::new());
        let (_queue, mut frames) = ring(&device);
        assert_eq!(frames.frame_count(), 2);

        // First lap: the next slot was never submitted, nothing to wait for.
        assert_eq!(frames.set_fence().unwrap(), 1);
        frames.advance().unwrap();
        assert_eq!(frames.current_index(), 1);
        assert!(device.fence_waits().unwrap().is_empty());

        assert_eq!(frames.set_fence().unwrap(), 2);
        frames.advance().unwrap();
        assert_eq!(frames.current_index(), 0);
        let waits = device.fence_waits().unwrap();
        assert_eq!(waits.len(), 1);
        assert_eq!(waits[0].value, 1);
    }

    #[test]
    fn gpu_idle_covers_every_slot() {
        let device = Arc::new(HeadlessDevice::new());
        let (_queue, mut frames) = ring(&device);
        frames.set_fence().unwrap();
        frames.advance().unwrap();
        frames.wait_for_gpu_idle().unwrap();
        assert_eq!(device.pending_op_count().unwrap(), 0);
    }

    #[test]
    fn advance_resets_the_next_pools() {
        let device = Arc::new(HeadlessDevice::new());
        let (_queue, mut frames) = ring(&device);
        frames.frames[1].descriptor_pool.allocate(3).unwrap();
        frames.set_fence().unwrap();
        frames.advance().unwrap();
        assert_eq!(frames.current().descriptor_pool.allocated_count(), 0);
    }
}
