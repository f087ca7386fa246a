use std::sync::Arc;
use color_eyre::Result;
use crate::renderer::config::RenderConfig;
use crate::renderer::core::{CommandAllocatorId, CommandListId, RenderDevice};
use crate::renderer::error::PoolExhausted;
use crate::renderer::internals::constant_buffer_pool::{ConstantBufferManager, ConstantBufferSlot};
use crate::renderer::internals::linear_descriptor_allocator::{DescriptorTable, LinearDescriptorAllocator};
use crate::renderer::shader_data::ConstantBufferType;

/// Everything one frame in flight records into. Owned by exactly one slot of the ring and only
/// reused after `last_fence_value` completed.
pub struct FrameContext {
    pub command_allocator: CommandAllocatorId,
    pub command_list: CommandListId,
    pub descriptor_pool: LinearDescriptorAllocator,
    pub constant_buffers: ConstantBufferManager,

    // Fence value signaled after this context's last submission.
    pub last_fence_value: u64,

    device: Arc<dyn RenderDevice>,
}

impl FrameContext {
    pub fn new(config: &RenderConfig, device: Arc<dyn RenderDevice>) -> Result<Self> {
        let command_allocator = device.create_command_allocator()?;
        let command_list = device.create_command_list(command_allocator)?;
        let descriptor_pool = LinearDescriptorAllocator::new(config.descriptor_count_per_frame(), device.clone())?;
        let constant_buffers = ConstantBufferManager::new(config.max_draw_count_per_frame, device.clone())?;

        Ok(Self {
            command_allocator,
            command_list,
            descriptor_pool,
            constant_buffers,
            last_fence_value: 0,
            device,
        })
    }

    /// Takes one `kind` constant-buffer slot and a `descriptor_count` table for a single draw.
    /// When either pool is short, neither is touched.
    pub fn allocate_draw(
        &mut self,
        kind: ConstantBufferType,
        descriptor_count: u32,
    ) -> Result<(ConstantBufferSlot, DescriptorTable), PoolExhausted> {
        self.constant_buffers.pool(kind).check_available()?;
        self.descriptor_pool.check_available(descriptor_count)?;

        let slot = self.constant_buffers.pool(kind).allocate()?;
        let table = self.descriptor_pool.allocate(descriptor_count)?;
        Ok((slot, table))
    }

    /// Reclaims the per-frame pools. The GPU must have retired `last_fence_value`.
    pub fn reset_pools(&mut self) {
        self.constant_buffers.reset();
        self.descriptor_pool.reset();
    }
}

impl Drop for FrameContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_command_list(self.command_list) {
            log::error!("Failed to destroy frame command list: {}", e);
        }
        if let Err(e) = self.device.destroy_command_allocator(self.command_allocator) {
            log::error!("Failed to destroy frame command allocator: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::core::headless::HeadlessDevice;

    fn frame(max_draw_count_per_frame: u32) -> FrameContext {
        let config = RenderConfig {
            max_draw_count_per_frame,
            ..Default::default()
        };
        FrameContext::new(&config, Arc::new(HeadlessDevice::new())).unwrap()
    }

    #[test]
    fn full_constant_buffer_pool_leaves_the_table_heap_alone() {
        let mut frame = frame(1);
        frame.allocate_draw(ConstantBufferType::Default, 2).unwrap();
        let used = frame.descriptor_pool.allocated_count();

        let err = frame.allocate_draw(ConstantBufferType::Default, 2).unwrap_err();
        assert_eq!(err.pool, "Mesh");
        assert_eq!(frame.descriptor_pool.allocated_count(), used);

        // Another draw kind still gets its slot and table.
        assert!(frame.allocate_draw(ConstantBufferType::Sprite, 2).is_ok());
    }

    #[test]
    fn full_table_heap_leaves_the_constant_buffer_pool_alone() {
        let mut frame = frame(2);
        let capacity = 2 * RenderConfig::MAX_DESCRIPTOR_COUNT_FOR_DRAW;
        frame.allocate_draw(ConstantBufferType::Sprite, capacity - 1).unwrap();

        let err = frame.allocate_draw(ConstantBufferType::Sprite, 2).unwrap_err();
        assert_eq!(err.pool, "descriptor table heap");
        assert_eq!(err.available, 1);
        assert_eq!(frame.constant_buffers.pool(ConstantBufferType::Sprite).allocated_count(), 1);

        frame.reset_pools();
        assert_eq!(frame.descriptor_pool.allocated_count(), 0);
        assert_eq!(frame.constant_buffers.pool(ConstantBufferType::Sprite).allocated_count(), 0);
    }
}
