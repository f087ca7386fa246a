use std::sync::Arc;
use bytemuck::Pod;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use crate::renderer::core::{
    BufferDesc, BufferId, BufferUsage, CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapId,
    HeapKind, RenderDevice, ViewDesc,
};
use crate::renderer::error::PoolExhausted;
use crate::renderer::shader_data::ConstantBufferType;

/// Constant-buffer views must start on 256-byte boundaries.
pub const CONSTANT_BUFFER_ALIGNMENT: u32 = 256;

pub fn aligned_size(size: u32) -> u32 {
    size.div_ceil(CONSTANT_BUFFER_ALIGNMENT) * CONSTANT_BUFFER_ALIGNMENT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBufferSlot {
    pub index: u32,
    pub offset: u64,
    /// Pre-created view of this slot, ready to be copied into a descriptor table.
    pub view: CpuDescriptorHandle,
}

/// Bump allocator over a persistently mapped upload buffer cut into equally sized slots.
/// Every slot's view is created once up front; allocation only hands slots to draws.
pub struct ConstantBufferPool {
    buffer: BufferId,
    heap: DescriptorHeapId,
    view_start: CpuDescriptorHandle,
    stride: u32,
    slot_size: u32,
    capacity: u32,
    allocated: u32,
    name: &'static str,

    device: Arc<dyn RenderDevice>,
}

impl ConstantBufferPool {
    pub fn new(
        name: &'static str,
        size_per_slot: u32,
        capacity: u32,
        device: Arc<dyn RenderDevice>,
    ) -> Result<Self> {
        let slot_size = aligned_size(size_per_slot);
        let buffer = device.create_buffer(&BufferDesc {
            size: slot_size as u64 * capacity as u64,
            heap: HeapKind::Upload,
            usage: BufferUsage::Constant,
            name: format!("{} constant buffer pool", name),
        })?;
        let heap = device.create_descriptor_heap(&DescriptorHeapDesc {
            capacity,
            shader_visible: false,
        })?;
        let view_start = device.cpu_heap_start(heap)?;
        let stride = device.descriptor_increment_size();

        for index in 0..capacity {
            device.create_view(
                &ViewDesc::ConstantBuffer {
                    buffer,
                    offset: index as u64 * slot_size as u64,
                    size: slot_size,
                },
                view_start.offset(index, stride),
            )?;
        }

        Ok(Self {
            buffer,
            heap,
            view_start,
            stride,
            slot_size,
            capacity,
            allocated: 0,
            name,
            device,
        })
    }

    /// Fails exactly when `allocate` would.
    pub fn check_available(&self) -> Result<(), PoolExhausted> {
        if self.allocated >= self.capacity {
            return Err(PoolExhausted {
                pool: self.name,
                requested: 1,
                available: 0,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn allocate(&mut self) -> Result<ConstantBufferSlot, PoolExhausted> {
        self.check_available()?;
        let index = self.allocated;
        self.allocated += 1;
        Ok(ConstantBufferSlot {
            index,
            offset: index as u64 * self.slot_size as u64,
            view: self.view_start.offset(index, self.stride),
        })
    }

    pub fn write<T: Pod>(&self, slot: &ConstantBufferSlot, data: &T) -> Result<()> {
        let bytes = bytemuck::bytes_of(data);
        if bytes.len() > self.slot_size as usize {
            return Err(eyre!("{} bytes do not fit a {} byte constant buffer slot", bytes.len(), self.slot_size));
        }
        let start = slot.offset as usize;
        self.device.map_buffer(self.buffer, &mut |mapped| {
            mapped[start..start + bytes.len()].copy_from_slice(bytes);
        })
    }

    pub fn reset(&mut self) {
        self.allocated = 0;
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocated
    }
}

impl Drop for ConstantBufferPool {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_descriptor_heap(self.heap) {
            log::error!("Failed to destroy {} view heap: {}", self.name, e);
        }
        if let Err(e) = self.device.destroy_buffer(self.buffer) {
            log::error!("Failed to destroy {} buffer: {}", self.name, e);
        }
    }
}

/// One pool per `ConstantBufferType`, owned by a frame context.
pub struct ConstantBufferManager {
    pools: Vec<ConstantBufferPool>,
}

impl ConstantBufferManager {
    pub fn new(max_draw_count: u32, device: Arc<dyn RenderDevice>) -> Result<Self> {
        let pools = ConstantBufferType::ALL
            .iter()
            .map(|&kind| {
                let name = match kind {
                    ConstantBufferType::Default => "Mesh",
                    ConstantBufferType::Sprite => "Sprite",
                };
                ConstantBufferPool::new(name, kind.size(), max_draw_count, device.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { pools })
    }

    pub fn pool(&mut self, kind: ConstantBufferType) -> &mut ConstantBufferPool {
        &mut self.pools[kind as usize]
    }

    pub fn reset(&mut self) {
        for pool in &mut self.pools {
            pool.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::core::headless::HeadlessDevice;
    use crate::renderer::shader_data::{MeshConstants, SpriteConstants};

    #[test]
    fn slots_are_aligned_to_256_bytes() {
        assert_eq!(aligned_size(size_of::<MeshConstants>() as u32), 256);
        assert_eq!(aligned_size(size_of::<SpriteConstants>() as u32), 256);
        assert_eq!(aligned_size(257), 512);
    }

    #[test]
    fn pool_exhausts_then_reset_starts_over() {
        let device = Arc::new(HeadlessDevice::new());
        let mut pool = ConstantBufferPool::new("Test", 64, 2, device).unwrap();
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();
        assert_eq!(second.offset, 256);

        let err = pool.allocate().unwrap_err();
        assert_eq!(err.capacity, 2);
        assert_eq!(pool.allocated_count(), 2);

        pool.reset();
        assert_eq!(pool.allocate().unwrap(), first);
    }

    #[test]
    fn manager_resets_every_pool() {
        let device = Arc::new(HeadlessDevice::new());
        let mut manager = ConstantBufferManager::new(4, device).unwrap();
        manager.pool(ConstantBufferType::Default).allocate().unwrap();
        manager.pool(ConstantBufferType::Sprite).allocate().unwrap();
        manager.reset();
        assert_eq!(manager.pool(ConstantBufferType::Default).allocated_count(), 0);
        assert_eq!(manager.pool(ConstantBufferType::Sprite).allocated_count(), 0);
    }
}
