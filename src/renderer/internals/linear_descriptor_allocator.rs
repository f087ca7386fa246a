use std::sync::Arc;
use color_eyre::Result;
use crate::renderer::core::{
    CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapId, GpuDescriptorHandle, RenderDevice,
};
use crate::renderer::error::PoolExhausted;

/// A contiguous run of descriptors in the frame's shader-visible heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub cpu: CpuDescriptorHandle,
    pub gpu: GpuDescriptorHandle,
    pub count: u32,
}

/// Bump allocator over one frame context's shader-visible descriptor heap.
///
/// `reset` must only run after the fence value of the frame that last used this heap completed.
pub struct LinearDescriptorAllocator {
    heap: DescriptorHeapId,
    cpu_start: CpuDescriptorHandle,
    gpu_start: GpuDescriptorHandle,
    stride: u32,
    capacity: u32,
    allocated: u32,

    device: Arc<dyn RenderDevice>,
}

impl LinearDescriptorAllocator {
    pub fn new(capacity: u32, device: Arc<dyn RenderDevice>) -> Result<Self> {
        let heap = device.create_descriptor_heap(&DescriptorHeapDesc {
            capacity,
            shader_visible: true,
        })?;
        let cpu_start = device.cpu_heap_start(heap)?;
        let gpu_start = device.gpu_heap_start(heap)?;
        let stride = device.descriptor_increment_size();

        Ok(Self {
            heap,
            cpu_start,
            gpu_start,
            stride,
            capacity,
            allocated: 0,
            device,
        })
    }

    /// Fails exactly when `allocate(count)` would.
    pub fn check_available(&self, count: u32) -> Result<(), PoolExhausted> {
        if count > self.capacity - self.allocated {
            return Err(PoolExhausted {
                pool: "descriptor table heap",
                requested: count,
                available: self.capacity - self.allocated,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn allocate(&mut self, count: u32) -> Result<DescriptorTable, PoolExhausted> {
        self.check_available(count)?;
        let table = DescriptorTable {
            cpu: self.cpu_start.offset(self.allocated, self.stride),
            gpu: self.gpu_start.offset(self.allocated, self.stride),
            count,
        };
        self.allocated += count;
        Ok(table)
    }

    pub fn reset(&mut self) {
        self.allocated = 0;
    }

    pub fn heap(&self) -> DescriptorHeapId {
        self.heap
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocated
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Drop for LinearDescriptorAllocator {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_descriptor_heap(self.heap) {
            log::error!("Failed to destroy descriptor table heap: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::core::headless::HeadlessDevice;

    fn allocator(capacity: u32) -> LinearDescriptorAllocator {
        LinearDescriptorAllocator::new(capacity, Arc::new(HeadlessDevice::new())).unwrap()
    }

    #[test]
    fn reset_restarts_at_the_first_offset() {
        let mut allocator = allocator(32);
        let first = allocator.allocate(3).unwrap();
        allocator.allocate(9).unwrap();
        allocator.allocate(1).unwrap();
        allocator.reset();
        assert_eq!(allocator.allocate(5).unwrap().cpu, first.cpu);
        assert_eq!(allocator.allocated_count(), 5);
    }

    #[test]
    fn tables_are_contiguous() {
        let mut allocator = allocator(32);
        let a = allocator.allocate(3).unwrap();
        let b = allocator.allocate(2).unwrap();
        assert_eq!(b.cpu, a.cpu.offset(3, allocator.stride()));
        assert_eq!(b.gpu, a.gpu.offset(3, allocator.stride()));
    }

    #[test]
    fn overflowing_request_fails_without_side_effects() {
        let mut allocator = allocator(10);
        allocator.allocate(8).unwrap();
        let err = allocator.allocate(3).unwrap_err();
        assert_eq!(err.requested, 3);
        assert_eq!(err.available, 2);
        assert_eq!(allocator.allocated_count(), 8);
        assert!(allocator.allocate(2).is_ok());
        assert!(allocator.allocate(1).is_err());
    }
}
