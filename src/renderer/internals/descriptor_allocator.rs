use std::sync::Arc;
use color_eyre::Result;
use crate::renderer::core::{CpuDescriptorHandle, DescriptorHeapDesc, DescriptorHeapId, RenderDevice};
use crate::renderer::error::RenderError;
use crate::renderer::internals::index_allocator::IndexAllocator;

/// Long-lived descriptors (texture views) in a CPU-only heap. Draws copy them into the
/// frame's shader-visible table heap.
pub struct DescriptorAllocator {
    heap: DescriptorHeapId,
    start: CpuDescriptorHandle,
    stride: u32,
    indices: IndexAllocator,

    device: Arc<dyn RenderDevice>,
}

impl DescriptorAllocator {
    pub fn new(capacity: u32, device: Arc<dyn RenderDevice>) -> Result<Self> {
        let heap = device.create_descriptor_heap(&DescriptorHeapDesc {
            capacity,
            shader_visible: false,
        })?;
        let start = device.cpu_heap_start(heap)?;
        let stride = device.descriptor_increment_size();

        Ok(Self {
            heap,
            start,
            stride,
            indices: IndexAllocator::new(capacity),
            device,
        })
    }

    /// `None` when the heap is full.
    pub fn allocate(&mut self) -> Option<CpuDescriptorHandle> {
        let index = self.indices.alloc()?;
        Some(self.start.offset(index, self.stride))
    }

    pub fn free(&mut self, handle: CpuDescriptorHandle) -> Result<(), RenderError> {
        if handle.0 < self.start.0 {
            return Err(RenderError::DescriptorOutOfHeap { handle: handle.0, start: self.start.0 });
        }
        let offset = handle.0 - self.start.0;
        if offset % self.stride as u64 != 0 {
            return Err(RenderError::MisalignedDescriptor { handle: handle.0, start: self.start.0, stride: self.stride });
        }
        let index = offset / self.stride as u64;
        if index >= self.indices.capacity() as u64 {
            return Err(RenderError::DescriptorOutOfHeap { handle: handle.0, start: self.start.0 });
        }
        self.indices.free(index as u32)
    }

    pub fn capacity(&self) -> u32 {
        self.indices.capacity()
    }

    pub fn allocated_count(&self) -> u32 {
        self.indices.allocated_count()
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        let live = self.indices.allocated_count();
        if live != 0 {
            log::error!("{} persistent descriptors were never freed", live);
        }
        if let Err(e) = self.device.destroy_descriptor_heap(self.heap) {
            log::error!("Failed to destroy persistent descriptor heap: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::core::headless::HeadlessDevice;

    #[test]
    fn handles_map_back_to_their_slots() {
        let device = Arc::new(HeadlessDevice::new());
        let mut allocator = DescriptorAllocator::new(8, device.clone()).unwrap();

        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_eq!(b.0 - a.0, device.descriptor_increment_size() as u64);

        allocator.free(a).unwrap();
        assert_eq!(allocator.allocate(), Some(a));
        allocator.free(a).unwrap();
        allocator.free(b).unwrap();
        assert_eq!(allocator.allocated_count(), 0);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let mut allocator = DescriptorAllocator::new(4, device).unwrap();
        let _a = allocator.allocate().unwrap();
        assert!(matches!(
            allocator.free(CpuDescriptorHandle(1)),
            Err(RenderError::DescriptorOutOfHeap { .. })
        ));
    }

    #[test]
    fn handles_between_slots_are_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let mut allocator = DescriptorAllocator::new(4, device).unwrap();
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();

        let inside = CpuDescriptorHandle(b.0 + 1);
        assert!(matches!(
            allocator.free(inside),
            Err(RenderError::MisalignedDescriptor { .. })
        ));
        // Neither neighbour was touched.
        assert_eq!(allocator.allocated_count(), 2);
        allocator.free(b).unwrap();
        allocator.free(a).unwrap();
    }

    #[test]
    fn exhausted_heap_returns_none() {
        let device = Arc::new(HeadlessDevice::new());
        let mut allocator = DescriptorAllocator::new(2, device).unwrap();
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_eq!(allocator.allocate(), None);
        allocator.free(a).unwrap();
        allocator.free(b).unwrap();
    }
}
