//! Device seam of the renderer.
//!
//! Responsibilities:
//! - Name every GPU object with a typed, generation-checked key
//! - Record work in explicit-API terms: resource states, barriers, copies, descriptor tables, draws
//! - Expose fences as monotonically increasing counters the CPU can block on
//!
//! The frame orchestrator only talks to `dyn RenderDevice`, so it runs unchanged on the Vulkan
//! backend and on the headless simulator the tests use.

pub mod headless;
pub mod vulkan;
mod types;

pub use types::*;

use color_eyre::Result;

pub trait RenderDevice: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId>;
    fn destroy_buffer(&self, buffer: BufferId) -> Result<()>;
    /// Maps an upload-heap buffer, lets `write` fill it, then unmaps it.
    fn map_buffer(&self, buffer: BufferId, write: &mut dyn FnMut(&mut [u8])) -> Result<()>;

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId>;
    fn destroy_texture(&self, texture: TextureId) -> Result<()>;
    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc>;
    fn copyable_footprint(&self, desc: &TextureDesc) -> Footprint {
        Footprint::for_texture(desc)
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapId>;
    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId) -> Result<()>;
    fn descriptor_increment_size(&self) -> u32 {
        DESCRIPTOR_INCREMENT_SIZE
    }
    fn cpu_heap_start(&self, heap: DescriptorHeapId) -> Result<CpuDescriptorHandle>;
    fn gpu_heap_start(&self, heap: DescriptorHeapId) -> Result<GpuDescriptorHandle>;
    fn create_view(&self, view: &ViewDesc, dest: CpuDescriptorHandle) -> Result<()>;
    fn copy_descriptors(&self, count: u32, dest: CpuDescriptorHandle, src: CpuDescriptorHandle) -> Result<()>;

    fn create_command_allocator(&self) -> Result<CommandAllocatorId>;
    fn destroy_command_allocator(&self, allocator: CommandAllocatorId) -> Result<()>;
    /// Reclaims the memory of every list recorded from `allocator`. The GPU must be done with them.
    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> Result<()>;
    /// Lists are created closed.
    fn create_command_list(&self, allocator: CommandAllocatorId) -> Result<CommandListId>;
    fn destroy_command_list(&self, list: CommandListId) -> Result<()>;
    fn reset_command_list(&self, list: CommandListId, allocator: CommandAllocatorId) -> Result<()>;
    fn record(&self, list: CommandListId, command: Command) -> Result<()>;
    fn close_command_list(&self, list: CommandListId) -> Result<()>;

    /// Direct queues only: every queue accepts copy, barrier and draw work.
    fn create_queue(&self) -> Result<QueueId>;
    fn destroy_queue(&self, queue: QueueId) -> Result<()>;
    fn execute_command_lists(&self, queue: QueueId, lists: &[CommandListId]) -> Result<()>;

    fn create_fence(&self, initial_value: u64) -> Result<FenceId>;
    fn destroy_fence(&self, fence: FenceId) -> Result<()>;
    /// Queues a GPU-side write of `value` into `fence` behind all work already submitted to `queue`.
    fn signal(&self, queue: QueueId, fence: FenceId, value: u64) -> Result<()>;
    fn fence_completed_value(&self, fence: FenceId) -> Result<u64>;
    /// Blocks the calling thread until `fence` reaches `value`. No timeout.
    fn wait_for_fence(&self, fence: FenceId, value: u64) -> Result<()>;

    fn create_swapchain(&self, queue: QueueId, desc: &SwapchainDesc) -> Result<SwapchainId>;
    fn destroy_swapchain(&self, swapchain: SwapchainId) -> Result<()>;
    fn swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<TextureId>;
    fn current_back_buffer_index(&self, swapchain: SwapchainId) -> Result<u32>;
    fn present(&self, swapchain: SwapchainId, sync_interval: u32, allow_tearing: bool) -> Result<()>;
    /// Recreates the back buffers. Every texture previously returned by `swapchain_buffer` is invalidated.
    fn resize_swapchain(&self, swapchain: SwapchainId, width: u32, height: u32) -> Result<()>;

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId>;
    fn destroy_pipeline(&self, pipeline: PipelineId) -> Result<()>;

    /// Objects created through this device and not destroyed yet.
    fn live_object_count(&self) -> usize;
}

pub const DESCRIPTOR_INCREMENT_SIZE: u32 = 32;

/// Hands out descriptor address ranges to heaps: heap `n` starts at `(n + 1) << 32`, so a
/// handle can be traced back to its heap and slot without any lookup table on the caller side.
#[derive(Debug, Default)]
pub(crate) struct DescriptorAddressSpace {
    next_serial: u32,
}

impl DescriptorAddressSpace {
    const HEAP_SHIFT: u32 = 32;

    pub fn reserve(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        (serial as u64 + 1) << Self::HEAP_SHIFT
    }

    /// Splits a handle into its heap base and slot index.
    pub fn locate(ptr: u64) -> (u64, u32) {
        let base = (ptr >> Self::HEAP_SHIFT) << Self::HEAP_SHIFT;
        let index = ((ptr - base) / DESCRIPTOR_INCREMENT_SIZE as u64) as u32;
        (base, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_space_round_trips_slots() {
        let mut space = DescriptorAddressSpace::default();
        let first = space.reserve();
        let second = space.reserve();
        assert_ne!(first, second);

        let handle = CpuDescriptorHandle(second).offset(7, DESCRIPTOR_INCREMENT_SIZE);
        assert_eq!(DescriptorAddressSpace::locate(handle.0), (second, 7));
    }
}
