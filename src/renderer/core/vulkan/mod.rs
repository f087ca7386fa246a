//! Vulkan backend of the device seam.
//!
//! Responsibilities:
//! - Translate each recorded `Command` straight into a Vulkan command buffer
//! - Map descriptor heaps onto one bindless descriptor set layout shared by every pipeline,
//!   root tables becoming push-constant slot indices into it
//! - Back fences with timeline semaphores
//! - Hide acquire/present semaphores behind the swap chain's back buffer index

mod command;
mod convert;
mod device;
mod instance;
mod pipeline;
mod swapchain;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use slotmap::SlotMap;
use winit::window::Window;
use command::PassState;
use instance::VulkanInstance;
use swapchain::Swapchain;
use super::{
    BufferDesc, BufferId, BufferUsage, Command, CommandAllocatorId, CommandListId, CpuDescriptorHandle,
    DescriptorAddressSpace, DescriptorHeapDesc, DescriptorHeapId, FenceId, Format, GpuDescriptorHandle,
    HeapKind, PipelineDesc, PipelineId, QueueId, RenderDevice, ResourceState, SwapchainDesc, SwapchainId,
    TextureDesc, TextureId, TextureUsage, ViewDesc, DESCRIPTOR_INCREMENT_SIZE,
};

/// The renderer creates one queue; a second hardware queue is only used if more are requested.
const MAX_QUEUES: u32 = 2;

struct VulkanBuffer {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    desc: BufferDesc,
}

struct VulkanTexture {
    image: vk::Image,
    view: vk::ImageView,
    // Swap chain images are owned by the swap chain and have no allocation.
    allocation: Option<Allocation>,
    desc: TextureDesc,
    // Still in UNDEFINED layout until the first command touches it.
    initialized: bool,
}

struct VulkanHeap {
    desc: DescriptorHeapDesc,
    base: u64,
    views: Vec<Option<ViewDesc>>,
    set: Option<(vk::DescriptorPool, vk::DescriptorSet)>,
}

struct VulkanAllocator {
    pool: vk::CommandPool,
}

struct VulkanCommandList {
    cmd: vk::CommandBuffer,
    allocator: CommandAllocatorId,
    open: bool,
    pass: PassState,
}

struct VulkanSwapchain {
    inner: Swapchain,
    desc: SwapchainDesc,
    queue: QueueId,
    buffers: Vec<TextureId>,
    current: u32,
    // Signaled when `current` may be written; waited by the next submission on `queue`.
    pending_acquire: Option<vk::Semaphore>,
}

struct VulkanState {
    allocator: Option<Allocator>,
    buffers: SlotMap<BufferId, VulkanBuffer>,
    textures: SlotMap<TextureId, VulkanTexture>,
    heaps: SlotMap<DescriptorHeapId, VulkanHeap>,
    heap_by_base: HashMap<u64, DescriptorHeapId>,
    address_space: DescriptorAddressSpace,
    allocators: SlotMap<CommandAllocatorId, VulkanAllocator>,
    lists: SlotMap<CommandListId, VulkanCommandList>,
    queues: SlotMap<QueueId, vk::Queue>,
    fences: SlotMap<FenceId, vk::Semaphore>,
    swapchains: SlotMap<SwapchainId, VulkanSwapchain>,
    pipelines: SlotMap<PipelineId, vk::Pipeline>,
}

impl VulkanState {
    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator.as_mut().ok_or_eyre("GPU allocator was already released")
    }

    fn heap_slot(&self, ptr: u64) -> Result<(DescriptorHeapId, u32)> {
        let (base, index) = DescriptorAddressSpace::locate(ptr);
        let heap_id = *self
            .heap_by_base
            .get(&base)
            .ok_or_else(|| eyre!("Descriptor handle {:#x} does not point into a live heap", ptr))?;
        if index >= self.heaps[heap_id].desc.capacity {
            return Err(eyre!("Descriptor handle {:#x} is past the end of its heap", ptr));
        }
        Ok((heap_id, index))
    }

    /// Stores `view` in the heap's shadow copy and, for shader-visible heaps, in the descriptor set.
    fn write_descriptor(&mut self, device: &ash::Device, heap_id: DescriptorHeapId, index: u32, view: ViewDesc) -> Result<()> {
        let heap = &mut self.heaps[heap_id];
        heap.views[index as usize] = Some(view);
        let Some((_, set)) = heap.set else {
            return Ok(());
        };

        match view {
            ViewDesc::ConstantBuffer { buffer, offset, size } => {
                let buffer = self.buffers.get(buffer).ok_or_eyre("Constant buffer view of unknown buffer")?;
                let buffer_info = [vk::DescriptorBufferInfo {
                    buffer: buffer.buffer,
                    offset,
                    range: size as u64,
                }];
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(pipeline::CONSTANT_BUFFER_BINDING)
                    .dst_array_element(index)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&buffer_info);
                unsafe { device.update_descriptor_sets(&[write], &[]) };
            }
            ViewDesc::Texture { texture } => {
                let texture = self.textures.get(texture).ok_or_eyre("Shader resource view of unknown texture")?;
                let image_info = [vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: texture.view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }];
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(pipeline::TEXTURE_BINDING)
                    .dst_array_element(index)
                    .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                    .image_info(&image_info);
                unsafe { device.update_descriptor_sets(&[write], &[]) };
            }
        }
        Ok(())
    }

    fn register_swapchain_images(&mut self, inner: &Swapchain, desc: &SwapchainDesc) -> Vec<TextureId> {
        inner
            .images
            .iter()
            .zip(&inner.image_views)
            .enumerate()
            .map(|(index, (&image, &view))| {
                self.textures.insert(VulkanTexture {
                    image,
                    view,
                    allocation: None,
                    desc: TextureDesc {
                        width: inner.extent.width,
                        height: inner.extent.height,
                        format: desc.format,
                        usage: TextureUsage::RenderTarget,
                        initial_state: ResourceState::Present,
                        name: format!("Back buffer {}", index),
                    },
                    initialized: false,
                })
            })
            .collect()
    }

    fn destroy_texture(&mut self, device: &ash::Device, texture: VulkanTexture) -> Result<()> {
        unsafe {
            device.destroy_image_view(texture.view, None);
            device.destroy_image(texture.image, None);
        }
        if let Some(allocation) = texture.allocation {
            self.allocator()?.free(allocation)?;
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, device: &ash::Device, buffer: VulkanBuffer) -> Result<()> {
        unsafe { device.destroy_buffer(buffer.buffer, None) };
        if let Some(allocation) = buffer.allocation {
            self.allocator()?.free(allocation)?;
        }
        Ok(())
    }
}

pub struct VulkanDevice {
    state: Mutex<VulkanState>,

    device: ash::Device,
    swapchain_loader: ash::khr::swapchain::Device,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    hardware_queues: Vec<vk::Queue>,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    sampler: vk::Sampler,
    descriptor_limit: u32,

    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    instance: VulkanInstance,
    window: Arc<Window>,
}

impl VulkanDevice {
    pub fn new(window: Arc<Window>, enable_validation: bool) -> Result<Self> {
        let instance = VulkanInstance::new(&window, enable_validation)?;
        let (surface, surface_loader) = instance.create_surface(&window)?;
        let selected = device::select_physical_device(&instance.instance, surface, &surface_loader)?;
        log::info!(
            "Using GPU '{}'",
            selected.properties.device_name_as_c_str().map(|name| name.to_string_lossy()).unwrap_or_default()
        );

        let (device, hardware_queues) = device::create_logical_device(&instance.instance, &selected, MAX_QUEUES)?;
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance.instance, &device);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device: selected.physical,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let descriptor_limit = device::shader_visible_descriptor_limit(&instance.instance, selected.physical)?;
        let sampler = pipeline::create_sampler(&device)?;
        let set_layout = pipeline::create_set_layout(&device, descriptor_limit, &sampler)?;
        let pipeline_layout = pipeline::create_pipeline_layout(&device, set_layout)?;

        Ok(Self {
            state: Mutex::new(VulkanState {
                allocator: Some(allocator),
                buffers: SlotMap::with_key(),
                textures: SlotMap::with_key(),
                heaps: SlotMap::with_key(),
                heap_by_base: HashMap::new(),
                address_space: DescriptorAddressSpace::default(),
                allocators: SlotMap::with_key(),
                lists: SlotMap::with_key(),
                queues: SlotMap::with_key(),
                fences: SlotMap::with_key(),
                swapchains: SlotMap::with_key(),
                pipelines: SlotMap::with_key(),
            }),
            device,
            swapchain_loader,
            physical_device: selected.physical,
            queue_family: selected.queue_family,
            hardware_queues,
            set_layout,
            pipeline_layout,
            sampler,
            descriptor_limit,
            surface,
            surface_loader,
            instance,
            window,
        })
    }

    /// Back buffer format to ask the swap chain for: BGRA when the surface offers it.
    pub fn surface_format(&self) -> Result<Format> {
        let formats = unsafe {
            self.surface_loader.get_physical_device_surface_formats(self.physical_device, self.surface)?
        };
        [Format::Bgra8Unorm, Format::Rgba8Unorm]
            .into_iter()
            .find(|&format| {
                formats.iter().any(|surface_format| {
                    surface_format.format == convert::format(format)
                        && surface_format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
            })
            .ok_or_eyre("Surface offers neither BGRA8 nor RGBA8 back buffers")
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    fn state(&self) -> Result<MutexGuard<'_, VulkanState>> {
        self.state.lock().map_err(|e| eyre!(e.to_string()))
    }

    /// Lets the queue consume a pending acquire semaphore nobody rendered to, so the swap chain
    /// can be torn down.
    fn drain_acquire(&self, queue: vk::Queue, pending_acquire: Option<vk::Semaphore>) -> Result<()> {
        if let Some(semaphore) = pending_acquire {
            let wait_infos = [vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
            let submit = vk::SubmitInfo2::default().wait_semaphore_infos(&wait_infos);
            unsafe { self.device.queue_submit2(queue, &[submit], vk::Fence::null())? };
        }
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    /// Replaces the swap chain of `id` with one built from `desc` and acquires its first image.
    fn recreate_swapchain(&self, state: &mut VulkanState, id: SwapchainId, desc: SwapchainDesc) -> Result<()> {
        let sc = state.swapchains.get_mut(id).ok_or_eyre("Unknown swap chain")?;
        let queue = *state.queues.get(sc.queue).ok_or_eyre("Swap chain queue was destroyed")?;
        let pending_acquire = sc.pending_acquire.take();
        self.drain_acquire(queue, pending_acquire)?;

        let old_handle = state.swapchains[id].inner.swapchain;
        let mut inner = Swapchain::new(
            self.surface,
            &self.surface_loader,
            &self.swapchain_loader,
            self.physical_device,
            &self.device,
            &desc,
            old_handle,
        )?;
        let (current, acquire) = inner.acquire(&self.swapchain_loader)?;

        let old_buffers = std::mem::take(&mut state.swapchains[id].buffers);
        for buffer in old_buffers {
            state.textures.remove(buffer);
        }
        let buffers = state.register_swapchain_images(&inner, &desc);

        let sc = &mut state.swapchains[id];
        let mut old = std::mem::replace(&mut sc.inner, inner);
        old.destroy_views(&self.device);
        unsafe { self.swapchain_loader.destroy_swapchain(old.swapchain, None) };

        sc.desc = desc;
        sc.buffers = buffers;
        sc.current = current;
        sc.pending_acquire = Some(acquire);
        Ok(())
    }
}

impl RenderDevice for VulkanDevice {
    fn backend_name(&self) -> &'static str {
        "Vulkan"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId> {
        let mut state = self.state()?;
        let usage = match desc.usage {
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            BufferUsage::Constant => vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        };
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = match desc.heap {
            HeapKind::Upload => MemoryLocation::CpuToGpu,
            HeapKind::Default => MemoryLocation::GpuOnly,
        };
        let allocation = state.allocator()?.allocate(&AllocationCreateDesc {
            name: &desc.name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())? };

        Ok(state.buffers.insert(VulkanBuffer {
            buffer,
            allocation: Some(allocation),
            desc: desc.clone(),
        }))
    }

    fn destroy_buffer(&self, buffer: BufferId) -> Result<()> {
        let mut state = self.state()?;
        let buffer = state.buffers.remove(buffer).ok_or_eyre("Destroying unknown buffer")?;
        state.destroy_buffer(&self.device, buffer)
    }

    fn map_buffer(&self, buffer: BufferId, write: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut state = self.state()?;
        let buffer = state.buffers.get_mut(buffer).ok_or_eyre("Mapping unknown buffer")?;
        if buffer.desc.heap != HeapKind::Upload {
            return Err(eyre!("Buffer '{}' is not CPU-visible", buffer.desc.name));
        }
        let size = buffer.desc.size as usize;
        let mapped = buffer
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| eyre!("Buffer '{}' is not persistently mapped", buffer.desc.name))?;
        write(&mut mapped[..size]);
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(eyre!("Texture '{}' has zero size", desc.name));
        }
        let mut state = self.state()?;
        let format = convert::format(desc.format);
        let usage = match desc.usage {
            TextureUsage::Sampled => vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            TextureUsage::RenderTarget => vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            TextureUsage::DepthStencil => vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        };
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D { width: desc.width, height: desc.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = state.allocator()?.allocate(&AllocationCreateDesc {
            name: &desc.name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe { self.device.bind_image_memory(image, allocation.memory(), allocation.offset())? };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(convert::subresource_range(convert::aspect(desc.format)));
        let view = unsafe { self.device.create_image_view(&view_info, None)? };

        Ok(state.textures.insert(VulkanTexture {
            image,
            view,
            allocation: Some(allocation),
            desc: desc.clone(),
            initialized: false,
        }))
    }

    fn destroy_texture(&self, texture: TextureId) -> Result<()> {
        let mut state = self.state()?;
        let owned_by_swapchain = state.textures.get(texture).ok_or_eyre("Destroying unknown texture")?.allocation.is_none();
        if owned_by_swapchain {
            return Err(eyre!("Back buffers are destroyed with their swap chain"));
        }
        let texture = state.textures.remove(texture).ok_or_eyre("Destroying unknown texture")?;
        state.destroy_texture(&self.device, texture)
    }

    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc> {
        let state = self.state()?;
        Ok(state.textures.get(texture).ok_or_eyre("Unknown texture")?.desc.clone())
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapId> {
        let mut state = self.state()?;
        let set = if desc.shader_visible {
            if desc.capacity > self.descriptor_limit {
                return Err(eyre!(
                    "Shader-visible heap of {} descriptors exceeds the device limit of {}",
                    desc.capacity,
                    self.descriptor_limit
                ));
            }
            let pool_sizes = [
                vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: self.descriptor_limit },
                vk::DescriptorPoolSize { ty: vk::DescriptorType::SAMPLED_IMAGE, descriptor_count: self.descriptor_limit },
                vk::DescriptorPoolSize { ty: vk::DescriptorType::SAMPLER, descriptor_count: 1 },
            ];
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
                .max_sets(1)
                .pool_sizes(&pool_sizes);
            let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None)? };
            let set_layouts = [self.set_layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&set_layouts);
            let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
            let set = sets.first().copied().ok_or_eyre("Descriptor set allocation returned nothing")?;
            Some((pool, set))
        } else {
            None
        };

        let base = state.address_space.reserve();
        let heap = state.heaps.insert(VulkanHeap {
            desc: *desc,
            base,
            views: vec![None; desc.capacity as usize],
            set,
        });
        state.heap_by_base.insert(base, heap);
        Ok(heap)
    }

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId) -> Result<()> {
        let mut state = self.state()?;
        let removed = state.heaps.remove(heap).ok_or_eyre("Destroying unknown descriptor heap")?;
        state.heap_by_base.remove(&removed.base);
        if let Some((pool, _)) = removed.set {
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
        Ok(())
    }

    fn cpu_heap_start(&self, heap: DescriptorHeapId) -> Result<CpuDescriptorHandle> {
        let state = self.state()?;
        Ok(CpuDescriptorHandle(state.heaps.get(heap).ok_or_eyre("Unknown descriptor heap")?.base))
    }

    fn gpu_heap_start(&self, heap: DescriptorHeapId) -> Result<GpuDescriptorHandle> {
        let state = self.state()?;
        let heap = state.heaps.get(heap).ok_or_eyre("Unknown descriptor heap")?;
        if !heap.desc.shader_visible {
            return Err(eyre!("CPU-only descriptor heaps have no GPU address"));
        }
        Ok(GpuDescriptorHandle(heap.base))
    }

    fn create_view(&self, view: &ViewDesc, dest: CpuDescriptorHandle) -> Result<()> {
        let mut state = self.state()?;
        match *view {
            ViewDesc::ConstantBuffer { buffer, offset, size } => {
                let buffer = state.buffers.get(buffer).ok_or_eyre("Constant buffer view of unknown buffer")?;
                if offset + size as u64 > buffer.desc.size {
                    return Err(eyre!("Constant buffer view exceeds '{}'", buffer.desc.name));
                }
            }
            ViewDesc::Texture { texture } => {
                state.textures.get(texture).ok_or_eyre("Shader resource view of unknown texture")?;
            }
        }
        let (heap, index) = state.heap_slot(dest.0)?;
        state.write_descriptor(&self.device, heap, index, *view)
    }

    fn copy_descriptors(&self, count: u32, dest: CpuDescriptorHandle, src: CpuDescriptorHandle) -> Result<()> {
        let mut state = self.state()?;
        for i in 0..count {
            let (src_heap, src_index) = state.heap_slot(src.offset(i, DESCRIPTOR_INCREMENT_SIZE).0)?;
            let (dst_heap, dst_index) = state.heap_slot(dest.offset(i, DESCRIPTOR_INCREMENT_SIZE).0)?;
            let view = state.heaps[src_heap].views[src_index as usize]
                .ok_or_else(|| eyre!("Copying empty descriptor slot {}", src_index))?;
            state.write_descriptor(&self.device, dst_heap, dst_index, view)?;
        }
        Ok(())
    }

    fn create_command_allocator(&self) -> Result<CommandAllocatorId> {
        let mut state = self.state()?;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_family);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None)? };
        Ok(state.allocators.insert(VulkanAllocator { pool }))
    }

    fn destroy_command_allocator(&self, allocator: CommandAllocatorId) -> Result<()> {
        let mut state = self.state()?;
        if state.lists.values().any(|list| list.allocator == allocator) {
            return Err(eyre!("Command allocator destroyed while lists still use it"));
        }
        let removed = state.allocators.remove(allocator).ok_or_eyre("Destroying unknown command allocator")?;
        unsafe { self.device.destroy_command_pool(removed.pool, None) };
        Ok(())
    }

    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> Result<()> {
        let state = self.state()?;
        let pool = state.allocators.get(allocator).ok_or_eyre("Resetting unknown command allocator")?.pool;
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }

    fn create_command_list(&self, allocator: CommandAllocatorId) -> Result<CommandListId> {
        let mut state = self.state()?;
        let pool = state.allocators.get(allocator).ok_or_eyre("Unknown command allocator")?.pool;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or_eyre("Command buffer allocation returned nothing")?;
        Ok(state.lists.insert(VulkanCommandList {
            cmd,
            allocator,
            open: false,
            pass: PassState::default(),
        }))
    }

    fn destroy_command_list(&self, list: CommandListId) -> Result<()> {
        let mut state = self.state()?;
        let removed = state.lists.remove(list).ok_or_eyre("Destroying unknown command list")?;
        if let Some(allocator) = state.allocators.get(removed.allocator) {
            unsafe { self.device.free_command_buffers(allocator.pool, &[removed.cmd]) };
        }
        Ok(())
    }

    /// Command buffers belong to the pool they were allocated from, so switching allocators
    /// reallocates the buffer out of the new pool.
    fn reset_command_list(&self, list: CommandListId, allocator: CommandAllocatorId) -> Result<()> {
        let mut state = self.state()?;
        let pool = state.allocators.get(allocator).ok_or_eyre("Unknown command allocator")?.pool;
        let current = state.lists.get(list).ok_or_eyre("Resetting unknown command list")?;
        if current.open {
            return Err(eyre!("Command list reset while still recording"));
        }

        if current.allocator != allocator {
            if let Some(old) = state.allocators.get(current.allocator) {
                unsafe { self.device.free_command_buffers(old.pool, &[current.cmd]) };
            }
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info)? }
                .into_iter()
                .next()
                .ok_or_eyre("Command buffer allocation returned nothing")?;
            let entry = &mut state.lists[list];
            entry.cmd = cmd;
            entry.allocator = allocator;
        }

        let entry = &mut state.lists[list];
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device.reset_command_buffer(entry.cmd, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(entry.cmd, &begin_info)?;
        }
        entry.pass.reset();
        entry.open = true;
        Ok(())
    }

    fn record(&self, list: CommandListId, command: Command) -> Result<()> {
        self.state()?.record(&self.device, self.pipeline_layout, list, command)
    }

    fn close_command_list(&self, list: CommandListId) -> Result<()> {
        self.state()?.close(&self.device, list)
    }

    fn create_queue(&self) -> Result<QueueId> {
        let mut state = self.state()?;
        let index = state.queues.len() % self.hardware_queues.len();
        Ok(state.queues.insert(self.hardware_queues[index]))
    }

    fn destroy_queue(&self, queue: QueueId) -> Result<()> {
        let mut state = self.state()?;
        let queue = state.queues.remove(queue).ok_or_eyre("Destroying unknown queue")?;
        unsafe { self.device.queue_wait_idle(queue)? };
        Ok(())
    }

    fn execute_command_lists(&self, queue: QueueId, lists: &[CommandListId]) -> Result<()> {
        let mut state = self.state()?;
        let vk_queue = *state.queues.get(queue).ok_or_eyre("Submitting to unknown queue")?;

        let mut command_buffers = Vec::with_capacity(lists.len());
        for &list in lists {
            let entry = state.lists.get(list).ok_or_eyre("Submitting unknown command list")?;
            if entry.open {
                return Err(eyre!("Submitting a command list that was not closed"));
            }
            command_buffers.push(vk::CommandBufferSubmitInfo::default().command_buffer(entry.cmd));
        }

        // The first submission after an acquire must not write the image before it is released.
        let wait_infos = state
            .swapchains
            .values_mut()
            .filter(|sc| sc.queue == queue)
            .filter_map(|sc| sc.pending_acquire.take())
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags2::ALL_TRANSFER)
            })
            .collect::<Vec<_>>();

        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&command_buffers);
        unsafe { self.device.queue_submit2(vk_queue, &[submit], vk::Fence::null())? };
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> Result<FenceId> {
        let mut state = self.state()?;
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { self.device.create_semaphore(&semaphore_info, None)? };
        Ok(state.fences.insert(semaphore))
    }

    fn destroy_fence(&self, fence: FenceId) -> Result<()> {
        let semaphore = self.state()?.fences.remove(fence).ok_or_eyre("Destroying unknown fence")?;
        unsafe { self.device.destroy_semaphore(semaphore, None) };
        Ok(())
    }

    fn signal(&self, queue: QueueId, fence: FenceId, value: u64) -> Result<()> {
        let state = self.state()?;
        let semaphore = *state.fences.get(fence).ok_or_eyre("Signaling unknown fence")?;
        let queue = *state.queues.get(queue).ok_or_eyre("Signaling on unknown queue")?;
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = vk::SubmitInfo2::default().signal_semaphore_infos(&signal_infos);
        unsafe { self.device.queue_submit2(queue, &[submit], vk::Fence::null())? };
        Ok(())
    }

    fn fence_completed_value(&self, fence: FenceId) -> Result<u64> {
        let semaphore = *self.state()?.fences.get(fence).ok_or_eyre("Unknown fence")?;
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore)? })
    }

    fn wait_for_fence(&self, fence: FenceId, value: u64) -> Result<()> {
        // Blocking happens without the state lock held.
        let semaphore = *self.state()?.fences.get(fence).ok_or_eyre("Waiting on unknown fence")?;
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, u64::MAX)? };
        Ok(())
    }

    fn create_swapchain(&self, queue: QueueId, desc: &SwapchainDesc) -> Result<SwapchainId> {
        let mut state = self.state()?;
        state.queues.get(queue).ok_or_eyre("Swap chain on unknown queue")?;
        let mut inner = Swapchain::new(
            self.surface,
            &self.surface_loader,
            &self.swapchain_loader,
            self.physical_device,
            &self.device,
            desc,
            vk::SwapchainKHR::null(),
        )?;
        let (current, acquire) = inner.acquire(&self.swapchain_loader)?;
        let buffers = state.register_swapchain_images(&inner, desc);
        Ok(state.swapchains.insert(VulkanSwapchain {
            inner,
            desc: *desc,
            queue,
            buffers,
            current,
            pending_acquire: Some(acquire),
        }))
    }

    fn destroy_swapchain(&self, swapchain: SwapchainId) -> Result<()> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let sc = state.swapchains.get_mut(swapchain).ok_or_eyre("Destroying unknown swap chain")?;
        let queue = *state.queues.get(sc.queue).ok_or_eyre("Swap chain queue was destroyed")?;
        let pending_acquire = sc.pending_acquire.take();
        self.drain_acquire(queue, pending_acquire)?;

        let mut sc = state.swapchains.remove(swapchain).ok_or_eyre("Destroying unknown swap chain")?;
        for buffer in &sc.buffers {
            state.textures.remove(*buffer);
        }
        sc.inner.destroy_views(&self.device);
        unsafe { self.swapchain_loader.destroy_swapchain(sc.inner.swapchain, None) };
        Ok(())
    }

    fn swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<TextureId> {
        let state = self.state()?;
        let sc = state.swapchains.get(swapchain).ok_or_eyre("Unknown swap chain")?;
        sc.buffers.get(index as usize).copied().ok_or_eyre("Back buffer index out of range")
    }

    fn current_back_buffer_index(&self, swapchain: SwapchainId) -> Result<u32> {
        let state = self.state()?;
        Ok(state.swapchains.get(swapchain).ok_or_eyre("Unknown swap chain")?.current)
    }

    /// The present mode is fixed when the swap chain is built, so `sync_interval` and
    /// `allow_tearing` only matter through `SwapchainDesc::allow_tearing`.
    fn present(&self, swapchain: SwapchainId, _sync_interval: u32, _allow_tearing: bool) -> Result<()> {
        let mut state = self.state()?;
        let sc = state.swapchains.get(swapchain).ok_or_eyre("Presenting unknown swap chain")?;
        let queue = *state.queues.get(sc.queue).ok_or_eyre("Swap chain queue was destroyed")?;
        let image_index = sc.current;
        let present_semaphore = sc.inner.present_semaphore(image_index);

        // Orders the present behind everything already submitted to the queue.
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(present_semaphore)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = vk::SubmitInfo2::default().signal_semaphore_infos(&signal_infos);
        unsafe { self.device.queue_submit2(queue, &[submit], vk::Fence::null())? };

        let wait_semaphores = [present_semaphore];
        let swapchains = [sc.inner.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let mut out_of_date = match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => {
                if suboptimal {
                    log::debug!("Presented to a suboptimal swap chain");
                }
                false
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(e) => return Err(e.into()),
        };

        if !out_of_date {
            let sc = &mut state.swapchains[swapchain];
            match sc.inner.acquire(&self.swapchain_loader) {
                Ok((current, acquire)) => {
                    sc.current = current;
                    sc.pending_acquire = Some(acquire);
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => out_of_date = true,
                Err(e) => return Err(e.into()),
            }
        }

        // Only the swap chain follows the window here. The renderer's viewport, scissor and
        // depth texture keep the old size until the window's `Resized` event reaches
        // `Renderer::update_window_size`, which rebuilds them and the swap chain once more.
        if out_of_date {
            log::warn!("Swap chain is out of date, recreating it");
            let desc = state.swapchains[swapchain].desc;
            let size = self.window.inner_size();
            let desc = SwapchainDesc { width: size.width.max(1), height: size.height.max(1), ..desc };
            self.recreate_swapchain(&mut state, swapchain, desc)?;
        }
        Ok(())
    }

    fn resize_swapchain(&self, swapchain: SwapchainId, width: u32, height: u32) -> Result<()> {
        let mut state = self.state()?;
        let desc = state.swapchains.get(swapchain).ok_or_eyre("Resizing unknown swap chain")?.desc;
        self.recreate_swapchain(&mut state, swapchain, SwapchainDesc { width, height, ..desc })
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId> {
        let root_slots = desc.root_tables.len();
        if root_slots > 2 {
            return Err(eyre!("Pipeline '{}' has {} root tables, at most 2 are supported", desc.name, root_slots));
        }
        let pipeline = pipeline::create_graphics_pipeline(&self.device, self.pipeline_layout, desc)?;
        Ok(self.state()?.pipelines.insert(pipeline))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) -> Result<()> {
        let pipeline = self.state()?.pipelines.remove(pipeline).ok_or_eyre("Destroying unknown pipeline")?;
        unsafe { self.device.destroy_pipeline(pipeline, None) };
        Ok(())
    }

    fn live_object_count(&self) -> usize {
        match self.state() {
            Ok(state) => {
                state.buffers.len()
                    + state.textures.len()
                    + state.heaps.len()
                    + state.allocators.len()
                    + state.lists.len()
                    + state.queues.len()
                    + state.fences.len()
                    + state.swapchains.len()
                    + state.pipelines.len()
            }
            Err(e) => {
                log::error!("Vulkan device state is poisoned: {}", e);
                0
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("Failed waiting for the device to go idle: {}", e);
            }
        }

        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let leaked = state.buffers.len() + state.heaps.len() + state.pipelines.len() + state.fences.len();
        if leaked > 0 {
            log::warn!("Vulkan device dropped with {} live objects, destroying them", leaked);
        }

        unsafe {
            for (_, mut sc) in state.swapchains.drain() {
                sc.inner.destroy_views(&self.device);
                self.swapchain_loader.destroy_swapchain(sc.inner.swapchain, None);
                for buffer in sc.buffers {
                    state.textures.remove(buffer);
                }
            }
            for (_, pipeline) in state.pipelines.drain() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, semaphore) in state.fences.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            for (_, heap) in state.heaps.drain() {
                if let Some((pool, _)) = heap.set {
                    self.device.destroy_descriptor_pool(pool, None);
                }
            }
            state.lists.clear();
            for (_, allocator) in state.allocators.drain() {
                self.device.destroy_command_pool(allocator.pool, None);
            }
        }
        let textures = state.textures.drain().map(|(_, texture)| texture).collect::<Vec<_>>();
        for texture in textures {
            if let Err(e) = state.destroy_texture(&self.device, texture) {
                log::error!("Failed to free texture memory: {}", e);
            }
        }
        let buffers = state.buffers.drain().map(|(_, buffer)| buffer).collect::<Vec<_>>();
        for buffer in buffers {
            if let Err(e) = state.destroy_buffer(&self.device, buffer) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
        // The allocator frees its memory blocks through the device, so it goes first.
        state.allocator = None;

        unsafe {
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.destroy_descriptor_set_layout(self.set_layout, None);
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
        // `instance` is destroyed by its own Drop after this.
    }
}
