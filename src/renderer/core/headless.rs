//! CPU simulation of a GPU timeline.
//!
//! Responsibilities:
//! - Keep buffers and textures as plain byte arrays and move bytes on copy commands
//! - Queue submitted work and only execute it when a fence wait needs it, so the GPU is always
//!   "behind" the CPU and reuse hazards become observable
//! - Validate what a debug layer would: barrier states, allocator resets while work is pending,
//!   descriptor tables overwritten before the GPU read them, deletes of in-flight resources
//! - Record instrumentation for tests: fence waits, copy counts, draws, presents

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use color_eyre::Result;
use color_eyre::eyre::{eyre, OptionExt};
use slotmap::SlotMap;
use super::{
    Barrier, BufferDesc, BufferId, Command, CommandAllocatorId, CommandListId, CpuDescriptorHandle,
    DescriptorAddressSpace, DescriptorHeapDesc, DescriptorHeapId, FenceId, Footprint, Format,
    GpuDescriptorHandle, HeapKind, IndexBufferView, PipelineDesc, PipelineId, QueueId, RenderDevice,
    ResourceId, ResourceState, SwapchainDesc, SwapchainId, TextureDesc, TextureId, TextureUsage,
    VertexBufferView, ViewDesc,
};

/// One call to `wait_for_fence`, as observed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceWait {
    pub fence: FenceId,
    pub value: u64,
    pub completed_before: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub executed_lists: usize,
    pub buffer_copies: usize,
    pub texture_copies: usize,
    pub draws: usize,
    pub presents: usize,
}

struct SimBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
    state: ResourceState,
}

struct SimTexture {
    desc: TextureDesc,
    data: Vec<u8>,
    state: ResourceState,
}

struct SimHeap {
    desc: DescriptorHeapDesc,
    base: u64,
    slots: Vec<Option<ViewDesc>>,
    // Bumped on every write so in-flight tables can detect being overwritten.
    versions: Vec<u64>,
}

struct SimAllocator {
    in_flight: usize,
}

struct SimCommandList {
    allocator: CommandAllocatorId,
    commands: Vec<Command>,
    open: bool,
}

/// Versions of the descriptors a draw reads, captured at submission.
struct TableSnapshot {
    heap: DescriptorHeapId,
    start: u32,
    versions: Vec<u64>,
}

enum QueueOp {
    Execute {
        allocator: CommandAllocatorId,
        commands: Vec<Command>,
        draw_tables: Vec<Vec<TableSnapshot>>,
    },
    Signal {
        fence: FenceId,
        value: u64,
    },
    Present {
        buffer: TextureId,
    },
}

#[derive(Default)]
struct SimQueue {
    pending: VecDeque<QueueOp>,
}

struct SimFence {
    completed: u64,
}

struct SimSwapchain {
    desc: SwapchainDesc,
    queue: QueueId,
    buffers: Vec<TextureId>,
    current: u32,
}

/// GPU-side bindings while one command list executes.
#[derive(Default)]
struct ExecState {
    pipeline: Option<PipelineId>,
    heap: Option<DescriptorHeapId>,
    tables: BTreeMap<u32, GpuDescriptorHandle>,
    vertex_buffer: Option<VertexBufferView>,
    index_buffer: Option<IndexBufferView>,
    color_target: Option<TextureId>,
    draw: usize,
}

#[derive(Default)]
struct HeadlessState {
    buffers: SlotMap<BufferId, SimBuffer>,
    textures: SlotMap<TextureId, SimTexture>,
    heaps: SlotMap<DescriptorHeapId, SimHeap>,
    heap_by_base: HashMap<u64, DescriptorHeapId>,
    address_space: DescriptorAddressSpace,
    allocators: SlotMap<CommandAllocatorId, SimAllocator>,
    lists: SlotMap<CommandListId, SimCommandList>,
    queues: SlotMap<QueueId, SimQueue>,
    fences: SlotMap<FenceId, SimFence>,
    swapchains: SlotMap<SwapchainId, SimSwapchain>,
    pipelines: SlotMap<PipelineId, PipelineDesc>,

    fence_waits: Vec<FenceWait>,
    recorded_texture_copies: HashMap<TextureId, usize>,
    stats: HeadlessStats,
}

pub struct HeadlessDevice {
    state: Mutex<HeadlessState>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeadlessState::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, HeadlessState>> {
        self.state.lock().map_err(|e| eyre!(e.to_string()))
    }

    /// Runs every queued GPU operation, as if the device went idle.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state()?;
        let queues = state.queues.keys().collect::<Vec<_>>();
        for queue in queues {
            while let Some(op) = state.queues[queue].pending.pop_front() {
                state.run_op(op)?;
            }
        }
        Ok(())
    }

    /// Tightly packed contents of a texture as the GPU currently sees them.
    pub fn read_texture(&self, texture: TextureId) -> Result<Vec<u8>> {
        let state = self.state()?;
        let texture = state.textures.get(texture).ok_or_eyre("Unknown texture")?;
        Ok(texture.data.clone())
    }

    pub fn resource_state(&self, resource: ResourceId) -> Result<ResourceState> {
        let state = self.state()?;
        match resource {
            ResourceId::Buffer(id) => Ok(state.buffers.get(id).ok_or_eyre("Unknown buffer")?.state),
            ResourceId::Texture(id) => Ok(state.textures.get(id).ok_or_eyre("Unknown texture")?.state),
        }
    }

    pub fn fence_waits(&self) -> Result<Vec<FenceWait>> {
        Ok(self.state()?.fence_waits.clone())
    }

    /// Buffer-to-texture copies recorded into any command list targeting `texture`.
    pub fn texture_copy_count(&self, texture: TextureId) -> Result<usize> {
        Ok(self.state()?.recorded_texture_copies.get(&texture).copied().unwrap_or(0))
    }

    pub fn stats(&self) -> Result<HeadlessStats> {
        Ok(self.state()?.stats.clone())
    }

    pub fn pending_op_count(&self) -> Result<usize> {
        Ok(self.state()?.queues.values().map(|q| q.pending.len()).sum())
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessState {
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

    fn write_descriptor(&mut self, heap: DescriptorHeapId, index: u32, view: Option<ViewDesc>) {
        let heap = &mut self.heaps[heap];
        heap.slots[index as usize] = view;
        heap.versions[index as usize] += 1;
    }

    fn in_flight(&self, resource: ResourceId) -> bool {
        self.queues.values().any(|queue| {
            queue.pending.iter().any(|op| match op {
                QueueOp::Execute { commands, .. } => commands
                    .iter()
                    .any(|command| command.referenced_resources().contains(&resource)),
                QueueOp::Present { buffer } => resource == ResourceId::Texture(*buffer),
                QueueOp::Signal { .. } => false,
            })
        })
    }

    fn ensure_idle(&self, resource: ResourceId) -> Result<()> {
        if self.in_flight(resource) {
            return Err(eyre!("{:?} is destroyed while submitted GPU work still references it", resource));
        }
        Ok(())
    }

    fn new_texture(&mut self, desc: &TextureDesc) -> TextureId {
        let size = (desc.width * desc.height * desc.format.bytes_per_pixel()) as usize;
        self.textures.insert(SimTexture {
            desc: desc.clone(),
            data: vec![0; size],
            state: desc.initial_state,
        })
    }

    fn swapchain_buffers(&mut self, desc: &SwapchainDesc) -> Vec<TextureId> {
        (0..desc.buffer_count)
            .map(|index| {
                self.new_texture(&TextureDesc {
                    width: desc.width,
                    height: desc.height,
                    format: desc.format,
                    usage: TextureUsage::RenderTarget,
                    initial_state: ResourceState::Present,
                    name: format!("Back buffer {}", index),
                })
            })
            .collect()
    }

    /// Captures, per draw, the descriptor versions of every bound table.
    fn snapshot_tables(&self, commands: &[Command]) -> Result<Vec<Vec<TableSnapshot>>> {
        let mut pipeline = None;
        let mut tables = BTreeMap::new();
        let mut snapshots = Vec::new();
        for command in commands {
            match *command {
                Command::SetPipeline(id) => pipeline = Some(id),
                Command::SetDescriptorTable { root_index, table } => {
                    tables.insert(root_index, table);
                }
                Command::DrawIndexed { .. } => {
                    let desc = pipeline
                        .and_then(|id| self.pipelines.get(id))
                        .ok_or_eyre("Draw recorded without a pipeline")?;
                    let mut draw = Vec::new();
                    for (&root_index, table) in &tables {
                        let Some(len) = desc.table_len(root_index) else {
                            continue;
                        };
                        let (heap_id, start) = self.heap_slot(table.0)?;
                        let heap = &self.heaps[heap_id];
                        let end = start as usize + len as usize;
                        if end > heap.versions.len() {
                            return Err(eyre!("Descriptor table at {:#x} runs past the end of its heap", table.0));
                        }
                        draw.push(TableSnapshot {
                            heap: heap_id,
                            start,
                            versions: heap.versions[start as usize..end].to_vec(),
                        });
                    }
                    snapshots.push(draw);
                }
                _ => {}
            }
        }
        Ok(snapshots)
    }

    fn resource_state_mut(&mut self, resource: ResourceId) -> Result<&mut ResourceState> {
        match resource {
            ResourceId::Buffer(id) => Ok(&mut self.buffers.get_mut(id).ok_or_eyre("Barrier on unknown buffer")?.state),
            ResourceId::Texture(id) => Ok(&mut self.textures.get_mut(id).ok_or_eyre("Barrier on unknown texture")?.state),
        }
    }

    fn texture_in(&self, id: TextureId, expected: ResourceState, usage: &str) -> Result<&SimTexture> {
        let texture = self.textures.get(id).ok_or_else(|| eyre!("{} uses an unknown texture", usage))?;
        if texture.state != expected {
            return Err(eyre!(
                "{} expects '{}' in {:?} but it is in {:?}",
                usage, texture.desc.name, expected, texture.state
            ));
        }
        Ok(texture)
    }

    fn buffer_in(&self, id: BufferId, expected: &[ResourceState], usage: &str) -> Result<&SimBuffer> {
        let buffer = self.buffers.get(id).ok_or_else(|| eyre!("{} uses an unknown buffer", usage))?;
        if !expected.contains(&buffer.state) {
            return Err(eyre!(
                "{} expects '{}' in one of {:?} but it is in {:?}",
                usage, buffer.desc.name, expected, buffer.state
            ));
        }
        Ok(buffer)
    }

    fn run_op(&mut self, op: QueueOp) -> Result<()> {
        match op {
            QueueOp::Execute { allocator, commands, draw_tables } => {
                let mut exec = ExecState::default();
                for command in &commands {
                    self.execute(&mut exec, command, &draw_tables)?;
                }
                if let Some(allocator) = self.allocators.get_mut(allocator) {
                    allocator.in_flight -= 1;
                }
                self.stats.executed_lists += 1;
            }
            QueueOp::Signal { fence, value } => {
                if let Some(fence) = self.fences.get_mut(fence) {
                    fence.completed = value;
                }
            }
            QueueOp::Present { buffer } => {
                self.texture_in(buffer, ResourceState::Present, "Present")?;
                self.stats.presents += 1;
            }
        }
        Ok(())
    }

    fn execute(&mut self, exec: &mut ExecState, command: &Command, draw_tables: &[Vec<TableSnapshot>]) -> Result<()> {
        match *command {
            Command::Barrier(Barrier { resource, before, after }) => {
                let state = self.resource_state_mut(resource)?;
                if *state != before {
                    return Err(eyre!(
                        "Barrier on {:?} expects {:?} but the resource is in {:?}",
                        resource, before, *state
                    ));
                }
                *state = after;
            }
            Command::CopyBuffer { dst, dst_offset, src, src_offset, size } => {
                let source = self.buffer_in(src, &[ResourceState::GenericRead, ResourceState::CopySource], "Buffer copy")?;
                let range = src_offset as usize..(src_offset + size) as usize;
                let bytes = source.data.get(range).ok_or_eyre("Buffer copy reads past the source")?.to_vec();
                self.buffer_in(dst, &[ResourceState::CopyDest], "Buffer copy")?;
                let target = &mut self.buffers[dst].data;
                target
                    .get_mut(dst_offset as usize..(dst_offset + size) as usize)
                    .ok_or_eyre("Buffer copy writes past the destination")?
                    .copy_from_slice(&bytes);
                self.stats.buffer_copies += 1;
            }
            Command::CopyBufferToTexture { dst, src, footprint } => {
                let source = self.buffer_in(src, &[ResourceState::GenericRead, ResourceState::CopySource], "Texture copy")?;
                if footprint.offset + footprint.total_bytes > source.data.len() as u64 {
                    return Err(eyre!("Texture copy footprint exceeds the upload buffer"));
                }
                let rows = copy_rows(&source.data, &footprint);
                self.texture_in(dst, ResourceState::CopyDest, "Texture copy")?;
                let target = &mut self.textures[dst];
                if rows.len() != target.data.len() {
                    return Err(eyre!("Texture copy footprint does not match '{}'", target.desc.name));
                }
                target.data = rows;
                self.stats.texture_copies += 1;
            }
            Command::ClearRenderTarget { target, color } => {
                self.texture_in(target, ResourceState::RenderTarget, "Clear")?;
                let texture = &mut self.textures[target];
                let pixel = pack_color(texture.desc.format, color);
                for chunk in texture.data.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&pixel);
                }
            }
            Command::ClearDepth { target, depth } => {
                self.texture_in(target, ResourceState::DepthWrite, "Depth clear")?;
                let texture = &mut self.textures[target];
                for chunk in texture.data.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&depth.to_le_bytes());
                }
            }
            Command::SetViewport(_) | Command::SetScissor(_) => {}
            Command::SetRenderTargets { color, depth } => {
                self.texture_in(color, ResourceState::RenderTarget, "Render target")?;
                if let Some(depth) = depth {
                    self.texture_in(depth, ResourceState::DepthWrite, "Depth target")?;
                }
                exec.color_target = Some(color);
            }
            Command::SetPipeline(pipeline) => {
                self.pipelines.get(pipeline).ok_or_eyre("Unknown pipeline")?;
                exec.pipeline = Some(pipeline);
            }
            Command::SetDescriptorHeap(heap) => {
                let sim = self.heaps.get(heap).ok_or_eyre("Unknown descriptor heap")?;
                if !sim.desc.shader_visible {
                    return Err(eyre!("Only shader-visible heaps can be bound"));
                }
                exec.heap = Some(heap);
            }
            Command::SetDescriptorTable { root_index, table } => {
                let (heap, _) = self.heap_slot(table.0)?;
                if exec.heap != Some(heap) {
                    return Err(eyre!("Descriptor table does not belong to the bound heap"));
                }
                exec.tables.insert(root_index, table);
            }
            Command::SetVertexBuffer(view) => {
                self.buffer_in(view.buffer, &[ResourceState::VertexAndConstantBuffer, ResourceState::GenericRead], "Vertex buffer")?;
                exec.vertex_buffer = Some(view);
            }
            Command::SetIndexBuffer(view) => {
                self.buffer_in(view.buffer, &[ResourceState::IndexBuffer, ResourceState::GenericRead], "Index buffer")?;
                exec.index_buffer = Some(view);
            }
            Command::DrawIndexed { index_count, first_index, .. } => {
                exec.pipeline.ok_or_eyre("Draw without a pipeline")?;
                exec.color_target.ok_or_eyre("Draw without a render target")?;
                exec.vertex_buffer.ok_or_eyre("Draw without a vertex buffer")?;
                let index_buffer = exec.index_buffer.ok_or_eyre("Draw without an index buffer")?;
                if first_index + index_count > index_buffer.index_count() {
                    return Err(eyre!("Draw reads past the end of the index buffer"));
                }
                let snapshots = draw_tables.get(exec.draw).ok_or_eyre("Draw was not captured at submission")?;
                for snapshot in snapshots {
                    self.check_table(snapshot)?;
                }
                exec.draw += 1;
                self.stats.draws += 1;
            }
        }
        Ok(())
    }

    fn check_table(&self, snapshot: &TableSnapshot) -> Result<()> {
        let heap = self.heaps.get(snapshot.heap).ok_or_eyre("Descriptor heap destroyed while in flight")?;
        for (offset, version) in snapshot.versions.iter().enumerate() {
            let index = snapshot.start as usize + offset;
            if heap.versions[index] != *version {
                return Err(eyre!(
                    "Descriptor {} was overwritten before the GPU consumed the draw that reads it",
                    index
                ));
            }
            match heap.slots[index] {
                Some(ViewDesc::Texture { texture }) => {
                    self.texture_in(texture, ResourceState::PixelShaderResource, "Shader resource view")?;
                }
                Some(ViewDesc::ConstantBuffer { buffer, offset, size }) => {
                    let buffer = self.buffers.get(buffer).ok_or_eyre("Constant buffer view of a destroyed buffer")?;
                    if offset + size as u64 > buffer.desc.size {
                        return Err(eyre!("Constant buffer view exceeds '{}'", buffer.desc.name));
                    }
                }
                None => return Err(eyre!("Draw reads descriptor {} which was never written", index)),
            }
        }
        Ok(())
    }

    /// Executes queued work on the queue that will signal `fence` to `value`, up to that signal.
    fn advance_to(&mut self, fence: FenceId, value: u64) -> Result<()> {
        let queue = self
            .queues
            .iter()
            .find(|(_, queue)| {
                queue.pending.iter().any(|op| matches!(op, QueueOp::Signal { fence: f, value: v } if *f == fence && *v >= value))
            })
            .map(|(id, _)| id)
            .ok_or_else(|| eyre!("Waiting for fence value {} that no submitted work will ever signal", value))?;

        while self.fences[fence].completed < value {
            let op = self.queues[queue]
                .pending
                .pop_front()
                .ok_or_eyre("Queue drained before reaching the fence value")?;
            self.run_op(op)?;
        }
        Ok(())
    }
}

fn copy_rows(source: &[u8], footprint: &Footprint) -> Vec<u8> {
    let mut rows = Vec::with_capacity((footprint.row_size * footprint.rows) as usize);
    for row in 0..footprint.rows as u64 {
        let start = (footprint.offset + row * footprint.row_pitch as u64) as usize;
        rows.extend_from_slice(&source[start..start + footprint.row_size as usize]);
    }
    rows
}

fn pack_color(format: Format, color: [f32; 4]) -> [u8; 4] {
    let [r, g, b, a] = color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
    match format {
        Format::Bgra8Unorm => [b, g, r, a],
        _ => [r, g, b, a],
    }
}

impl RenderDevice for HeadlessDevice {
    fn backend_name(&self) -> &'static str {
        "headless"
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId> {
        let mut state = self.state()?;
        Ok(state.buffers.insert(SimBuffer {
            desc: desc.clone(),
            data: vec![0; desc.size as usize],
            state: desc.initial_state(),
        }))
    }

    fn destroy_buffer(&self, buffer: BufferId) -> Result<()> {
        let mut state = self.state()?;
        state.ensure_idle(ResourceId::Buffer(buffer))?;
        state.buffers.remove(buffer).ok_or_eyre("Destroying unknown buffer")?;
        Ok(())
    }

    fn map_buffer(&self, buffer: BufferId, write: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut state = self.state()?;
        let buffer = state.buffers.get_mut(buffer).ok_or_eyre("Mapping unknown buffer")?;
        if buffer.desc.heap != HeapKind::Upload {
            return Err(eyre!("Buffer '{}' is not CPU-visible", buffer.desc.name));
        }
        write(&mut buffer.data);
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(eyre!("Texture '{}' has zero size", desc.name));
        }
        Ok(self.state()?.new_texture(desc))
    }

    fn destroy_texture(&self, texture: TextureId) -> Result<()> {
        let mut state = self.state()?;
        state.ensure_idle(ResourceId::Texture(texture))?;
        state.textures.remove(texture).ok_or_eyre("Destroying unknown texture")?;
        Ok(())
    }

    fn texture_desc(&self, texture: TextureId) -> Result<TextureDesc> {
        let state = self.state()?;
        Ok(state.textures.get(texture).ok_or_eyre("Unknown texture")?.desc.clone())
    }

    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapId> {
        let mut state = self.state()?;
        let base = state.address_space.reserve();
        let heap = state.heaps.insert(SimHeap {
            desc: *desc,
            base,
            slots: vec![None; desc.capacity as usize],
            versions: vec![0; desc.capacity as usize],
        });
        state.heap_by_base.insert(base, heap);
        Ok(heap)
    }

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapId) -> Result<()> {
        let mut state = self.state()?;
        let removed = state.heaps.remove(heap).ok_or_eyre("Destroying unknown descriptor heap")?;
        state.heap_by_base.remove(&removed.base);
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
                let sim = state.buffers.get(buffer).ok_or_eyre("Constant buffer view of unknown buffer")?;
                if offset + size as u64 > sim.desc.size {
                    return Err(eyre!("Constant buffer view exceeds '{}'", sim.desc.name));
                }
            }
            ViewDesc::Texture { texture } => {
                state.textures.get(texture).ok_or_eyre("Shader resource view of unknown texture")?;
            }
        }
        let (heap, index) = state.heap_slot(dest.0)?;
        state.write_descriptor(heap, index, Some(*view));
        Ok(())
    }

    fn copy_descriptors(&self, count: u32, dest: CpuDescriptorHandle, src: CpuDescriptorHandle) -> Result<()> {
        let mut state = self.state()?;
        for i in 0..count {
            let stride = super::DESCRIPTOR_INCREMENT_SIZE;
            let (src_heap, src_index) = state.heap_slot(src.offset(i, stride).0)?;
            let (dst_heap, dst_index) = state.heap_slot(dest.offset(i, stride).0)?;
            let view = state.heaps[src_heap].slots[src_index as usize];
            state.write_descriptor(dst_heap, dst_index, view);
        }
        Ok(())
    }

    fn create_command_allocator(&self) -> Result<CommandAllocatorId> {
        Ok(self.state()?.allocators.insert(SimAllocator { in_flight: 0 }))
    }

    fn destroy_command_allocator(&self, allocator: CommandAllocatorId) -> Result<()> {
        let mut state = self.state()?;
        let sim = state.allocators.get(allocator).ok_or_eyre("Destroying unknown command allocator")?;
        if sim.in_flight > 0 {
            return Err(eyre!("Command allocator destroyed while its lists are executing"));
        }
        state.allocators.remove(allocator);
        Ok(())
    }

    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> Result<()> {
        let state = self.state()?;
        let sim = state.allocators.get(allocator).ok_or_eyre("Resetting unknown command allocator")?;
        if sim.in_flight > 0 {
            return Err(eyre!(
                "Command allocator reset while {} submitted list(s) recorded from it are still pending",
                sim.in_flight
            ));
        }
        Ok(())
    }

    fn create_command_list(&self, allocator: CommandAllocatorId) -> Result<CommandListId> {
        let mut state = self.state()?;
        state.allocators.get(allocator).ok_or_eyre("Unknown command allocator")?;
        Ok(state.lists.insert(SimCommandList {
            allocator,
            commands: Vec::new(),
            open: false,
        }))
    }

    fn destroy_command_list(&self, list: CommandListId) -> Result<()> {
        self.state()?.lists.remove(list).ok_or_eyre("Destroying unknown command list")?;
        Ok(())
    }

    fn reset_command_list(&self, list: CommandListId, allocator: CommandAllocatorId) -> Result<()> {
        let mut state = self.state()?;
        state.allocators.get(allocator).ok_or_eyre("Unknown command allocator")?;
        let sim = state.lists.get_mut(list).ok_or_eyre("Resetting unknown command list")?;
        if sim.open {
            return Err(eyre!("Command list reset while still recording"));
        }
        sim.allocator = allocator;
        sim.commands.clear();
        sim.open = true;
        Ok(())
    }

    fn record(&self, list: CommandListId, command: Command) -> Result<()> {
        let mut state = self.state()?;
        if let Command::CopyBufferToTexture { dst, .. } = command {
            *state.recorded_texture_copies.entry(dst).or_default() += 1;
        }
        let sim = state.lists.get_mut(list).ok_or_eyre("Recording into unknown command list")?;
        if !sim.open {
            return Err(eyre!("Recording into a closed command list"));
        }
        sim.commands.push(command);
        Ok(())
    }

    fn close_command_list(&self, list: CommandListId) -> Result<()> {
        let mut state = self.state()?;
        let sim = state.lists.get_mut(list).ok_or_eyre("Closing unknown command list")?;
        if !sim.open {
            return Err(eyre!("Command list closed twice"));
        }
        sim.open = false;
        Ok(())
    }

    fn create_queue(&self) -> Result<QueueId> {
        Ok(self.state()?.queues.insert(SimQueue::default()))
    }

    fn destroy_queue(&self, queue: QueueId) -> Result<()> {
        let mut state = self.state()?;
        let sim = state.queues.get(queue).ok_or_eyre("Destroying unknown queue")?;
        if !sim.pending.is_empty() {
            return Err(eyre!("Queue destroyed with {} operations pending", sim.pending.len()));
        }
        state.queues.remove(queue);
        Ok(())
    }

    fn execute_command_lists(&self, queue: QueueId, lists: &[CommandListId]) -> Result<()> {
        let mut state = self.state()?;
        state.queues.get(queue).ok_or_eyre("Submitting to unknown queue")?;
        for &list in lists {
            let sim = state.lists.get(list).ok_or_eyre("Submitting unknown command list")?;
            if sim.open {
                return Err(eyre!("Submitting a command list that was not closed"));
            }
            let allocator = sim.allocator;
            let commands = sim.commands.clone();
            let draw_tables = state.snapshot_tables(&commands)?;
            state.allocators.get_mut(allocator).ok_or_eyre("Command list allocator was destroyed")?.in_flight += 1;
            state.queues[queue].pending.push_back(QueueOp::Execute { allocator, commands, draw_tables });
        }
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> Result<FenceId> {
        Ok(self.state()?.fences.insert(SimFence { completed: initial_value }))
    }

    fn destroy_fence(&self, fence: FenceId) -> Result<()> {
        self.state()?.fences.remove(fence).ok_or_eyre("Destroying unknown fence")?;
        Ok(())
    }

    fn signal(&self, queue: QueueId, fence: FenceId, value: u64) -> Result<()> {
        let mut state = self.state()?;
        state.fences.get(fence).ok_or_eyre("Signaling unknown fence")?;
        let sim = state.queues.get_mut(queue).ok_or_eyre("Signaling on unknown queue")?;
        sim.pending.push_back(QueueOp::Signal { fence, value });
        Ok(())
    }

    fn fence_completed_value(&self, fence: FenceId) -> Result<u64> {
        let state = self.state()?;
        Ok(state.fences.get(fence).ok_or_eyre("Unknown fence")?.completed)
    }

    fn wait_for_fence(&self, fence: FenceId, value: u64) -> Result<()> {
        let mut state = self.state()?;
        let completed_before = state.fences.get(fence).ok_or_eyre("Waiting on unknown fence")?.completed;
        state.fence_waits.push(FenceWait { fence, value, completed_before });
        if completed_before >= value {
            return Ok(());
        }
        state.advance_to(fence, value)
    }

    fn create_swapchain(&self, queue: QueueId, desc: &SwapchainDesc) -> Result<SwapchainId> {
        let mut state = self.state()?;
        state.queues.get(queue).ok_or_eyre("Swap chain on unknown queue")?;
        let buffers = state.swapchain_buffers(desc);
        Ok(state.swapchains.insert(SimSwapchain {
            desc: *desc,
            queue,
            buffers,
            current: 0,
        }))
    }

    fn destroy_swapchain(&self, swapchain: SwapchainId) -> Result<()> {
        let mut state = self.state()?;
        let buffers = state.swapchains.get(swapchain).ok_or_eyre("Destroying unknown swap chain")?.buffers.clone();
        for &buffer in &buffers {
            state.ensure_idle(ResourceId::Texture(buffer))?;
        }
        for buffer in buffers {
            state.textures.remove(buffer);
        }
        state.swapchains.remove(swapchain);
        Ok(())
    }

    fn swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<TextureId> {
        let state = self.state()?;
        let sim = state.swapchains.get(swapchain).ok_or_eyre("Unknown swap chain")?;
        sim.buffers.get(index as usize).copied().ok_or_eyre("Back buffer index out of range")
    }

    fn current_back_buffer_index(&self, swapchain: SwapchainId) -> Result<u32> {
        let state = self.state()?;
        Ok(state.swapchains.get(swapchain).ok_or_eyre("Unknown swap chain")?.current)
    }

    fn present(&self, swapchain: SwapchainId, _sync_interval: u32, _allow_tearing: bool) -> Result<()> {
        let mut state = self.state()?;
        let sim = state.swapchains.get_mut(swapchain).ok_or_eyre("Presenting unknown swap chain")?;
        let buffer = sim.buffers[sim.current as usize];
        let queue = sim.queue;
        sim.current = (sim.current + 1) % sim.desc.buffer_count;
        state.queues[queue].pending.push_back(QueueOp::Present { buffer });
        Ok(())
    }

    fn resize_swapchain(&self, swapchain: SwapchainId, width: u32, height: u32) -> Result<()> {
        let mut state = self.state()?;
        let sim = state.swapchains.get(swapchain).ok_or_eyre("Resizing unknown swap chain")?;
        let old_buffers = sim.buffers.clone();
        let desc = SwapchainDesc { width, height, ..sim.desc };
        for &buffer in &old_buffers {
            state.ensure_idle(ResourceId::Texture(buffer))?;
        }
        for buffer in old_buffers {
            state.textures.remove(buffer);
        }
        let buffers = state.swapchain_buffers(&desc);
        let sim = &mut state.swapchains[swapchain];
        sim.desc = desc;
        sim.buffers = buffers;
        sim.current = 0;
        Ok(())
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> Result<PipelineId> {
        Ok(self.state()?.pipelines.insert(desc.clone()))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) -> Result<()> {
        self.state()?.pipelines.remove(pipeline).ok_or_eyre("Destroying unknown pipeline")?;
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
                log::error!("Headless device state is poisoned: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_buffer(device: &HeadlessDevice, size: u64) -> BufferId {
        device
            .create_buffer(&BufferDesc {
                size,
                heap: HeapKind::Upload,
                usage: super::super::BufferUsage::Staging,
                name: "upload".into(),
            })
            .unwrap()
    }

    fn open_list(device: &HeadlessDevice) -> (CommandAllocatorId, CommandListId) {
        let allocator = device.create_command_allocator().unwrap();
        let list = device.create_command_list(allocator).unwrap();
        device.reset_command_list(list, allocator).unwrap();
        (allocator, list)
    }

    #[test]
    fn work_runs_only_when_a_wait_needs_it() {
        let device = HeadlessDevice::new();
        let queue = device.create_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        let (_, list) = open_list(&device);
        device.close_command_list(list).unwrap();

        device.execute_command_lists(queue, &[list]).unwrap();
        device.signal(queue, fence, 1).unwrap();
        assert_eq!(device.fence_completed_value(fence).unwrap(), 0);
        assert_eq!(device.pending_op_count().unwrap(), 2);

        device.wait_for_fence(fence, 1).unwrap();
        assert_eq!(device.fence_completed_value(fence).unwrap(), 1);
        assert_eq!(device.stats().unwrap().executed_lists, 1);
        assert_eq!(device.fence_waits().unwrap(), vec![FenceWait { fence, value: 1, completed_before: 0 }]);
    }

    #[test]
    fn waiting_for_an_unsignaled_value_is_an_error() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(0).unwrap();
        assert!(device.wait_for_fence(fence, 5).is_err());
    }

    #[test]
    fn allocator_reset_with_pending_work_is_rejected() {
        let device = HeadlessDevice::new();
        let queue = device.create_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        let (allocator, list) = open_list(&device);
        device.close_command_list(list).unwrap();
        device.execute_command_lists(queue, &[list]).unwrap();
        device.signal(queue, fence, 1).unwrap();

        assert!(device.reset_command_allocator(allocator).is_err());
        device.wait_for_fence(fence, 1).unwrap();
        assert!(device.reset_command_allocator(allocator).is_ok());
    }

    #[test]
    fn barrier_with_wrong_before_state_fails_on_execution() {
        let device = HeadlessDevice::new();
        let queue = device.create_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        let buffer = upload_buffer(&device, 16);
        let (_, list) = open_list(&device);
        device
            .record(list, Command::Barrier(Barrier::transition(
                ResourceId::Buffer(buffer),
                ResourceState::CopyDest,
                ResourceState::GenericRead,
            )))
            .unwrap();
        device.close_command_list(list).unwrap();
        device.execute_command_lists(queue, &[list]).unwrap();
        device.signal(queue, fence, 1).unwrap();

        assert!(device.wait_for_fence(fence, 1).is_err());
    }

    #[test]
    fn texture_copy_honours_row_pitch() {
        let device = HeadlessDevice::new();
        let queue = device.create_queue().unwrap();
        let fence = device.create_fence(0).unwrap();
        let desc = TextureDesc {
            width: 3,
            height: 2,
            format: Format::Rgba8Unorm,
            usage: TextureUsage::Sampled,
            initial_state: ResourceState::CopyDest,
            name: "small".into(),
        };
        let texture = device.create_texture(&desc).unwrap();
        let footprint = device.copyable_footprint(&desc);
        assert_eq!(footprint.row_pitch, 256);

        let upload = upload_buffer(&device, footprint.total_bytes);
        device
            .map_buffer(upload, &mut |bytes| {
                bytes[..12].fill(1);
                bytes[256..268].fill(2);
            })
            .unwrap();

        let (_, list) = open_list(&device);
        device.record(list, Command::CopyBufferToTexture { dst: texture, src: upload, footprint }).unwrap();
        device.close_command_list(list).unwrap();
        device.execute_command_lists(queue, &[list]).unwrap();
        device.signal(queue, fence, 1).unwrap();
        device.wait_for_fence(fence, 1).unwrap();

        let pixels = device.read_texture(texture).unwrap();
        assert_eq!(&pixels[..12], &[1; 12]);
        assert_eq!(&pixels[12..], &[2; 12]);
        assert_eq!(device.texture_copy_count(texture).unwrap(), 1);
    }

    #[test]
    fn destroying_an_in_flight_buffer_is_rejected() {
        let device = HeadlessDevice::new();
        let queue = device.create_queue().unwrap();
        let buffer = upload_buffer(&device, 16);
        let (_, list) = open_list(&device);
        device
            .record(list, Command::Barrier(Barrier::transition(
                ResourceId::Buffer(buffer),
                ResourceState::GenericRead,
                ResourceState::CopySource,
            )))
            .unwrap();
        device.close_command_list(list).unwrap();
        device.execute_command_lists(queue, &[list]).unwrap();

        assert!(device.destroy_buffer(buffer).is_err());
        device.flush().unwrap();
        assert!(device.destroy_buffer(buffer).is_ok());
    }
}
