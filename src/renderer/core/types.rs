slotmap::new_key_type! {
    pub struct BufferId;
    pub struct TextureId;
    pub struct DescriptorHeapId;
    pub struct CommandAllocatorId;
    pub struct CommandListId;
    pub struct QueueId;
    pub struct FenceId;
    pub struct SwapchainId;
    pub struct PipelineId;
}

/// Row pitch granularity of buffer-to-texture copies.
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u32 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// GPU-resident memory, only reachable through copies.
    Default,
    /// CPU-writable staging memory, persistently mappable.
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    GenericRead,
    CopyDest,
    CopySource,
    VertexAndConstantBuffer,
    IndexBuffer,
    PixelShaderResource,
    RenderTarget,
    DepthWrite,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Bgra8Unorm,
    Depth32Float,
}

impl Format {
    pub fn bytes_per_pixel(self) -> u32 {
        4
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::Depth32Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    Vertex,
    Index,
    Constant,
    Staging,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub size: u64,
    pub heap: HeapKind,
    pub usage: BufferUsage,
    pub name: String,
}

impl BufferDesc {
    /// Upload-heap buffers live in `GenericRead`, default-heap buffers start out in `Common`.
    pub fn initial_state(&self) -> ResourceState {
        match self.heap {
            HeapKind::Upload => ResourceState::GenericRead,
            HeapKind::Default => ResourceState::Common,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureUsage {
    Sampled,
    RenderTarget,
    DepthStencil,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
    pub name: String,
}

/// Layout of a texture's pixel data inside a linear buffer, as the copy engine expects it.
/// `row_pitch` may exceed `row_size`, so uploads have to be written row by row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footprint {
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub row_pitch: u32,
    pub row_size: u32,
    pub rows: u32,
    pub total_bytes: u64,
}

impl Footprint {
    pub fn for_texture(desc: &TextureDesc) -> Self {
        let row_size = desc.width * desc.format.bytes_per_pixel();
        let row_pitch = row_size.div_ceil(TEXTURE_DATA_PITCH_ALIGNMENT) * TEXTURE_DATA_PITCH_ALIGNMENT;
        let total_bytes = row_pitch as u64 * (desc.height as u64 - 1) + row_size as u64;
        Self {
            offset: 0,
            width: desc.width,
            height: desc.height,
            row_pitch,
            row_size,
            rows: desc.height,
            total_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    pub capacity: u32,
    pub shader_visible: bool,
}

/// Address of a descriptor as seen by the CPU: heap start plus `index * stride`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuDescriptorHandle(pub u64);

/// Address of a descriptor inside a shader-visible heap, as bound to a root table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    pub fn offset(self, count: u32, stride: u32) -> Self {
        Self(self.0 + count as u64 * stride as u64)
    }
}

impl GpuDescriptorHandle {
    pub fn offset(self, count: u32, stride: u32) -> Self {
        Self(self.0 + count as u64 * stride as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDesc {
    ConstantBuffer { buffer: BufferId, offset: u64, size: u32 },
    Texture { texture: TextureId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferId),
    Texture(TextureId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub resource: ResourceId,
    pub before: ResourceState,
    pub after: ResourceState,
}

impl Barrier {
    pub fn transition(resource: ResourceId, before: ResourceState, after: ResourceState) -> Self {
        Self { resource, before, after }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub buffer: BufferId,
    pub size: u32,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub buffer: BufferId,
    pub size: u32,
}

impl IndexBufferView {
    /// Indices are always 16-bit.
    pub fn index_count(&self) -> u32 {
        self.size / 2
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Barrier(Barrier),
    CopyBuffer { dst: BufferId, dst_offset: u64, src: BufferId, src_offset: u64, size: u64 },
    CopyBufferToTexture { dst: TextureId, src: BufferId, footprint: Footprint },
    ClearRenderTarget { target: TextureId, color: [f32; 4] },
    ClearDepth { target: TextureId, depth: f32 },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    SetRenderTargets { color: TextureId, depth: Option<TextureId> },
    SetPipeline(PipelineId),
    SetDescriptorHeap(DescriptorHeapId),
    SetDescriptorTable { root_index: u32, table: GpuDescriptorHandle },
    SetVertexBuffer(VertexBufferView),
    SetIndexBuffer(IndexBufferView),
    DrawIndexed { index_count: u32, first_index: u32, base_vertex: i32 },
}

impl Command {
    /// Resources the GPU touches directly while executing this command.
    pub fn referenced_resources(&self) -> smallvec::SmallVec<[ResourceId; 2]> {
        use smallvec::smallvec;
        match *self {
            Command::Barrier(barrier) => smallvec![barrier.resource],
            Command::CopyBuffer { dst, src, .. } => smallvec![ResourceId::Buffer(dst), ResourceId::Buffer(src)],
            Command::CopyBufferToTexture { dst, src, .. } => smallvec![ResourceId::Texture(dst), ResourceId::Buffer(src)],
            Command::ClearRenderTarget { target, .. } | Command::ClearDepth { target, .. } => {
                smallvec![ResourceId::Texture(target)]
            }
            Command::SetRenderTargets { color, depth } => match depth {
                Some(depth) => smallvec![ResourceId::Texture(color), ResourceId::Texture(depth)],
                None => smallvec![ResourceId::Texture(color)],
            },
            Command::SetVertexBuffer(view) => smallvec![ResourceId::Buffer(view.buffer)],
            Command::SetIndexBuffer(view) => smallvec![ResourceId::Buffer(view.buffer)],
            _ => smallvec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub format: Format,
    pub allow_tearing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32x2,
    Float32x3,
    Float32x4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorRange {
    ConstantBuffer(u32),
    Texture(u32),
}

impl DescriptorRange {
    pub fn count(self) -> u32 {
        match self {
            DescriptorRange::ConstantBuffer(count) | DescriptorRange::Texture(count) => count,
        }
    }
}

/// Root signature + pipeline state in one object. Each root table is a contiguous run of
/// descriptors in the bound shader-visible heap, laid out range after range.
/// Triangle lists, no culling, opaque, depth test `LessEqual` when a depth format is set.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub name: &'static str,
    /// WGSL source with `vs_main` and `fs_main` entry points.
    pub shader: &'static str,
    pub vertex_stride: u32,
    pub vertex_attributes: &'static [VertexAttribute],
    pub root_tables: &'static [&'static [DescriptorRange]],
    pub color_format: Format,
    pub depth_format: Option<Format>,
}

impl PipelineDesc {
    pub fn table_len(&self, root_index: u32) -> Option<u32> {
        self.root_tables
            .get(root_index as usize)
            .map(|ranges| ranges.iter().map(|range| range.count()).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(width: u32, height: u32) -> TextureDesc {
        TextureDesc {
            width,
            height,
            format: Format::Rgba8Unorm,
            usage: TextureUsage::Sampled,
            initial_state: ResourceState::CopyDest,
            name: "test".into(),
        }
    }

    #[test]
    fn footprint_pads_rows_to_pitch_alignment() {
        let footprint = Footprint::for_texture(&desc(100, 3));
        assert_eq!(footprint.row_size, 400);
        assert_eq!(footprint.row_pitch, 512);
        assert_eq!(footprint.total_bytes, 512 * 2 + 400);
    }

    #[test]
    fn footprint_of_aligned_width_is_tight() {
        let footprint = Footprint::for_texture(&desc(512, 256));
        assert_eq!(footprint.row_pitch, footprint.row_size);
        assert_eq!(footprint.total_bytes, 512 * 4 * 256);
    }

    #[test]
    fn descriptor_handles_offset_by_stride() {
        let start = CpuDescriptorHandle(0x1_0000_0000);
        assert_eq!(start.offset(3, 32), CpuDescriptorHandle(0x1_0000_0060));
    }
}
