use std::path::Path;
use std::sync::Arc;
use bytemuck::Pod;
use color_eyre::Result;
use crate::renderer::core::{
    Barrier, BufferDesc, BufferId, BufferUsage, Command, CommandAllocatorId, CommandListId, FenceId,
    Footprint, Format, HeapKind, IndexBufferView, QueueId, RenderDevice, ResourceId, ResourceState,
    TextureDesc, TextureId, TextureUsage, VertexBufferView,
};
use crate::renderer::error::RenderError;

/// GPU-resident texture plus the persistently kept staging buffer it is refreshed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicTextureResources {
    pub texture: TextureId,
    pub upload: BufferId,
    pub footprint: Footprint,
}

/// Responsibilities:
/// - Move load-time data (vertices, indices, texels) into default-heap resources
/// - Keep those copies off the frame command lists with a private queue, allocator, list and fence
/// - Block until every upload it submits completed
pub struct ResourceManager {
    queue: QueueId,
    command_allocator: CommandAllocatorId,
    command_list: CommandListId,
    fence: FenceId,
    fence_value: u64,

    device: Arc<dyn RenderDevice>,
}

impl ResourceManager {
    pub fn new(device: Arc<dyn RenderDevice>) -> Result<Self> {
        let queue = device.create_queue()?;
        let command_allocator = device.create_command_allocator()?;
        let command_list = device.create_command_list(command_allocator)?;
        let fence = device.create_fence(0)?;

        Ok(Self {
            queue,
            command_allocator,
            command_list,
            fence,
            fence_value: 0,
            device,
        })
    }

    pub fn device(&self) -> &Arc<dyn RenderDevice> {
        &self.device
    }

    /// Records `func` into the private list, submits it and waits for it to finish.
    pub fn immediate_submit<F>(&mut self, func: F) -> Result<()>
    where
        F: FnOnce(CommandListId, &dyn RenderDevice) -> Result<()>,
    {
        let list = self.command_list;
        self.device.reset_command_allocator(self.command_allocator)?;
        self.device.reset_command_list(list, self.command_allocator)?;

        func(list, self.device.as_ref())?;

        self.device.close_command_list(list)?;
        self.device.execute_command_lists(self.queue, &[list])?;

        self.fence_value += 1;
        self.device.signal(self.queue, self.fence, self.fence_value)?;
        self.device.wait_for_fence(self.fence, self.fence_value)?;
        Ok(())
    }

    fn create_upload_buffer(&self, bytes: &[u8], name: &str) -> Result<BufferId> {
        let upload = self.device.create_buffer(&BufferDesc {
            size: bytes.len() as u64,
            heap: HeapKind::Upload,
            usage: BufferUsage::Staging,
            name: format!("{} upload", name),
        })?;
        let mapped = self.device.map_buffer(upload, &mut |mapped| mapped[..bytes.len()].copy_from_slice(bytes));
        release_on_error(self.device.as_ref(), &[ResourceId::Buffer(upload)], mapped)?;
        Ok(upload)
    }

    fn create_default_buffer(
        &mut self,
        bytes: &[u8],
        usage: BufferUsage,
        final_state: ResourceState,
        name: &str,
    ) -> Result<BufferId> {
        let device = self.device.clone();
        let buffer = device.create_buffer(&BufferDesc {
            size: bytes.len() as u64,
            heap: HeapKind::Default,
            usage,
            name: name.to_string(),
        })?;
        let owned = [ResourceId::Buffer(buffer)];
        let upload = release_on_error(device.as_ref(), &owned, self.create_upload_buffer(bytes, name))?;
        let size = bytes.len() as u64;

        let submitted = self.immediate_submit(|list, device| {
            let resource = ResourceId::Buffer(buffer);
            device.record(list, Command::Barrier(Barrier::transition(resource, ResourceState::Common, ResourceState::CopyDest)))?;
            device.record(list, Command::CopyBuffer { dst: buffer, dst_offset: 0, src: upload, src_offset: 0, size })?;
            device.record(list, Command::Barrier(Barrier::transition(resource, ResourceState::CopyDest, final_state)))?;
            Ok(())
        });
        let uploaded = submitted.and(device.destroy_buffer(upload));
        release_on_error(device.as_ref(), &owned, uploaded)?;

        log::debug!("Uploaded {} bytes into '{}'", size, name);
        Ok(buffer)
    }

    pub fn create_vertex_buffer<T: Pod>(&mut self, vertices: &[T]) -> Result<(BufferId, VertexBufferView)> {
        let bytes = bytemuck::cast_slice(vertices);
        let buffer = self.create_default_buffer(bytes, BufferUsage::Vertex, ResourceState::VertexAndConstantBuffer, "Vertex buffer")?;
        Ok((buffer, VertexBufferView {
            buffer,
            size: bytes.len() as u32,
            stride: size_of::<T>() as u32,
        }))
    }

    pub fn create_index_buffer(&mut self, indices: &[u16]) -> Result<(BufferId, IndexBufferView)> {
        let bytes = bytemuck::cast_slice(indices);
        let buffer = self.create_default_buffer(bytes, BufferUsage::Index, ResourceState::IndexBuffer, "Index buffer")?;
        Ok((buffer, IndexBufferView {
            buffer,
            size: bytes.len() as u32,
        }))
    }

    /// Creates a sampled texture and, with `pixels`, uploads tightly packed texels into it.
    /// The texels are checked against the texture size before anything is allocated.
    pub fn create_texture(&mut self, width: u32, height: u32, format: Format, pixels: Option<&[u8]>) -> Result<TextureId> {
        let desc = TextureDesc {
            width,
            height,
            format,
            usage: TextureUsage::Sampled,
            initial_state: ResourceState::CopyDest,
            name: format!("Texture {}x{}", width, height),
        };
        let footprint = self.device.copyable_footprint(&desc);
        let staged = match pixels {
            Some(pixels) => {
                let mut staged = vec![0u8; footprint.total_bytes as usize];
                write_rows(&mut staged, &footprint, pixels, width, height, format)?;
                Some(staged)
            }
            None => None,
        };

        let device = self.device.clone();
        let texture = device.create_texture(&desc)?;
        let filled = self.fill_texture(texture, footprint, staged.as_deref(), &desc.name);
        release_on_error(device.as_ref(), &[ResourceId::Texture(texture)], filled)?;
        Ok(texture)
    }

    /// Copies `staged` into a fresh texture, if given, and leaves it sampleable.
    fn fill_texture(&mut self, texture: TextureId, footprint: Footprint, staged: Option<&[u8]>, name: &str) -> Result<()> {
        let to_sampled = Barrier::transition(
            ResourceId::Texture(texture),
            ResourceState::CopyDest,
            ResourceState::PixelShaderResource,
        );
        let Some(staged) = staged else {
            return self.immediate_submit(|list, device| device.record(list, Command::Barrier(to_sampled)));
        };

        let upload = self.create_upload_buffer(staged, name)?;
        let submitted = self.immediate_submit(|list, device| {
            device.record(list, Command::CopyBufferToTexture { dst: texture, src: upload, footprint })?;
            device.record(list, Command::Barrier(to_sampled))?;
            Ok(())
        });
        submitted.and(self.device.destroy_buffer(upload))?;
        log::debug!("Uploaded texture {}x{}", footprint.width, footprint.height);
        Ok(())
    }

    pub fn create_texture_from_file(&mut self, path: &Path) -> Result<TextureId> {
        let image = image::open(path)?;
        let pixels = image.to_rgba8();
        let (width, height) = pixels.dimensions();
        log::debug!("Decoded {} ({}x{})", path.display(), width, height);
        self.create_texture(width, height, Format::Rgba8Unorm, Some(pixels.as_raw()))
    }

    /// Texture that starts out sampleable, plus a staging buffer sized for one full image.
    pub fn create_dynamic_texture_resources(&mut self, width: u32, height: u32) -> Result<DynamicTextureResources> {
        let texture = self.create_texture(width, height, Format::Rgba8Unorm, None)?;
        let staging = self.device.texture_desc(texture).and_then(|desc| {
            let footprint = self.device.copyable_footprint(&desc);
            let upload = self.device.create_buffer(&BufferDesc {
                size: footprint.total_bytes,
                heap: HeapKind::Upload,
                usage: BufferUsage::Staging,
                name: format!("Dynamic texture {}x{} upload", width, height),
            })?;
            Ok((upload, footprint))
        });
        let (upload, footprint) = release_on_error(self.device.as_ref(), &[ResourceId::Texture(texture)], staging)?;

        Ok(DynamicTextureResources {
            texture,
            upload,
            footprint,
        })
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        let results = [
            self.device.destroy_fence(self.fence),
            self.device.destroy_command_list(self.command_list),
            self.device.destroy_command_allocator(self.command_allocator),
            self.device.destroy_queue(self.queue),
        ];
        for result in results {
            if let Err(e) = result {
                log::error!("Failed to release upload queue objects: {}", e);
            }
        }
    }
}

/// Hands `result` back unchanged, destroying `objects` first when it is an error.
pub(crate) fn release_on_error<T>(device: &dyn RenderDevice, objects: &[ResourceId], result: Result<T>) -> Result<T> {
    if result.is_err() {
        for &object in objects {
            let released = match object {
                ResourceId::Buffer(buffer) => device.destroy_buffer(buffer),
                ResourceId::Texture(texture) => device.destroy_texture(texture),
            };
            if let Err(e) = released {
                log::error!("Failed to release {:?} after a failed creation: {}", object, e);
            }
        }
    }
    result
}

/// Copies tightly packed `width`x`height` texels into a staging area laid out as `footprint`.
/// The source may be smaller than the texture; uncovered texels keep their previous bytes.
pub fn write_rows(
    dst: &mut [u8],
    footprint: &Footprint,
    src: &[u8],
    width: u32,
    height: u32,
    format: Format,
) -> Result<(), RenderError> {
    if width > footprint.width || height > footprint.height {
        return Err(RenderError::ImageTooLarge {
            src_width: width,
            src_height: height,
            width: footprint.width,
            height: footprint.height,
        });
    }
    let src_pitch = (width * format.bytes_per_pixel()) as usize;
    let expected = src_pitch * height as usize;
    if src.len() != expected {
        return Err(RenderError::ImageDataSize { expected, actual: src.len() });
    }

    for (row, bytes) in src.chunks_exact(src_pitch.max(1)).enumerate().take(height as usize) {
        let start = footprint.offset as usize + row * footprint.row_pitch as usize;
        dst[start..start + src_pitch].copy_from_slice(bytes);
    }
    Ok(())
}

/// Records the copy of a dynamic texture's staging buffer, bracketed by the transitions that take
/// the texture out of and back into the sampled state.
pub fn record_texture_update(
    device: &dyn RenderDevice,
    list: CommandListId,
    resources: &DynamicTextureResources,
) -> Result<()> {
    let texture = ResourceId::Texture(resources.texture);
    device.record(list, Command::Barrier(Barrier::transition(texture, ResourceState::PixelShaderResource, ResourceState::CopyDest)))?;
    device.record(list, Command::CopyBufferToTexture {
        dst: resources.texture,
        src: resources.upload,
        footprint: resources.footprint,
    })?;
    device.record(list, Command::Barrier(Barrier::transition(texture, ResourceState::CopyDest, ResourceState::PixelShaderResource)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::core::headless::HeadlessDevice;

    #[test]
    fn vertex_upload_lands_in_vertex_state() {
        let device = Arc::new(HeadlessDevice::new());
        let mut manager = ResourceManager::new(device.clone()).unwrap();
        let (buffer, view) = manager.create_vertex_buffer(&[[1.0f32, 2.0, 3.0]; 4]).unwrap();
        assert_eq!(view.size, 48);
        assert_eq!(view.stride, 12);
        assert_eq!(
            device.resource_state(ResourceId::Buffer(buffer)).unwrap(),
            ResourceState::VertexAndConstantBuffer
        );
        assert_eq!(device.pending_op_count().unwrap(), 0);
        device.destroy_buffer(buffer).unwrap();
    }

    #[test]
    fn texture_upload_is_row_pitch_aware() {
        let device = Arc::new(HeadlessDevice::new());
        let mut manager = ResourceManager::new(device.clone()).unwrap();
        let pixels: Vec<u8> = (0..(3 * 2 * 4)).map(|i| i as u8).collect();
        let texture = manager.create_texture(3, 2, Format::Rgba8Unorm, Some(&pixels)).unwrap();

        assert_eq!(device.read_texture(texture).unwrap(), pixels);
        assert_eq!(
            device.resource_state(ResourceId::Texture(texture)).unwrap(),
            ResourceState::PixelShaderResource
        );
        device.destroy_texture(texture).unwrap();
    }

    #[test]
    fn texels_of_the_wrong_size_allocate_nothing() {
        let device = Arc::new(HeadlessDevice::new());
        let mut manager = ResourceManager::new(device.clone()).unwrap();
        let live = device.live_object_count();

        let err = manager.create_texture(2, 2, Format::Rgba8Unorm, Some(&[0u8; 3])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::ImageDataSize { expected: 16, actual: 3 })
        ));
        assert_eq!(device.live_object_count(), live);
    }

    #[test]
    fn failed_steps_release_what_they_were_handed() {
        let device = Arc::new(HeadlessDevice::new());
        let buffer = device.create_buffer(&BufferDesc {
            size: 16,
            heap: HeapKind::Default,
            usage: BufferUsage::Vertex,
            name: "scratch".into(),
        }).unwrap();
        let texture = device.create_texture(&TextureDesc {
            width: 2,
            height: 2,
            format: Format::Rgba8Unorm,
            usage: TextureUsage::Sampled,
            initial_state: ResourceState::CopyDest,
            name: "scratch".into(),
        }).unwrap();
        let live = device.live_object_count();
        let owned = [ResourceId::Buffer(buffer), ResourceId::Texture(texture)];

        assert_eq!(release_on_error(device.as_ref(), &owned, Ok(7)).unwrap(), 7);
        assert_eq!(device.live_object_count(), live);

        let failed: Result<()> = Err(RenderError::NotDynamic.into());
        let err = release_on_error(device.as_ref(), &owned, failed).unwrap_err();
        assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::NotDynamic)));
        assert_eq!(device.live_object_count(), live - 2);
    }

    #[test]
    fn oversized_images_are_rejected() {
        let footprint = Footprint::for_texture(&TextureDesc {
            width: 4,
            height: 4,
            format: Format::Rgba8Unorm,
            usage: TextureUsage::Sampled,
            initial_state: ResourceState::CopyDest,
            name: "small".into(),
        });
        let mut staged = vec![0u8; footprint.total_bytes as usize];
        let pixels = vec![0u8; 8 * 8 * 4];
        assert!(matches!(
            write_rows(&mut staged, &footprint, &pixels, 8, 8, Format::Rgba8Unorm),
            Err(RenderError::ImageTooLarge { .. })
        ));
        assert!(matches!(
            write_rows(&mut staged, &footprint, &pixels[..10], 2, 2, Format::Rgba8Unorm),
            Err(RenderError::ImageDataSize { expected: 16, actual: 10 })
        ));
    }
}
