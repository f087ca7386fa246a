use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use color_eyre::Result;
use slotmap::SlotMap;
use crate::renderer::contexts::resource_ctx::resource_manager::{
    record_texture_update, release_on_error, write_rows, DynamicTextureResources, ResourceManager,
};
use crate::renderer::core::{CommandListId, CpuDescriptorHandle, Format, RenderDevice, ResourceId, TextureId, ViewDesc};
use crate::renderer::error::{PoolExhausted, RenderError};
use crate::renderer::internals::descriptor_allocator::DescriptorAllocator;

slotmap::new_key_type! {
    pub struct TextureHandle;
}

/// Whether a dynamic texture's staging buffer holds texels the GPU copy has not seen yet.
///
/// `Clean --update_texture_with_image--> Dirty --record_pending_upload--> Clean`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Clean,
    Dirty,
}

struct DynamicUpload {
    resources: DynamicTextureResources,
    state: UploadState,
}

struct TextureEntry {
    texture: TextureId,
    srv: CpuDescriptorHandle,
    width: u32,
    height: u32,
    ref_count: u32,
    path: Option<PathBuf>,
    dynamic: Option<DynamicUpload>,
}

/// Responsibilities:
/// - Hand out reference-counted texture handles, de-duplicating file textures by path
/// - Own the persistent descriptor heap texture views live in
/// - Track dynamic textures' staging buffers and upload state
pub struct TextureManager {
    entries: SlotMap<TextureHandle, TextureEntry>,
    by_path: HashMap<PathBuf, TextureHandle>,
    descriptors: DescriptorAllocator,

    device: Arc<dyn RenderDevice>,
}

impl TextureManager {
    pub fn new(max_descriptor_count: u32, device: Arc<dyn RenderDevice>) -> Result<Self> {
        Ok(Self {
            entries: SlotMap::with_key(),
            by_path: HashMap::new(),
            descriptors: DescriptorAllocator::new(max_descriptor_count, device.clone())?,
            device,
        })
    }

    fn insert(
        &mut self,
        texture: TextureId,
        path: Option<PathBuf>,
        dynamic: Option<DynamicTextureResources>,
    ) -> Result<TextureHandle> {
        // The new entry takes ownership of these; until then a failure destroys them.
        let mut owned = vec![ResourceId::Texture(texture)];
        owned.extend(dynamic.map(|resources| ResourceId::Buffer(resources.upload)));

        let srv: Result<_> = self.descriptors.allocate().ok_or_else(|| {
            PoolExhausted {
                pool: "persistent descriptor heap",
                requested: 1,
                available: 0,
                capacity: self.descriptors.capacity(),
            }
            .into()
        });
        let srv = release_on_error(self.device.as_ref(), &owned, srv)?;

        let desc = self
            .device
            .create_view(&ViewDesc::Texture { texture }, srv)
            .and_then(|()| self.device.texture_desc(texture));
        if desc.is_err() {
            if let Err(e) = self.descriptors.free(srv) {
                log::error!("Failed to free texture descriptor: {}", e);
            }
        }
        let desc = release_on_error(self.device.as_ref(), &owned, desc)?;

        Ok(self.entries.insert(TextureEntry {
            texture,
            srv,
            width: desc.width,
            height: desc.height,
            ref_count: 1,
            path,
            dynamic: dynamic.map(|resources| DynamicUpload {
                resources,
                state: UploadState::Clean,
            }),
        }))
    }

    pub fn create_texture_from_file(&mut self, resources: &mut ResourceManager, path: &Path) -> Result<TextureHandle> {
        let key = std::fs::canonicalize(path)?;
        if let Some(&handle) = self.by_path.get(&key) {
            self.entries[handle].ref_count += 1;
            return Ok(handle);
        }

        let texture = resources.create_texture_from_file(&key)?;
        let handle = self.insert(texture, Some(key.clone()), None)?;
        self.by_path.insert(key, handle);
        log::info!("Loaded texture {}", path.display());
        Ok(handle)
    }

    pub fn create_dynamic_texture(&mut self, resources: &mut ResourceManager, width: u32, height: u32) -> Result<TextureHandle> {
        let dynamic = resources.create_dynamic_texture_resources(width, height)?;
        self.insert(dynamic.texture, None, Some(dynamic))
    }

    pub fn create_static_texture(
        &mut self,
        resources: &mut ResourceManager,
        width: u32,
        height: u32,
        format: Format,
        pixels: &[u8],
    ) -> Result<TextureHandle> {
        let texture = resources.create_texture(width, height, format, Some(pixels))?;
        self.insert(texture, None, None)
    }

    /// Writes `pixels` into the staging buffer of a dynamic texture. The GPU copy is deferred until
    /// the texture is next drawn.
    ///
    /// There is one staging buffer per texture and it is written immediately, without waiting on the
    /// frames in flight. A copy recorded by a frame the GPU has not finished yet reads whatever this
    /// call leaves behind.
    pub fn update_texture_with_image(&mut self, handle: TextureHandle, pixels: &[u8], width: u32, height: u32) -> Result<()> {
        let entry = self.entries.get_mut(handle).ok_or(RenderError::InvalidHandle("texture"))?;
        let dynamic = entry.dynamic.as_mut().ok_or(RenderError::NotDynamic)?;
        let footprint = dynamic.resources.footprint;

        let mut result = Ok(());
        self.device.map_buffer(dynamic.resources.upload, &mut |mapped| {
            result = write_rows(mapped, &footprint, pixels, width, height, Format::Rgba8Unorm);
        })?;
        result?;

        dynamic.state = UploadState::Dirty;
        Ok(())
    }

    /// Records the deferred copy of a dirty dynamic texture into `list`. Returns whether a copy was
    /// recorded.
    pub fn record_pending_upload(&mut self, handle: TextureHandle, list: CommandListId) -> Result<bool> {
        let entry = self.entries.get_mut(handle).ok_or(RenderError::InvalidHandle("texture"))?;
        let Some(dynamic) = entry.dynamic.as_mut() else {
            return Ok(false);
        };
        if dynamic.state == UploadState::Clean {
            return Ok(false);
        }
        record_texture_update(self.device.as_ref(), list, &dynamic.resources)?;
        dynamic.state = UploadState::Clean;
        Ok(true)
    }

    pub fn add_ref(&mut self, handle: TextureHandle) -> Result<()> {
        let entry = self.entries.get_mut(handle).ok_or(RenderError::InvalidHandle("texture"))?;
        entry.ref_count += 1;
        Ok(())
    }

    /// Drops one reference. At zero the GPU objects are destroyed, so the caller must have waited
    /// for every frame that could still sample the texture. Returns whether it was destroyed.
    pub fn release(&mut self, handle: TextureHandle) -> Result<bool> {
        // Entries leave the map when their count reaches zero, so a stale handle is a double free.
        let entry = self.entries.get_mut(handle).ok_or(RenderError::DoubleFree("texture"))?;
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(false);
        }

        let entry = self.entries.remove(handle).ok_or(RenderError::InvalidHandle("texture"))?;
        if let Some(path) = &entry.path {
            self.by_path.remove(path);
        }
        self.destroy_entry(entry)?;
        Ok(true)
    }

    fn destroy_entry(&mut self, entry: TextureEntry) -> Result<()> {
        self.descriptors.free(entry.srv)?;
        if let Some(dynamic) = entry.dynamic {
            self.device.destroy_buffer(dynamic.resources.upload)?;
        }
        self.device.destroy_texture(entry.texture)?;
        Ok(())
    }

    pub fn srv(&self, handle: TextureHandle) -> Result<CpuDescriptorHandle, RenderError> {
        Ok(self.entries.get(handle).ok_or(RenderError::InvalidHandle("texture"))?.srv)
    }

    pub fn texture(&self, handle: TextureHandle) -> Result<TextureId, RenderError> {
        Ok(self.entries.get(handle).ok_or(RenderError::InvalidHandle("texture"))?.texture)
    }

    pub fn size(&self, handle: TextureHandle) -> Result<(u32, u32), RenderError> {
        let entry = self.entries.get(handle).ok_or(RenderError::InvalidHandle("texture"))?;
        Ok((entry.width, entry.height))
    }

    pub fn ref_count(&self, handle: TextureHandle) -> Option<u32> {
        self.entries.get(handle).map(|entry| entry.ref_count)
    }

    pub fn upload_state(&self, handle: TextureHandle) -> Option<UploadState> {
        self.entries.get(handle)?.dynamic.as_ref().map(|dynamic| dynamic.state)
    }

    pub fn is_file_cached(&self, path: &Path) -> bool {
        std::fs::canonicalize(path)
            .map(|key| self.by_path.contains_key(&key))
            .unwrap_or(false)
    }

    pub fn live_count(&self) -> usize {
        self.entries.len()
    }

    /// Destroys whatever is still alive. Live entries at this point are leaks and are reported as
    /// `ResourceLeak` after they are released.
    pub fn shutdown(&mut self) -> Result<()> {
        let leaked = self.entries.len();
        let handles = self.entries.keys().collect::<Vec<_>>();
        for handle in handles {
            if let Some(entry) = self.entries.remove(handle) {
                self.destroy_entry(entry)?;
            }
        }
        self.by_path.clear();

        let descriptors = self.descriptors.allocated_count();
        if descriptors > 0 {
            log::error!("{} persistent descriptors outlived their textures", descriptors);
            return Err(RenderError::ResourceLeak { what: "persistent descriptors", count: descriptors as usize }.into());
        }
        if leaked > 0 {
            log::error!("{} textures were never deleted", leaked);
            return Err(RenderError::ResourceLeak { what: "textures", count: leaked }.into());
        }
        Ok(())
    }
}

/// Checkerboard of (r, g, b) and black texels, one texel per square, opaque.
pub fn tiled_image(width: u32, height: u32, r: u8, g: u8, b: u8) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            if (y % 2 + x) % 2 == 0 {
                pixels.extend_from_slice(&[r, g, b, 255]);
            } else {
                pixels.extend_from_slice(&[0, 0, 0, 255]);
            }
        }
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::core::headless::HeadlessDevice;

    fn setup() -> (Arc<HeadlessDevice>, ResourceManager, TextureManager) {
        let device = Arc::new(HeadlessDevice::new());
        let resources = ResourceManager::new(device.clone()).unwrap();
        let textures = TextureManager::new(16, device.clone()).unwrap();
        (device, resources, textures)
    }

    #[test]
    fn updates_mark_dirty_and_upload_once() {
        let (device, mut resources, mut textures) = setup();
        let handle = textures.create_dynamic_texture(&mut resources, 4, 4).unwrap();
        assert_eq!(textures.upload_state(handle), Some(UploadState::Clean));

        let pixels = vec![7u8; 4 * 4 * 4];
        textures.update_texture_with_image(handle, &pixels, 4, 4).unwrap();
        textures.update_texture_with_image(handle, &pixels, 4, 4).unwrap();
        assert_eq!(textures.upload_state(handle), Some(UploadState::Dirty));

        let allocator = device.create_command_allocator().unwrap();
        let list = device.create_command_list(allocator).unwrap();
        device.reset_command_list(list, allocator).unwrap();
        assert!(textures.record_pending_upload(handle, list).unwrap());
        assert!(!textures.record_pending_upload(handle, list).unwrap());
        assert_eq!(textures.upload_state(handle), Some(UploadState::Clean));
        assert_eq!(device.texture_copy_count(textures.texture(handle).unwrap()).unwrap(), 1);

        device.close_command_list(list).unwrap();
        textures.release(handle).unwrap();
    }

    #[test]
    fn static_textures_cannot_be_updated() {
        let (_device, mut resources, mut textures) = setup();
        let pixels = tiled_image(2, 2, 255, 0, 0);
        let handle = textures
            .create_static_texture(&mut resources, 2, 2, Format::Rgba8Unorm, &pixels)
            .unwrap();
        let err = textures.update_texture_with_image(handle, &pixels, 2, 2).unwrap_err();
        assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::NotDynamic)));
        textures.release(handle).unwrap();
    }

    #[test]
    fn shared_handles_count_references() {
        let (_device, mut resources, mut textures) = setup();
        let handle = textures.create_dynamic_texture(&mut resources, 2, 2).unwrap();
        textures.add_ref(handle).unwrap();
        assert_eq!(textures.ref_count(handle), Some(2));
        assert!(!textures.release(handle).unwrap());
        assert!(textures.release(handle).unwrap());
        let err = textures.release(handle).unwrap_err();
        assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::DoubleFree("texture"))));
        assert_eq!(textures.live_count(), 0);
    }

    #[test]
    fn shutdown_reports_leaks() {
        let (_device, mut resources, mut textures) = setup();
        textures.create_dynamic_texture(&mut resources, 2, 2).unwrap();
        let err = textures.shutdown().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::ResourceLeak { what: "textures", count: 1 })
        ));
        assert_eq!(textures.live_count(), 0);
    }

    #[test]
    fn full_descriptor_heap_releases_the_new_texture() {
        let device = Arc::new(HeadlessDevice::new());
        let mut resources = ResourceManager::new(device.clone()).unwrap();
        let mut textures = TextureManager::new(1, device.clone()).unwrap();
        let pixels = tiled_image(2, 2, 0, 255, 0);
        let first = textures
            .create_static_texture(&mut resources, 2, 2, Format::Rgba8Unorm, &pixels)
            .unwrap();
        let live = device.live_object_count();

        let err = textures
            .create_static_texture(&mut resources, 2, 2, Format::Rgba8Unorm, &pixels)
            .unwrap_err();
        assert_eq!(err.downcast_ref::<PoolExhausted>().map(|e| e.capacity), Some(1));
        assert_eq!(device.live_object_count(), live);

        // Dynamic textures also own a staging buffer.
        assert!(textures.create_dynamic_texture(&mut resources, 4, 4).is_err());
        assert_eq!(device.live_object_count(), live);
        assert_eq!(textures.live_count(), 1);

        textures.release(first).unwrap();
        textures.shutdown().unwrap();
    }

    #[test]
    fn tiled_image_alternates_per_row() {
        let pixels = tiled_image(2, 2, 10, 20, 30);
        assert_eq!(&pixels[0..4], &[10, 20, 30, 255]);
        assert_eq!(&pixels[4..8], &[0, 0, 0, 255]);
        assert_eq!(&pixels[8..12], &[0, 0, 0, 255]);
        assert_eq!(&pixels[12..16], &[10, 20, 30, 255]);
    }
}
