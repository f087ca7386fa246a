pub mod resource_manager;
pub mod texture_manager;

use std::sync::Arc;
use color_eyre::Result;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::resource_ctx::resource_manager::ResourceManager;
use crate::renderer::contexts::resource_ctx::texture_manager::TextureManager;
use crate::renderer::core::RenderDevice;

/// Responsibilities:
/// - Upload buffers and textures at load time
/// - Manage texture lifetimes and their persistent descriptors
pub struct RenderResourceContext {
    // Declared first: textures are released before the upload queue goes away.
    pub textures: TextureManager,
    pub uploads: ResourceManager,
}

impl RenderResourceContext {
    pub fn new(config: &RenderConfig, device: Arc<dyn RenderDevice>) -> Result<Self> {
        Ok(Self {
            textures: TextureManager::new(config.max_descriptor_count, device.clone())?,
            uploads: ResourceManager::new(device)?,
        })
    }
}
