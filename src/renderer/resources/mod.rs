/// "Resources" refers to the drawable objects applications create through the renderer.
/// They record their draws into the current frame context.

pub mod mesh;
pub mod sprite;
pub mod vertex;

use std::path::PathBuf;
use color_eyre::Result;
use glam::{Mat4, Vec2};
use crate::renderer::contexts::frame_ctx::frame::FrameContext;
use crate::renderer::contexts::resource_ctx::texture_manager::{TextureHandle, TextureManager};
use crate::renderer::contexts::resource_ctx::RenderResourceContext;
use crate::renderer::core::{PipelineId, RenderDevice};

slotmap::new_key_type! {
    pub struct MeshHandle;
    pub struct SpriteHandle;
}

/// Where a mesh tri-group or sprite gets its texture from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextureSource {
    /// Loaded through the texture manager, shared with every other user of the same file.
    File(PathBuf),
    /// An existing texture; the object holds its own reference.
    Shared(TextureHandle),
}

impl TextureSource {
    pub(crate) fn acquire(&self, resources: &mut RenderResourceContext) -> Result<TextureHandle> {
        match self {
            TextureSource::File(path) => resources.textures.create_texture_from_file(&mut resources.uploads, path),
            TextureSource::Shared(handle) => {
                resources.textures.add_ref(*handle)?;
                Ok(*handle)
            }
        }
    }
}

/// What a draw records against: the current frame's pools and list, plus the state shared by
/// every object of one draw kind.
pub struct DrawContext<'a> {
    pub device: &'a dyn RenderDevice,
    pub frame: &'a mut FrameContext,
    pub textures: &'a TextureManager,
    pub pipeline: PipelineId,
    /// Sampled by tri-groups without a texture.
    pub fallback_texture: TextureHandle,
    pub view: Mat4,
    pub projection: Mat4,
    pub screen_size: Vec2,
}
