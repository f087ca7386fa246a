pub mod camera;
pub mod config;
pub mod core;
pub mod error;

pub mod contexts;
pub mod shader_data;
pub mod resources;
pub mod internals;

use std::path::Path;
use std::sync::Arc;
use color_eyre::Result;
use glam::{Mat4, Vec2, Vec3};
use slotmap::SlotMap;
use crate::renderer::camera::Camera;
use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::RenderDeviceContext;
use crate::renderer::contexts::frame_ctx::RenderFrameContext;
use crate::renderer::contexts::pipeline_ctx::{DrawKind, RenderPipelineContext};
use crate::renderer::contexts::resource_ctx::texture_manager::{tiled_image, TextureHandle, TextureManager};
use crate::renderer::contexts::resource_ctx::RenderResourceContext;
use crate::renderer::core::{Barrier, Command, Format, PipelineId, RenderDevice, ResourceId, ResourceState};
use crate::renderer::error::{PoolExhausted, RenderError};
use crate::renderer::resources::mesh::{MeshDesc, MeshObject};
use crate::renderer::resources::sprite::{SpriteObject, TextureRect};
use crate::renderer::resources::{DrawContext, MeshHandle, SpriteHandle, TextureSource};

/// Where the renderer is in the `begin_render → end_render → present` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    Recording,
    Submitted,
}

/// Outcome of a draw call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawStatus {
    Recorded,
    /// A per-frame pool ran out; the draw was not recorded this frame.
    Dropped(PoolExhausted),
    /// Nothing to draw, e.g. a sprite without a texture.
    Skipped,
}

pub struct Renderer {
    meshes: SlotMap<MeshHandle, MeshObject>,
    sprites: SlotMap<SpriteHandle, SpriteObject>,

    // Contexts drop in this order: everything recorded into frames goes before the device.
    pip: RenderPipelineContext,
    frm: RenderFrameContext,
    res: RenderResourceContext,
    dev: RenderDeviceContext,

    camera: Camera,
    config: RenderConfig,
    phase: FramePhase,
    // 1x1 white, sampled by tri-groups without a texture.
    fallback_texture: TextureHandle,
    released: bool,
}

impl Renderer {
    pub fn new(
        device: Arc<dyn RenderDevice>,
        config: RenderConfig,
        format: Format,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        config.validate()?;
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidWindowSize { width, height }.into());
        }

        let dev = RenderDeviceContext::new(&config, format, width, height, device.clone())?;
        let frm = RenderFrameContext::new(&config, dev.queue, device.clone())?;
        let mut res = RenderResourceContext::new(&config, device.clone())?;
        let pip = RenderPipelineContext::new(format, device);

        let fallback_texture = res.textures.create_static_texture(
            &mut res.uploads,
            1,
            1,
            Format::Rgba8Unorm,
            &[255, 255, 255, 255],
        )?;

        log::info!(
            "Renderer initialized: {} frame contexts, {} swap-chain buffers",
            frm.frame_count(),
            config.swap_chain_frame_count
        );

        Ok(Self {
            meshes: SlotMap::with_key(),
            sprites: SlotMap::with_key(),
            pip,
            frm,
            res,
            dev,
            camera: Camera::new(width, height),
            config,
            phase: FramePhase::Idle,
            fallback_texture,
            released: false,
        })
    }

    fn expect_phase(&self, operation: &'static str, expected: FramePhase) -> Result<(), RenderError> {
        if self.phase != expected {
            return Err(RenderError::OutOfOrder { operation, actual: self.phase });
        }
        Ok(())
    }

    fn expect_outside_recording(&self, operation: &'static str) -> Result<(), RenderError> {
        if self.phase == FramePhase::Recording {
            return Err(RenderError::OutOfOrder { operation, actual: self.phase });
        }
        Ok(())
    }

    pub fn begin_render(&mut self) -> Result<()> {
        self.expect_phase("begin_render", FramePhase::Idle)?;
        let device = self.dev.device.as_ref();
        let target = &self.dev.target;
        let frame = self.frm.current();

        // Allocator first: resetting the list reuses the allocator's memory.
        device.reset_command_allocator(frame.command_allocator)?;
        device.reset_command_list(frame.command_list, frame.command_allocator)?;

        let list = frame.command_list;
        let back_buffer = target.back_buffer()?;
        device.record(list, Command::Barrier(Barrier::transition(
            ResourceId::Texture(back_buffer),
            ResourceState::Present,
            ResourceState::RenderTarget,
        )))?;
        device.record(list, Command::ClearRenderTarget {
            target: back_buffer,
            color: self.config.clear_color,
        })?;
        device.record(list, Command::ClearDepth {
            target: target.depth,
            depth: 1.0,
        })?;
        device.record(list, Command::SetViewport(target.viewport))?;
        device.record(list, Command::SetScissor(target.scissor))?;
        device.record(list, Command::SetRenderTargets {
            color: back_buffer,
            depth: Some(target.depth),
        })?;

        log::trace!("Recording frame context {}", self.frm.current_index());
        self.phase = FramePhase::Recording;
        Ok(())
    }

    pub fn end_render(&mut self) -> Result<()> {
        self.expect_phase("end_render", FramePhase::Recording)?;
        let device = self.dev.device.as_ref();
        let list = self.frm.current().command_list;

        let back_buffer = self.dev.target.back_buffer()?;
        device.record(list, Command::Barrier(Barrier::transition(
            ResourceId::Texture(back_buffer),
            ResourceState::RenderTarget,
            ResourceState::Present,
        )))?;
        device.close_command_list(list)?;
        device.execute_command_lists(self.dev.queue, &[list])?;

        self.phase = FramePhase::Submitted;
        Ok(())
    }

    /// Presents the submitted frame and moves to the next frame context, waiting until the GPU
    /// retired that context's previous frame.
    pub fn present(&mut self) -> Result<()> {
        self.expect_phase("present", FramePhase::Submitted)?;
        let fence_value = self.frm.set_fence()?;
        self.dev.target.present(self.config.vsync)?;
        self.frm.advance()?;

        log::trace!("Presented frame {}", fence_value);
        self.phase = FramePhase::Idle;
        Ok(())
    }

    /// Returns `Ok(false)` when the size is unchanged.
    pub fn update_window_size(&mut self, width: u32, height: u32) -> Result<bool> {
        self.expect_phase("update_window_size", FramePhase::Idle)?;
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidWindowSize { width, height }.into());
        }
        let target = &self.dev.target;
        if target.width == width && target.height == height {
            return Ok(false);
        }

        // Any frame context may still reference the old back buffers, not just the next one.
        self.frm.wait_for_gpu_idle()?;
        self.dev.target.resize(width, height)?;
        self.camera.set_viewport_size(width, height);

        log::info!("Resized render target to {}x{}", width, height);
        Ok(true)
    }

    pub fn create_mesh_object(&mut self, desc: &MeshDesc) -> Result<MeshHandle> {
        let mesh = MeshObject::new(desc, &mut self.res)?;
        if let Err(e) = self.pip.acquire(DrawKind::Mesh, &mut self.res.uploads) {
            mesh.destroy(&mut self.res, self.dev.device.as_ref())?;
            return Err(e);
        }
        Ok(self.meshes.insert(mesh))
    }

    pub fn delete_mesh_object(&mut self, handle: MeshHandle) -> Result<()> {
        self.expect_outside_recording("delete_mesh_object")?;
        let mesh = self.meshes.remove(handle).ok_or(RenderError::InvalidHandle("mesh"))?;
        self.frm.wait_for_gpu_idle()?;
        mesh.destroy(&mut self.res, self.dev.device.as_ref())?;
        self.pip.release(DrawKind::Mesh)
    }

    /// Draws `handle` with `world` into the current frame. `texture` replaces the mesh's own
    /// textures on every tri-group.
    pub fn render_mesh_object(
        &mut self,
        handle: MeshHandle,
        world: Mat4,
        texture: Option<TextureHandle>,
    ) -> Result<DrawStatus> {
        self.expect_phase("render_mesh_object", FramePhase::Recording)?;
        let mesh = self.meshes.get(handle).ok_or(RenderError::InvalidHandle("mesh"))?;
        let list = self.frm.current().command_list;

        match texture {
            Some(texture) => {
                self.res.textures.record_pending_upload(texture, list)?;
            }
            None => {
                for texture in mesh.textures() {
                    self.res.textures.record_pending_upload(texture, list)?;
                }
            }
        }

        let pipeline = self.pip.pipeline(DrawKind::Mesh)?;
        let mut ctx = draw_context(&self.dev, &mut self.frm, &self.res, pipeline, self.fallback_texture);
        ctx.view = self.camera.get_view_mat();
        ctx.projection = self.camera.get_proj_mat();
        let status = mesh.draw(&mut ctx, world, texture)?;
        log_dropped("mesh", &status);
        Ok(status)
    }

    /// A sprite without a texture of its own, drawn with `render_sprite_with_texture`.
    pub fn create_sprite_object(&mut self) -> Result<SpriteHandle> {
        self.pip.acquire(DrawKind::Sprite, &mut self.res.uploads)?;
        Ok(self.sprites.insert(SpriteObject::new()))
    }

    /// A sprite drawing `rect` of `source`, or all of it when `rect` is `None`.
    pub fn create_sprite_object_with_texture(
        &mut self,
        source: &TextureSource,
        rect: Option<TextureRect>,
    ) -> Result<SpriteHandle> {
        let sprite = SpriteObject::new_textured(source, rect, &mut self.res)?;
        if let Err(e) = self.pip.acquire(DrawKind::Sprite, &mut self.res.uploads) {
            sprite.destroy(&mut self.res)?;
            return Err(e);
        }
        Ok(self.sprites.insert(sprite))
    }

    pub fn delete_sprite_object(&mut self, handle: SpriteHandle) -> Result<()> {
        self.expect_outside_recording("delete_sprite_object")?;
        let sprite = self.sprites.remove(handle).ok_or(RenderError::InvalidHandle("sprite"))?;
        self.frm.wait_for_gpu_idle()?;
        sprite.destroy(&mut self.res)?;
        self.pip.release(DrawKind::Sprite)
    }

    /// Draws the sprite's own texture at pixel position (`x`, `y`), stretched to `width` x `height`.
    /// Non-positive sizes draw the texture region at its own size.
    pub fn render_sprite(
        &mut self,
        handle: SpriteHandle,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        z: f32,
    ) -> Result<DrawStatus> {
        self.expect_phase("render_sprite", FramePhase::Recording)?;
        let sprite = self.sprites.get(handle).ok_or(RenderError::InvalidHandle("sprite"))?;
        if let Some(texture) = sprite.texture() {
            let list = self.frm.current().command_list;
            self.res.textures.record_pending_upload(texture, list)?;
        }

        let quad = self.pip.sprite_quad()?;
        let pipeline = self.pip.pipeline(DrawKind::Sprite)?;
        let mut ctx = draw_context(&self.dev, &mut self.frm, &self.res, pipeline, self.fallback_texture);
        let status = sprite.draw(&mut ctx, &quad, pixel_pos(x, y), pixel_pos(width, height), z)?;
        log_dropped("sprite", &status);
        Ok(status)
    }

    /// Draws `rect` of `texture` (all of it when `None`) through `handle`, uploading the texture
    /// first if it is a dynamic texture with pending changes.
    #[allow(clippy::too_many_arguments)]
    pub fn render_sprite_with_texture(
        &mut self,
        handle: SpriteHandle,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        rect: Option<TextureRect>,
        z: f32,
        texture: TextureHandle,
    ) -> Result<DrawStatus> {
        self.expect_phase("render_sprite_with_texture", FramePhase::Recording)?;
        if !self.sprites.contains_key(handle) {
            return Err(RenderError::InvalidHandle("sprite").into());
        }
        let list = self.frm.current().command_list;
        self.res.textures.record_pending_upload(texture, list)?;

        let quad = self.pip.sprite_quad()?;
        let pipeline = self.pip.pipeline(DrawKind::Sprite)?;
        let mut ctx = draw_context(&self.dev, &mut self.frm, &self.res, pipeline, self.fallback_texture);
        let status = SpriteObject::draw_with_texture(
            &mut ctx,
            &quad,
            pixel_pos(x, y),
            pixel_pos(width, height),
            rect,
            z,
            texture,
        )?;
        log_dropped("sprite", &status);
        Ok(status)
    }

    pub fn create_texture_from_file(&mut self, path: impl AsRef<Path>) -> Result<TextureHandle> {
        self.res.textures.create_texture_from_file(&mut self.res.uploads, path.as_ref())
    }

    pub fn create_dynamic_texture(&mut self, width: u32, height: u32) -> Result<TextureHandle> {
        self.res.textures.create_dynamic_texture(&mut self.res.uploads, width, height)
    }

    pub fn create_static_texture(&mut self, width: u32, height: u32, format: Format, pixels: &[u8]) -> Result<TextureHandle> {
        self.res.textures.create_static_texture(&mut self.res.uploads, width, height, format, pixels)
    }

    /// Checkerboard of (`r`, `g`, `b`) and black texels.
    pub fn create_tiled_texture(&mut self, width: u32, height: u32, r: u8, g: u8, b: u8) -> Result<TextureHandle> {
        let pixels = tiled_image(width, height, r, g, b);
        self.create_static_texture(width, height, Format::Rgba8Unorm, &pixels)
    }

    /// Stages `pixels` for a dynamic texture. The GPU copy happens when the texture is next drawn.
    pub fn update_texture_with_image(&mut self, texture: TextureHandle, pixels: &[u8], width: u32, height: u32) -> Result<()> {
        self.res.textures.update_texture_with_image(texture, pixels, width, height)
    }

    pub fn delete_texture(&mut self, texture: TextureHandle) -> Result<()> {
        self.expect_outside_recording("delete_texture")?;
        self.frm.wait_for_gpu_idle()?;
        self.res.textures.release(texture)?;
        Ok(())
    }

    pub fn set_camera_pos(&mut self, x: f32, y: f32, z: f32) {
        self.camera.set_position(Vec3::new(x, y, z));
    }

    pub fn move_camera(&mut self, dx: f32, dy: f32, dz: f32) {
        self.camera.translate(Vec3::new(dx, dy, dz));
    }

    pub fn camera_pos(&self) -> Vec3 {
        self.camera.get_position()
    }

    pub fn view_proj_matrices(&self) -> (Mat4, Mat4) {
        (self.camera.get_view_mat(), self.camera.get_proj_mat())
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn window_size(&self) -> (u32, u32) {
        (self.dev.target.width, self.dev.target.height)
    }

    pub fn device(&self) -> &Arc<dyn RenderDevice> {
        &self.dev.device
    }

    pub fn textures(&self) -> &TextureManager {
        &self.res.textures
    }

    pub fn frames(&self) -> &RenderFrameContext {
        &self.frm
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn sprite_count(&self) -> usize {
        self.sprites.len()
    }

    /// Waits for the GPU and releases everything. Objects the application never deleted are
    /// reported as `ResourceLeak` after they are released.
    pub fn shutdown(mut self) -> Result<()> {
        let released = self.release_all();
        let device = self.dev.device.clone();
        drop(self);

        let live = device.live_object_count();
        if live != 0 {
            log::error!("{} device objects still alive after shutdown", live);
            debug_assert!(live == 0, "{} device objects leaked", live);
            released?;
            return Err(RenderError::ResourceLeak { what: "device objects", count: live }.into());
        }
        log::info!("Renderer shut down");
        released
    }

    fn release_all(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        self.frm.wait_for_gpu_idle()?;
        let device = self.dev.device.clone();
        let mut leak = None;

        let meshes = self.meshes.len();
        for (_, mesh) in self.meshes.drain() {
            mesh.destroy(&mut self.res, device.as_ref())?;
            self.pip.release(DrawKind::Mesh)?;
        }
        if meshes > 0 {
            log::error!("{} mesh objects were never deleted", meshes);
            leak.get_or_insert(RenderError::ResourceLeak { what: "mesh objects", count: meshes });
        }

        let sprites = self.sprites.len();
        for (_, sprite) in self.sprites.drain() {
            sprite.destroy(&mut self.res)?;
            self.pip.release(DrawKind::Sprite)?;
        }
        if sprites > 0 {
            log::error!("{} sprite objects were never deleted", sprites);
            leak.get_or_insert(RenderError::ResourceLeak { what: "sprite objects", count: sprites });
        }

        self.res.textures.release(self.fallback_texture)?;
        self.res.textures.shutdown()?;

        match leak {
            Some(leak) => Err(leak.into()),
            None => Ok(()),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            log::error!("Failed to release renderer resources: {}", e);
        }
    }
}

/// Draw state for the current frame. Sprites draw in screen space and ignore the camera.
fn draw_context<'a>(
    dev: &'a RenderDeviceContext,
    frm: &'a mut RenderFrameContext,
    res: &'a RenderResourceContext,
    pipeline: PipelineId,
    fallback_texture: TextureHandle,
) -> DrawContext<'a> {
    DrawContext {
        device: dev.device.as_ref(),
        frame: frm.current_mut(),
        textures: &res.textures,
        pipeline,
        fallback_texture,
        view: Mat4::IDENTITY,
        projection: Mat4::IDENTITY,
        screen_size: Vec2::new(dev.target.width as f32, dev.target.height as f32),
    }
}

fn pixel_pos(x: i32, y: i32) -> Vec2 {
    Vec2::new(x as f32, y as f32)
}

fn log_dropped(what: &str, status: &DrawStatus) {
    if let DrawStatus::Dropped(e) = status {
        log::warn!("Dropped {} draw: {}", what, e);
    }
}
