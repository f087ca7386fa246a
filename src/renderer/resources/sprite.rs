use color_eyre::Result;
use glam::{Vec2, Vec4};
use crate::renderer::DrawStatus;
use crate::renderer::contexts::pipeline_ctx::QuadBuffers;
use crate::renderer::contexts::resource_ctx::texture_manager::TextureHandle;
use crate::renderer::contexts::resource_ctx::RenderResourceContext;
use crate::renderer::core::{Command, DescriptorRange, Format, PipelineDesc};
use crate::renderer::resources::vertex::BASIC_VERTEX_ATTRIBUTES;
use crate::renderer::resources::{DrawContext, TextureSource};
use crate::renderer::shader_data::{BasicVertex, ConstantBufferType, SpriteConstants};

// Constants and texture in a single table.
const SPRITE_ROOT_TABLES: &[&[DescriptorRange]] = &[
    &[DescriptorRange::ConstantBuffer(1), DescriptorRange::Texture(1)],
];

pub fn pipeline_desc(color_format: Format) -> PipelineDesc {
    PipelineDesc {
        name: "Sprite",
        shader: include_str!("shaders/sprite.wgsl"),
        vertex_stride: size_of::<BasicVertex>() as u32,
        vertex_attributes: &BASIC_VERTEX_ATTRIBUTES,
        root_tables: SPRITE_ROOT_TABLES,
        color_format,
        depth_format: Some(Format::Depth32Float),
    }
}

/// Unit quad every sprite is drawn with; texture coordinates equal positions.
pub fn quad_vertices() -> [BasicVertex; 4] {
    [
        Vec2::new(0.0, 1.0),
        Vec2::new(0.0, 0.0),
        Vec2::new(1.0, 0.0),
        Vec2::new(1.0, 1.0),
    ]
    .map(|corner| BasicVertex::new(corner.extend(0.0), Vec4::ONE, corner))
}

pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 0, 2, 3];

/// Source rectangle in texels, right and bottom exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl TextureRect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }

    /// Falls back to the whole texture for a missing or empty rect, then clamps it so it samples
    /// at least one texel inside the texture.
    pub fn clamped(rect: Option<TextureRect>, tex_width: u32, tex_height: u32) -> Self {
        let (w, h) = (tex_width as i32, tex_height as i32);
        let mut rect = rect.filter(TextureRect::is_valid).unwrap_or(TextureRect::new(0, 0, w, h));

        rect.left = rect.left.clamp(0, w);
        rect.top = rect.top.clamp(0, h);
        // Not `clamp`: the lower bound may exceed the upper one when left == width.
        rect.right = rect.right.max(rect.left + 1).min(w);
        rect.bottom = rect.bottom.max(rect.top + 1).min(h);
        rect
    }

    pub fn size(&self) -> Vec2 {
        Vec2::new((self.right - self.left) as f32, (self.bottom - self.top) as f32)
    }
}

/// Fills the sprite constants for drawing `rect` of a `tex_size` texture at `pos`, stretched to
/// `pixel_size`. Non-positive pixel sizes draw the sample at its own size.
pub fn sprite_constants(
    screen_size: Vec2,
    pos: Vec2,
    pixel_size: Vec2,
    rect: Option<TextureRect>,
    tex_size: (u32, u32),
    z: f32,
) -> SpriteConstants {
    let rect = TextureRect::clamped(rect, tex_size.0, tex_size.1);
    let sample_size = rect.size();
    let pixel_size = Vec2::new(
        if pixel_size.x <= 0.0 { sample_size.x } else { pixel_size.x },
        if pixel_size.y <= 0.0 { sample_size.y } else { pixel_size.y },
    );
    let tex_size = Vec2::new(tex_size.0 as f32, tex_size.1 as f32);

    SpriteConstants {
        screen_res: screen_size,
        pos,
        scale: pixel_size / tex_size,
        tex_size,
        tex_sample_pos: Vec2::new(rect.left as f32, rect.top as f32),
        tex_sample_size: sample_size,
        z,
        alpha: 1.0,
        _reserved: [0.0; 2],
    }
}

/// Screen-space textured quad. A sprite without its own texture only draws through
/// `draw_with_texture`.
pub struct SpriteObject {
    texture: Option<TextureHandle>,
    rect: TextureRect,
}

impl SpriteObject {
    pub fn new() -> Self {
        Self {
            texture: None,
            rect: TextureRect::default(),
        }
    }

    pub fn new_textured(
        source: &TextureSource,
        rect: Option<TextureRect>,
        resources: &mut RenderResourceContext,
    ) -> Result<Self> {
        let texture = source.acquire(resources)?;
        let (width, height) = resources.textures.size(texture)?;
        Ok(Self {
            texture: Some(texture),
            rect: TextureRect::clamped(rect, width, height),
        })
    }

    pub fn texture(&self) -> Option<TextureHandle> {
        self.texture
    }

    pub fn rect(&self) -> TextureRect {
        self.rect
    }

    /// Draws the sprite's own texture and rect. `Skipped` when it has no texture.
    pub fn draw(&self, ctx: &mut DrawContext, quad: &QuadBuffers, pos: Vec2, pixel_size: Vec2, z: f32) -> Result<DrawStatus> {
        let Some(texture) = self.texture else {
            return Ok(DrawStatus::Skipped);
        };
        Self::draw_with_texture(ctx, quad, pos, pixel_size, Some(self.rect), z, texture)
    }

    pub fn draw_with_texture(
        ctx: &mut DrawContext,
        quad: &QuadBuffers,
        pos: Vec2,
        pixel_size: Vec2,
        rect: Option<TextureRect>,
        z: f32,
        texture: TextureHandle,
    ) -> Result<DrawStatus> {
        let tex_size = ctx.textures.size(texture)?;
        let srv = ctx.textures.srv(texture)?;

        let (slot, table) = match ctx.frame.allocate_draw(ConstantBufferType::Sprite, 2) {
            Ok(allocation) => allocation,
            Err(e) => return Ok(DrawStatus::Dropped(e)),
        };
        let constants = sprite_constants(ctx.screen_size, pos, pixel_size, rect, tex_size, z);
        ctx.frame.constant_buffers.pool(ConstantBufferType::Sprite).write(&slot, &constants)?;

        let stride = ctx.frame.descriptor_pool.stride();
        ctx.device.copy_descriptors(1, table.cpu, slot.view)?;
        ctx.device.copy_descriptors(1, table.cpu.offset(1, stride), srv)?;

        let list = ctx.frame.command_list;
        ctx.device.record(list, Command::SetPipeline(ctx.pipeline))?;
        ctx.device.record(list, Command::SetDescriptorHeap(ctx.frame.descriptor_pool.heap()))?;
        ctx.device.record(list, Command::SetVertexBuffer(quad.vertex_view))?;
        ctx.device.record(list, Command::SetIndexBuffer(quad.index_view))?;
        ctx.device.record(list, Command::SetDescriptorTable { root_index: 0, table: table.gpu })?;
        ctx.device.record(list, Command::DrawIndexed {
            index_count: QUAD_INDICES.len() as u32,
            first_index: 0,
            base_vertex: 0,
        })?;

        Ok(DrawStatus::Recorded)
    }

    pub fn destroy(self, resources: &mut RenderResourceContext) -> Result<()> {
        if let Some(texture) = self.texture {
            resources.textures.release(texture)?;
        }
        Ok(())
    }
}

impl Default for SpriteObject {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_empty_rect_covers_the_texture() {
        assert_eq!(TextureRect::clamped(None, 64, 32), TextureRect::new(0, 0, 64, 32));
        assert_eq!(
            TextureRect::clamped(Some(TextureRect::new(10, 10, 10, 20)), 64, 32),
            TextureRect::new(0, 0, 64, 32)
        );
    }

    #[test]
    fn rect_is_clamped_into_the_texture() {
        assert_eq!(
            TextureRect::clamped(Some(TextureRect::new(-5, 8, 100, 40)), 64, 32),
            TextureRect::new(0, 8, 64, 32)
        );
        // Left at the right edge still leaves the rect ending at the edge.
        assert_eq!(
            TextureRect::clamped(Some(TextureRect::new(70, 0, 80, 4)), 64, 32),
            TextureRect::new(64, 0, 64, 4)
        );
    }

    #[test]
    fn constants_scale_pixel_size_by_texture_size() {
        let constants = sprite_constants(
            Vec2::new(800.0, 600.0),
            Vec2::new(100.0, 80.0),
            Vec2::new(100.0, 100.0),
            None,
            (1024, 1024),
            0.5,
        );
        assert_eq!(constants.scale, Vec2::splat(100.0 / 1024.0));
        assert_eq!(constants.tex_sample_size, Vec2::splat(1024.0));
        assert_eq!(constants.pos, Vec2::new(100.0, 80.0));
        assert_eq!(constants.z, 0.5);
        assert_eq!(constants.alpha, 1.0);
    }

    #[test]
    fn non_positive_size_uses_the_sample_size() {
        let constants = sprite_constants(
            Vec2::new(800.0, 600.0),
            Vec2::ZERO,
            Vec2::new(0.0, -1.0),
            Some(TextureRect::new(0, 0, 16, 8)),
            (64, 32),
            0.0,
        );
        assert_eq!(constants.scale, Vec2::new(16.0 / 64.0, 8.0 / 32.0));
        assert_eq!(constants.tex_sample_size, Vec2::new(16.0, 8.0));
    }

    #[test]
    fn quad_tex_coords_match_positions() {
        for vertex in quad_vertices() {
            assert_eq!(vertex.position[..2], vertex.tex_coord);
        }
    }
}
