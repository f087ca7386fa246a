use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2};

/// Per-frame constant-buffer pools, one per layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstantBufferType {
    /// Mesh transforms, `MeshConstants`.
    Default,
    Sprite,
}

impl ConstantBufferType {
    pub const ALL: [ConstantBufferType; 2] = [ConstantBufferType::Default, ConstantBufferType::Sprite];

    pub fn size(self) -> u32 {
        match self {
            ConstantBufferType::Default => size_of::<MeshConstants>() as u32,
            ConstantBufferType::Sprite => size_of::<SpriteConstants>() as u32,
        }
    }
}

/// Transforms of one mesh draw. glam matrices are column-major like the WGSL side, so they are
/// written as is.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct MeshConstants {
    pub world: Mat4,
    pub view: Mat4,
    pub projection: Mat4,
}

/// Screen-space placement and texture sampling window of one sprite draw, in pixels.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct SpriteConstants {
    pub screen_res: Vec2,
    pub pos: Vec2,
    pub scale: Vec2,
    pub tex_size: Vec2,
    pub tex_sample_pos: Vec2,
    pub tex_sample_size: Vec2,
    pub z: f32,
    pub alpha: f32,
    pub _reserved: [f32; 2],
}

/// Vertex layout shared by meshes and the sprite quad. Plain arrays keep it free of SIMD padding.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct BasicVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub tex_coord: [f32; 2],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_the_shaders() {
        assert_eq!(size_of::<MeshConstants>(), 192);
        assert_eq!(size_of::<SpriteConstants>(), 64);
        assert_eq!(size_of::<BasicVertex>(), 36);
    }
}
