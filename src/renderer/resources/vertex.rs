use glam::{Vec2, Vec3, Vec4};
use crate::renderer::core::{VertexAttribute, VertexFormat};
use crate::renderer::shader_data::BasicVertex;

/// Input layout of `BasicVertex`: position, color, texture coordinate.
pub const BASIC_VERTEX_ATTRIBUTES: [VertexAttribute; 3] = [
    VertexAttribute { location: 0, format: VertexFormat::Float32x3, offset: 0 },
    VertexAttribute { location: 1, format: VertexFormat::Float32x4, offset: 12 },
    VertexAttribute { location: 2, format: VertexFormat::Float32x2, offset: 28 },
];

impl BasicVertex {
    pub fn new(position: Vec3, color: Vec4, tex_coord: Vec2) -> Self {
        Self {
            position: position.to_array(),
            color: color.to_array(),
            tex_coord: tex_coord.to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn attribute_offsets_match_the_struct() {
        assert_eq!(BASIC_VERTEX_ATTRIBUTES[0].offset as usize, offset_of!(BasicVertex, position));
        assert_eq!(BASIC_VERTEX_ATTRIBUTES[1].offset as usize, offset_of!(BasicVertex, color));
        assert_eq!(BASIC_VERTEX_ATTRIBUTES[2].offset as usize, offset_of!(BasicVertex, tex_coord));
    }
}
