use color_eyre::Result;
use glam::{Mat4, Vec2, Vec3, Vec4};
use crate::renderer::DrawStatus;
use crate::renderer::contexts::resource_ctx::texture_manager::TextureHandle;
use crate::renderer::contexts::resource_ctx::RenderResourceContext;
use crate::renderer::core::{
    BufferId, Command, DescriptorRange, Format, IndexBufferView, PipelineDesc, RenderDevice, VertexBufferView,
};
use crate::renderer::error::RenderError;
use crate::renderer::resources::vertex::BASIC_VERTEX_ATTRIBUTES;
use crate::renderer::resources::{DrawContext, TextureSource};
use crate::renderer::shader_data::{BasicVertex, ConstantBufferType, MeshConstants};

pub const MAX_TRI_GROUP_COUNT: usize = 8;

const MESH_ROOT_TABLES: &[&[DescriptorRange]] = &[
    // Per object: transforms
    &[DescriptorRange::ConstantBuffer(1)],
    // Per tri-group: texture
    &[DescriptorRange::Texture(1)],
];

pub fn pipeline_desc(color_format: Format) -> PipelineDesc {
    PipelineDesc {
        name: "Mesh",
        shader: include_str!("shaders/mesh.wgsl"),
        vertex_stride: size_of::<BasicVertex>() as u32,
        vertex_attributes: &BASIC_VERTEX_ATTRIBUTES,
        root_tables: MESH_ROOT_TABLES,
        color_format,
        depth_format: Some(Format::Depth32Float),
    }
}

#[derive(Debug, Clone)]
pub struct TriGroupDesc {
    pub indices: Vec<u16>,
    pub texture: Option<TextureSource>,
}

#[derive(Debug, Clone)]
pub struct MeshDesc {
    pub vertices: Vec<BasicVertex>,
    pub tri_groups: Vec<TriGroupDesc>,
}

impl MeshDesc {
    const BOX_HALF_LENGTH: f32 = 0.25;

    /// Unit-ish box with one tri-group per face, in +z, -z, -x, +x, +y, -y order.
    pub fn new_box(face_textures: [TextureSource; 6]) -> Self {
        let h = Self::BOX_HALF_LENGTH;
        let corners = [
            Vec3::new(-h, h, h),
            Vec3::new(-h, -h, h),
            Vec3::new(h, -h, h),
            Vec3::new(h, h, h),
            Vec3::new(-h, h, -h),
            Vec3::new(-h, -h, -h),
            Vec3::new(h, -h, -h),
            Vec3::new(h, h, -h),
        ];
        let faces: [[usize; 6]; 6] = [
            [3, 0, 1, 3, 1, 2], // +z
            [4, 7, 6, 4, 6, 5], // -z
            [0, 4, 5, 0, 5, 1], // -x
            [7, 3, 2, 7, 2, 6], // +x
            [0, 3, 7, 0, 7, 4], // +y
            [2, 1, 5, 2, 5, 6], // -y
        ];
        let face_tex_coords = [
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ];

        let vertices = faces
            .iter()
            .flat_map(|face| {
                face.iter()
                    .zip(face_tex_coords)
                    .map(|(&corner, tex_coord)| BasicVertex::new(corners[corner], Vec4::ONE, tex_coord))
            })
            .collect();
        let tri_groups = face_textures
            .into_iter()
            .enumerate()
            .map(|(face, texture)| TriGroupDesc {
                indices: (face as u16 * 6..face as u16 * 6 + 6).collect(),
                texture: Some(texture),
            })
            .collect();

        Self {
            vertices,
            tri_groups,
        }
    }
}

struct TriGroup {
    index_buffer: BufferId,
    index_view: IndexBufferView,
    texture: Option<TextureHandle>,
}

/// One vertex buffer drawn as up to `MAX_TRI_GROUP_COUNT` index ranges, each with its own texture.
pub struct MeshObject {
    vertex_buffer: BufferId,
    vertex_view: VertexBufferView,
    tri_groups: Vec<TriGroup>,
}

impl MeshObject {
    pub fn new(desc: &MeshDesc, resources: &mut RenderResourceContext) -> Result<Self> {
        if desc.tri_groups.len() > MAX_TRI_GROUP_COUNT {
            return Err(RenderError::TooManyTriGroups {
                count: desc.tri_groups.len(),
                max: MAX_TRI_GROUP_COUNT,
            }
            .into());
        }

        let (vertex_buffer, vertex_view) = resources.uploads.create_vertex_buffer(&desc.vertices)?;
        let mut mesh = Self {
            vertex_buffer,
            vertex_view,
            tri_groups: Vec::with_capacity(desc.tri_groups.len()),
        };

        for group in &desc.tri_groups {
            if let Err(e) = mesh.push_tri_group(group, resources) {
                let device = resources.uploads.device().clone();
                if let Err(cleanup) = mesh.destroy(resources, device.as_ref()) {
                    log::error!("Failed to release partially created mesh: {}", cleanup);
                }
                return Err(e);
            }
        }
        Ok(mesh)
    }

    fn push_tri_group(&mut self, group: &TriGroupDesc, resources: &mut RenderResourceContext) -> Result<()> {
        let (index_buffer, index_view) = resources.uploads.create_index_buffer(&group.indices)?;
        let texture = match group.texture.as_ref().map(|source| source.acquire(resources)).transpose() {
            Ok(texture) => texture,
            Err(e) => {
                resources.uploads.device().destroy_buffer(index_buffer)?;
                return Err(e);
            }
        };
        self.tri_groups.push(TriGroup {
            index_buffer,
            index_view,
            texture,
        });
        Ok(())
    }

    pub fn tri_group_count(&self) -> usize {
        self.tri_groups.len()
    }

    /// Records the mesh with `world` into the current frame. `texture` replaces every tri-group's own.
    pub fn draw(&self, ctx: &mut DrawContext, world: Mat4, texture: Option<TextureHandle>) -> Result<DrawStatus> {
        let descriptor_count = 1 + self.tri_groups.len() as u32;
        let (slot, table) = match ctx.frame.allocate_draw(ConstantBufferType::Default, descriptor_count) {
            Ok(allocation) => allocation,
            Err(e) => return Ok(DrawStatus::Dropped(e)),
        };
        ctx.frame.constant_buffers.pool(ConstantBufferType::Default).write(&slot, &MeshConstants {
            world,
            view: ctx.view,
            projection: ctx.projection,
        })?;

        let stride = ctx.frame.descriptor_pool.stride();
        ctx.device.copy_descriptors(1, table.cpu, slot.view)?;
        for (i, group) in self.tri_groups.iter().enumerate() {
            let source = texture.or(group.texture).unwrap_or(ctx.fallback_texture);
            ctx.device.copy_descriptors(1, table.cpu.offset(1 + i as u32, stride), ctx.textures.srv(source)?)?;
        }

        let device: &dyn RenderDevice = ctx.device;
        let list = ctx.frame.command_list;
        device.record(list, Command::SetPipeline(ctx.pipeline))?;
        device.record(list, Command::SetDescriptorHeap(ctx.frame.descriptor_pool.heap()))?;
        device.record(list, Command::SetVertexBuffer(self.vertex_view))?;
        device.record(list, Command::SetDescriptorTable { root_index: 0, table: table.gpu })?;
        for (i, group) in self.tri_groups.iter().enumerate() {
            device.record(list, Command::SetDescriptorTable {
                root_index: 1,
                table: table.gpu.offset(1 + i as u32, stride),
            })?;
            device.record(list, Command::SetIndexBuffer(group.index_view))?;
            device.record(list, Command::DrawIndexed {
                index_count: group.index_view.index_count(),
                first_index: 0,
                base_vertex: 0,
            })?;
        }

        Ok(DrawStatus::Recorded)
    }

    /// Textures this mesh samples when drawn without an override.
    pub fn textures(&self) -> impl Iterator<Item = TextureHandle> + '_ {
        self.tri_groups.iter().filter_map(|group| group.texture)
    }

    /// Releases buffers and texture references. No in-flight frame may still draw the mesh.
    pub fn destroy(self, resources: &mut RenderResourceContext, device: &dyn RenderDevice) -> Result<()> {
        for group in self.tri_groups {
            device.destroy_buffer(group.index_buffer)?;
            if let Some(texture) = group.texture {
                resources.textures.release(texture)?;
            }
        }
        device.destroy_buffer(self.vertex_buffer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_has_one_tri_group_per_face() {
        let handle = TextureHandle::default();
        let desc = MeshDesc::new_box(std::array::from_fn(|_| TextureSource::Shared(handle)));
        assert_eq!(desc.vertices.len(), 36);
        assert_eq!(desc.tri_groups.len(), 6);
        assert_eq!(desc.tri_groups[5].indices, vec![30, 31, 32, 33, 34, 35]);
        assert_eq!(desc.vertices[0].position, [0.25, 0.25, 0.25]);
        assert_eq!(desc.vertices[0].tex_coord, [0.0, 0.0]);
    }

    #[test]
    fn mesh_tables_hold_transforms_then_texture() {
        let desc = pipeline_desc(Format::Bgra8Unorm);
        assert_eq!(desc.table_len(0), Some(1));
        assert_eq!(desc.table_len(1), Some(1));
        assert_eq!(desc.table_len(2), None);
    }
}
