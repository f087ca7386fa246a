use std::collections::HashMap;
use std::sync::Arc;
use color_eyre::Result;
use crate::renderer::contexts::resource_ctx::resource_manager::ResourceManager;
use crate::renderer::core::{BufferId, Format, IndexBufferView, PipelineId, RenderDevice, VertexBufferView};
use crate::renderer::error::RenderError;
use crate::renderer::resources::{mesh, sprite};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawKind {
    Mesh,
    Sprite,
}

/// Unit quad shared by every sprite.
#[derive(Debug, Clone, Copy)]
pub struct QuadBuffers {
    vertex_buffer: BufferId,
    index_buffer: BufferId,
    pub vertex_view: VertexBufferView,
    pub index_view: IndexBufferView,
}

struct PipelineEntry {
    pipeline: PipelineId,
    ref_count: u32,
    quad: Option<QuadBuffers>,
}

/// Responsibilities:
/// - Create each draw kind's pipeline when its first object is created
/// - Share it between all objects of that kind by reference count
/// - Tear it down, with the sprite quad, when the last object is gone
pub struct RenderPipelineContext {
    entries: HashMap<DrawKind, PipelineEntry>,
    color_format: Format,

    device: Arc<dyn RenderDevice>,
}

impl RenderPipelineContext {
    pub fn new(color_format: Format, device: Arc<dyn RenderDevice>) -> Self {
        Self {
            entries: HashMap::new(),
            color_format,
            device,
        }
    }

    pub fn acquire(&mut self, kind: DrawKind, uploads: &mut ResourceManager) -> Result<PipelineId> {
        if let Some(entry) = self.entries.get_mut(&kind) {
            entry.ref_count += 1;
            return Ok(entry.pipeline);
        }

        let (desc, quad) = match kind {
            DrawKind::Mesh => (mesh::pipeline_desc(self.color_format), None),
            DrawKind::Sprite => {
                let (vertex_buffer, vertex_view) = uploads.create_vertex_buffer(&sprite::quad_vertices())?;
                let (index_buffer, index_view) = uploads.create_index_buffer(&sprite::QUAD_INDICES)?;
                let quad = QuadBuffers {
                    vertex_buffer,
                    index_buffer,
                    vertex_view,
                    index_view,
                };
                (sprite::pipeline_desc(self.color_format), Some(quad))
            }
        };
        let pipeline = self.device.create_pipeline(&desc)?;
        log::info!("Created {} pipeline", desc.name);

        self.entries.insert(kind, PipelineEntry {
            pipeline,
            ref_count: 1,
            quad,
        });
        Ok(pipeline)
    }

    /// Drops one reference. The last release destroys the pipeline, so no in-flight frame may
    /// still use it.
    pub fn release(&mut self, kind: DrawKind) -> Result<()> {
        let entry = self.entries.get_mut(&kind).ok_or(RenderError::DoubleFree("pipeline"))?;
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(());
        }

        if let Some(entry) = self.entries.remove(&kind) {
            self.destroy_entry(entry)?;
        }
        Ok(())
    }

    fn destroy_entry(&self, entry: PipelineEntry) -> Result<()> {
        self.device.destroy_pipeline(entry.pipeline)?;
        if let Some(quad) = entry.quad {
            self.device.destroy_buffer(quad.vertex_buffer)?;
            self.device.destroy_buffer(quad.index_buffer)?;
        }
        Ok(())
    }

    pub fn pipeline(&self, kind: DrawKind) -> Result<PipelineId, RenderError> {
        self.entries
            .get(&kind)
            .map(|entry| entry.pipeline)
            .ok_or(RenderError::InvalidHandle("pipeline"))
    }

    pub fn sprite_quad(&self) -> Result<QuadBuffers, RenderError> {
        self.entries
            .get(&DrawKind::Sprite)
            .and_then(|entry| entry.quad)
            .ok_or(RenderError::InvalidHandle("sprite quad"))
    }

    pub fn ref_count(&self, kind: DrawKind) -> u32 {
        self.entries.get(&kind).map_or(0, |entry| entry.ref_count)
    }
}

impl Drop for RenderPipelineContext {
    fn drop(&mut self) {
        for (kind, entry) in std::mem::take(&mut self.entries) {
            log::warn!("{:?} pipeline still referenced {} time(s) at teardown", kind, entry.ref_count);
            if let Err(e) = self.destroy_entry(entry) {
                log::error!("Failed to destroy {:?} pipeline: {}", kind, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::core::headless::HeadlessDevice;

    #[test]
    fn pipeline_lives_while_referenced() {
        let device = Arc::new(HeadlessDevice::new());
        let mut uploads = ResourceManager::new(device.clone()).unwrap();
        let mut pipelines = RenderPipelineContext::new(Format::Rgba8Unorm, device.clone());

        let first = pipelines.acquire(DrawKind::Sprite, &mut uploads).unwrap();
        let second = pipelines.acquire(DrawKind::Sprite, &mut uploads).unwrap();
        assert_eq!(first, second);
        assert_eq!(pipelines.ref_count(DrawKind::Sprite), 2);
        assert_eq!(pipelines.sprite_quad().unwrap().index_view.index_count(), 6);

        let live = device.live_object_count();
        pipelines.release(DrawKind::Sprite).unwrap();
        assert_eq!(device.live_object_count(), live);
        pipelines.release(DrawKind::Sprite).unwrap();
        // Pipeline plus the two quad buffers.
        assert_eq!(device.live_object_count(), live - 3);
        assert!(pipelines.pipeline(DrawKind::Sprite).is_err());
        assert!(pipelines.release(DrawKind::Sprite).is_err());
    }
}
