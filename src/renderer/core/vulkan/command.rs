use ash::vk;
use color_eyre::eyre::{eyre, OptionExt};
use color_eyre::Result;
use slotmap::SlotMap;
use crate::renderer::core::vulkan::{convert, pipeline, VulkanState, VulkanTexture};
use crate::renderer::core::{
    Command, CommandListId, DescriptorAddressSpace, ResourceId, ResourceState, TextureId,
};

/// Render-pass bookkeeping of one command list. Barriers and copies are not allowed inside
/// dynamic rendering, so the pass is ended around them and resumed with `LOAD` at the next draw.
#[derive(Debug, Default)]
pub struct PassState {
    color: Option<TextureId>,
    depth: Option<TextureId>,
    rendering: bool,
    clear_color: Option<(TextureId, [f32; 4])>,
    clear_depth: Option<(TextureId, f32)>,
    // Heap slot of each root table, pushed as constants at every draw.
    tables: [u32; 2],
}

impl PassState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn end(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.rendering {
            unsafe { device.cmd_end_rendering(cmd) };
            self.rendering = false;
        }
    }

    fn begin(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        textures: &SlotMap<TextureId, VulkanTexture>,
    ) -> Result<()> {
        let color_id = self.color.ok_or_eyre("Drawing without a render target")?;
        let color = textures.get(color_id).ok_or_eyre("Render target was destroyed")?;

        let clear_color = self.clear_color.take().filter(|(target, _)| *target == color_id);
        let color_attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(color.view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(if clear_color.is_some() { vk::AttachmentLoadOp::CLEAR } else { vk::AttachmentLoadOp::LOAD })
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color.map_or([0.0; 4], |(_, color)| color),
                },
            })];

        let depth_attachment = match self.depth {
            Some(depth_id) => {
                let depth = textures.get(depth_id).ok_or_eyre("Depth target was destroyed")?;
                let clear_depth = self.clear_depth.take().filter(|(target, _)| *target == depth_id);
                Some(vk::RenderingAttachmentInfo::default()
                    .image_view(depth.view)
                    .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                    .load_op(if clear_depth.is_some() { vk::AttachmentLoadOp::CLEAR } else { vk::AttachmentLoadOp::LOAD })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: clear_depth.map_or(1.0, |(_, depth)| depth),
                            stencil: 0,
                        },
                    }))
            }
            None => None,
        };

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: color.desc.width,
                    height: color.desc.height,
                },
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }

        unsafe { device.cmd_begin_rendering(cmd, &rendering_info) };
        self.rendering = true;
        Ok(())
    }

    /// Clears inside the running pass when `target` is attached, otherwise defers the clear to
    /// the load op of the next pass on it.
    fn clear(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        textures: &SlotMap<TextureId, VulkanTexture>,
        target: TextureId,
        value: ClearValue,
    ) -> Result<()> {
        let attached = match value {
            ClearValue::Color(_) => self.color == Some(target),
            ClearValue::Depth(_) => self.depth == Some(target),
        };
        if !(self.rendering && attached) {
            match value {
                ClearValue::Color(color) => self.clear_color = Some((target, color)),
                ClearValue::Depth(depth) => self.clear_depth = Some((target, depth)),
            }
            return Ok(());
        }

        let texture = textures.get(target).ok_or_eyre("Clearing unknown texture")?;
        let attachment = match value {
            ClearValue::Color(color) => vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: 0,
                clear_value: vk::ClearValue { color: vk::ClearColorValue { float32: color } },
            },
            ClearValue::Depth(depth) => vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
                },
            },
        };
        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width: texture.desc.width, height: texture.desc.height },
            },
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe { device.cmd_clear_attachments(cmd, &[attachment], &[rect]) };
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum ClearValue {
    Color([f32; 4]),
    Depth(f32),
}

impl VulkanState {
    /// Translates `command` into Vulkan calls on the list's command buffer right away.
    pub(super) fn record(
        &mut self,
        device: &ash::Device,
        layout: vk::PipelineLayout,
        list_id: CommandListId,
        command: Command,
    ) -> Result<()> {
        let list = self.lists.get_mut(list_id).ok_or_eyre("Recording into unknown command list")?;
        if !list.open {
            return Err(eyre!("Recording into a closed command list"));
        }
        let cmd = list.cmd;
        let pass = &mut list.pass;

        // Textures used for the first time come out of UNDEFINED into their initial state.
        if !matches!(command, Command::Barrier(_)) {
            for resource in command.referenced_resources() {
                let ResourceId::Texture(id) = resource else {
                    continue;
                };
                let texture = self.textures.get_mut(id).ok_or_eyre("Command references unknown texture")?;
                if texture.initialized {
                    continue;
                }
                pass.end(device, cmd);
                let barrier = convert::image_barrier(
                    texture.image,
                    convert::aspect(texture.desc.format),
                    vk::ImageLayout::UNDEFINED,
                    ResourceState::Common,
                    texture.desc.initial_state,
                );
                let dependency_info = vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
                unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
                texture.initialized = true;
            }
        }

        match command {
            Command::Barrier(barrier) => {
                pass.end(device, cmd);
                match barrier.resource {
                    ResourceId::Texture(id) => {
                        let texture = self.textures.get_mut(id).ok_or_eyre("Barrier on unknown texture")?;
                        let old_layout = if texture.initialized {
                            convert::layout(barrier.before)
                        } else {
                            vk::ImageLayout::UNDEFINED
                        };
                        let image_barrier = convert::image_barrier(
                            texture.image,
                            convert::aspect(texture.desc.format),
                            old_layout,
                            barrier.before,
                            barrier.after,
                        );
                        texture.initialized = true;
                        let dependency_info = vk::DependencyInfo::default()
                            .image_memory_barriers(std::slice::from_ref(&image_barrier));
                        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
                    }
                    ResourceId::Buffer(id) => {
                        let buffer = self.buffers.get(id).ok_or_eyre("Barrier on unknown buffer")?;
                        let buffer_barrier = convert::buffer_barrier(buffer.buffer, barrier.before, barrier.after);
                        let dependency_info = vk::DependencyInfo::default()
                            .buffer_memory_barriers(std::slice::from_ref(&buffer_barrier));
                        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency_info) };
                    }
                }
            }
            Command::CopyBuffer { dst, dst_offset, src, src_offset, size } => {
                pass.end(device, cmd);
                let dst = self.buffers.get(dst).ok_or_eyre("Copy into unknown buffer")?;
                let src = self.buffers.get(src).ok_or_eyre("Copy from unknown buffer")?;
                let region = vk::BufferCopy { src_offset, dst_offset, size };
                unsafe { device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]) };
            }
            Command::CopyBufferToTexture { dst, src, footprint } => {
                pass.end(device, cmd);
                let texture = self.textures.get(dst).ok_or_eyre("Copy into unknown texture")?;
                let src = self.buffers.get(src).ok_or_eyre("Copy from unknown buffer")?;
                let region = vk::BufferImageCopy {
                    buffer_offset: footprint.offset,
                    buffer_row_length: footprint.row_pitch / texture.desc.format.bytes_per_pixel(),
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: convert::aspect(texture.desc.format),
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                    image_extent: vk::Extent3D {
                        width: footprint.width,
                        height: footprint.height,
                        depth: 1,
                    },
                };
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        src.buffer,
                        texture.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
            Command::ClearRenderTarget { target, color } => {
                pass.clear(device, cmd, &self.textures, target, ClearValue::Color(color))?;
            }
            Command::ClearDepth { target, depth } => {
                pass.clear(device, cmd, &self.textures, target, ClearValue::Depth(depth))?;
            }
            Command::SetViewport(viewport) => {
                // Negative height keeps +Y up in clip space, matching the other backends.
                let viewport = vk::Viewport {
                    x: viewport.x,
                    y: viewport.y + viewport.height,
                    width: viewport.width,
                    height: -viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                };
                unsafe { device.cmd_set_viewport(cmd, 0, &[viewport]) };
            }
            Command::SetScissor(rect) => {
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D { x: rect.left, y: rect.top },
                    extent: vk::Extent2D {
                        width: (rect.right - rect.left).max(0) as u32,
                        height: (rect.bottom - rect.top).max(0) as u32,
                    },
                };
                unsafe { device.cmd_set_scissor(cmd, 0, &[scissor]) };
            }
            Command::SetRenderTargets { color, depth } => {
                pass.end(device, cmd);
                pass.color = Some(color);
                pass.depth = depth;
                pass.begin(device, cmd, &self.textures)?;
            }
            Command::SetPipeline(pipeline) => {
                let pipeline = *self.pipelines.get(pipeline).ok_or_eyre("Binding unknown pipeline")?;
                unsafe { device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline) };
            }
            Command::SetDescriptorHeap(heap) => {
                let heap = self.heaps.get(heap).ok_or_eyre("Binding unknown descriptor heap")?;
                let (_, set) = heap.set.ok_or_eyre("Binding a CPU-only descriptor heap")?;
                unsafe {
                    device.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, layout, 0, &[set], &[])
                };
            }
            Command::SetDescriptorTable { root_index, table } => {
                let (_, slot) = DescriptorAddressSpace::locate(table.0);
                *pass
                    .tables
                    .get_mut(root_index as usize)
                    .ok_or_else(|| eyre!("Root table {} out of range", root_index))? = slot;
            }
            Command::SetVertexBuffer(view) => {
                let buffer = self.buffers.get(view.buffer).ok_or_eyre("Binding unknown vertex buffer")?;
                unsafe { device.cmd_bind_vertex_buffers(cmd, 0, &[buffer.buffer], &[0]) };
            }
            Command::SetIndexBuffer(view) => {
                let buffer = self.buffers.get(view.buffer).ok_or_eyre("Binding unknown index buffer")?;
                unsafe { device.cmd_bind_index_buffer(cmd, buffer.buffer, 0, vk::IndexType::UINT16) };
            }
            Command::DrawIndexed { index_count, first_index, base_vertex } => {
                if !pass.rendering {
                    pass.begin(device, cmd, &self.textures)?;
                }
                unsafe {
                    device.cmd_push_constants(
                        cmd,
                        layout,
                        vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                        0,
                        bytemuck::cast_slice(&pass.tables),
                    );
                    device.cmd_draw_indexed(cmd, index_count, 1, first_index, base_vertex, 0);
                }
            }
        }
        Ok(())
    }

    pub(super) fn close(&mut self, device: &ash::Device, list_id: CommandListId) -> Result<()> {
        let list = self.lists.get_mut(list_id).ok_or_eyre("Closing unknown command list")?;
        if !list.open {
            return Err(eyre!("Command list closed twice"));
        }
        list.pass.end(device, list.cmd);
        if list.pass.clear_color.is_some() || list.pass.clear_depth.is_some() {
            log::warn!("Command list closed with a clear that no render pass consumed");
        }
        unsafe { device.end_command_buffer(list.cmd)? };
        list.open = false;
        Ok(())
    }
}

const _: () = assert!(pipeline::ROOT_TABLE_PUSH_CONSTANT_SIZE as usize == size_of::<[u32; 2]>());
