use ash::vk;
use crate::renderer::core::{Format, ResourceState, VertexFormat};

pub fn format(format: Format) -> vk::Format {
    match format {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Depth32Float => vk::Format::D32_SFLOAT,
    }
}

pub fn vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

pub fn aspect(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Image layout a texture in `state` has to be in.
pub fn layout(state: ResourceState) -> vk::ImageLayout {
    match state {
        ResourceState::Common | ResourceState::GenericRead => vk::ImageLayout::GENERAL,
        ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ResourceState::PixelShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceState::DepthWrite => vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
        ResourceState::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        ResourceState::VertexAndConstantBuffer | ResourceState::IndexBuffer => vk::ImageLayout::GENERAL,
    }
}

/// Pipeline stages and accesses that use a resource in `state`.
pub fn scope(state: ResourceState) -> (vk::PipelineStageFlags2, vk::AccessFlags2) {
    match state {
        ResourceState::Common => (
            vk::PipelineStageFlags2::ALL_COMMANDS,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        ),
        ResourceState::GenericRead => (vk::PipelineStageFlags2::ALL_COMMANDS, vk::AccessFlags2::MEMORY_READ),
        ResourceState::CopyDest => (vk::PipelineStageFlags2::ALL_TRANSFER, vk::AccessFlags2::TRANSFER_WRITE),
        ResourceState::CopySource => (vk::PipelineStageFlags2::ALL_TRANSFER, vk::AccessFlags2::TRANSFER_READ),
        ResourceState::VertexAndConstantBuffer => (
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT
                | vk::PipelineStageFlags2::VERTEX_SHADER
                | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::VERTEX_ATTRIBUTE_READ | vk::AccessFlags2::SHADER_STORAGE_READ,
        ),
        ResourceState::IndexBuffer => (vk::PipelineStageFlags2::INDEX_INPUT, vk::AccessFlags2::INDEX_READ),
        ResourceState::PixelShaderResource => (
            vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
        ResourceState::RenderTarget => (
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        ),
        ResourceState::DepthWrite => (
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        // The presentation engine synchronizes through the semaphores.
        ResourceState::Present => (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE),
    }
}

pub fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn image_barrier(
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    before: ResourceState,
    after: ResourceState,
) -> vk::ImageMemoryBarrier2<'static> {
    let (src_stage_mask, src_access_mask) = scope(before);
    let (dst_stage_mask, dst_access_mask) = scope(after);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src_stage_mask)
        .src_access_mask(src_access_mask)
        .dst_stage_mask(dst_stage_mask)
        .dst_access_mask(dst_access_mask)
        .old_layout(old_layout)
        .new_layout(layout(after))
        .subresource_range(subresource_range(aspect_mask))
        .image(image)
}

pub fn buffer_barrier(buffer: vk::Buffer, before: ResourceState, after: ResourceState) -> vk::BufferMemoryBarrier2<'static> {
    let (src_stage_mask, src_access_mask) = scope(before);
    let (dst_stage_mask, dst_access_mask) = scope(after);
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(src_stage_mask)
        .src_access_mask(src_access_mask)
        .dst_stage_mask(dst_stage_mask)
        .dst_access_mask(dst_access_mask)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_states_use_transfer_layouts() {
        assert_eq!(layout(ResourceState::CopyDest), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(scope(ResourceState::CopyDest).1, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(layout(ResourceState::Present), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn depth_formats_use_the_depth_aspect() {
        assert_eq!(aspect(Format::Depth32Float), vk::ImageAspectFlags::DEPTH);
        assert_eq!(format(Format::Bgra8Unorm), vk::Format::B8G8R8A8_UNORM);
    }
}
