use ash::vk;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use naga::back::spv;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use crate::renderer::core::vulkan::convert;
use crate::renderer::core::PipelineDesc;

/// Binding slots of the single descriptor set every pipeline shares.
pub const CONSTANT_BUFFER_BINDING: u32 = 0;
pub const TEXTURE_BINDING: u32 = 1;
pub const SAMPLER_BINDING: u32 = 2;

/// Two `u32` heap slots, one per root table.
pub const ROOT_TABLE_PUSH_CONSTANT_SIZE: u32 = 8;

/// Compiles WGSL into SPIR-V holding every entry point of the module.
pub fn compile_wgsl(name: &str, source: &str) -> Result<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| eyre!("Shader '{}' failed to parse:\n{}", name, e.emit_to_string(source)))?;
    let info = Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| eyre!("Shader '{}' failed validation: {}", name, e))?;

    let options = spv::Options {
        lang_version: (1, 3),
        // Y is flipped with a negative viewport height instead.
        flags: spv::WriterFlags::LABEL_VARYINGS,
        ..Default::default()
    };
    let words = spv::write_vec(&module, &info, &options, None)?;
    log::debug!("Compiled shader '{}' ({} words)", name, words.len());
    Ok(words)
}

pub fn create_set_layout(
    device: &ash::Device,
    descriptor_limit: u32,
    sampler: &vk::Sampler,
) -> Result<vk::DescriptorSetLayout> {
    let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
    let bindings = [
        vk::DescriptorSetLayoutBinding::default()
            .binding(CONSTANT_BUFFER_BINDING)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(descriptor_limit)
            .stage_flags(stages),
        vk::DescriptorSetLayoutBinding::default()
            .binding(TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .descriptor_count(descriptor_limit)
            .stage_flags(stages),
        vk::DescriptorSetLayoutBinding::default()
            .binding(SAMPLER_BINDING)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .descriptor_count(1)
            .stage_flags(stages)
            .immutable_samplers(std::slice::from_ref(sampler)),
    ];
    let flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
    let binding_flags = [flags, flags, vk::DescriptorBindingFlags::empty()];
    let mut binding_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
        .binding_flags(&binding_flags);

    let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
        .bindings(&bindings)
        .push_next(&mut binding_flags_info);
    Ok(unsafe { device.create_descriptor_set_layout(&layout_info, None)? })
}

pub fn create_pipeline_layout(device: &ash::Device, set_layout: vk::DescriptorSetLayout) -> Result<vk::PipelineLayout> {
    let push_constant_ranges = [vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        .offset(0)
        .size(ROOT_TABLE_PUSH_CONSTANT_SIZE)];
    let set_layouts = [set_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constant_ranges);
    Ok(unsafe { device.create_pipeline_layout(&layout_info, None)? })
}

pub fn create_sampler(device: &ash::Device) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .max_lod(vk::LOD_CLAMP_NONE);
    Ok(unsafe { device.create_sampler(&sampler_info, None)? })
}

/// Triangle-list pipeline rendering into `desc.color_format` (and depth, when set) with dynamic
/// rendering. Viewport and scissor are dynamic.
pub fn create_graphics_pipeline(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    desc: &PipelineDesc,
) -> Result<vk::Pipeline> {
    let spirv = compile_wgsl(desc.name, desc.shader)?;
    let module = unsafe {
        device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(&spirv), None)?
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(module)
            .name(c"vs_main"),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(module)
            .name(c"fs_main"),
    ];

    let vertex_bindings = [vk::VertexInputBindingDescription::default()
        .binding(0)
        .stride(desc.vertex_stride)
        .input_rate(vk::VertexInputRate::VERTEX)];
    let vertex_attributes = desc
        .vertex_attributes
        .iter()
        .map(|attribute| {
            vk::VertexInputAttributeDescription::default()
                .location(attribute.location)
                .binding(0)
                .format(convert::vertex_format(attribute.format))
                .offset(attribute.offset)
        })
        .collect::<Vec<_>>();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_format.is_some())
        .depth_write_enable(desc.depth_format.is_some())
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(false)
        .color_write_mask(vk::ColorComponentFlags::RGBA)];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
        .attachments(&color_blend_attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default()
        .dynamic_states(&dynamic_states);

    let color_formats = [convert::format(desc.color_format)];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(desc.depth_format.map_or(vk::Format::UNDEFINED, convert::format));

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let result = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    unsafe { device.destroy_shader_module(module, None) };

    let pipelines = result.map_err(|(_, e)| eyre!("Failed to create pipeline '{}': {}", desc.name, e))?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| eyre!("Pipeline '{}' was not created", desc.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_shaders_compile_to_spirv() {
        for (name, source) in [
            ("mesh", include_str!("../../resources/shaders/mesh.wgsl")),
            ("sprite", include_str!("../../resources/shaders/sprite.wgsl")),
        ] {
            let words = compile_wgsl(name, source).unwrap();
            assert_eq!(words[0], 0x0723_0203);
        }
    }
}
