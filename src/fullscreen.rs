//! The shared fullscreen quad and the pipeline builder used by every screen-space pass.

use std::mem::offset_of;

use ash::vk;
use ash::vk::Handle;
use bytemuck::{Pod, Zeroable};

use crate::error::{Result, VkResultExt};
use crate::gpu::{CommandRecorder, GpuDevice};
use crate::resource::GpuBuffer;

//==================================================================================================
// SECTION: Quad Geometry
//==================================================================================================

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub pos: [f32; 2],
}

impl QuadVertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(size_of::<QuadVertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 1] {
        [vk::VertexInputAttributeDescription::default()
            .binding(0)
            .location(0)
            .format(vk::Format::R32G32_SFLOAT)
            .offset(offset_of!(QuadVertex, pos) as u32)]
    }
}

/// Triangle-strip order: top-left, bottom-left, top-right, bottom-right in clip space.
pub const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex { pos: [-1.0, -1.0] },
    QuadVertex { pos: [-1.0, 1.0] },
    QuadVertex { pos: [1.0, -1.0] },
    QuadVertex { pos: [1.0, 1.0] },
];

#[derive(Clone, Copy, Debug, Default)]
pub struct FullscreenQuad {
    pub buffer: GpuBuffer,
}

impl FullscreenQuad {
    pub fn create(&mut self, device: &dyn GpuDevice) -> Result<()> {
        let bytes = bytemuck::cast_slice::<QuadVertex, u8>(&QUAD_VERTICES);
        self.buffer.create(
            device,
            "fullscreen quad",
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        self.buffer.upload(device, bytes)
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        self.buffer.destroy(device);
    }

    /// Binds the quad and draws it. The caller has already bound pipeline and descriptors.
    pub fn draw(&self, recorder: &mut dyn CommandRecorder) {
        recorder.bind_vertex_buffer(self.buffer.buffer, 0);
        recorder.draw(QUAD_VERTICES.len() as u32, 1);
    }
}

//==================================================================================================
// SECTION: Pipeline Builder
//==================================================================================================

/// Fixed-function choices that differ between the screen-space passes.
#[derive(Clone, Copy)]
pub struct FullscreenPipelineDesc<'a> {
    pub name: &'static str,
    pub vert: &'a [u32],
    pub frag: &'a [u32],
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    /// Baked viewport. `None` makes viewport and scissor dynamic.
    pub viewport: Option<vk::Viewport>,
    pub alpha_blend: bool,
    pub specialization: Option<&'a vk::SpecializationInfo<'a>>,
}

/// Builds a quad pipeline with no depth test. Shader modules are released before returning,
/// on success and on failure.
pub fn create_fullscreen_pipeline(
    device: &dyn GpuDevice,
    desc: &FullscreenPipelineDesc<'_>,
) -> Result<vk::Pipeline> {
    let vert_module = device
        .create_shader_module(desc.vert)
        .step(format!("{} vertex shader", desc.name))?;
    let frag_module = match device
        .create_shader_module(desc.frag)
        .step(format!("{} fragment shader", desc.name))
    {
        Ok(module) => module,
        Err(err) => {
            device.destroy_shader_module(vert_module);
            return Err(err);
        }
    };

    let pipeline = build_pipeline(device, desc, vert_module, frag_module);

    if !vert_module.is_null() {
        device.destroy_shader_module(vert_module);
    }
    if !frag_module.is_null() {
        device.destroy_shader_module(frag_module);
    }
    pipeline
}

fn build_pipeline(
    device: &dyn GpuDevice,
    desc: &FullscreenPipelineDesc<'_>,
    vert_module: vk::ShaderModule,
    frag_module: vk::ShaderModule,
) -> Result<vk::Pipeline> {
    let main_function_name = c"main";
    let mut frag_stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_module)
        .name(main_function_name);
    if let Some(specialization) = desc.specialization {
        frag_stage = frag_stage.specialization_info(specialization);
    }
    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(main_function_name),
        frag_stage,
    ];

    let binding_descriptions = [QuadVertex::binding_description()];
    let attribute_descriptions = QuadVertex::attribute_descriptions();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_STRIP)
        .primitive_restart_enable(false);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);
    let baked_viewports: Vec<vk::Viewport> = desc.viewport.into_iter().collect();
    let baked_scissors: Vec<vk::Rect2D> = desc
        .viewport
        .map(|v| {
            vk::Rect2D::default()
                .offset(vk::Offset2D {
                    x: v.x as i32,
                    y: v.y as i32,
                })
                .extent(vk::Extent2D {
                    width: v.width as u32,
                    height: v.height as u32,
                })
        })
        .into_iter()
        .collect();
    let viewport_state = if desc.viewport.is_some() {
        vk::PipelineViewportStateCreateInfo::default()
            .viewports(&baked_viewports)
            .scissors(&baked_scissors)
    } else {
        vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1)
    };

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(desc.alpha_blend)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD);
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .logic_op(vk::LogicOp::COPY)
        .attachments(std::slice::from_ref(&color_blend_attachment))
        .blend_constants([0.0, 0.0, 0.0, 0.0]);

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(false)
        .depth_write_enable(false)
        .stencil_test_enable(false);

    let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .layout(desc.layout)
        .render_pass(desc.render_pass)
        .subpass(0);
    if desc.viewport.is_none() {
        pipeline_info = pipeline_info.dynamic_state(&dynamic_state);
    }

    device
        .create_graphics_pipeline(&pipeline_info)
        .step(format!("{} pipeline", desc.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::full_viewport;
    use crate::gpu::mock::{Cmd, Kind, MockDevice, MockRecorder};
    use crate::resource::RenderPassResource;

    fn pass_and_layout(device: &MockDevice) -> (RenderPassResource, vk::PipelineLayout) {
        let attachment = vk::AttachmentDescription::default()
            .format(vk::Format::B8G8R8A8_UNORM)
            .samples(vk::SampleCountFlags::TYPE_1);
        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref));
        let mut pass = RenderPassResource::default();
        pass.create(device, "test", &[attachment], &[subpass], &[])
            .unwrap();
        let layout = device
            .create_pipeline_layout(&vk::PipelineLayoutCreateInfo::default())
            .unwrap();
        (pass, layout)
    }

    #[test]
    fn quad_is_four_vec2_vertices() {
        assert_eq!(size_of::<QuadVertex>(), 8);
        let device = MockDevice::new();
        let mut quad = FullscreenQuad::default();
        quad.create(&device).unwrap();
        assert_eq!(quad.buffer.size, 32);

        let mut recorder = MockRecorder::new();
        quad.draw(&mut recorder);
        assert!(matches!(recorder.cmds[1], Cmd::Draw(4)));

        quad.destroy(&device);
        assert_eq!(device.total_live(), 0);
    }

    #[test]
    fn baked_viewport_versus_dynamic_state() {
        let device = MockDevice::new();
        let (pass, layout) = pass_and_layout(&device);
        let mut desc = FullscreenPipelineDesc {
            name: "test",
            vert: &[],
            frag: &[],
            render_pass: pass.handle,
            layout,
            viewport: Some(full_viewport(vk::Extent2D {
                width: 640,
                height: 480,
            })),
            alpha_blend: false,
            specialization: None,
        };
        let fixed = create_fullscreen_pipeline(&device, &desc).unwrap();
        let record = device.pipeline(fixed);
        assert_eq!(record.fixed_viewport, Some((640.0, 480.0)));
        assert!(record.dynamic_states.is_empty());

        desc.viewport = None;
        let dynamic = create_fullscreen_pipeline(&device, &desc).unwrap();
        let record = device.pipeline(dynamic);
        assert_eq!(record.fixed_viewport, None);
        assert!(record.dynamic_states.contains(&vk::DynamicState::VIEWPORT));

        assert_eq!(device.live(Kind::ShaderModule), 0);
    }

    #[test]
    fn failed_pipeline_still_releases_shader_modules() {
        let device = MockDevice::new();
        let (pass, layout) = pass_and_layout(&device);
        device.fail_next(Kind::Pipeline);
        let desc = FullscreenPipelineDesc {
            name: "test",
            vert: &[],
            frag: &[],
            render_pass: pass.handle,
            layout,
            viewport: None,
            alpha_blend: true,
            specialization: None,
        };
        let err = create_fullscreen_pipeline(&device, &desc).unwrap_err();
        assert_eq!(err.failed_step(), Some("test pipeline"));
        assert_eq!(device.live(Kind::ShaderModule), 0);
        assert_eq!(device.created(Kind::ShaderModule), 2);
    }
}
