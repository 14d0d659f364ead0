//! Procedural demo scene: a ground slab and a grid of boxes, some of them emissive enough to bloom.

use std::mem::{offset_of, size_of};
use std::path::Path;

use anyhow::{Result, anyhow};
use ash::vk;
use ash::vk::Handle;
use bytemuck::{Pod, Zeroable};
use log::*;
use nalgebra::{Matrix4, Point3, Vector3};

use frameforge::config::RendererConfig;
use frameforge::gpu::{CommandRecorder, GpuDevice, full_scissor, full_viewport};
use frameforge::resource::{GpuBuffer, PersistentUniformBuffer};
use frameforge::shader::read_words;
use frameforge::temporal::CameraFrame;
use frameforge::{FrameScene, ShadowCasters};

type Vec3 = Vector3<f32>;
type Mat4 = Matrix4<f32>;

const GRID: i32 = 6;
const SPACING: f32 = 14.0;
const ORBIT_RADIUS: f32 = 90.0;
const ORBIT_HEIGHT: f32 = 35.0;
const ORBIT_SPEED: f32 = 0.08;

//==================================================================================================
// SECTION: Vertex and Uniform Layouts
//==================================================================================================

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    /// Components above 1.0 mark the surface as emissive.
    pub color: [f32; 3],
}

impl Vertex {
    fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
    }

    fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        let attribute = |location, offset| {
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(location)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset as u32)
        };
        [
            attribute(0, offset_of!(Vertex, pos)),
            attribute(1, offset_of!(Vertex, normal)),
            attribute(2, offset_of!(Vertex, color)),
        ]
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct SceneUniforms {
    pub view_proj: [[f32; 4]; 4],
    pub light_view_proj: [[f32; 4]; 4],
    /// Towards the sun; `w` is the intensity.
    pub sun_dir: [f32; 4],
    pub sun_color: [f32; 4],
}

//==================================================================================================
// SECTION: Geometry
//==================================================================================================

/// Axis-aligned box with per-face normals, 24 vertices and 36 indices.
fn push_box(
    vertices: &mut Vec<Vertex>,
    indices: &mut Vec<u32>,
    center: Vec3,
    half: Vec3,
    color: [f32; 3],
) {
    let faces: [(Vec3, Vec3, Vec3); 6] = [
        (Vec3::x(), Vec3::y(), Vec3::z()),
        (-Vec3::x(), Vec3::z(), Vec3::y()),
        (Vec3::y(), Vec3::z(), Vec3::x()),
        (-Vec3::y(), Vec3::x(), Vec3::z()),
        (Vec3::z(), Vec3::x(), Vec3::y()),
        (-Vec3::z(), Vec3::y(), Vec3::x()),
    ];
    for (normal, u, v) in faces {
        let base = vertices.len() as u32;
        let face_center = center + normal.component_mul(&half);
        let du = u.component_mul(&half);
        let dv = v.component_mul(&half);
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let p = face_center + du * su + dv * sv;
            vertices.push(Vertex {
                pos: p.into(),
                normal: normal.into(),
                color,
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
}

pub fn build_geometry() -> (Vec<Vertex>, Vec<u32>) {
    let mut vertices = Vec::new();
    let mut indices = Vec::new();

    let ground = GRID as f32 * SPACING;
    push_box(
        &mut vertices,
        &mut indices,
        Vec3::new(0.0, -0.5, 0.0),
        Vec3::new(ground, 0.5, ground),
        [0.35, 0.35, 0.38],
    );

    for x in -GRID / 2..GRID / 2 {
        for z in -GRID / 2..GRID / 2 {
            let cell = (x * 31 + z * 17).rem_euclid(7) as f32;
            let height = 4.0 + cell * 3.0;
            let center = Vec3::new(
                (x as f32 + 0.5) * SPACING,
                height * 0.5,
                (z as f32 + 0.5) * SPACING,
            );
            push_box(
                &mut vertices,
                &mut indices,
                center,
                Vec3::new(4.0, height * 0.5, 4.0),
                [0.55, 0.5 + cell * 0.04, 0.45],
            );
            // Neon strip on every third tower.
            if (x + z).rem_euclid(3) == 0 {
                push_box(
                    &mut vertices,
                    &mut indices,
                    center + Vec3::new(0.0, height * 0.5 + 0.3, 0.0),
                    Vec3::new(4.2, 0.3, 4.2),
                    [6.0, 1.2 + cell * 0.5, 4.0],
                );
            }
        }
    }
    (vertices, indices)
}

//==================================================================================================
// SECTION: Camera
//==================================================================================================

/// Maps GL clip space to Vulkan's: flips Y and squeezes depth from [-1, 1] to [0, 1].
fn vulkan_clip() -> Mat4 {
    Mat4::new(
        1.0, 0.0, 0.0, 0.0, //
        0.0, -1.0, 0.0, 0.0, //
        0.0, 0.0, 0.5, 0.5, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Slow orbit around the grid centre.
pub fn orbit_camera(extent: vk::Extent2D, time: f32) -> CameraFrame {
    let angle = time * ORBIT_SPEED;
    let position = Point3::new(
        ORBIT_RADIUS * angle.cos(),
        ORBIT_HEIGHT,
        ORBIT_RADIUS * angle.sin(),
    );
    let view = Mat4::look_at_rh(&position, &Point3::new(0.0, 8.0, 0.0), &Vec3::y_axis());
    let aspect = extent.width.max(1) as f32 / extent.height.max(1) as f32;
    let proj = vulkan_clip() * Mat4::new_perspective(aspect, 50.0f32.to_radians(), 0.5, 500.0);
    CameraFrame {
        view,
        proj,
        position,
    }
}

/// Orthographic light frustum centred on the origin, looking along `-sun_dir`.
pub fn light_view_proj(config: &RendererConfig) -> Mat4 {
    let direction = Vec3::from(config.sky_light.direction);
    let to_sun = (-direction).try_normalize(1e-6).unwrap_or_else(Vec3::y);
    let eye = Point3::from(to_sun * config.shadow.distance * 0.5);
    let up = if to_sun.y.abs() > 0.99 {
        Vec3::z_axis()
    } else {
        Vec3::y_axis()
    };
    let view = Mat4::look_at_rh(&eye, &Point3::origin(), &up);
    let c = config.shadow.coverage;
    let proj = Mat4::new_orthographic(-c, c, -c, c, 0.1, config.shadow.distance);
    vulkan_clip() * proj * view
}

//==================================================================================================
// SECTION: DemoScene
//==================================================================================================

#[derive(Debug, Default)]
pub struct DemoScene {
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    index_count: u32,
    uniforms: PersistentUniformBuffer,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    pipeline_layout: vk::PipelineLayout,
    main_pipeline: vk::Pipeline,
    shadow_pipeline: vk::Pipeline,
}

impl DemoScene {
    /// Builds buffers and both pipelines. On error, call [`DemoScene::destroy`].
    pub fn create(
        &mut self,
        device: &dyn GpuDevice,
        hdr_render_pass: vk::RenderPass,
        shadow_render_pass: vk::RenderPass,
        frames_in_flight: usize,
        shader_dir: &Path,
    ) -> Result<()> {
        let (vertices, indices) = build_geometry();
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let vertex_bytes = bytemuck::cast_slice::<Vertex, u8>(&vertices);
        self.vertex_buffer.create(
            device,
            "scene vertex",
            vertex_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            host,
        )?;
        self.vertex_buffer.upload(device, vertex_bytes)?;
        let index_bytes = bytemuck::cast_slice::<u32, u8>(&indices);
        self.index_buffer.create(
            device,
            "scene index",
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER,
            host,
        )?;
        self.index_buffer.upload(device, index_bytes)?;
        self.index_count = indices.len() as u32;

        self.uniforms.create(
            device,
            "scene uniforms",
            size_of::<SceneUniforms>() as vk::DeviceSize,
            frames_in_flight,
        )?;
        self.create_descriptors(device, frames_in_flight)?;

        let scene_vert = read_words(&shader_dir.join("scene.vert.spv"))?;
        let scene_frag = read_words(&shader_dir.join("scene.frag.spv"))?;
        let shadow_vert = read_words(&shader_dir.join("shadow.vert.spv"))?;
        self.main_pipeline = create_mesh_pipeline(
            device,
            &scene_vert,
            Some(&scene_frag),
            hdr_render_pass,
            self.pipeline_layout,
        )?;
        self.shadow_pipeline = create_mesh_pipeline(
            device,
            &shadow_vert,
            None,
            shadow_render_pass,
            self.pipeline_layout,
        )?;
        info!(
            "Demo scene ready: {} vertices, {} indices.",
            vertices.len(),
            indices.len()
        );
        Ok(())
    }

    fn create_descriptors(
        &mut self,
        device: &dyn GpuDevice,
        frames_in_flight: usize,
    ) -> Result<()> {
        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);
        let layout_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(std::slice::from_ref(&binding));
        self.descriptor_set_layout = device.create_descriptor_set_layout(&layout_info)?;

        let set_layouts = [self.descriptor_set_layout];
        let pipeline_layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        self.pipeline_layout = device.create_pipeline_layout(&pipeline_layout_info)?;

        let pool_size = vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(frames_in_flight as u32);
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(std::slice::from_ref(&pool_size))
            .max_sets(frames_in_flight as u32);
        self.descriptor_pool = device.create_descriptor_pool(&pool_info)?;

        let layouts = vec![self.descriptor_set_layout; frames_in_flight];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        self.descriptor_sets = device.allocate_descriptor_sets(&alloc_info)?;

        for (slot, &set) in self.descriptor_sets.iter().enumerate() {
            let buffer_info = [vk::DescriptorBufferInfo::default()
                .buffer(self.uniforms.buffer(slot))
                .offset(0)
                .range(self.uniforms.size())];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info);
            device.update_descriptor_sets(&[write]);
        }
        Ok(())
    }

    /// Writes the slot's uniforms. The slot's fence must already be waited on.
    pub fn update(&self, slot: usize, camera: &CameraFrame, config: &RendererConfig) -> Result<()> {
        let direction = Vec3::from(config.sky_light.direction);
        let to_sun = (-direction).try_normalize(1e-6).unwrap_or_else(Vec3::y);
        let intensity = if config.sky_light.enabled {
            config.sky_light.intensity
        } else {
            0.0
        };
        let uniforms = SceneUniforms {
            view_proj: (camera.proj * camera.view).into(),
            light_view_proj: light_view_proj(config).into(),
            sun_dir: [to_sun.x, to_sun.y, to_sun.z, intensity],
            sun_color: [
                config.sky_light.color[0],
                config.sky_light.color[1],
                config.sky_light.color[2],
                1.0,
            ],
        };
        self.uniforms
            .write(slot, bytemuck::bytes_of(&uniforms))
            .map_err(|e| anyhow!("scene uniforms: {e}"))
    }

    /// Safe on partial state.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        for pipeline in [&mut self.shadow_pipeline, &mut self.main_pipeline] {
            if !pipeline.is_null() {
                device.destroy_pipeline(*pipeline);
                *pipeline = vk::Pipeline::null();
            }
        }
        if !self.pipeline_layout.is_null() {
            device.destroy_pipeline_layout(self.pipeline_layout);
            self.pipeline_layout = vk::PipelineLayout::null();
        }
        if !self.descriptor_pool.is_null() {
            device.destroy_descriptor_pool(self.descriptor_pool);
            self.descriptor_pool = vk::DescriptorPool::null();
        }
        self.descriptor_sets.clear();
        if !self.descriptor_set_layout.is_null() {
            device.destroy_descriptor_set_layout(self.descriptor_set_layout);
            self.descriptor_set_layout = vk::DescriptorSetLayout::null();
        }
        self.uniforms.destroy(device);
        self.index_buffer.destroy(device);
        self.vertex_buffer.destroy(device);
        self.index_count = 0;
    }
}

impl FrameScene for DemoScene {
    fn shadow_casters(&self, slot: usize) -> ShadowCasters {
        ShadowCasters {
            pipeline: self.shadow_pipeline,
            layout: self.pipeline_layout,
            vertex_buffer: self.vertex_buffer.buffer,
            index_buffer: self.index_buffer.buffer,
            index_type: vk::IndexType::UINT32,
            index_count: self.index_count,
            descriptor_set: self.descriptor_sets.get(slot).copied().unwrap_or_default(),
        }
    }

    fn record_main(&self, recorder: &mut dyn CommandRecorder, slot: usize, extent: vk::Extent2D) {
        let Some(&set) = self.descriptor_sets.get(slot) else {
            warn!("No scene descriptor set for slot {slot}, skipping main pass draws.");
            return;
        };
        recorder.bind_pipeline(self.main_pipeline);
        recorder.set_viewport(full_viewport(extent));
        recorder.set_scissor(full_scissor(extent));
        recorder.bind_vertex_buffer(self.vertex_buffer.buffer, 0);
        recorder.bind_index_buffer(self.index_buffer.buffer, 0, vk::IndexType::UINT32);
        recorder.bind_descriptor_sets(self.pipeline_layout, 0, &[set]);
        recorder.draw_indexed(self.index_count, 1);
    }
}

//==================================================================================================
// SECTION: Pipelines
//==================================================================================================

/// Mesh pipeline with depth test and dynamic viewport. Without a fragment shader it is a
/// depth-only shadow caster with slope-scaled bias.
fn create_mesh_pipeline(
    device: &dyn GpuDevice,
    vert: &[u32],
    frag: Option<&[u32]>,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    let vert_module = device.create_shader_module(vert)?;
    let frag_module = match frag.map(|code| device.create_shader_module(code)).transpose() {
        Ok(module) => module,
        Err(err) => {
            device.destroy_shader_module(vert_module);
            return Err(err.into());
        }
    };

    let main_function_name = c"main";
    let mut shader_stages = vec![
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(main_function_name),
    ];
    if let Some(module) = frag_module {
        shader_stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(module)
                .name(main_function_name),
        );
    }
    let depth_only = frag_module.is_none();

    let binding_descriptions = [Vertex::binding_description()];
    let attribute_descriptions = Vertex::attribute_descriptions();
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(depth_only)
        .depth_bias_constant_factor(1.25)
        .depth_bias_slope_factor(1.75);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false);
    let color_attachments: &[vk::PipelineColorBlendAttachmentState] = if depth_only {
        &[]
    } else {
        std::slice::from_ref(&color_blend_attachment)
    };
    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(color_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let pipeline = device.create_graphics_pipeline(&pipeline_info);

    device.destroy_shader_module(vert_module);
    if let Some(module) = frag_module {
        device.destroy_shader_module(module);
    }
    Ok(pipeline?)
}
