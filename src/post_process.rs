//! The final composite: tonemap, bloom blend, chromatic aberration and volumetric scattering,
//! drawn as one fullscreen quad into the swapchain render pass.

use std::mem::offset_of;

use ash::vk;
use ash::vk::Handle;
use bytemuck::{Pod, Zeroable};
use log::*;
use nalgebra::{Matrix4, Vector3};

use crate::config::RendererConfig;
use crate::error::{RenderError, Result, VkResultExt};
use crate::fullscreen::{FullscreenPipelineDesc, FullscreenQuad, create_fullscreen_pipeline};
use crate::gpu::{CommandRecorder, GpuDevice, full_viewport};
use crate::resource::PersistentUniformBuffer;
use crate::shader::ShaderSet;

//==================================================================================================
// SECTION: Uniform Layout
//==================================================================================================

/// Composite-time parameters. Mirrors the `Params` uniform block in `composite.frag` (std140).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct PostProcessParams {
    pub exposure: f32,
    pub bloom_threshold: f32,
    pub bloom_intensity: f32,
    pub chromatic_aberration_strength: f32,
    pub scattering_multiplier: f32,
    pub transmittance_floor: f32,
    pub transmittance_mix: f32,
    pub vignette_strength: f32,
    pub vignette_radius: f32,
    pub grain_strength: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub color_temperature: f32,
    pub time: f32,
    /// 1.0 when bindings 4/5 hold real scattering/transmittance, 0.0 when they hold placeholders.
    pub volumetrics_enabled: f32,
    pub bloom_levels: f32,
    /// Column-major.
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    /// Normalized direction towards the sun; `w` is the sky-light intensity.
    pub sun_world_dir: [f32; 4],
}

const _: () = assert!(size_of::<PostProcessParams>() == 208);
const _: () = assert!(offset_of!(PostProcessParams, view) == 64);
const _: () = assert!(offset_of!(PostProcessParams, sun_world_dir) == 192);

impl PostProcessParams {
    pub fn from_config(
        config: &RendererConfig,
        bloom_levels: u32,
        volumetrics_enabled: bool,
    ) -> Self {
        let [x, y, z] = config.sky_light.direction;
        // Config stores the direction light travels; the shader wants the way towards the sun.
        let towards_sun = -Vector3::new(x, y, z);
        let towards_sun = towards_sun
            .try_normalize(f32::EPSILON)
            .unwrap_or_else(Vector3::y);
        let intensity = if config.sky_light.enabled {
            config.sky_light.intensity
        } else {
            0.0
        };
        Self {
            exposure: config.tonemap.exposure,
            bloom_threshold: config.bloom.threshold,
            bloom_intensity: config.bloom.intensity,
            chromatic_aberration_strength: config.compositing.chromatic_aberration_strength,
            scattering_multiplier: config.compositing.scattering_multiplier,
            transmittance_floor: config.compositing.transmittance_floor,
            transmittance_mix: config.compositing.transmittance_mix,
            vignette_strength: config.tonemap.vignette_strength,
            vignette_radius: config.tonemap.vignette_radius,
            grain_strength: config.tonemap.grain_strength,
            contrast: config.tonemap.contrast,
            saturation: config.tonemap.saturation,
            color_temperature: config.tonemap.color_temperature,
            time: 0.0,
            volumetrics_enabled: if volumetrics_enabled { 1.0 } else { 0.0 },
            bloom_levels: bloom_levels as f32,
            view: Matrix4::identity().into(),
            proj: Matrix4::identity().into(),
            sun_world_dir: [towards_sun.x, towards_sun.y, towards_sun.z, intensity],
        }
    }

    pub fn with_camera(mut self, view: &Matrix4<f32>, proj: &Matrix4<f32>, time: f32) -> Self {
        self.view = (*view).into();
        self.proj = (*proj).into();
        self.time = time;
        self
    }
}

//==================================================================================================
// SECTION: Pipeline
//==================================================================================================

pub const BINDING_PARAMS: u32 = 0;
pub const BINDING_HDR: u32 = 1;
pub const BINDING_BLOOM: u32 = 2;
pub const BINDING_SHADOW: u32 = 3;
pub const BINDING_SCATTERING: u32 = 4;
pub const BINDING_TRANSMITTANCE: u32 = 5;

/// Image views the composite samples. Rebound after every recreation.
#[derive(Clone, Copy, Debug)]
pub struct PostProcessInputs<'a> {
    pub hdr_view: vk::ImageView,
    pub bloom_views: &'a [vk::ImageView],
    pub shadow_view: vk::ImageView,
    pub shadow_sampler: vk::Sampler,
    /// `None` when volumetrics are disabled or failed; the HDR view is bound in their place.
    pub scattering_view: Option<vk::ImageView>,
    pub transmittance_view: Option<vk::ImageView>,
}

/// Layouts, sampler, pool, per-slot sets and uniforms are extent-independent. The pipeline bakes a
/// fixed viewport and is rebuilt on every resize.
#[derive(Debug, Default)]
pub struct PostProcessPipeline {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub sampler: vk::Sampler,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    pub uniforms: PersistentUniformBuffer,
    bloom_levels: u32,
}

impl PostProcessPipeline {
    /// Descriptor set layout → pipeline layout → sampler → uniforms → pool → one set per slot.
    pub fn create_layouts(
        &mut self,
        device: &dyn GpuDevice,
        bloom_levels: u32,
        frames_in_flight: usize,
    ) -> Result<()> {
        if !self.descriptor_set_layout.is_null() {
            return Err(RenderError::StillLive("post-process layouts"));
        }
        if bloom_levels == 0 {
            return Err(RenderError::InvalidConfig {
                field: "bloom.mip_count",
                reason: "must be at least 1",
            });
        }
        self.bloom_levels = bloom_levels;

        let sampled = |binding: u32, count: u32| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(count)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
        };
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(BINDING_PARAMS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            sampled(BINDING_HDR, 1),
            sampled(BINDING_BLOOM, self.bloom_levels),
            sampled(BINDING_SHADOW, 1),
            sampled(BINDING_SCATTERING, 1),
            sampled(BINDING_TRANSMITTANCE, 1),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.descriptor_set_layout = device
            .create_descriptor_set_layout(&layout_info)
            .step("post-process descriptor set layout")?;

        let set_layouts = [self.descriptor_set_layout];
        let pipeline_layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        self.pipeline_layout = device
            .create_pipeline_layout(&pipeline_layout_info)
            .step("post-process pipeline layout")?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        self.sampler = device
            .create_sampler(&sampler_info)
            .step("post-process sampler")?;

        self.uniforms.create(
            device,
            "post-process uniforms",
            size_of::<PostProcessParams>() as vk::DeviceSize,
            frames_in_flight,
        )?;

        let slots = frames_in_flight as u32;
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(slots),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(slots * (self.bloom_levels + 4)),
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(slots);
        self.descriptor_pool = device
            .create_descriptor_pool(&pool_info)
            .step("post-process descriptor pool")?;

        let layouts = vec![self.descriptor_set_layout; frames_in_flight];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        self.descriptor_sets = device
            .allocate_descriptor_sets(&alloc_info)
            .step("post-process descriptor sets")?;
        Ok(())
    }

    /// Builds the composite pipeline with a viewport baked to `extent`.
    pub fn create_pipeline(
        &mut self,
        device: &dyn GpuDevice,
        shaders: &ShaderSet,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<()> {
        if self.pipeline_layout.is_null() {
            return Err(RenderError::NotCreated("post-process pipeline layout"));
        }
        if !self.pipeline.is_null() {
            return Err(RenderError::StillLive("post-process pipeline"));
        }
        // constant_id 0 sizes the bloom sampler array in the shader.
        let map_entries = [vk::SpecializationMapEntry::default()
            .constant_id(0)
            .offset(0)
            .size(size_of::<u32>())];
        let bloom_levels = self.bloom_levels.to_ne_bytes();
        let specialization = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(&bloom_levels);

        self.pipeline = create_fullscreen_pipeline(
            device,
            &FullscreenPipelineDesc {
                name: "post-process",
                vert: &shaders.fullscreen_vert,
                frag: &shaders.composite_frag,
                render_pass,
                layout: self.pipeline_layout,
                viewport: Some(full_viewport(extent)),
                alpha_blend: false,
                specialization: Some(&specialization),
            },
        )?;
        debug!("Created {}x{} post-process pipeline.", extent.width, extent.height);
        Ok(())
    }

    pub fn destroy_pipeline(&mut self, device: &dyn GpuDevice) {
        if !self.pipeline.is_null() {
            device.destroy_pipeline(self.pipeline);
            self.pipeline = vk::Pipeline::null();
        }
    }

    /// Rewrites every binding of every slot's set. Binding slots are stable; views are not.
    pub fn update_descriptors(&self, device: &dyn GpuDevice, inputs: &PostProcessInputs<'_>) {
        let sampled = |view: vk::ImageView, sampler: vk::Sampler, layout: vk::ImageLayout| {
            vk::DescriptorImageInfo::default()
                .sampler(sampler)
                .image_view(view)
                .image_layout(layout)
        };
        let read_only = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        let hdr_info = [sampled(inputs.hdr_view, self.sampler, read_only)];
        let bloom_infos: Vec<vk::DescriptorImageInfo> = (0..self.bloom_levels as usize)
            .map(|i| {
                let view = inputs.bloom_views.get(i).copied().unwrap_or(inputs.hdr_view);
                sampled(view, self.sampler, read_only)
            })
            .collect();
        let shadow_info = [sampled(
            inputs.shadow_view,
            inputs.shadow_sampler,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        )];
        let volumetric = |view: Option<vk::ImageView>| match view {
            Some(view) => [sampled(view, self.sampler, vk::ImageLayout::GENERAL)],
            None => [sampled(inputs.hdr_view, self.sampler, read_only)],
        };
        let scattering_info = volumetric(inputs.scattering_view);
        let transmittance_info = volumetric(inputs.transmittance_view);

        let buffer_infos: Vec<[vk::DescriptorBufferInfo; 1]> = (0..self.descriptor_sets.len())
            .map(|slot| {
                [vk::DescriptorBufferInfo::default()
                    .buffer(self.uniforms.buffer(slot))
                    .offset(0)
                    .range(self.uniforms.size())]
            })
            .collect();

        let mut writes = Vec::with_capacity(self.descriptor_sets.len() * 6);
        for (&set, buffer_info) in self.descriptor_sets.iter().zip(&buffer_infos) {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(BINDING_PARAMS)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(buffer_info),
            );
            writes.push(image_write(set, BINDING_HDR, &hdr_info));
            writes.push(image_write(set, BINDING_BLOOM, &bloom_infos));
            writes.push(image_write(set, BINDING_SHADOW, &shadow_info));
            writes.push(image_write(set, BINDING_SCATTERING, &scattering_info));
            writes.push(image_write(set, BINDING_TRANSMITTANCE, &transmittance_info));
        }
        device.update_descriptor_sets(&writes);
    }

    /// Byte copy of `params` into the slot's mapped uniform buffer.
    pub fn update_ubo(&self, slot: usize, params: &PostProcessParams) -> Result<()> {
        self.uniforms.write(slot, bytemuck::bytes_of(params))
    }

    /// Records the composite draw. The caller has begun the swapchain render pass.
    pub fn render(
        &self,
        recorder: &mut dyn CommandRecorder,
        slot: usize,
        quad: &FullscreenQuad,
    ) -> Result<()> {
        if self.pipeline.is_null() {
            return Err(RenderError::NotCreated("post-process pipeline"));
        }
        let set = *self
            .descriptor_sets
            .get(slot)
            .ok_or(RenderError::SlotOutOfRange {
                slot,
                count: self.descriptor_sets.len(),
            })?;
        recorder.bind_pipeline(self.pipeline);
        recorder.bind_descriptor_sets(self.pipeline_layout, 0, &[set]);
        quad.draw(recorder);
        Ok(())
    }

    /// Pipeline → pipeline layout → pool (and its sets) → set layout → sampler → uniforms.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        self.destroy_pipeline(device);
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
        if !self.sampler.is_null() {
            device.destroy_sampler(self.sampler);
            self.sampler = vk::Sampler::null();
        }
        self.uniforms.destroy(device);
    }

    pub fn bloom_levels(&self) -> u32 {
        self.bloom_levels
    }
}

fn image_write<'a>(
    set: vk::DescriptorSet,
    binding: u32,
    infos: &'a [vk::DescriptorImageInfo],
) -> vk::WriteDescriptorSet<'a> {
    vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .dst_array_element(0)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::mock::{Cmd, Kind, MockDevice, MockRecorder};
    use crate::resource::RenderPassResource;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    fn swapchain_pass(device: &MockDevice) -> RenderPassResource {
        let attachment = vk::AttachmentDescription::default()
            .format(vk::Format::B8G8R8A8_UNORM)
            .samples(vk::SampleCountFlags::TYPE_1)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);
        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref));
        let mut pass = RenderPassResource::default();
        pass.create(device, "swapchain", &[attachment], &[subpass], &[])
            .unwrap();
        pass
    }

    fn views(base: u64, count: u64) -> Vec<vk::ImageView> {
        (0..count).map(|i| vk::ImageView::from_raw(base + i)).collect()
    }

    #[test]
    fn zero_bloom_levels_is_rejected() {
        let device = MockDevice::new();
        let mut post = PostProcessPipeline::default();
        assert!(matches!(
            post.create_layouts(&device, 0, 2),
            Err(RenderError::InvalidConfig { .. })
        ));
        assert_eq!(device.total_live(), 0);
    }

    #[test]
    fn params_mirror_config() {
        let config = RendererConfig::default();
        let params = PostProcessParams::from_config(&config, 5, false);
        assert_eq!(params.transmittance_floor, 0.7);
        assert_eq!(params.chromatic_aberration_strength, 0.002);
        assert_eq!(params.bloom_levels, 5.0);
        assert_eq!(params.volumetrics_enabled, 0.0);
        assert_eq!(params.sun_world_dir[3], 0.8);
        // Sun is above the scene for the default downward-travelling light.
        assert!(params.sun_world_dir[1] > 0.0);
        let dir = Vector3::new(
            params.sun_world_dir[0],
            params.sun_world_dir[1],
            params.sun_world_dir[2],
        );
        assert!((dir.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn ubo_write_round_trips_per_slot() {
        let device = MockDevice::new();
        let mut post = PostProcessPipeline::default();
        post.create_layouts(&device, 5, 3).unwrap();

        let params = PostProcessParams::from_config(&RendererConfig::default(), 5, true)
            .with_camera(
                &Matrix4::new_translation(&Vector3::new(1.0, 2.0, 3.0)),
                &Matrix4::identity(),
                4.5,
            );
        for slot in 0..3 {
            post.update_ubo(slot, &params).unwrap();
            let back: PostProcessParams =
                bytemuck::pod_read_unaligned(post.uniforms.read(slot).unwrap());
            assert_eq!(back, params);
        }
        assert!(matches!(
            post.update_ubo(3, &params),
            Err(RenderError::SlotOutOfRange { slot: 3, count: 3 })
        ));
    }

    #[test]
    fn pipeline_bakes_the_extent() {
        let device = MockDevice::new();
        let pass = swapchain_pass(&device);
        let mut post = PostProcessPipeline::default();
        post.create_layouts(&device, 5, 2).unwrap();
        post.create_pipeline(&device, &ShaderSet::default(), pass.handle, EXTENT)
            .unwrap();
        assert_eq!(
            device.pipeline(post.pipeline).fixed_viewport,
            Some((800.0, 600.0))
        );
        assert!(matches!(
            post.create_pipeline(&device, &ShaderSet::default(), pass.handle, EXTENT),
            Err(RenderError::StillLive(_))
        ));

        let layout = post.pipeline_layout;
        post.destroy_pipeline(&device);
        assert!(post.pipeline.is_null());
        assert!(device.is_live(Kind::PipelineLayout, layout));
    }

    #[test]
    fn descriptors_fall_back_to_hdr_without_volumetrics() {
        let device = MockDevice::new();
        let mut post = PostProcessPipeline::default();
        post.create_layouts(&device, 3, 2).unwrap();
        let hdr = vk::ImageView::from_raw(0x100);
        let bloom = views(0x200, 3);
        let inputs = PostProcessInputs {
            hdr_view: hdr,
            bloom_views: &bloom,
            shadow_view: vk::ImageView::from_raw(0x300),
            shadow_sampler: vk::Sampler::from_raw(0x301),
            scattering_view: None,
            transmittance_view: None,
        };
        post.update_descriptors(&device, &inputs);

        let writes = device.writes();
        assert_eq!(writes.len(), 12);
        let first_set: Vec<_> = writes
            .iter()
            .filter(|w| w.set == post.descriptor_sets[0])
            .collect();
        assert_eq!(first_set[0].buffers, vec![post.uniforms.buffer(0)]);
        assert_eq!(first_set[1].views, vec![hdr]);
        assert_eq!(first_set[2].views, bloom);
        assert_eq!(first_set[3].samplers, vec![vk::Sampler::from_raw(0x301)]);
        assert_eq!(first_set[4].views, vec![hdr]);
        assert_eq!(first_set[5].views, vec![hdr]);
        let second_set = writes.iter().find(|w| w.set == post.descriptor_sets[1]).unwrap();
        assert_eq!(second_set.buffers, vec![post.uniforms.buffer(1)]);

        device.clear_writes();
        let scattering = vk::ImageView::from_raw(0x400);
        post.update_descriptors(
            &device,
            &PostProcessInputs {
                scattering_view: Some(scattering),
                transmittance_view: Some(vk::ImageView::from_raw(0x401)),
                ..inputs
            },
        );
        let scatter_write = device
            .writes()
            .into_iter()
            .find(|w| w.binding == BINDING_SCATTERING)
            .unwrap();
        assert_eq!(scatter_write.views, vec![scattering]);
    }

    #[test]
    fn render_binds_the_slot_set() {
        let device = MockDevice::new();
        let pass = swapchain_pass(&device);
        let mut post = PostProcessPipeline::default();
        post.create_layouts(&device, 5, 2).unwrap();
        let mut recorder = MockRecorder::new();
        assert!(matches!(
            post.render(&mut recorder, 0, &FullscreenQuad::default()),
            Err(RenderError::NotCreated(_))
        ));

        post.create_pipeline(&device, &ShaderSet::default(), pass.handle, EXTENT)
            .unwrap();
        post.render(&mut recorder, 1, &FullscreenQuad::default())
            .unwrap();
        assert!(matches!(recorder.cmds[0], Cmd::BindPipeline(p) if p == post.pipeline));
        let slot_sets = vec![post.descriptor_sets[1]];
        assert!(matches!(&recorder.cmds[1], Cmd::BindSets(_, sets) if *sets == slot_sets));
        assert!(matches!(recorder.cmds[3], Cmd::Draw(4)));
    }

    #[test]
    fn destroy_releases_everything() {
        let device = MockDevice::new();
        let mut pass = swapchain_pass(&device);
        let mut post = PostProcessPipeline::default();
        post.create_layouts(&device, 5, 3).unwrap();
        post.create_pipeline(&device, &ShaderSet::default(), pass.handle, EXTENT)
            .unwrap();
        post.destroy(&device);
        pass.destroy(&device);
        assert_eq!(device.total_live(), 0);
        assert!(post.descriptor_sets.is_empty());
        assert!(!post.uniforms.is_live());
    }
}
