//! The bloom mip ladder: a fixed number of successively halved HDR targets, each written by one
//! fullscreen downsample pass that samples the level above it.

use ash::vk;
use ash::vk::Handle;
use bytemuck::{Pod, Zeroable};
use log::*;

use crate::error::{RenderError, Result, VkResultExt};
use crate::fullscreen::{FullscreenPipelineDesc, FullscreenQuad, create_fullscreen_pipeline};
use crate::gpu::{CommandRecorder, GpuDevice, full_scissor, full_viewport};
use crate::resource::{FramebufferResource, GpuImage, ImageDesc, RenderPassResource};
use crate::shader::ShaderSet;

pub const BLOOM_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// Extents of `count` levels below `extent`: floor-halved per level, never below 1×1.
pub fn mip_extents(extent: vk::Extent2D, count: u32) -> Vec<vk::Extent2D> {
    let mut current = extent;
    (0..count)
        .map(|_| {
            current = vk::Extent2D {
                width: (current.width / 2).max(1),
                height: (current.height / 2).max(1),
            };
            current
        })
        .collect()
}

/// Downsample push constants. `src_texel` is one texel of the level being sampled.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct BloomPushConstants {
    pub src_texel: [f32; 2],
    pub threshold: f32,
    /// 1 on the level that reads the HDR target and applies the bright-pass threshold.
    pub is_first: u32,
}

#[derive(Clone, Debug, Default)]
pub struct BloomLevel {
    pub image: GpuImage,
    pub framebuffer: FramebufferResource,
}

/// Render pass, pipeline and one descriptor set per level persist across resizes because the
/// pipeline uses dynamic viewport state. Only the level images and framebuffers follow the extent.
#[derive(Debug, Default)]
pub struct BloomChain {
    pub render_pass: RenderPassResource,
    pub levels: Vec<BloomLevel>,
    pub sampler: vk::Sampler,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    mip_count: u32,
}

impl BloomChain {
    /// Render pass → sampler → layouts → pipeline → pool → per-level descriptor sets.
    pub fn create_persistent(
        &mut self,
        device: &dyn GpuDevice,
        shaders: &ShaderSet,
        mip_count: u32,
    ) -> Result<()> {
        if self.render_pass.is_live() || !self.pipeline.is_null() {
            return Err(RenderError::StillLive("bloom chain"));
        }
        if mip_count == 0 {
            return Err(RenderError::InvalidConfig {
                field: "bloom.mip_count",
                reason: "must be at least 1",
            });
        }
        self.mip_count = mip_count;

        let attachment = vk::AttachmentDescription::default()
            .format(BLOOM_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref));
        // Each level's write must land before the next level samples it.
        let dependencies = [
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .src_access_mask(vk::AccessFlags::SHADER_READ)
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ),
        ];
        self.render_pass.create(
            device,
            "bloom",
            &[attachment],
            std::slice::from_ref(&subpass),
            &dependencies,
        )?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK);
        self.sampler = device
            .create_sampler(&sampler_info)
            .step("bloom sampler")?;

        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT);
        let layout_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(std::slice::from_ref(&binding));
        self.descriptor_set_layout = device
            .create_descriptor_set_layout(&layout_info)
            .step("bloom descriptor set layout")?;

        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(size_of::<BloomPushConstants>() as u32);
        let set_layouts = [self.descriptor_set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(std::slice::from_ref(&push_range));
        self.pipeline_layout = device
            .create_pipeline_layout(&pipeline_layout_info)
            .step("bloom pipeline layout")?;

        self.pipeline = create_fullscreen_pipeline(
            device,
            &FullscreenPipelineDesc {
                name: "bloom",
                vert: &shaders.fullscreen_vert,
                frag: &shaders.bloom_frag,
                render_pass: self.render_pass.handle,
                layout: self.pipeline_layout,
                viewport: None,
                alpha_blend: false,
                specialization: None,
            },
        )?;

        let pool_size = vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(self.mip_count);
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(std::slice::from_ref(&pool_size))
            .max_sets(self.mip_count);
        self.descriptor_pool = device
            .create_descriptor_pool(&pool_info)
            .step("bloom descriptor pool")?;

        let layouts = vec![self.descriptor_set_layout; self.mip_count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        self.descriptor_sets = device
            .allocate_descriptor_sets(&alloc_info)
            .step("bloom descriptor sets")?;
        Ok(())
    }

    /// One image and framebuffer per level, sized from `extent` by [`mip_extents`].
    pub fn create_levels(&mut self, device: &dyn GpuDevice, extent: vk::Extent2D) -> Result<()> {
        if !self.render_pass.is_live() {
            return Err(RenderError::NotCreated("bloom render pass"));
        }
        if !self.levels.is_empty() {
            return Err(RenderError::StillLive("bloom levels"));
        }
        for (index, level_extent) in mip_extents(extent, self.mip_count).into_iter().enumerate() {
            self.levels.push(BloomLevel::default());
            let level = &mut self.levels[index];
            let desc = ImageDesc::new_2d(
                "bloom level",
                level_extent,
                BLOOM_FORMAT,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                vk::ImageAspectFlags::COLOR,
            );
            level.image.create(device, &desc)?;
            level.framebuffer = FramebufferResource::create(
                device,
                "bloom level",
                &self.render_pass,
                &[level.image.view],
                level_extent,
            )?;
            debug!(
                "Bloom level {index}: {}x{}.",
                level_extent.width, level_extent.height
            );
        }
        Ok(())
    }

    /// Level 0 samples `hdr_view`; level i samples level i-1.
    pub fn update_descriptors(&self, device: &dyn GpuDevice, hdr_view: vk::ImageView) {
        let sources: Vec<vk::ImageView> = std::iter::once(hdr_view)
            .chain(self.levels.iter().map(|l| l.image.view))
            .take(self.levels.len())
            .collect();
        let image_infos: Vec<[vk::DescriptorImageInfo; 1]> = sources
            .iter()
            .map(|&view| {
                [vk::DescriptorImageInfo::default()
                    .sampler(self.sampler)
                    .image_view(view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)]
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet<'_>> = self
            .descriptor_sets
            .iter()
            .zip(&image_infos)
            .map(|(&set, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(0)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(info)
            })
            .collect();
        device.update_descriptor_sets(&writes);
    }

    /// Records one downsample pass per level, finest first.
    pub fn render(
        &self,
        recorder: &mut dyn CommandRecorder,
        quad: &FullscreenQuad,
        source_extent: vk::Extent2D,
        threshold: f32,
    ) {
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        }];
        let mut src_extent = source_extent;
        for (index, (level, &set)) in self.levels.iter().zip(&self.descriptor_sets).enumerate() {
            let extent = level.framebuffer.extent;
            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(self.render_pass.handle)
                .framebuffer(level.framebuffer.handle)
                .render_area(full_scissor(extent))
                .clear_values(&clear_values);
            recorder.begin_render_pass(&begin_info);
            recorder.bind_pipeline(self.pipeline);
            recorder.set_viewport(full_viewport(extent));
            recorder.set_scissor(full_scissor(extent));
            recorder.bind_descriptor_sets(self.pipeline_layout, 0, &[set]);
            let push = BloomPushConstants {
                src_texel: [
                    1.0 / src_extent.width as f32,
                    1.0 / src_extent.height as f32,
                ],
                threshold,
                is_first: u32::from(index == 0),
            };
            recorder.push_constants(
                self.pipeline_layout,
                vk::ShaderStageFlags::FRAGMENT,
                0,
                bytemuck::bytes_of(&push),
            );
            quad.draw(recorder);
            recorder.end_render_pass();
            src_extent = extent;
        }
    }

    pub fn destroy_levels(&mut self, device: &dyn GpuDevice) {
        for mut level in self.levels.drain(..) {
            level.framebuffer.destroy(device);
            level.image.destroy(device);
        }
    }

    /// Levels, then pipeline objects, then the render pass. Descriptor sets go with the pool.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        self.destroy_levels(device);
        if !self.pipeline.is_null() {
            device.destroy_pipeline(self.pipeline);
            self.pipeline = vk::Pipeline::null();
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
        if !self.sampler.is_null() {
            device.destroy_sampler(self.sampler);
            self.sampler = vk::Sampler::null();
        }
        self.render_pass.destroy(device);
    }

    pub fn views(&self) -> Vec<vk::ImageView> {
        self.levels.iter().map(|l| l.image.view).collect()
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }
}
