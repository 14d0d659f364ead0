//! Shadow-map preview drawn on top of the composite, in the lower-left corner.

use ash::vk;
use ash::vk::Handle;
use log::*;

use crate::error::{RenderError, Result, VkResultExt};
use crate::fullscreen::{FullscreenPipelineDesc, FullscreenQuad, create_fullscreen_pipeline};
use crate::gpu::{CommandRecorder, GpuDevice};
use crate::shader::ShaderSet;

const MARGIN: f32 = 16.0;

/// Square preview a quarter of the shorter edge, inset from the lower-left corner.
pub fn preview_viewport(extent: vk::Extent2D) -> vk::Viewport {
    let size = (extent.width.min(extent.height) as f32 / 4.0).max(1.0);
    vk::Viewport::default()
        .x(MARGIN)
        .y((extent.height as f32 - size - MARGIN).max(0.0))
        .width(size)
        .height(size)
        .min_depth(0.0)
        .max_depth(1.0)
}

#[derive(Debug, Default)]
pub struct DebugOverlay {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub sampler: vk::Sampler,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_set: vk::DescriptorSet,
}

impl DebugOverlay {
    pub fn create_layouts(&mut self, device: &dyn GpuDevice) -> Result<()> {
        if self.has_layout() {
            return Err(RenderError::StillLive("debug overlay layouts"));
        }
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        self.descriptor_set_layout = device
            .create_descriptor_set_layout(&layout_info)
            .step("debug overlay descriptor set layout")?;

        let set_layouts = [self.descriptor_set_layout];
        let pipeline_layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        self.pipeline_layout = device
            .create_pipeline_layout(&pipeline_layout_info)
            .step("debug overlay pipeline layout")?;

        // Raw depth reads; the shadow sampler's compare op would turn them into 0/1 tests.
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
        self.sampler = device
            .create_sampler(&sampler_info)
            .step("debug overlay sampler")?;

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(1);
        self.descriptor_pool = device
            .create_descriptor_pool(&pool_info)
            .step("debug overlay descriptor pool")?;

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        self.descriptor_set = device
            .allocate_descriptor_sets(&alloc_info)
            .step("debug overlay descriptor set")?
            .first()
            .copied()
            .ok_or(RenderError::NotCreated("debug overlay descriptor set"))?;
        Ok(())
    }

    pub fn has_layout(&self) -> bool {
        !self.pipeline_layout.is_null()
    }

    /// Builds the pipeline with the preview viewport for `extent`.
    pub fn rebuild(
        &mut self,
        device: &dyn GpuDevice,
        shaders: &ShaderSet,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
    ) -> Result<()> {
        if !self.has_layout() {
            return Err(RenderError::NotCreated("debug overlay layouts"));
        }
        if !self.pipeline.is_null() {
            return Err(RenderError::StillLive("debug overlay pipeline"));
        }
        self.pipeline = create_fullscreen_pipeline(
            device,
            &FullscreenPipelineDesc {
                name: "debug overlay",
                vert: &shaders.overlay_vert,
                frag: &shaders.overlay_frag,
                render_pass,
                layout: self.pipeline_layout,
                viewport: Some(preview_viewport(extent)),
                alpha_blend: true,
                specialization: None,
            },
        )?;
        debug!("Rebuilt debug overlay for {}x{}.", extent.width, extent.height);
        Ok(())
    }

    pub fn destroy_pipeline(&mut self, device: &dyn GpuDevice) {
        if !self.pipeline.is_null() {
            device.destroy_pipeline(self.pipeline);
            self.pipeline = vk::Pipeline::null();
        }
    }

    pub fn update_descriptor(&self, device: &dyn GpuDevice, shadow_view: vk::ImageView) {
        if self.descriptor_set.is_null() {
            return;
        }
        let image_info = [vk::DescriptorImageInfo::default()
            .sampler(self.sampler)
            .image_view(shadow_view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        device.update_descriptor_sets(&[write]);
    }

    /// Records the preview quad if the pipeline exists; a missing pipeline draws nothing.
    pub fn render(&self, recorder: &mut dyn CommandRecorder, quad: &FullscreenQuad) {
        if self.pipeline.is_null() {
            return;
        }
        recorder.bind_pipeline(self.pipeline);
        recorder.bind_descriptor_sets(self.pipeline_layout, 0, &[self.descriptor_set]);
        quad.draw(recorder);
    }

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
        self.descriptor_set = vk::DescriptorSet::null();
        if !self.descriptor_set_layout.is_null() {
            device.destroy_descriptor_set_layout(self.descriptor_set_layout);
            self.descriptor_set_layout = vk::DescriptorSetLayout::null();
        }
        if !self.sampler.is_null() {
            device.destroy_sampler(self.sampler);
            self.sampler = vk::Sampler::null();
        }
    }
}
