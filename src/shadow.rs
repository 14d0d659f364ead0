//! The extent-independent shadow map: a depth-only target written once per frame from the light's
//! viewpoint and sampled by the composite pass with hardware depth comparison.

use ash::vk;
use ash::vk::Handle;
use log::*;

use crate::error::{RenderError, Result, VkResultExt};
use crate::gpu::{CommandRecorder, GpuDevice, full_scissor, full_viewport};
use crate::resource::{FramebufferResource, GpuImage, ImageDesc, RenderPassResource};

pub const SHADOW_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Geometry and state the scene hands to the shadow pass for its single indexed draw.
#[derive(Clone, Copy, Debug)]
pub struct ShadowCasters {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_type: vk::IndexType,
    pub index_count: u32,
    pub descriptor_set: vk::DescriptorSet,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShadowState {
    #[default]
    Uninitialized,
    ReadyForWrite,
}

#[derive(Debug, Default)]
pub struct ShadowPass {
    pub image: GpuImage,
    pub sampler: vk::Sampler,
    pub render_pass: RenderPassResource,
    pub framebuffer: FramebufferResource,
    size: u32,
    state: ShadowState,
    /// Whether the image has left UNDEFINED, i.e. a render has completed at least once.
    written: bool,
}

impl ShadowPass {
    /// Image → memory → view → comparison sampler → render pass → framebuffer.
    ///
    /// Stops at the first failing step. Earlier sub-resources stay live until [`Self::destroy`].
    pub fn create(&mut self, device: &dyn GpuDevice, size: u32) -> Result<()> {
        if self.is_live() {
            return Err(RenderError::StillLive("shadow pass"));
        }
        if size == 0 {
            return Err(RenderError::InvalidConfig {
                field: "shadow.map_size",
                reason: "must be at least 1",
            });
        }
        let extent = vk::Extent2D {
            width: size,
            height: size,
        };
        self.size = size;
        self.written = false;

        let desc = ImageDesc::new_2d(
            "shadow map",
            extent,
            SHADOW_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::DEPTH,
        );
        self.image.create(device, &desc)?;

        // Fixed state: shadow lookups in the composite shader rely on it.
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_BORDER)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
            .compare_enable(true)
            .compare_op(vk::CompareOp::LESS)
            .min_lod(0.0)
            .max_lod(1.0)
            .max_anisotropy(1.0);
        self.sampler = device
            .create_sampler(&sampler_info)
            .step("shadow sampler")?;

        let attachment = vk::AttachmentDescription::default()
            .format(SHADOW_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
        let depth_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .depth_stencil_attachment(&depth_ref);
        let dependencies = [
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                .dst_stage_mask(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS)
                .src_access_mask(vk::AccessFlags::SHADER_READ)
                .dst_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE),
            vk::SubpassDependency::default()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(vk::PipelineStageFlags::LATE_FRAGMENT_TESTS)
                .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ),
        ];
        self.render_pass.create(
            device,
            "shadow",
            &[attachment],
            std::slice::from_ref(&subpass),
            &dependencies,
        )?;

        self.framebuffer = FramebufferResource::create(
            device,
            "shadow",
            &self.render_pass,
            &[self.image.view],
            extent,
        )?;

        self.state = ShadowState::ReadyForWrite;
        info!("Created {size}x{size} shadow map.");
        Ok(())
    }

    /// Records pre-barrier, the depth-only pass with one indexed draw, and the post-barrier.
    pub fn render(
        &mut self,
        recorder: &mut dyn CommandRecorder,
        casters: &ShadowCasters,
    ) -> Result<()> {
        if self.state != ShadowState::ReadyForWrite {
            return Err(RenderError::NotCreated("shadow pass"));
        }
        let extent = vk::Extent2D {
            width: self.size,
            height: self.size,
        };

        let (old_layout, src_access) = if self.written {
            (
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
                vk::AccessFlags::SHADER_READ,
            )
        } else {
            (vk::ImageLayout::UNDEFINED, vk::AccessFlags::empty())
        };
        let to_attachment = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image.image)
            .subresource_range(depth_range())
            .src_access_mask(src_access)
            .dst_access_mask(
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            &[to_attachment],
        );

        let clear_values = [vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 1.0,
                stencil: 0,
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass.handle)
            .framebuffer(self.framebuffer.handle)
            .render_area(full_scissor(extent))
            .clear_values(&clear_values);
        recorder.begin_render_pass(&begin_info);
        recorder.bind_pipeline(casters.pipeline);
        recorder.set_viewport(full_viewport(extent));
        recorder.set_scissor(full_scissor(extent));
        recorder.bind_vertex_buffer(casters.vertex_buffer, 0);
        recorder.bind_index_buffer(casters.index_buffer, 0, casters.index_type);
        recorder.bind_descriptor_sets(casters.layout, 0, &[casters.descriptor_set]);
        recorder.draw_indexed(casters.index_count, 1);
        recorder.end_render_pass();

        // The pass already ended in the read-only layout; this only orders the depth writes
        // before the fragment-shader reads.
        let to_read = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)
            .new_layout(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image.image)
            .subresource_range(depth_range())
            .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ);
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            &[to_read],
        );

        self.written = true;
        trace!("Recorded shadow pass ({} indices).", casters.index_count);
        Ok(())
    }

    /// Framebuffer → render pass → sampler → view/image/memory. Safe on partial state.
    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        self.framebuffer.destroy(device);
        self.render_pass.destroy(device);
        if !self.sampler.is_null() {
            device.destroy_sampler(self.sampler);
            self.sampler = vk::Sampler::null();
        }
        self.image.destroy(device);
        self.state = ShadowState::Uninitialized;
        self.written = false;
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn state(&self) -> ShadowState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.image.is_live()
            || !self.sampler.is_null()
            || self.render_pass.is_live()
            || !self.framebuffer.handle.is_null()
    }
}

fn depth_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::DEPTH)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}
