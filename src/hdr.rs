//! The offscreen high-dynamic-range colour target the main scene renders into.
//!
//! The render pass only depends on formats, so it outlives swapchain recreation and scene
//! pipelines built against it stay valid. The colour image and framebuffer follow the extent.

use ash::vk;
use log::*;

use crate::error::{RenderError, Result};
use crate::gpu::{CommandRecorder, GpuDevice, color_range, full_scissor};
use crate::resource::{FramebufferResource, GpuImage, ImageDesc, RenderPassResource};

pub const HDR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

#[derive(Debug, Default)]
pub struct HdrTarget {
    pub render_pass: RenderPassResource,
    pub color: GpuImage,
    pub framebuffer: FramebufferResource,
    /// Set after the first completed pass. Until then the image is still UNDEFINED and the
    /// render pass performs the only transition needed.
    initialized: bool,
}

impl HdrTarget {
    /// Two attachments: HDR colour (stored, left shader-readable) and the shared depth buffer.
    pub fn create_render_pass(
        &mut self,
        device: &dyn GpuDevice,
        depth_format: vk::Format,
    ) -> Result<()> {
        let color_attachment = vk::AttachmentDescription::default()
            .format(HDR_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let depth_attachment = vk::AttachmentDescription::default()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::CLEAR)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let depth_ref = vk::AttachmentReference::default()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref))
            .depth_stencil_attachment(&depth_ref);
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        self.render_pass.create(
            device,
            "hdr",
            &[color_attachment, depth_attachment],
            std::slice::from_ref(&subpass),
            std::slice::from_ref(&dependency),
        )
    }

    /// Colour image at `extent` plus the framebuffer pairing it with `depth_view`.
    pub fn create_target(
        &mut self,
        device: &dyn GpuDevice,
        extent: vk::Extent2D,
        depth_view: vk::ImageView,
    ) -> Result<()> {
        if !self.render_pass.is_live() {
            return Err(RenderError::NotCreated("hdr render pass"));
        }
        let desc = ImageDesc::new_2d(
            "hdr color",
            extent,
            HDR_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        );
        self.color.create(device, &desc)?;
        self.framebuffer = FramebufferResource::create(
            device,
            "hdr",
            &self.render_pass,
            &[self.color.view, depth_view],
            extent,
        )?;
        self.initialized = false;
        debug!("Created {}x{} HDR target.", extent.width, extent.height);
        Ok(())
    }

    /// Framebuffer, then the colour image. The render pass survives.
    pub fn destroy_target(&mut self, device: &dyn GpuDevice) {
        self.framebuffer.destroy(device);
        self.color.destroy(device);
        self.initialized = false;
    }

    pub fn destroy(&mut self, device: &dyn GpuDevice) {
        self.destroy_target(device);
        self.render_pass.destroy(device);
    }

    /// Records the read-to-write barrier (after the first frame) and begins the HDR pass.
    pub fn begin(&mut self, recorder: &mut dyn CommandRecorder, clear_color: [f32; 4]) {
        if self.initialized {
            let to_attachment = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.color.image)
                .subresource_range(color_range())
                .src_access_mask(vk::AccessFlags::SHADER_READ)
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
            recorder.pipeline_barrier(
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                &[to_attachment],
            );
        }

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass.handle)
            .framebuffer(self.framebuffer.handle)
            .render_area(full_scissor(self.extent()))
            .clear_values(&clear_values);
        recorder.begin_render_pass(&begin_info);
    }

    /// Ends the HDR pass and orders its writes before fragment-shader reads downstream.
    pub fn end(&mut self, recorder: &mut dyn CommandRecorder) {
        recorder.end_render_pass();
        let to_read = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.color.image)
            .subresource_range(color_range())
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ);
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            &[to_read],
        );
        self.initialized = true;
    }

    pub fn view(&self) -> vk::ImageView {
        self.color.view
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.framebuffer.extent
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
