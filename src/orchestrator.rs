//! Per-frame pass sequencing and the resize recreation protocol.
//!
//! Resource split:
//!
//! | persists across resize                  | rebuilt on resize                            |
//! |-----------------------------------------|----------------------------------------------|
//! | shadow pass, HDR/bloom render passes,   | swapchain + views, composite render pass,    |
//! | bloom pipeline + sets, post-process     | depth, composite framebuffers, HDR target,   |
//! | layouts/UBOs/sets, overlay layouts      | bloom levels, post/overlay pipelines,        |
//! |                                         | volumetric targets                           |

use std::sync::Arc;

use ash::vk;
use log::*;

use crate::bloom::BloomChain;
use crate::config::RendererConfig;
use crate::depth::DepthResource;
use crate::error::{RenderError, Result, VkResultExt};
use crate::fullscreen::FullscreenQuad;
use crate::gpu::{CommandRecorder, GpuDevice, PresentationSurface, full_scissor};
use crate::hdr::HdrTarget;
use crate::overlay::DebugOverlay;
use crate::post_process::{PostProcessInputs, PostProcessParams, PostProcessPipeline};
use crate::resource::{FramebufferResource, RenderPassResource};
use crate::shader::ShaderSet;
use crate::shadow::{ShadowCasters, ShadowPass};
use crate::swapchain::SwapchainResourceSet;
use crate::temporal::{CameraFrame, TemporalState};
use crate::volumetric::VolumetricResources;

/// Clear colour of the HDR target, in linear radiance.
const HDR_CLEAR: [f32; 4] = [0.02, 0.02, 0.03, 1.0];

/// Supplies scene geometry to the shadow pass and records the main HDR pass draws.
///
/// Pipelines passed back here must be built against [`FrameOrchestrator::hdr_render_pass`] and
/// [`FrameOrchestrator::shadow_render_pass`]; both outlive swapchain recreation.
pub trait FrameScene {
    fn shadow_casters(&self, slot: usize) -> ShadowCasters;

    /// Records draws inside the already-begun HDR pass. Viewport and scissor are dynamic and must
    /// be set from `extent`.
    fn record_main(&self, recorder: &mut dyn CommandRecorder, slot: usize, extent: vk::Extent2D);
}

/// What the frame driver knows about the frame being recorded.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameContext {
    /// Frame-in-flight slot whose fence the driver has already waited on.
    pub slot: usize,
    /// Acquired swapchain image.
    pub image_index: u32,
    pub camera: CameraFrame,
    /// Seconds since start.
    pub time: f32,
}

#[derive(Debug)]
pub struct FrameOrchestrator {
    config: Arc<RendererConfig>,
    shaders: ShaderSet,
    frames_in_flight: usize,
    swapchain: SwapchainResourceSet,
    composite_pass: RenderPassResource,
    framebuffers: Vec<FramebufferResource>,
    depth: DepthResource,
    shadow: ShadowPass,
    hdr: HdrTarget,
    bloom: BloomChain,
    post: PostProcessPipeline,
    volumetrics: VolumetricResources,
    overlay: DebugOverlay,
    quad: FullscreenQuad,
    temporal: TemporalState,
}

impl FrameOrchestrator {
    /// Holds no GPU resources until [`Self::init`].
    pub fn new(shaders: ShaderSet, config: Arc<RendererConfig>, frames_in_flight: usize) -> Self {
        Self {
            config,
            shaders,
            frames_in_flight: frames_in_flight.max(1),
            swapchain: SwapchainResourceSet::default(),
            composite_pass: RenderPassResource::default(),
            framebuffers: Vec::new(),
            depth: DepthResource::default(),
            shadow: ShadowPass::default(),
            hdr: HdrTarget::default(),
            bloom: BloomChain::default(),
            post: PostProcessPipeline::default(),
            volumetrics: VolumetricResources::default(),
            overlay: DebugOverlay::default(),
            quad: FullscreenQuad::default(),
            temporal: TemporalState::default(),
        }
    }

    //==============================================================================================
    // SECTION: Lifecycle
    //==============================================================================================

    /// Creates every resource for `extent`. On error, call [`Self::shutdown`] to release whatever
    /// was created before the failing step.
    pub fn init(
        &mut self,
        device: &dyn GpuDevice,
        surface: &dyn PresentationSurface,
        extent: vk::Extent2D,
    ) -> Result<()> {
        self.quad.create(device)?;
        self.shadow.create(device, self.config.shadow.map_size)?;
        self.hdr.create_render_pass(device, device.depth_format())?;
        self.bloom
            .create_persistent(device, &self.shaders, self.config.bloom.mip_count)?;
        self.post
            .create_layouts(device, self.bloom.mip_count(), self.frames_in_flight)?;

        self.create_extent_dependent(device, surface, extent)?;
        self.bind_descriptors(device);
        if self.config.debug.show_shadow_map {
            self.enable_overlay(device);
        }
        info!(
            "Frame orchestrator ready at {}x{} with {} frames in flight.",
            self.swapchain.extent.width, self.swapchain.extent.height, self.frames_in_flight
        );
        Ok(())
    }

    /// Tears down and rebuilds everything that depends on the surface extent.
    ///
    /// Safe to call with an unchanged extent. A volumetric failure is logged and rendering
    /// continues without it. Any other failure is returned and the caller should
    /// [`Self::shutdown`].
    pub fn recreate_swapchain(
        &mut self,
        device: &dyn GpuDevice,
        surface: &dyn PresentationSurface,
        extent: vk::Extent2D,
    ) -> Result<()> {
        device.wait_idle().step("device idle wait")?;

        self.overlay.destroy_pipeline(device);
        self.post.destroy_pipeline(device);
        self.destroy_extent_dependent(device, surface);

        self.create_extent_dependent(device, surface, extent)?;
        self.temporal.reset();
        self.bind_descriptors(device);
        if self.overlay.has_layout() {
            self.rebuild_overlay(device);
        }
        info!(
            "Swapchain recreated at {}x{}.",
            self.swapchain.extent.width, self.swapchain.extent.height
        );
        Ok(())
    }

    /// Swaps in a new config snapshot. Returns whether a recreation was run to apply it.
    pub fn apply_config(
        &mut self,
        device: &dyn GpuDevice,
        surface: &dyn PresentationSurface,
        config: Arc<RendererConfig>,
    ) -> Result<bool> {
        let recreate = self.config.requires_recreation(&config);
        let show_overlay = config.debug.show_shadow_map;
        self.config = config;

        if show_overlay && !self.overlay.has_layout() {
            device.wait_idle().step("device idle wait")?;
            self.enable_overlay(device);
        }
        if recreate {
            info!("Config change affects GPU resources, recreating.");
            self.recreate_swapchain(device, surface, self.swapchain.extent)?;
        }
        Ok(recreate)
    }

    /// Releases every resource. Safe after a failed [`Self::init`] or recreation.
    pub fn shutdown(&mut self, device: &dyn GpuDevice, surface: &dyn PresentationSurface) {
        if let Err(err) = device.wait_idle() {
            warn!("Device idle wait failed during shutdown: {err}");
        }
        self.overlay.destroy(device);
        self.post.destroy(device);
        self.destroy_extent_dependent(device, surface);
        self.bloom.destroy(device);
        self.hdr.destroy(device);
        self.shadow.destroy(device);
        self.quad.destroy(device);
        debug!("Frame orchestrator shut down.");
    }

    //==============================================================================================
    // SECTION: Frame Recording
    //==============================================================================================

    /// Records one frame: uniforms, shadow, HDR scene, volumetric prepare, bloom, composite.
    pub fn record_frame(
        &mut self,
        recorder: &mut dyn CommandRecorder,
        frame: &FrameContext,
        scene: &dyn FrameScene,
    ) -> Result<()> {
        let framebuffer = self
            .framebuffers
            .get(frame.image_index as usize)
            .map(|f| f.handle)
            .ok_or(RenderError::SlotOutOfRange {
                slot: frame.image_index as usize,
                count: self.framebuffers.len(),
            })?;

        let params = PostProcessParams::from_config(
            &self.config,
            self.bloom.mip_count(),
            self.volumetrics.composite_views().is_some(),
        )
        .with_camera(&frame.camera.view, &frame.camera.proj, frame.time);
        self.post.update_ubo(frame.slot, &params)?;

        self.shadow
            .render(recorder, &scene.shadow_casters(frame.slot))?;

        let extent = self.hdr.extent();
        self.hdr.begin(recorder, HDR_CLEAR);
        scene.record_main(recorder, frame.slot, extent);
        self.hdr.end(recorder);

        self.volumetrics.prepare(recorder);

        self.bloom
            .render(recorder, &self.quad, extent, self.config.bloom.threshold);

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        }];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.composite_pass.handle)
            .framebuffer(framebuffer)
            .render_area(full_scissor(self.swapchain.extent))
            .clear_values(&clear_values);
        recorder.begin_render_pass(&begin_info);
        self.post.render(recorder, frame.slot, &self.quad)?;
        if self.config.debug.show_shadow_map {
            self.overlay.render(recorder, &self.quad);
        }
        recorder.end_render_pass();

        self.temporal.advance(&frame.camera);
        trace!(
            "Recorded frame {} (slot {}, image {}).",
            self.temporal.frame_counter, frame.slot, frame.image_index
        );
        Ok(())
    }

    //==============================================================================================
    // SECTION: Accessors
    //==============================================================================================

    pub fn config(&self) -> &Arc<RendererConfig> {
        &self.config
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn swapchain(&self) -> &SwapchainResourceSet {
        &self.swapchain
    }

    pub fn temporal(&self) -> &TemporalState {
        &self.temporal
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn hdr_render_pass(&self) -> vk::RenderPass {
        self.hdr.render_pass.handle
    }

    pub fn shadow_render_pass(&self) -> vk::RenderPass {
        self.shadow.render_pass.handle
    }

    pub fn shadow_map_size(&self) -> u32 {
        self.shadow.size()
    }

    pub fn volumetrics_active(&self) -> bool {
        self.volumetrics.composite_views().is_some()
    }

    //==============================================================================================
    // SECTION: Extent-Dependent Resources
    //==============================================================================================

    /// Swapchain → views → composite pass → depth → framebuffers → HDR target → bloom levels →
    /// post pipeline → volumetrics (non-fatal).
    fn create_extent_dependent(
        &mut self,
        device: &dyn GpuDevice,
        surface: &dyn PresentationSurface,
        extent: vk::Extent2D,
    ) -> Result<()> {
        self.swapchain.create(surface, extent)?;
        self.swapchain.create_views(device)?;
        let extent = self.swapchain.extent;

        self.create_composite_pass(device)?;
        self.depth.create(device, extent)?;
        for &view in &self.swapchain.views {
            let framebuffer = FramebufferResource::create(
                device,
                "composite",
                &self.composite_pass,
                &[view],
                extent,
            )?;
            self.framebuffers.push(framebuffer);
        }

        self.hdr.create_target(device, extent, self.depth.view())?;
        self.bloom.create_levels(device, extent)?;
        self.post
            .create_pipeline(device, &self.shaders, self.composite_pass.handle, extent)?;

        if let Err(err) = self.volumetrics.create(device, &self.config, extent) {
            warn!("Volumetric resources unavailable, continuing without them: {err}");
            self.volumetrics.destroy(device);
        }
        Ok(())
    }

    /// Reverse of creation. Every step tolerates partial state.
    fn destroy_extent_dependent(
        &mut self,
        device: &dyn GpuDevice,
        surface: &dyn PresentationSurface,
    ) {
        self.volumetrics.destroy(device);
        self.post.destroy_pipeline(device);
        self.bloom.destroy_levels(device);
        self.hdr.destroy_target(device);
        for mut framebuffer in self.framebuffers.drain(..) {
            framebuffer.destroy(device);
        }
        self.depth.destroy(device);
        self.swapchain.destroy_views(device);
        self.composite_pass.destroy(device);
        self.swapchain.destroy(device, surface);
    }

    /// Single colour attachment in the swapchain format, cleared and left ready to present.
    fn create_composite_pass(&mut self, device: &dyn GpuDevice) -> Result<()> {
        let color_attachment = vk::AttachmentDescription::default()
            .format(self.swapchain.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);
        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref));
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        self.composite_pass.create(
            device,
            "composite",
            &[color_attachment],
            std::slice::from_ref(&subpass),
            std::slice::from_ref(&dependency),
        )
    }

    /// Points every sampled input at the current views. Binding slots never move.
    fn bind_descriptors(&self, device: &dyn GpuDevice) {
        self.bloom.update_descriptors(device, self.hdr.view());
        let bloom_views = self.bloom.views();
        let (scattering_view, transmittance_view) = self.volumetrics.composite_views().unzip();
        self.post.update_descriptors(
            device,
            &PostProcessInputs {
                hdr_view: self.hdr.view(),
                bloom_views: &bloom_views,
                shadow_view: self.shadow.view(),
                shadow_sampler: self.shadow.sampler,
                scattering_view,
                transmittance_view,
            },
        );
        self.overlay.update_descriptor(device, self.shadow.view());
    }

    /// Creates overlay layouts and pipeline. Failure disables the overlay instead of propagating.
    fn enable_overlay(&mut self, device: &dyn GpuDevice) {
        if let Err(err) = self.overlay.create_layouts(device) {
            warn!("Debug overlay unavailable: {err}");
            self.overlay.destroy(device);
            return;
        }
        self.overlay.update_descriptor(device, self.shadow.view());
        self.rebuild_overlay(device);
    }

    fn rebuild_overlay(&mut self, device: &dyn GpuDevice) {
        if let Err(err) = self.overlay.rebuild(
            device,
            &self.shaders,
            self.composite_pass.handle,
            self.swapchain.extent,
        ) {
            warn!("Debug overlay pipeline unavailable: {err}");
            self.overlay.destroy_pipeline(device);
        }
    }
}
