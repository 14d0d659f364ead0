//! The windowed frame loop: acquire, record through the orchestrator, submit, present.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Result, anyhow};
use ash::vk;
use ash::vk::Handle;
use log::*;
use winit::window::Window;

use frameforge::gpu::AshRecorder;
use frameforge::shader::ShaderSet;
use frameforge::{ConfigWatcher, FrameContext, FrameOrchestrator};

use crate::bootstrap::GpuContext;
use crate::frame::FrameSync;
use crate::scene::{DemoScene, orbit_camera};

pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

fn asset_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets")
}

fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

pub struct DemoApp {
    ctx: GpuContext,
    orchestrator: FrameOrchestrator,
    scene: DemoScene,
    sync: FrameSync,
    config: ConfigWatcher,
    frame: usize,
    pub resized: bool,
    start: Instant,
}

impl DemoApp {
    pub fn create(window: &Window) -> Result<Self> {
        let config = ConfigWatcher::load(asset_dir().join("config.json"))?;
        let shader_dir = asset_dir().join("shaders");
        let shaders = ShaderSet::load(&shader_dir)?;

        let ctx = GpuContext::create(window)?;
        let mut orchestrator =
            FrameOrchestrator::new(shaders, config.snapshot(), MAX_FRAMES_IN_FLIGHT);
        let mut scene = DemoScene::default();
        let mut sync = FrameSync::default();

        let setup = (|| -> Result<()> {
            orchestrator.init(&ctx.device, &ctx.surface, window_extent(window))?;
            scene.create(
                &ctx.device,
                orchestrator.hdr_render_pass(),
                orchestrator.shadow_render_pass(),
                MAX_FRAMES_IN_FLIGHT,
                &shader_dir,
            )?;
            sync = FrameSync::create(
                ctx.raw_device(),
                ctx.queue_families.graphics,
                MAX_FRAMES_IN_FLIGHT,
                orchestrator.swapchain().images.len(),
            )?;
            Ok(())
        })();

        let mut app = Self {
            ctx,
            orchestrator,
            scene,
            sync,
            config,
            frame: 0,
            resized: false,
            start: Instant::now(),
        };
        if let Err(err) = setup {
            app.destroy();
            return Err(err);
        }
        Ok(app)
    }

    /// Renders a frame.
    pub fn render(&mut self, window: &Window) -> Result<()> {
        if let Some(config) = self.config.check_and_reload() {
            let recreated =
                self.orchestrator
                    .apply_config(&self.ctx.device, &self.ctx.surface, config)?;
            if recreated {
                self.sync
                    .reset_images_in_flight(self.orchestrator.swapchain().images.len());
            }
        }

        let device = self.ctx.raw_device().clone();
        let in_flight_fence = self.sync.in_flight_fences[self.frame];

        // SAFETY: the fence belongs to this device.
        unsafe { device.wait_for_fences(&[in_flight_fence], true, u64::MAX)? };

        // SAFETY: swapchain and semaphore are live. The semaphore is unsignalled after its last
        // wait.
        let image_index = unsafe {
            match self.ctx.surface.swapchain_device().acquire_next_image(
                self.orchestrator.swapchain().swapchain,
                u64::MAX,
                self.sync.image_available_semaphores[self.frame],
                vk::Fence::null(),
            ) {
                Ok((image_index, _)) => image_index,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    self.recreate_swapchain(window)?;
                    return Ok(());
                }
                Err(e) => return Err(anyhow!(e)),
            }
        };

        let image_in_flight = self
            .sync
            .images_in_flight
            .get(image_index as usize)
            .copied()
            .unwrap_or_default();
        if !image_in_flight.is_null() {
            // SAFETY: the fence belongs to this device.
            unsafe { device.wait_for_fences(&[image_in_flight], true, u64::MAX)? };
        }
        if let Some(owner) = self.sync.images_in_flight.get_mut(image_index as usize) {
            *owner = in_flight_fence;
        }

        let time = self.start.elapsed().as_secs_f32();
        let camera = orbit_camera(self.orchestrator.extent(), time);
        self.scene
            .update(self.frame, &camera, self.orchestrator.config())?;

        let command_buffer = self.sync.command_buffers[self.frame];
        // SAFETY: the slot's fence was waited on, so the command buffer is no longer pending.
        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }
        let mut recorder = AshRecorder::new(&device, command_buffer);
        self.orchestrator.record_frame(
            &mut recorder,
            &FrameContext {
                slot: self.frame,
                image_index,
                camera,
                time,
            },
            &self.scene,
        )?;
        // SAFETY: the command buffer is in the recording state.
        unsafe { device.end_command_buffer(command_buffer)? };

        let wait_semaphores = &[self.sync.image_available_semaphores[self.frame]];
        let wait_stages = &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = &[command_buffer];
        let signal_semaphores = &[self.sync.render_finished_semaphores[self.frame]];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(signal_semaphores);

        // SAFETY: queue, fence and submit_info are valid; the fence is reset only right before use.
        unsafe {
            device.reset_fences(&[in_flight_fence])?;
            device.queue_submit(self.ctx.graphics_queue, &[submit_info], in_flight_fence)?;
        }

        let swapchains = &[self.orchestrator.swapchain().swapchain];
        let image_indices = &[image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(signal_semaphores)
            .swapchains(swapchains)
            .image_indices(image_indices);

        // SAFETY: the present queue is live and present_info references live handles.
        let result = unsafe {
            self.ctx
                .surface
                .swapchain_device()
                .queue_present(self.ctx.present_queue, &present_info)
        };
        let changed = match result {
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Ok(false) => false,
            Err(e) => return Err(e.into()),
        };

        if self.resized || changed {
            self.resized = false;
            self.recreate_swapchain(window)?;
        }

        self.frame = (self.frame + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(())
    }

    /// Rebuilds extent-dependent resources at the window's current size. Zero-area windows are
    /// skipped until they are restored.
    pub fn recreate_swapchain(&mut self, window: &Window) -> Result<()> {
        let extent = window_extent(window);
        if extent.width == 0 || extent.height == 0 {
            debug!("Window is zero-sized, deferring swapchain recreation.");
            return Ok(());
        }
        self.orchestrator
            .recreate_swapchain(&self.ctx.device, &self.ctx.surface, extent)?;
        self.sync
            .reset_images_in_flight(self.orchestrator.swapchain().images.len());
        Ok(())
    }

    /// Releases everything in reverse creation order. Safe after a failed setup.
    pub fn destroy(&mut self) {
        // SAFETY: the device is live until `ctx.destroy` below.
        if let Err(e) = unsafe { self.ctx.raw_device().device_wait_idle() } {
            warn!("Device idle wait failed during teardown: {e}");
        }
        self.sync.destroy(self.ctx.raw_device());
        self.scene.destroy(&self.ctx.device);
        self.orchestrator.shutdown(&self.ctx.device, &self.ctx.surface);
        self.ctx.destroy();
    }
}
