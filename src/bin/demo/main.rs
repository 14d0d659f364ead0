//! Windowed demo driving [`frameforge::FrameOrchestrator`] over a procedural scene.
//!
//! Edit `assets/config.json` while it runs; tunables apply on the next frame and bloom/volumetric
//! changes trigger a swapchain recreation.

mod app;
mod bootstrap;
mod frame;
mod scene;
mod vk_window;

use anyhow::{Result, anyhow};
use ash::vk;
use log::*;
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use frameforge::RenderError;

use crate::app::DemoApp;

//==================================================================================================
// SECTION: Winit Application Handler
//==================================================================================================

#[derive(Default)]
struct AppHandler {
    window: Option<Window>,
    demo: Option<DemoApp>,
    minimized: bool,
}

impl AppHandler {
    fn handle_render_error(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        let vk_err = e
            .downcast_ref::<vk::Result>()
            .copied()
            .or_else(|| e.downcast_ref::<RenderError>().and_then(RenderError::vk_result));
        match vk_err {
            Some(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                warn!("Render returned OUT_OF_DATE_KHR, recreating swapchain next frame.");
                if let Some(demo) = self.demo.as_mut() {
                    demo.resized = true;
                }
            }
            Some(vk::Result::ERROR_DEVICE_LOST) => {
                error!("Device lost, exiting.");
                event_loop.exit();
            }
            _ => {
                error!("Error during render: {:?}", e);
                event_loop.exit();
            }
        }
    }
}

impl ApplicationHandler for AppHandler {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        info!("AppHandler: Resumed.");
        if let (Some(demo), Some(window)) = (self.demo.as_mut(), self.window.as_ref()) {
            if let Err(e) = demo.recreate_swapchain(window) {
                error!("Failed to recreate swapchain on resume: {:?}", e);
                event_loop.exit();
            }
            return;
        }

        let window_attributes = Window::default_attributes()
            .with_title("frameforge demo")
            .with_inner_size(LogicalSize::new(1280.0, 720.0));

        let window = match event_loop.create_window(window_attributes) {
            Ok(win) => win,
            Err(e) => {
                error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match DemoApp::create(&window) {
            Ok(demo) => {
                self.demo = Some(demo);
                info!("AppHandler: demo created successfully.");
            }
            Err(e) => {
                error!("Failed to create demo: {:?}", e);
                event_loop.exit();
                return;
            }
        }
        self.window = Some(window);
        self.minimized = false;
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("AppHandler: CloseRequested. Exiting.");
                event_loop.exit();
            }
            WindowEvent::Resized(new_size) => {
                debug!("AppHandler: Window resized to {:?}", new_size);
                if new_size.width == 0 || new_size.height == 0 {
                    self.minimized = true;
                } else {
                    self.minimized = false;
                    if let Some(demo) = self.demo.as_mut() {
                        demo.resized = true;
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                if self.minimized {
                    return;
                }
                let result = match (self.demo.as_mut(), self.window.as_ref()) {
                    (Some(demo), Some(window)) => demo.render(window),
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    self.handle_render_error(event_loop, e);
                }
            }
            _ => (),
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            if !self.minimized && self.demo.is_some() {
                window.request_redraw();
            }
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        info!("AppHandler: Exiting. Cleaning up.");
        if let Some(mut demo) = self.demo.take() {
            demo.destroy();
        }
        self.window = None;
        info!("AppHandler: Cleanup complete.");
    }
}

//==================================================================================================
// SECTION: Main Application Entry Point
//==================================================================================================

pub fn main() -> Result<()> {
    // Set RUST_LOG (e.g. RUST_LOG=info) to see output.
    pretty_env_logger::init();
    info!("Starting frameforge demo...");

    let event_loop = EventLoop::new().map_err(|e| anyhow!("Failed to create event loop: {}", e))?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app_handler = AppHandler::default();
    if let Err(e) = event_loop.run_app(&mut app_handler) {
        error!("Event loop error: {}", e);
        return Err(anyhow!("Event loop failed: {}", e));
    }

    info!("Demo finished normally.");
    Ok(())
}
