//! Frame-resource lifecycle and multi-pass orchestration for an ash-based Vulkan renderer.
//!
//! The crate owns the chain of extent-dependent GPU resources (swapchain, depth, HDR target,
//! bloom chain, composite pipeline) plus the extent-independent shadow pass, and the protocol
//! that tears them down and rebuilds them when the presentation surface changes size.
//!
//! Every component talks to the device through the [`gpu::GpuDevice`], [`gpu::PresentationSurface`]
//! and [`gpu::CommandRecorder`] traits; [`gpu::AshDevice`] and friends are the production backends.

pub mod bloom;
pub mod config;
pub mod depth;
pub mod error;
pub mod fullscreen;
pub mod gpu;
pub mod hdr;
pub mod orchestrator;
pub mod overlay;
pub mod post_process;
pub mod resource;
pub mod shader;
pub mod shadow;
pub mod swapchain;
pub mod temporal;
pub mod volumetric;

pub use config::{ConfigWatcher, RendererConfig};
pub use error::{RenderError, Result};
pub use orchestrator::{FrameContext, FrameOrchestrator, FrameScene};
pub use shadow::ShadowCasters;
