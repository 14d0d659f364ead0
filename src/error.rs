use ash::prelude::VkResult;
use ash::vk;
use thiserror::Error;

/// Errors surfaced by resource creation and frame recording.
#[derive(Debug, Error)]
pub enum RenderError {
    /// A device call failed. `step` names the creation step that was running.
    #[error("{step} failed: {result}")]
    Vulkan { step: String, result: vk::Result },
    #[error("no memory type matches bits {type_bits:#b} with {required:?}")]
    NoMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },
    #[error("surface reports no formats")]
    NoSurfaceFormats,
    /// `create` was called on a component that still owns live handles.
    #[error("{0} still holds live handles; destroy it before creating again")]
    StillLive(&'static str),
    #[error("{0} has not been created")]
    NotCreated(&'static str),
    #[error("{len} bytes do not fit a {size}-byte uniform slot")]
    UniformOverflow { len: usize, size: u64 },
    #[error("frame slot {slot} out of range ({count} slots)")]
    SlotOutOfRange { slot: usize, count: usize },
    #[error("failed to read SPIR-V from {path}: {source}")]
    Shader {
        path: String,
        source: std::io::Error,
    },
    /// A resource-shaping setting is outside the range the GPU resources can be built with.
    #[error("invalid {field}: {reason}")]
    InvalidConfig {
        field: &'static str,
        reason: &'static str,
    },
    #[error("failed to parse config {path}: {source}")]
    Config {
        path: String,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Tags a raw `VkResult` with the creation step it belongs to.
pub(crate) trait VkResultExt<T> {
    fn step(self, step: impl Into<String>) -> Result<T>;
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn step(self, step: impl Into<String>) -> Result<T> {
        self.map_err(|result| RenderError::Vulkan {
            step: step.into(),
            result,
        })
    }
}

impl RenderError {
    /// The raw device result, if this error came from a device call.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            RenderError::Vulkan { result, .. } => Some(*result),
            _ => None,
        }
    }

    /// The creation step that failed, if this error came from a device call.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            RenderError::Vulkan { step, .. } => Some(step.as_str()),
            _ => None,
        }
    }
}
