//! Error types shared by every component of the renderer

use ash::vk;
use thiserror::Error;

/// Renderer error type
#[derive(Error, Debug)]
pub enum RenderError {
    /// A native Vulkan call failed. `context` names the operation and, where
    /// known, the subgraph or pass that triggered it.
    #[error("{context} failed: {result:?}")]
    NativeApi { context: String, result: vk::Result },
    #[error("No memory type matches type bits {type_bits:#b} with flags {required:?}")]
    NoSuitableMemory {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },
    #[error("Invalid render configuration: {0}")]
    Configuration(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} view used after it was freed")]
    StaleView(&'static str),
    #[error("Timed out waiting for the in-flight fence of frame {frame}")]
    FenceTimeout { frame: usize },
    #[error("Render graph executor used before a successful create()")]
    NotCompiled,
    #[error("Failed to initialize renderer: {0}")]
    InitializationFailed(String),
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,
    #[error("Render thread panicked")]
    RenderThreadPanicked,
}

pub type RenderResult<T> = Result<T, RenderError>;

impl RenderError {
    pub fn native(context: impl Into<String>, result: vk::Result) -> Self {
        Self::NativeApi {
            context: context.into(),
            result,
        }
    }

    /// Whether the frame loop can recover by recreating the swapchain.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::SwapchainOutOfDate => true,
            Self::NativeApi { result, .. } => *result == vk::Result::ERROR_OUT_OF_DATE_KHR,
            _ => false,
        }
    }
}

/// Extension for mapping raw `VkResult`s into [`RenderError::NativeApi`].
pub(crate) trait VkResultExt<T> {
    fn context(self, context: impl FnOnce() -> String) -> RenderResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn context(self, context: impl FnOnce() -> String) -> RenderResult<T> {
        self.map_err(|result| RenderError::native(context(), result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::native(
            "create renderpass for subgraph 'main'",
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
        );
        let text = err.to_string();
        assert!(text.contains("subgraph 'main'"));
        assert!(text.contains("ERROR_OUT_OF_HOST_MEMORY"));

        let err = RenderError::StaleView("buffer");
        assert_eq!(err.to_string(), "buffer view used after it was freed");
    }

    #[test]
    fn test_recoverable() {
        assert!(RenderError::SwapchainOutOfDate.is_recoverable());
        assert!(RenderError::native("present", vk::Result::ERROR_OUT_OF_DATE_KHR).is_recoverable());
        assert!(!RenderError::native("submit", vk::Result::ERROR_DEVICE_LOST).is_recoverable());
        assert!(!RenderError::FenceTimeout { frame: 1 }.is_recoverable());
    }

    #[test]
    fn test_context_mapping() {
        let raw: Result<(), vk::Result> = Err(vk::Result::ERROR_DEVICE_LOST);
        match raw.context(|| "queue submit".to_string()) {
            Err(RenderError::NativeApi { context, result }) => {
                assert_eq!(context, "queue submit");
                assert_eq!(result, vk::Result::ERROR_DEVICE_LOST);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
