//! Renderer configuration

use ash::vk;

/// Configuration for the renderer and its Vulkan context
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Application name reported to the Vulkan instance
    pub app_name: String,
    /// Number of frames that may be in flight at once
    pub frames_in_flight: usize,
    /// Enable vsync (selects FIFO-style present modes)
    pub vsync: bool,
    /// Timeout for the per-frame fence wait, in nanoseconds
    pub fence_timeout_ns: u64,
    /// Timeout for swapchain image acquisition, in nanoseconds
    pub acquire_timeout_ns: u64,
    /// Format used for `TargetFormat::DefaultColor` render targets
    pub default_color_format: vk::Format,
    /// Format used for `TargetFormat::DefaultDepth` render targets
    pub default_depth_format: vk::Format,
    /// Instance layers to enable
    pub validation_layers: Vec<String>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        let validation_layers = if cfg!(debug_assertions) {
            vec!["VK_LAYER_KHRONOS_validation".to_string()]
        } else {
            Vec::new()
        };

        Self {
            app_name: "vk-render-core".to_string(),
            frames_in_flight: 2,
            vsync: false,
            fence_timeout_ns: u64::MAX,
            acquire_timeout_ns: u64::MAX,
            default_color_format: vk::Format::R8G8B8A8_UNORM,
            default_depth_format: vk::Format::D32_SFLOAT,
            validation_layers,
        }
    }
}

impl RendererConfig {
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_fence_timeout_ns(mut self, timeout: u64) -> Self {
        self.fence_timeout_ns = timeout;
        self
    }

    pub fn with_acquire_timeout_ns(mut self, timeout: u64) -> Self {
        self.acquire_timeout_ns = timeout;
        self
    }

    pub fn with_default_color_format(mut self, format: vk::Format) -> Self {
        self.default_color_format = format;
        self
    }

    pub fn with_default_depth_format(mut self, format: vk::Format) -> Self {
        self.default_depth_format = format;
        self
    }

    pub fn with_validation_layers(mut self, layers: Vec<String>) -> Self {
        self.validation_layers = layers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert!(!config.vsync);
        assert_eq!(config.fence_timeout_ns, u64::MAX);
        assert_eq!(config.default_color_format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(config.default_depth_format, vk::Format::D32_SFLOAT);
    }

    #[test]
    fn test_frames_in_flight_never_zero() {
        let config = RendererConfig::default().with_frames_in_flight(0);
        assert_eq!(config.frames_in_flight, 1);
    }
}
