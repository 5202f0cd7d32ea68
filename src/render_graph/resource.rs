//! Render targets and attachments

use ash::vk;

use crate::backend::ClearValue;
use crate::config::RendererConfig;

/// Reference to a [`RenderTarget`] in a [`crate::render_graph::RenderGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderTargetRef(pub(crate) u32);

/// Reference to a [`RenderAttachment`] within one subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderAttachmentRef(pub(crate) u32);

/// Symbolic target format, resolved through a [`FormatTable`] at compile time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    DefaultColor,
    DefaultDepth,
    SwapchainColor,
}

/// Where a target's image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetSource {
    /// A backing image allocated by the executor, shared by every subgraph
    Image,
    /// The swapchain image of the frame being rendered
    Swapchain,
}

/// A logical image that attachments render into or read from
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTarget {
    pub name: String,
    pub format: TargetFormat,
    pub source: TargetSource,
    pub clear_value: ClearValue,
    pub samples: vk::SampleCountFlags,
}

impl RenderTarget {
    /// Offscreen color target in the default color format.
    pub fn color(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: TargetFormat::DefaultColor,
            source: TargetSource::Image,
            clear_value: ClearValue::Color([0.0, 0.0, 0.0, 1.0]),
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    /// Offscreen depth target cleared to 1.0.
    pub fn depth(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: TargetFormat::DefaultDepth,
            source: TargetSource::Image,
            clear_value: ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    /// The swapchain image of the current frame.
    pub fn swapchain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: TargetFormat::SwapchainColor,
            source: TargetSource::Swapchain,
            clear_value: ClearValue::Color([0.0, 0.0, 0.0, 1.0]),
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    pub fn with_clear_value(mut self, clear_value: ClearValue) -> Self {
        self.clear_value = clear_value;
        self
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn is_depth(&self) -> bool {
        self.format == TargetFormat::DefaultDepth
    }
}

/// Use of a target by one subgraph at a fixed attachment slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderAttachment {
    pub target: RenderTargetRef,
    pub slot: u32,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl RenderAttachment {
    /// Cleared on load, stored, and left in `final_layout`.
    pub fn new(target: RenderTargetRef, slot: u32, final_layout: vk::ImageLayout) -> Self {
        Self {
            target,
            slot,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout,
        }
    }

    pub fn with_load_op(mut self, load_op: vk::AttachmentLoadOp) -> Self {
        self.load_op = load_op;
        self
    }

    pub fn with_store_op(mut self, store_op: vk::AttachmentStoreOp) -> Self {
        self.store_op = store_op;
        self
    }

    pub fn with_initial_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.initial_layout = layout;
        self
    }
}

/// Reference from a pass to one of its subgraph's attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentRef {
    pub attachment: RenderAttachmentRef,
    pub layout: vk::ImageLayout,
}

impl AttachmentRef {
    pub fn new(attachment: RenderAttachmentRef, layout: vk::ImageLayout) -> Self {
        Self { attachment, layout }
    }
}

/// Resolves symbolic target formats to concrete Vulkan formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatTable {
    pub default_color: vk::Format,
    pub default_depth: vk::Format,
    pub swapchain_color: vk::Format,
}

impl FormatTable {
    pub fn from_config(config: &RendererConfig, swapchain_color: vk::Format) -> Self {
        Self {
            default_color: config.default_color_format,
            default_depth: config.default_depth_format,
            swapchain_color,
        }
    }

    pub fn resolve(&self, format: TargetFormat) -> vk::Format {
        match format {
            TargetFormat::DefaultColor => self.default_color,
            TargetFormat::DefaultDepth => self.default_depth,
            TargetFormat::SwapchainColor => self.swapchain_color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TargetFormat::DefaultColor, vk::Format::R8G8B8A8_UNORM)]
    #[case(TargetFormat::DefaultDepth, vk::Format::D32_SFLOAT)]
    #[case(TargetFormat::SwapchainColor, vk::Format::B8G8R8A8_SRGB)]
    fn test_format_resolution(#[case] format: TargetFormat, #[case] expected: vk::Format) {
        let table = FormatTable::from_config(&RendererConfig::default(), vk::Format::B8G8R8A8_SRGB);
        assert_eq!(table.resolve(format), expected);
    }
}
