//! Plain-data descriptors passed across the device boundary
//!
//! These carry exactly what the renderer needs to create native objects, so a
//! backend can either translate them into Vulkan create-infos or record them
//! for inspection.

use ash::vk;

/// Description of a buffer to create
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

/// Description of an image to create
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub flags: vk::ImageCreateFlags,
}

/// Description of an image view to create
#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspect_mask: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub layer_count: u32,
}

/// Attachment references of a single subpass
#[derive(Debug, Clone, Default)]
pub struct SubpassLayout {
    pub input: Vec<vk::AttachmentReference>,
    pub color: Vec<vk::AttachmentReference>,
    pub resolve: Vec<vk::AttachmentReference>,
    pub depth: Option<vk::AttachmentReference>,
}

/// Everything needed to create a renderpass
#[derive(Debug, Clone, Default)]
pub struct RenderPassLayout {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassLayout>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

/// Description of a framebuffer to create
#[derive(Debug, Clone)]
pub struct FramebufferDesc {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
}

/// Clear value for one attachment slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl Default for ClearValue {
    fn default() -> Self {
        ClearValue::Color([0.0, 0.0, 0.0, 1.0])
    }
}

impl ClearValue {
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// Arguments of `vkCmdBeginRenderPass`
#[derive(Debug, Clone)]
pub struct RenderPassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_values: Vec<ClearValue>,
}

/// Image layout transition recorded as a pipeline barrier
#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect_mask: vk::ImageAspectFlags,
    pub layer_count: u32,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// A single queue submission
#[derive(Debug, Clone, Default)]
pub struct SubmitDesc {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// Arguments for creating (or recreating) a swapchain
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub old_swapchain: vk::SwapchainKHR,
}

/// Returns `true` for depth and depth/stencil formats.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Image aspect matching a format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        f if is_depth_format(f) => vk::ImageAspectFlags::DEPTH,
        _ => vk::ImageAspectFlags::COLOR,
    }
}
