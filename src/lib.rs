//! vk-render-core - the execution core of a Vulkan renderer
//!
//! The crate turns a declarative render graph into native renderpasses and
//! framebuffers and drives them from a dedicated render thread:
//! - **GpuAllocator**: buffers and images with shared, invalidatable views
//! - **CommandManager**: command pool ownership and one-shot submissions
//! - **Swapchain**: presentable images, recreated on resize
//! - **RenderGraph**: targets, subgraphs and passes compiled into renderpasses
//! - **RenderThread**: the fence-paced frame loop
//!
//! Everything talks to the GPU through the [`backend::GpuDevice`] trait.
//! [`backend::VulkanDevice`] implements it over `ash`, and
//! [`backend::DummyDevice`] implements it in memory for tests.

pub mod allocator;
pub mod backend;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod render_graph;
pub mod render_thread;
pub mod renderer;
pub mod resources;
pub mod swapchain;
pub mod sync;

#[cfg(not(target_arch = "wasm32"))]
pub mod window;

pub use allocator::{BufferView, GpuAllocator, ImageView};
pub use config::RendererConfig;
pub use error::{RenderError, RenderResult};
pub use events::{Event, EventQueue, ResourceEvent, WindowEvent};
pub use render_graph::{RenderGraph, RenderGraphBuilder, RenderGraphExecutor};
pub use render_thread::{FrameControl, FrameLoop, FrameOutcome, RenderThread};
pub use renderer::Renderer;
pub use resources::ResourceManager;
pub use swapchain::{SurfaceProvider, Swapchain, SwapchainManager};

/// Install an `env_logger` logger with an `info` default that `RUST_LOG`
/// overrides. Calling it again is a no-op.
#[cfg(not(target_arch = "wasm32"))]
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
