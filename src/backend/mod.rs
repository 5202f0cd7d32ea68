//! Backend abstraction layer
//!
//! Provides the device trait the renderer is written against, a Vulkan
//! implementation over `ash`, and an in-memory dummy used by tests.

pub mod dummy;
pub mod traits;
pub mod types;

#[cfg(not(target_arch = "wasm32"))]
pub mod vulkan;

pub use dummy::*;
pub use traits::*;
pub use types::*;

#[cfg(not(target_arch = "wasm32"))]
pub use vulkan::{VulkanContext, VulkanDevice};
