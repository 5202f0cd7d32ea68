//! Vulkan backend implementation using ash
//!
//! [`VulkanContext`] owns the instance, window surface and physical device
//! choice; [`VulkanDevice`] adds the logical device and implements
//! [`GpuDevice`](crate::backend::GpuDevice) on top of it.

mod context;
mod device;

pub use context::VulkanContext;
pub use device::VulkanDevice;
