//! Per-frame synchronization primitives
//!
//! Each frame slot owns one fence and two semaphores:
//!
//! - `in_flight`: signaled when the GPU finishes the slot's submission; the
//!   CPU waits on it before reusing the slot's command buffer
//! - `image_available`: signaled by swapchain acquire, waited by the submit
//! - `render_finished`: signaled by the submit, waited by present

use std::sync::Arc;

use ash::vk;
use log::debug;

use crate::backend::GpuDevice;
use crate::error::{RenderResult, VkResultExt};

/// Synchronization objects of one frame in flight.
pub struct FrameSync {
    device: Arc<dyn GpuDevice>,
    pub in_flight: vk::Fence,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

impl FrameSync {
    /// Create the objects; the fence starts signaled so the first wait
    /// returns immediately.
    pub fn new(device: Arc<dyn GpuDevice>) -> RenderResult<Self> {
        let in_flight = device
            .create_fence(true)
            .context(|| "create in-flight fence".to_string())?;
        let mut sync = Self {
            device,
            in_flight,
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
        };
        // On failure, Drop releases whatever was created so far.
        sync.image_available = sync
            .device
            .create_semaphore()
            .context(|| "create image-available semaphore".to_string())?;
        sync.render_finished = sync
            .device
            .create_semaphore()
            .context(|| "create render-finished semaphore".to_string())?;
        Ok(sync)
    }

    /// One `FrameSync` per frame in flight.
    pub fn create_ring(device: &Arc<dyn GpuDevice>, count: usize) -> RenderResult<Vec<Self>> {
        let ring = (0..count)
            .map(|_| Self::new(device.clone()))
            .collect::<RenderResult<Vec<_>>>()?;
        debug!(target: "render_thread", "Created {} frame sync slots", ring.len());
        Ok(ring)
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        if self.render_finished != vk::Semaphore::null() {
            self.device.destroy_semaphore(self.render_finished);
        }
        if self.image_available != vk::Semaphore::null() {
            self.device.destroy_semaphore(self.image_available);
        }
        if self.in_flight != vk::Fence::null() {
            self.device.destroy_fence(self.in_flight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyDevice;

    #[test]
    fn test_ring_lifecycle() {
        let dummy = Arc::new(DummyDevice::new());
        let device: Arc<dyn GpuDevice> = dummy.clone();
        let ring = FrameSync::create_ring(&device, 2).unwrap();
        assert_eq!(dummy.live_fences(), 2);
        assert_eq!(dummy.live_semaphores(), 4);
        assert!(ring.iter().all(|f| dummy.is_fence_signaled(f.in_flight)));

        drop(ring);
        assert_eq!(dummy.live_fences(), 0);
        assert_eq!(dummy.live_semaphores(), 0);
    }

    #[test]
    fn test_partial_failure_releases_created_objects() {
        let dummy = Arc::new(DummyDevice::new());
        dummy.fail_next("create_semaphore", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(FrameSync::new(dummy.clone()).is_err());
        assert_eq!(dummy.live_fences(), 0);
        assert_eq!(dummy.live_semaphores(), 0);
    }
}
