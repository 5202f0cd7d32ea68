//! Swapchain and surface management.
//!
//! - [`SurfaceProvider`] - window surface plus its current size
//! - [`Swapchain`] - presentable images, their views, and (re)creation
//! - [`SwapchainManager`] - one swapchain per window, recreated on resize events

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use log::{debug, error, info, warn};

use crate::backend::{GpuDevice, ImageViewDesc, SwapchainDesc};
use crate::error::{RenderError, RenderResult, VkResultExt};
use crate::events::{Event, EventReceiver, WindowEvent};

/// Window surface the swapchain presents to.
pub trait SurfaceProvider: Send + Sync {
    fn surface(&self) -> vk::SurfaceKHR;
    /// Stable key identifying the window that owns the surface.
    fn window_id(&self) -> u64;
    /// Current inner size of the window in pixels.
    fn size(&self) -> (u32, u32);
}

fn native_error(context: &str, result: vk::Result) -> RenderError {
    error!(target: "swapchain", "{context} failed: {result}");
    RenderError::native(context, result)
}

/// Pick the swapchain extent.
///
/// The surface's current extent wins unless it is the `u32::MAX` sentinel,
/// in which case the window size is clamped into the supported range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_size: (u32, u32),
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX
        && capabilities.current_extent.height != u32::MAX
    {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window_size.0.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window_size.1.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// Pick a present mode from a preferred list gated by vsync.
///
/// Without vsync the renderer asks for IMMEDIATE first. FIFO is the last
/// resort because every implementation must support it.
pub fn choose_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    let preferred: &[vk::PresentModeKHR] = if vsync {
        &[vk::PresentModeKHR::FIFO_RELAXED, vk::PresentModeKHR::FIFO]
    } else {
        &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
    };
    preferred
        .iter()
        .copied()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// `min + 1` images, clamped to `max` when the surface reports a maximum.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Prefer an sRGB BGRA format, otherwise whatever the surface lists first.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
) -> RenderResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
        .ok_or_else(|| {
            RenderError::InitializationFailed("surface reports no supported formats".into())
        })
}

/// Presentable image chain for one window.
pub struct Swapchain {
    device: Arc<dyn GpuDevice>,
    surface: Arc<dyn SurfaceProvider>,
    vsync: bool,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

impl Swapchain {
    /// Create an empty swapchain; call [`Swapchain::create`] to build the
    /// native objects.
    pub fn new(device: Arc<dyn GpuDevice>, surface: Arc<dyn SurfaceProvider>, vsync: bool) -> Self {
        Self {
            device,
            surface,
            vsync,
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn surface(&self) -> &Arc<dyn SurfaceProvider> {
        &self.surface
    }

    pub fn is_created(&self) -> bool {
        self.handle != vk::SwapchainKHR::null()
    }

    /// Whether the surface currently has no drawable area (e.g. minimized).
    pub fn is_surface_zero_sized(&self) -> RenderResult<bool> {
        let capabilities = self
            .device
            .surface_capabilities(self.surface.surface())
            .context(|| "query surface capabilities".to_string())?;
        let extent = choose_extent(&capabilities, self.surface.size());
        Ok(extent.width == 0 || extent.height == 0)
    }

    /// Create the swapchain, or recreate it chaining the current handle as
    /// `old_swapchain`. The new handle and views replace the old ones only
    /// after everything succeeded; the old ones are destroyed afterwards.
    pub fn create(&mut self) -> RenderResult<()> {
        let surface = self.surface.surface();
        let capabilities = self
            .device
            .surface_capabilities(surface)
            .context(|| "query surface capabilities".to_string())?;
        let formats = self
            .device
            .surface_formats(surface)
            .context(|| "query surface formats".to_string())?;
        let present_modes = self
            .device
            .surface_present_modes(surface)
            .context(|| "query surface present modes".to_string())?;

        let format = choose_surface_format(&formats)?;
        let extent = choose_extent(&capabilities, self.surface.size());
        let present_mode = choose_present_mode(&present_modes, self.vsync);
        let image_count = choose_image_count(&capabilities);

        let desc = SwapchainDesc {
            surface,
            min_image_count: image_count,
            format,
            extent,
            present_mode,
            pre_transform: capabilities.current_transform,
            old_swapchain: self.handle,
        };
        let handle = self
            .device
            .create_swapchain(&desc)
            .map_err(|result| native_error("create swapchain", result))?;

        let images = match self.device.swapchain_images(handle) {
            Ok(images) => images,
            Err(result) => {
                self.device.destroy_swapchain(handle);
                return Err(native_error("get swapchain images", result));
            }
        };

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            let desc = ImageViewDesc {
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: format.format,
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_levels: 1,
                layer_count: 1,
            };
            match self.device.create_image_view(&desc) {
                Ok(view) => views.push(view),
                Err(result) => {
                    for view in views {
                        self.device.destroy_image_view(view);
                    }
                    self.device.destroy_swapchain(handle);
                    return Err(native_error("create swapchain image view", result));
                }
            }
        }

        let old_handle = std::mem::replace(&mut self.handle, handle);
        let old_views = std::mem::replace(&mut self.image_views, views);
        self.images = images;
        self.format = format;
        self.extent = extent;
        self.present_mode = present_mode;

        for view in old_views {
            self.device.destroy_image_view(view);
        }
        if old_handle != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(old_handle);
        }

        info!(
            target: "swapchain",
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            format.format,
            present_mode
        );
        Ok(())
    }

    /// Wait for the device to go idle, then destroy views and the handle.
    /// Does nothing when the swapchain was never created.
    pub fn destroy(&mut self) -> RenderResult<()> {
        if self.handle == vk::SwapchainKHR::null() {
            return Ok(());
        }
        self.device
            .device_wait_idle()
            .context(|| "wait device idle before swapchain destroy".to_string())?;
        for view in self.image_views.drain(..) {
            self.device.destroy_image_view(view);
        }
        self.device.destroy_swapchain(self.handle);
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
        debug!(target: "swapchain", "Swapchain destroyed");
        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!(target: "swapchain", "Failed to destroy swapchain on drop: {err}");
        }
    }
}

/// Owns one [`Swapchain`] per window and recreates it when the window resizes.
pub struct SwapchainManager {
    swapchains: HashMap<u64, Swapchain>,
    events: EventReceiver,
}

impl SwapchainManager {
    pub fn new(events: EventReceiver) -> Self {
        Self {
            swapchains: HashMap::new(),
            events,
        }
    }

    /// Create a swapchain for the surface's window and start tracking it.
    pub fn add(
        &mut self,
        device: Arc<dyn GpuDevice>,
        surface: Arc<dyn SurfaceProvider>,
        vsync: bool,
    ) -> RenderResult<&Swapchain> {
        let window = surface.window_id();
        let mut swapchain = Swapchain::new(device, surface, vsync);
        swapchain.create()?;
        if let Some(mut previous) = self.swapchains.insert(window, swapchain) {
            previous.destroy()?;
        }
        self.swapchains
            .get(&window)
            .ok_or_else(|| RenderError::Configuration(format!("window {window} not tracked")))
    }

    pub fn get(&self, window: u64) -> Option<&Swapchain> {
        self.swapchains.get(&window)
    }

    pub fn get_mut(&mut self, window: u64) -> Option<&mut Swapchain> {
        self.swapchains.get_mut(&window)
    }

    pub fn len(&self) -> usize {
        self.swapchains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swapchains.is_empty()
    }

    /// Stop tracking a window and destroy its swapchain.
    pub fn remove(&mut self, window: u64) -> RenderResult<()> {
        match self.swapchains.remove(&window) {
            Some(mut swapchain) => swapchain.destroy(),
            None => Ok(()),
        }
    }

    /// Drain pending events and rebuild the swapchain of every resized window.
    /// Returns the number of swapchains recreated.
    pub fn process_events(&mut self) -> RenderResult<usize> {
        let mut recreated = 0;
        for event in self.events.drain() {
            let Event::Window(WindowEvent::Resized {
                window,
                width,
                height,
            }) = event
            else {
                continue;
            };
            let Some(swapchain) = self.swapchains.get_mut(&window) else {
                debug!(target: "swapchain", "Resize for untracked window {window}");
                continue;
            };
            if width == 0 || height == 0 {
                debug!(target: "swapchain", "Window {window} minimized, keeping swapchain");
                continue;
            }
            swapchain.destroy()?;
            swapchain.create()?;
            recreated += 1;
        }
        Ok(recreated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const FIFO: vk::PresentModeKHR = vk::PresentModeKHR::FIFO;
    const FIFO_RELAXED: vk::PresentModeKHR = vk::PresentModeKHR::FIFO_RELAXED;
    const MAILBOX: vk::PresentModeKHR = vk::PresentModeKHR::MAILBOX;
    const IMMEDIATE: vk::PresentModeKHR = vk::PresentModeKHR::IMMEDIATE;

    fn capabilities(
        current: (u32, u32),
        min_count: u32,
        max_count: u32,
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 2048,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[rstest]
    #[case::surface_extent((800, 600), (1920, 1080), (800, 600))]
    #[case::window_size((u32::MAX, u32::MAX), (1024, 768), (1024, 768))]
    #[case::clamped_low((u32::MAX, u32::MAX), (10, 10), (64, 64))]
    #[case::clamped_high((u32::MAX, u32::MAX), (4000, 100), (2048, 100))]
    fn test_choose_extent(
        #[case] current: (u32, u32),
        #[case] window: (u32, u32),
        #[case] expected: (u32, u32),
    ) {
        let extent = choose_extent(&capabilities(current, 2, 3), window);
        assert_eq!((extent.width, extent.height), expected);
    }

    #[rstest]
    #[case::bounded(2, 8, 3)]
    #[case::clamped(2, 2, 2)]
    #[case::unbounded(3, 0, 4)]
    fn test_choose_image_count(#[case] min: u32, #[case] max: u32, #[case] expected: u32) {
        assert_eq!(choose_image_count(&capabilities((1, 1), min, max)), expected);
    }

    #[rstest]
    #[case::immediate(false, &[FIFO, IMMEDIATE], IMMEDIATE)]
    #[case::mailbox(false, &[FIFO, MAILBOX], MAILBOX)]
    #[case::fifo_fallback(false, &[FIFO], FIFO)]
    #[case::vsync_relaxed(true, &[FIFO_RELAXED, IMMEDIATE], FIFO_RELAXED)]
    #[case::vsync_fifo(true, &[IMMEDIATE, FIFO], FIFO)]
    fn test_choose_present_mode(
        #[case] vsync: bool,
        #[case] available: &[vk::PresentModeKHR],
        #[case] expected: vk::PresentModeKHR,
    ) {
        assert_eq!(choose_present_mode(available, vsync), expected);
    }

    #[test]
    fn test_choose_surface_format() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]).unwrap().format, srgb.format);
        assert_eq!(choose_surface_format(&[unorm]).unwrap().format, unorm.format);
        assert!(choose_surface_format(&[]).is_err());
    }
}
