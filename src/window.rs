//! Window management using winit

use std::sync::Arc;

use ash::vk;
use winit::{
    dpi::PhysicalSize,
    event::WindowEvent as WinitWindowEvent,
    event_loop::EventLoop,
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::error::{RenderError, RenderResult};
use crate::events::{EventQueue, WindowEvent};
use crate::swapchain::SurfaceProvider;

/// Wrapper around a winit window that forwards resizes to the event queue
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    close_requested: bool,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(
        event_loop: &EventLoop<()>,
        title: &str,
        width: u32,
        height: u32,
    ) -> RenderResult<Self> {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)
            .map_err(|e| RenderError::InitializationFailed(format!("create window: {e}")))?;

        Ok(Self {
            window: Arc::new(window),
            width,
            height,
            close_requested: false,
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    pub fn id(&self) -> u64 {
        u64::from(self.window.id())
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Track size and close requests, publishing resizes to `events`.
    pub fn handle_event(&mut self, event: &WinitWindowEvent, events: &EventQueue) {
        match event {
            WinitWindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                events.publish(WindowEvent::Resized {
                    window: self.id(),
                    width: size.width,
                    height: size.height,
                });
            }
            WinitWindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    /// Pair the window with the surface created for it.
    pub fn surface(&self, surface: vk::SurfaceKHR) -> Arc<dyn SurfaceProvider> {
        Arc::new(WindowSurface {
            window: self.window_arc(),
            surface,
        })
    }
}

/// A winit window together with its Vulkan surface
pub struct WindowSurface {
    window: Arc<WinitWindow>,
    surface: vk::SurfaceKHR,
}

impl WindowSurface {
    pub fn new(window: Arc<WinitWindow>, surface: vk::SurfaceKHR) -> Self {
        Self { window, surface }
    }
}

impl SurfaceProvider for WindowSurface {
    fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    fn window_id(&self) -> u64 {
        u64::from(self.window.id())
    }

    fn size(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }
}
