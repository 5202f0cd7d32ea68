//! Top-level renderer
//!
//! Owns the shared allocator and resource manager and runs the frame loop
//! either on a dedicated [`RenderThread`] (`start`/`stop`) or on the caller's
//! thread one frame at a time (`render_frame`).

use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use crate::allocator::GpuAllocator;
use crate::backend::GpuDevice;
use crate::config::RendererConfig;
use crate::error::{RenderError, RenderResult};
use crate::events::EventQueue;
use crate::render_graph::RenderGraph;
use crate::render_thread::{FrameControl, FrameLoop, FrameOutcome, RenderThread};
use crate::resources::ResourceManager;
use crate::swapchain::SurfaceProvider;

pub struct Renderer {
    device: Arc<dyn GpuDevice>,
    surface: Arc<dyn SurfaceProvider>,
    config: RendererConfig,
    events: EventQueue,
    allocator: Arc<Mutex<GpuAllocator>>,
    resources: Arc<Mutex<ResourceManager>>,
    control: Arc<FrameControl>,
    frame_loop: Option<FrameLoop>,
    thread: Option<RenderThread>,
}

impl Renderer {
    /// Create the renderer for one window surface. Resource and resize events
    /// are read from `events`.
    pub fn new(
        device: Arc<dyn GpuDevice>,
        surface: Arc<dyn SurfaceProvider>,
        config: RendererConfig,
        events: &EventQueue,
    ) -> RenderResult<Self> {
        let allocator = Arc::new(Mutex::new(GpuAllocator::new(device.clone())));
        let resources = ResourceManager::new(device.clone(), allocator.clone())?
            .with_events(events.subscribe());

        info!(
            "Renderer created on {} ({} frames in flight, vsync {})",
            device.name(),
            config.frames_in_flight,
            config.vsync
        );

        Ok(Self {
            device,
            surface,
            config,
            events: events.clone(),
            allocator,
            resources: Arc::new(Mutex::new(resources)),
            control: Arc::new(FrameControl::new()),
            frame_loop: None,
            thread: None,
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<Mutex<GpuAllocator>> {
        &self.allocator
    }

    pub fn resources(&self) -> &Arc<Mutex<ResourceManager>> {
        &self.resources
    }

    pub fn control(&self) -> &Arc<FrameControl> {
        &self.control
    }

    /// Replace the active graph. It is compiled before the next frame.
    pub fn set_render_graph(&self, graph: Arc<RenderGraph>) {
        self.control.set_render_graph(graph);
    }

    pub fn clear_render_graph(&self) {
        self.control.clear_render_graph();
    }

    /// Rebuild the swapchain after the next present.
    pub fn request_resize(&self) {
        self.control.request_resize();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn frames_presented(&self) -> u64 {
        self.control.frames_presented()
    }

    fn build_frame_loop(&self) -> impl FnOnce() -> RenderResult<FrameLoop> + Send + 'static {
        let device = self.device.clone();
        let allocator = self.allocator.clone();
        let surface = self.surface.clone();
        let config = self.config.clone();
        let control = self.control.clone();
        let resources = self.resources.clone();
        let events = self.events.subscribe();
        move || {
            Ok(FrameLoop::new(device, allocator, surface, &config, control)?
                .with_resources(resources)
                .with_events(events))
        }
    }

    /// Render one frame on the calling thread.
    pub fn render_frame(&mut self) -> RenderResult<FrameOutcome> {
        if self.thread.is_some() {
            return Err(RenderError::Configuration(
                "render_frame called while the render thread is running".into(),
            ));
        }
        if self.frame_loop.is_none() {
            self.frame_loop = Some((self.build_frame_loop())()?);
        }
        let result = match self.frame_loop.as_mut() {
            Some(frame_loop) => frame_loop.render_frame(),
            None => return Err(RenderError::NotCompiled),
        };
        if let Err(err) = &result {
            // The slot fence may never signal again; rebuild on the next call.
            warn!("Frame failed, discarding the frame loop: {err}");
            self.frame_loop = None;
        }
        result
    }

    /// Spawn the render thread. Returns once its frame loop is built.
    pub fn start(&mut self) -> RenderResult<()> {
        if self.thread.is_some() {
            return Err(RenderError::Configuration("render thread already started".into()));
        }
        if let Some(mut frame_loop) = self.frame_loop.take() {
            frame_loop.shutdown()?;
        }
        // A fresh control block clears a stop request left by an earlier run.
        let control = Arc::new(FrameControl::new());
        if let Some(graph) = self.control.render_graph() {
            control.set_render_graph(graph);
        }
        self.control = control;
        let thread = RenderThread::spawn(self.control.clone(), self.build_frame_loop())?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Stop the render thread, returning the loop's terminal result.
    pub fn stop(&mut self) -> RenderResult<()> {
        match self.thread.take() {
            Some(mut thread) => thread.stop(),
            None => Ok(()),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("Render thread ended with error: {err}");
        }
        if let Some(mut frame_loop) = self.frame_loop.take() {
            if let Err(err) = frame_loop.shutdown() {
                warn!("Frame loop shutdown failed: {err}");
            }
        }
    }
}
