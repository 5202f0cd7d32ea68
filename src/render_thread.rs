//! Frame loop and the render thread that drives it
//!
//! Each iteration first applies pending invalidations (swapchain recreation,
//! render graph recompilation), then renders one frame on the current
//! in-flight slot:
//!
//! 1. wait for the slot's fence
//! 2. acquire a swapchain image (out-of-date skips the frame)
//! 3. reset and record the slot's command buffer through the executor
//! 4. reset the fence
//! 5. submit, waiting on image-available and signaling render-finished + fence
//! 6. present (out-of-date, suboptimal or a pending resize invalidates)
//! 7. advance to the next slot

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ash::vk;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::allocator::GpuAllocator;
use crate::backend::{GpuDevice, SubmitDesc};
use crate::commands::CommandManager;
use crate::config::RendererConfig;
use crate::error::{RenderError, RenderResult, VkResultExt};
use crate::events::{Event, EventReceiver, WindowEvent};
use crate::render_graph::{RenderGraph, RenderGraphExecutor};
use crate::resources::ResourceManager;
use crate::swapchain::{SurfaceProvider, Swapchain};
use crate::sync::FrameSync;

/// Flags and the pending graph, shared between the host and the render thread
#[derive(Default)]
pub struct FrameControl {
    stop: AtomicBool,
    swapchain_invalid: AtomicBool,
    resize_requested: AtomicBool,
    graph: Mutex<Option<Arc<RenderGraph>>>,
    frames_presented: AtomicU64,
}

impl FrameControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Ask for a swapchain rebuild after the next present.
    pub fn request_resize(&self) {
        self.resize_requested.store(true, Ordering::Release);
    }

    pub fn invalidate_swapchain(&self) {
        self.swapchain_invalid.store(true, Ordering::Release);
    }

    pub fn is_swapchain_invalid(&self) -> bool {
        self.swapchain_invalid.load(Ordering::Acquire)
    }

    /// Hand over a new graph; it is compiled at the start of the next frame.
    pub fn set_render_graph(&self, graph: Arc<RenderGraph>) {
        *self.graph.lock() = Some(graph);
    }

    pub fn clear_render_graph(&self) {
        *self.graph.lock() = None;
    }

    pub fn render_graph(&self) -> Option<Arc<RenderGraph>> {
        self.graph.lock().clone()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented.load(Ordering::Relaxed)
    }
}

/// Result of one frame loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was submitted and presented
    Presented { image_index: u32 },
    /// The swapchain could not be used this iteration (out of date or zero-sized)
    Skipped,
    /// No render graph has been set
    Idle,
}

/// Everything the render thread owns: swapchain, command buffers, frame
/// synchronization and the executor of the current graph.
pub struct FrameLoop {
    device: Arc<dyn GpuDevice>,
    allocator: Arc<Mutex<GpuAllocator>>,
    config: RendererConfig,
    control: Arc<FrameControl>,
    swapchain: Swapchain,
    commands: CommandManager,
    command_buffers: Vec<vk::CommandBuffer>,
    frames: Vec<FrameSync>,
    current_frame: usize,
    executor: Option<RenderGraphExecutor>,
    resources: Option<Arc<Mutex<ResourceManager>>>,
    events: Option<EventReceiver>,
}

impl FrameLoop {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        allocator: Arc<Mutex<GpuAllocator>>,
        surface: Arc<dyn SurfaceProvider>,
        config: &RendererConfig,
        control: Arc<FrameControl>,
    ) -> RenderResult<Self> {
        let frames_in_flight = config.frames_in_flight.max(1);

        let mut swapchain = Swapchain::new(device.clone(), surface, config.vsync);
        swapchain.create()?;

        let mut commands = CommandManager::new(device.clone())?;
        let command_buffers = commands.allocate_primary(frames_in_flight as u32)?;
        let frames = FrameSync::create_ring(&device, frames_in_flight)?;

        info!(
            target: "render_thread",
            "Frame loop ready on {} ({} frames in flight)",
            device.name(),
            frames_in_flight
        );

        Ok(Self {
            device,
            allocator,
            config: config.clone(),
            control,
            swapchain,
            commands,
            command_buffers,
            frames,
            current_frame: 0,
            executor: None,
            resources: None,
            events: None,
        })
    }

    /// Apply pending resource frees between frames.
    pub fn with_resources(mut self, resources: Arc<Mutex<ResourceManager>>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// React to `WindowEvent::Resized` for this loop's window.
    pub fn with_events(mut self, events: EventReceiver) -> Self {
        self.events = Some(events);
        self
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn executor(&self) -> Option<&RenderGraphExecutor> {
        self.executor.as_ref()
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_sync(&self, frame: usize) -> Option<&FrameSync> {
        self.frames.get(frame)
    }

    pub fn command_buffer(&self, frame: usize) -> Option<vk::CommandBuffer> {
        self.command_buffers.get(frame).copied()
    }

    /// Run one iteration: invalidation, then one frame.
    pub fn render_frame(&mut self) -> RenderResult<FrameOutcome> {
        self.poll_events();
        if let Some(resources) = &self.resources {
            let mut resources = resources.lock();
            resources.process_events();
            resources.apply_pending_frees()?;
        }

        if !self.poll_invalidation()? {
            return Ok(FrameOutcome::Skipped);
        }
        if self.executor.is_none() {
            return Ok(FrameOutcome::Idle);
        }
        self.draw_frame()
    }

    fn poll_events(&mut self) {
        let Some(events) = &self.events else {
            return;
        };
        let window = self.swapchain.surface().window_id();
        for event in events.drain() {
            if let Event::Window(WindowEvent::Resized { window: id, .. }) = event {
                if id == window {
                    self.control.request_resize();
                }
            }
        }
    }

    /// Recreate the swapchain and/or recompile the graph when flagged.
    /// Returns `false` when the surface is zero-sized and the frame must wait.
    fn poll_invalidation(&mut self) -> RenderResult<bool> {
        let pending = self.control.render_graph();
        let mut graph_changed = match (&pending, &self.executor) {
            (Some(graph), Some(executor)) => !Arc::ptr_eq(graph, executor.graph()),
            (Some(_), None) | (None, Some(_)) => true,
            (None, None) => false,
        };

        if self.control.is_swapchain_invalid() {
            if self.swapchain.is_surface_zero_sized()? {
                return Ok(false);
            }
            self.device
                .device_wait_idle()
                .context(|| "wait device idle before swapchain recreation".to_string())?;
            let old_format = self.swapchain.format().format;
            self.swapchain.create()?;
            self.control.swapchain_invalid.store(false, Ordering::Release);

            if self.swapchain.format().format != old_format {
                // Renderpasses bake the swapchain format in.
                graph_changed = true;
            } else if !graph_changed {
                if let Some(executor) = &mut self.executor {
                    executor.recreate_framebuffers(&self.swapchain)?;
                }
            }
        }

        if graph_changed {
            self.device
                .device_wait_idle()
                .context(|| "wait device idle before graph recompilation".to_string())?;
            if let Some(mut executor) = self.executor.take() {
                executor.destroy();
            }
            if let Some(graph) = pending {
                let mut executor = RenderGraphExecutor::new(
                    self.device.clone(),
                    self.allocator.clone(),
                    graph,
                    &self.config,
                );
                executor.create(&self.swapchain)?;
                self.executor = Some(executor);
            }
        }
        Ok(true)
    }

    fn draw_frame(&mut self) -> RenderResult<FrameOutcome> {
        let frame = self.current_frame;
        let sync = &self.frames[frame];
        let cmd = self.command_buffers[frame];
        let device = &self.device;

        match device.wait_for_fence(sync.in_flight, self.config.fence_timeout_ns) {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                error!(target: "render_thread", "Timed out waiting for frame {frame} fence");
                return Err(RenderError::FenceTimeout { frame });
            }
            Err(result) => {
                error!(target: "render_thread", "vkWaitForFences failed: {result}");
                return Err(RenderError::native("wait for in-flight fence", result));
            }
        }

        let image_index = match device.acquire_next_image(
            self.swapchain.handle(),
            self.config.acquire_timeout_ns,
            sync.image_available,
        ) {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!(target: "render_thread", "Swapchain out of date on acquire");
                self.control.invalidate_swapchain();
                return Ok(FrameOutcome::Skipped);
            }
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => {
                return Ok(FrameOutcome::Skipped);
            }
            Err(result) => {
                error!(target: "render_thread", "vkAcquireNextImageKHR failed: {result}");
                return Err(RenderError::native("acquire next image", result));
            }
        };

        device
            .reset_command_buffer(cmd)
            .context(|| "reset frame command buffer".to_string())?;
        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .context(|| "begin frame command buffer".to_string())?;
        if let Some(executor) = &self.executor {
            executor.execute(image_index, cmd)?;
        }
        device
            .end_command_buffer(cmd)
            .context(|| "end frame command buffer".to_string())?;

        // The fence stays signaled until the frame is handed to the queue.
        device
            .reset_fence(sync.in_flight)
            .context(|| "reset in-flight fence".to_string())?;

        let submit = SubmitDesc {
            command_buffers: vec![cmd],
            wait_semaphores: vec![(
                sync.image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )],
            signal_semaphores: vec![sync.render_finished],
            fence: sync.in_flight,
        };
        device
            .queue_submit(device.graphics_queue(), &submit)
            .map_err(|result| {
                error!(target: "render_thread", "vkQueueSubmit failed: {result}");
                RenderError::native("submit frame", result)
            })?;

        let mut invalid = match device.queue_present(
            device.present_queue(),
            self.swapchain.handle(),
            image_index,
            sync.render_finished,
        ) {
            Ok(false) => false,
            Ok(true) => {
                debug!(target: "render_thread", "Swapchain suboptimal on present");
                true
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                debug!(target: "render_thread", "Swapchain out of date on present");
                true
            }
            Err(result) => {
                error!(target: "render_thread", "vkQueuePresentKHR failed: {result}");
                return Err(RenderError::native("present frame", result));
            }
        };
        if self.control.resize_requested.swap(false, Ordering::AcqRel) {
            invalid = true;
        }
        if invalid {
            self.control.invalidate_swapchain();
        }

        self.current_frame = (frame + 1) % self.frames.len();
        self.control.frames_presented.fetch_add(1, Ordering::Relaxed);
        Ok(FrameOutcome::Presented { image_index })
    }

    /// Wait for the device, then release the executor, command buffers,
    /// frame synchronization and the swapchain. Safe to call more than once.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        let idle = self
            .device
            .device_wait_idle()
            .context(|| "wait device idle on shutdown".to_string());
        if let Some(mut executor) = self.executor.take() {
            executor.destroy();
        }
        self.commands.free_all();
        self.command_buffers.clear();
        self.frames.clear();
        let swapchain = self.swapchain.destroy();
        debug!(target: "render_thread", "Frame loop shut down");
        idle.and(swapchain)
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(target: "render_thread", "Frame loop shutdown failed: {err}");
        }
    }
}

/// Dedicated thread running a [`FrameLoop`] until stopped.
pub struct RenderThread {
    control: Arc<FrameControl>,
    handle: Option<JoinHandle<RenderResult<()>>>,
}

impl RenderThread {
    /// Spawn the thread and build the frame loop on it. Returns once the loop
    /// is built, surfacing construction errors directly.
    pub fn spawn<F>(control: Arc<FrameControl>, build: F) -> RenderResult<Self>
    where
        F: FnOnce() -> RenderResult<FrameLoop> + Send + 'static,
    {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<RenderResult<()>>(1);
        let thread_control = control.clone();
        let handle = std::thread::Builder::new()
            .name("render".into())
            .spawn(move || {
                let mut frame_loop = match build() {
                    Ok(frame_loop) => {
                        let _ = ready_tx.send(Ok(()));
                        frame_loop
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return Ok(());
                    }
                };
                let result = run_loop(&mut frame_loop, &thread_control);
                if let Err(err) = &result {
                    error!(target: "render_thread", "Render thread stopped on error: {err}");
                }
                let shutdown = frame_loop.shutdown();
                result.and(shutdown)
            })
            .map_err(|e| RenderError::InitializationFailed(format!("spawn render thread: {e}")))?;

        let mut thread = Self {
            control,
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(thread),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => thread.join().and(Err(RenderError::RenderThreadPanicked)),
        }
    }

    pub fn control(&self) -> &Arc<FrameControl> {
        &self.control
    }

    /// Whether the thread has exited (stopped or failed).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Request a stop and wait for the thread. Returns the loop's terminal
    /// result, so fatal errors from inside the thread reach the caller.
    pub fn stop(&mut self) -> RenderResult<()> {
        self.control.request_stop();
        self.join()
    }

    fn join(&mut self) -> RenderResult<()> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| RenderError::RenderThreadPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(target: "render_thread", "Render thread ended with error: {err}");
        }
    }
}

fn run_loop(frame_loop: &mut FrameLoop, control: &FrameControl) -> RenderResult<()> {
    while !control.is_stop_requested() {
        match frame_loop.render_frame()? {
            FrameOutcome::Presented { .. } => {}
            FrameOutcome::Skipped | FrameOutcome::Idle => {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
    info!(
        target: "render_thread",
        "Render thread stopping after {} frames",
        control.frames_presented()
    );
    Ok(())
}
