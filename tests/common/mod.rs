//! Shared fixtures for the integration tests.
//!
//! Everything runs against `DummyDevice`, which records every native call so
//! the tests can assert on ordering and object lifetimes.

#![allow(dead_code)]

use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use vk_render_core::backend::{DeviceCall, DummyDevice, DummySurface, GpuDevice};
use vk_render_core::render_graph::{
    RenderAttachment, RenderGraph, RenderGraphBuilder, RenderPass, RenderSubgraphRef, RenderTarget,
};
use vk_render_core::{
    FrameControl, FrameLoop, GpuAllocator, RendererConfig, SurfaceProvider, Swapchain,
};

pub const WINDOW: u64 = 1;
pub const COLOR: vk::ImageLayout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Shared recording log filled by pass actions.
pub type RecordLog = Arc<Mutex<Vec<String>>>;

pub struct TestContext {
    pub device: Arc<DummyDevice>,
    pub surface: Arc<DummySurface>,
    pub allocator: Arc<Mutex<GpuAllocator>>,
    pub config: RendererConfig,
}

impl TestContext {
    pub fn new() -> Self {
        init_logging();
        let device = Arc::new(DummyDevice::new());
        let allocator = Arc::new(Mutex::new(GpuAllocator::new(device.clone())));
        Self {
            device,
            surface: Arc::new(DummySurface::new(WINDOW, 800, 600)),
            allocator,
            config: RendererConfig::default(),
        }
    }

    pub fn gpu(&self) -> Arc<dyn GpuDevice> {
        self.device.clone()
    }

    pub fn surface_provider(&self) -> Arc<dyn SurfaceProvider> {
        self.surface.clone()
    }

    pub fn swapchain(&self) -> Swapchain {
        let mut swapchain = Swapchain::new(self.gpu(), self.surface_provider(), false);
        swapchain.create().expect("swapchain");
        swapchain
    }

    pub fn frame_loop(&self, control: &Arc<FrameControl>) -> FrameLoop {
        FrameLoop::new(
            self.gpu(),
            self.allocator.clone(),
            self.surface_provider(),
            &self.config,
            control.clone(),
        )
        .expect("frame loop")
    }

    /// Resize both the window and the surface the dummy device reports.
    pub fn resize(&self, width: u32, height: u32) {
        self.surface.resize(width, height);
        self.device.set_surface_extent(width, height);
    }

    pub fn position(&self, pred: impl Fn(&DeviceCall) -> bool) -> Option<usize> {
        self.device.calls().iter().position(pred)
    }

    pub fn rposition(&self, pred: impl Fn(&DeviceCall) -> bool) -> Option<usize> {
        self.device.calls().iter().rposition(pred)
    }
}

pub fn command_buffer() -> vk::CommandBuffer {
    vk::CommandBuffer::from_raw(0xC0FFEE)
}

fn logging_pass(name: &str, idx: u32, log: &RecordLog) -> RenderPass {
    let log = log.clone();
    let label = name.to_string();
    RenderPass::new(name, idx).on_record(move |ctx| {
        log.lock().push(format!("{label}@{}", ctx.subpass));
    })
}

/// Offscreen subgraph "scene" drawing into an image target, linked to a
/// "present" subgraph drawing into the swapchain.
pub fn offscreen_then_present(
    log: &RecordLog,
) -> (Arc<RenderGraph>, RenderSubgraphRef, RenderSubgraphRef) {
    let mut builder = RenderGraphBuilder::new();
    let hdr = builder.add_target(RenderTarget::color("hdr"));
    let backbuffer = builder.add_target(RenderTarget::swapchain("backbuffer"));

    let scene = builder.add_subgraph("scene", |sg| {
        let color = sg.add_attachment(RenderAttachment::new(
            hdr,
            0,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ));
        sg.add_pass(logging_pass("scene", 0, log).with_color(color, COLOR));
    });
    let present = builder.add_subgraph("present", |sg| {
        let color = sg.add_attachment(RenderAttachment::new(
            backbuffer,
            0,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ));
        sg.add_pass(logging_pass("present", 0, log).with_color(color, COLOR));
    });
    builder.link(scene, present);
    let graph = builder.build(scene).expect("graph");
    (graph, scene, present)
}

/// A single subgraph clearing the swapchain.
pub fn clear_swapchain() -> Arc<RenderGraph> {
    let mut builder = RenderGraphBuilder::new();
    let backbuffer = builder.add_target(RenderTarget::swapchain("backbuffer"));
    let main = builder.add_subgraph("main", |sg| {
        let color = sg.add_attachment(RenderAttachment::new(
            backbuffer,
            0,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ));
        sg.add_pass(RenderPass::new("clear", 0).with_color(color, COLOR));
    });
    builder.build(main).expect("graph")
}
