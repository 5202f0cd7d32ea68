//! # Clear Demo
//!
//! Opens a window and renders a two-subgraph graph on the render thread:
//! an offscreen "scene" target cleared to a slowly cycling color, followed by
//! a "present" subgraph that clears the swapchain image.
//!
//! Run with `cargo run --example clear`. Set `RUST_LOG=debug` to see
//! swapchain recreation and graph compilation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use log::{error, info};
use winit::event::Event;
use winit::event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget};

use vk_render_core::backend::{ClearValue, VulkanDevice};
use vk_render_core::render_graph::{RenderAttachment, RenderPass, RenderTarget};
use vk_render_core::window::Window;
use vk_render_core::{
    EventQueue, RenderGraph, RenderGraphBuilder, RenderResult, Renderer, RendererConfig,
};

const COLOR_ATTACHMENT: vk::ImageLayout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;

fn build_graph(scene_color: [f32; 4]) -> RenderResult<Arc<RenderGraph>> {
    let mut builder = RenderGraphBuilder::new();
    let scene_target = builder.add_target(
        RenderTarget::color("scene").with_clear_value(ClearValue::Color(scene_color)),
    );
    let backbuffer = builder.add_target(
        RenderTarget::swapchain("backbuffer")
            .with_clear_value(ClearValue::Color([0.1, 0.1, 0.12, 1.0])),
    );

    let scene = builder.add_subgraph("scene", |sg| {
        let color = sg.add_attachment(RenderAttachment::new(
            scene_target,
            0,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ));
        sg.add_pass(RenderPass::new("scene", 0).with_color(color, COLOR_ATTACHMENT));
    });
    let present = builder.add_subgraph("present", |sg| {
        let color = sg.add_attachment(RenderAttachment::new(
            backbuffer,
            0,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ));
        sg.add_pass(
            RenderPass::new("present", 0)
                .with_color(color, COLOR_ATTACHMENT)
                .on_record(|ctx| {
                    log::trace!(
                        "Recording present pass for image {} at {}x{}",
                        ctx.image_index,
                        ctx.extent.width,
                        ctx.extent.height
                    );
                }),
        );
    });
    builder.link(scene, present);
    builder.build(scene)
}

fn cycle_color(elapsed: Duration) -> [f32; 4] {
    let t = elapsed.as_secs_f32() * 0.5;
    [
        0.5 + 0.5 * t.sin(),
        0.5 + 0.5 * (t + 2.1).sin(),
        0.5 + 0.5 * (t + 4.2).sin(),
        1.0,
    ]
}

fn main() {
    vk_render_core::init_logging();

    let config = RendererConfig::default().with_app_name("clear-demo");
    let event_loop = EventLoop::new().expect("Failed to create event loop");
    let mut window = Window::new(&event_loop, "vk-render-core: clear", 1280, 720)
        .expect("Failed to create window");

    let device =
        Arc::new(VulkanDevice::new(window.window(), &config).expect("Failed to create device"));
    let surface = window.surface(device.surface());
    let events = EventQueue::new();

    let mut renderer =
        Renderer::new(device, surface, config, &events).expect("Failed to create renderer");
    let start = Instant::now();
    let graph = build_graph(cycle_color(Duration::ZERO)).expect("Invalid render graph");
    renderer.set_render_graph(graph);
    renderer.start().expect("Failed to start render thread");

    let mut last_rebuild = Instant::now();
    let mut last_report = Instant::now();

    event_loop
        .run(move |event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    window.handle_event(&event, &events);
                    if window.should_close() {
                        if let Err(err) = renderer.stop() {
                            error!("Render thread failed: {err}");
                        }
                        elwt.exit();
                    }
                }
                Event::AboutToWait => {
                    if !renderer.is_running() {
                        // The thread only exits on its own after a fatal error.
                        if let Err(err) = renderer.stop() {
                            error!("Render thread failed: {err}");
                        }
                        elwt.exit();
                        return;
                    }
                    // Swapping the graph makes the render thread recompile it.
                    if last_rebuild.elapsed() >= Duration::from_secs(2) {
                        match build_graph(cycle_color(start.elapsed())) {
                            Ok(graph) => renderer.set_render_graph(graph),
                            Err(err) => error!("Failed to build render graph: {err}"),
                        }
                        last_rebuild = Instant::now();
                    }
                    if last_report.elapsed() >= Duration::from_secs(1) {
                        let (width, height) = window.dimensions();
                        info!(
                            "{} frames presented ({width}x{height})",
                            renderer.frames_presented()
                        );
                        last_report = Instant::now();
                    }
                }
                _ => {}
            }
        })
        .expect("Event loop failed");
}
