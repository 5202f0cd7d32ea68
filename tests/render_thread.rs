//! Renderer lifecycle on a dedicated render thread

mod common;

use std::thread;
use std::time::{Duration, Instant};

use ash::vk;

use common::{clear_swapchain, TestContext};
use vk_render_core::backend::DeviceCall;
use vk_render_core::{
    EventQueue, FrameOutcome, RenderError, RenderThread, Renderer, RendererConfig,
};

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    done()
}

fn renderer(ctx: &TestContext, events: &EventQueue) -> Renderer {
    Renderer::new(
        ctx.gpu(),
        ctx.surface_provider(),
        RendererConfig::default(),
        events,
    )
    .unwrap()
}

#[test]
fn test_render_thread_presents_until_stopped() {
    let ctx = TestContext::new();
    let events = EventQueue::new();
    let mut renderer = renderer(&ctx, &events);
    renderer.set_render_graph(clear_swapchain());

    renderer.start().unwrap();
    assert!(renderer.is_running());
    assert!(wait_until(Duration::from_secs(5), || renderer.frames_presented() >= 3));

    renderer.stop().unwrap();
    assert!(!renderer.is_running());
    let presented = renderer.frames_presented();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(renderer.frames_presented(), presented);

    assert_eq!(ctx.device.live_swapchains(), 0);
    assert_eq!(ctx.device.live_fences(), 0);
    assert_eq!(ctx.device.live_render_passes(), 0);
}

#[test]
fn test_start_surfaces_construction_errors() {
    let ctx = TestContext::new();
    let events = EventQueue::new();
    let mut renderer = renderer(&ctx, &events);

    ctx.device
        .fail_next("create_swapchain", vk::Result::ERROR_SURFACE_LOST_KHR);
    let err = renderer.start().unwrap_err();
    assert!(matches!(
        err,
        RenderError::NativeApi {
            result: vk::Result::ERROR_SURFACE_LOST_KHR,
            ..
        }
    ));
    assert!(!renderer.is_running());

    // A later start succeeds once the surface is usable.
    renderer.set_render_graph(clear_swapchain());
    renderer.start().unwrap();
    renderer.stop().unwrap();
}

#[test]
fn test_fatal_error_reaches_stop() {
    let ctx = TestContext::new();
    let events = EventQueue::new();
    let mut renderer = renderer(&ctx, &events);
    renderer.set_render_graph(clear_swapchain());

    ctx.device.script_fence_timeouts(1);
    renderer.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || !renderer.is_running()));

    assert!(matches!(
        renderer.stop(),
        Err(RenderError::FenceTimeout { frame: 0 })
    ));
    // Resources were still released on the way out.
    assert_eq!(ctx.device.live_swapchains(), 0);
    assert_eq!(ctx.device.live_command_buffers(), 0);
}

#[test]
fn test_manual_frames_then_thread() {
    let ctx = TestContext::new();
    let events = EventQueue::new();
    let mut renderer = renderer(&ctx, &events);

    assert_eq!(renderer.render_frame().unwrap(), FrameOutcome::Idle);
    renderer.set_render_graph(clear_swapchain());
    assert!(matches!(
        renderer.render_frame().unwrap(),
        FrameOutcome::Presented { image_index: 0 }
    ));
    assert_eq!(renderer.frames_presented(), 1);

    renderer.start().unwrap();
    assert!(matches!(
        renderer.render_frame(),
        Err(RenderError::Configuration(_))
    ));
    assert!(matches!(
        renderer.start(),
        Err(RenderError::Configuration(_))
    ));
    assert!(wait_until(Duration::from_secs(5), || renderer.frames_presented() >= 2));
    renderer.stop().unwrap();

    // The manual loop's swapchain was released before the thread built its own.
    let creates = ctx
        .device
        .count_calls(|c| matches!(c, DeviceCall::CreateSwapchain { .. }));
    assert_eq!(creates, 2);
    assert_eq!(ctx.device.live_swapchains(), 0);
}

#[test]
fn test_failed_submit_does_not_poison_manual_frames() {
    let ctx = TestContext::new();
    let events = EventQueue::new();
    let mut renderer = renderer(&ctx, &events);
    renderer.set_render_graph(clear_swapchain());

    ctx.device
        .fail_next("queue_submit", vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    assert!(matches!(
        renderer.render_frame(),
        Err(RenderError::NativeApi {
            result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            ..
        })
    ));
    // The failed loop was torn down with its unsignaled fence.
    assert_eq!(ctx.device.live_swapchains(), 0);
    assert_eq!(ctx.device.live_fences(), 0);

    assert!(matches!(
        renderer.render_frame().unwrap(),
        FrameOutcome::Presented { .. }
    ));
    assert!(matches!(
        renderer.render_frame().unwrap(),
        FrameOutcome::Presented { .. }
    ));
    assert_eq!(renderer.frames_presented(), 2);
    assert_eq!(ctx.device.live_swapchains(), 1);
}

#[test]
fn test_window_resize_reaches_render_thread() {
    let ctx = TestContext::new();
    let events = EventQueue::new();
    let mut renderer = renderer(&ctx, &events);
    renderer.set_render_graph(clear_swapchain());
    renderer.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || renderer.frames_presented() >= 1));

    ctx.resize(1024, 768);
    events.publish(vk_render_core::WindowEvent::Resized {
        window: common::WINDOW,
        width: 1024,
        height: 768,
    });
    let device = ctx.device.clone();
    assert!(wait_until(Duration::from_secs(5), || {
        device.count_calls(|c| {
            matches!(
                c,
                DeviceCall::CreateSwapchain { extent, .. } if extent.width == 1024
            )
        }) == 1
    }));
    renderer.stop().unwrap();
}

#[test]
fn test_render_thread_build_error_is_returned() {
    let control = std::sync::Arc::new(vk_render_core::FrameControl::new());
    let result = RenderThread::spawn(control, || {
        Err(RenderError::InitializationFailed("no surface".into()))
    });
    assert!(matches!(result, Err(RenderError::InitializationFailed(_))));
}
