//! Frame loop pacing, invalidation and recompilation against the dummy device

mod common;

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use common::{clear_swapchain, offscreen_then_present, RecordLog, TestContext, WINDOW};
use vk_render_core::backend::DeviceCall;
use vk_render_core::resources::Mesh;
use vk_render_core::{
    EventQueue, FrameControl, FrameOutcome, RenderError, ResourceEvent, ResourceManager,
    WindowEvent,
};

fn control_with(graph: Option<Arc<vk_render_core::RenderGraph>>) -> Arc<FrameControl> {
    let control = Arc::new(FrameControl::new());
    if let Some(graph) = graph {
        control.set_render_graph(graph);
    }
    control
}

fn swapchain_creations(ctx: &TestContext) -> Vec<(vk::SwapchainKHR, vk::SwapchainKHR)> {
    ctx.device
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            DeviceCall::CreateSwapchain {
                swapchain,
                old_swapchain,
                ..
            } => Some((swapchain, old_swapchain)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_frame_follows_fence_acquire_submit_present_order() {
    let ctx = TestContext::new();
    let control = control_with(Some(clear_swapchain()));
    let mut frame_loop = ctx.frame_loop(&control);
    let fence = frame_loop.frame_sync(0).unwrap().in_flight;
    ctx.device.clear_calls();

    let outcome = frame_loop.render_frame().unwrap();
    assert_eq!(outcome, FrameOutcome::Presented { image_index: 0 });

    let wait = ctx.position(|c| *c == DeviceCall::WaitForFence(fence)).unwrap();
    let acquire = ctx
        .position(|c| matches!(c, DeviceCall::AcquireNextImage { .. }))
        .unwrap();
    let reset = ctx.position(|c| *c == DeviceCall::ResetFence(fence)).unwrap();
    let cmd = frame_loop.command_buffer(0).unwrap();
    let reset_cmd = ctx.position(|c| *c == DeviceCall::ResetCommandBuffer(cmd)).unwrap();
    let begin = ctx
        .position(|c| matches!(c, DeviceCall::BeginRenderPass { .. }))
        .unwrap();
    let end = ctx.position(|c| *c == DeviceCall::EndCommandBuffer(cmd)).unwrap();
    let submit = ctx
        .position(|c| matches!(c, DeviceCall::QueueSubmit { fence: f, .. } if *f == fence))
        .unwrap();
    let present = ctx
        .position(|c| matches!(c, DeviceCall::QueuePresent { .. }))
        .unwrap();
    assert!(wait < acquire);
    assert!(wait < reset_cmd);
    assert!(reset_cmd < begin);
    assert!(end < reset);
    assert!(reset < submit);
    assert!(begin < submit);
    assert!(submit < present);

    assert_eq!(control.frames_presented(), 1);
    assert_eq!(frame_loop.current_frame(), 1);
}

#[test]
fn test_frame_slots_cycle_independently_of_images() {
    let ctx = TestContext::new();
    let control = control_with(Some(clear_swapchain()));
    let mut frame_loop = ctx.frame_loop(&control);
    assert_eq!(frame_loop.frames_in_flight(), 2);
    assert_eq!(frame_loop.swapchain().image_count(), 3);

    let mut images = Vec::new();
    let mut slots = Vec::new();
    for _ in 0..4 {
        slots.push(frame_loop.current_frame());
        match frame_loop.render_frame().unwrap() {
            FrameOutcome::Presented { image_index } => images.push(image_index),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(images, vec![0, 1, 2, 0]);
    assert_eq!(slots, vec![0, 1, 0, 1]);

    let submitted: Vec<_> = ctx
        .device
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            DeviceCall::QueueSubmit { command_buffers, .. } => Some(command_buffers[0]),
            _ => None,
        })
        .collect();
    let cmd0 = frame_loop.command_buffer(0).unwrap();
    let cmd1 = frame_loop.command_buffer(1).unwrap();
    assert_eq!(submitted, vec![cmd0, cmd1, cmd0, cmd1]);
}

#[test]
fn test_out_of_date_acquire_skips_and_recreates() {
    let ctx = TestContext::new();
    let control = control_with(Some(clear_swapchain()));
    let mut frame_loop = ctx.frame_loop(&control);
    let original = frame_loop.swapchain().handle();
    let fence = frame_loop.frame_sync(0).unwrap().in_flight;

    ctx.device.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    assert_eq!(frame_loop.render_frame().unwrap(), FrameOutcome::Skipped);

    assert!(control.is_swapchain_invalid());
    assert_eq!(ctx.device.count_calls(|c| matches!(c, DeviceCall::QueueSubmit { .. })), 0);
    // The fence was never reset, so the next wait cannot deadlock.
    assert!(ctx.device.is_fence_signaled(fence));
    assert_eq!(frame_loop.current_frame(), 0);

    let outcome = frame_loop.render_frame().unwrap();
    assert!(matches!(outcome, FrameOutcome::Presented { .. }));
    assert!(!control.is_swapchain_invalid());

    let creations = swapchain_creations(&ctx);
    assert_eq!(creations.len(), 2);
    assert_eq!(creations[1].1, original);
    assert_ne!(frame_loop.swapchain().handle(), original);
}

#[test]
fn test_acquire_timeout_skips_without_invalidating() {
    let ctx = TestContext::new();
    let control = control_with(Some(clear_swapchain()));
    let mut frame_loop = ctx.frame_loop(&control);

    ctx.device.script_acquire(Err(vk::Result::TIMEOUT));
    assert_eq!(frame_loop.render_frame().unwrap(), FrameOutcome::Skipped);
    assert!(!control.is_swapchain_invalid());
    assert_eq!(swapchain_creations(&ctx).len(), 1);
}

#[test]
fn test_suboptimal_present_rebuilds_framebuffers_only() {
    let ctx = TestContext::new();
    let graph = clear_swapchain();
    let control = control_with(Some(graph.clone()));
    let mut frame_loop = ctx.frame_loop(&control);

    ctx.device.script_present(Ok(true));
    frame_loop.render_frame().unwrap();
    assert!(control.is_swapchain_invalid());
    let render_passes_before = ctx
        .device
        .count_calls(|c| matches!(c, DeviceCall::CreateRenderPass(_)));

    frame_loop.render_frame().unwrap();

    assert_eq!(swapchain_creations(&ctx).len(), 2);
    let executor = frame_loop.executor().unwrap();
    assert!(Arc::ptr_eq(executor.graph(), &graph));
    assert_eq!(
        ctx.device.count_calls(|c| matches!(c, DeviceCall::CreateRenderPass(_))),
        render_passes_before
    );
    assert_eq!(ctx.device.live_framebuffers(), 3);
}

#[test]
fn test_out_of_date_present_invalidates() {
    let ctx = TestContext::new();
    let control = control_with(Some(clear_swapchain()));
    let mut frame_loop = ctx.frame_loop(&control);

    ctx.device.script_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
    assert!(matches!(
        frame_loop.render_frame().unwrap(),
        FrameOutcome::Presented { .. }
    ));
    assert!(control.is_swapchain_invalid());
}

#[test]
fn test_failed_recording_keeps_fence_signaled() {
    let ctx = TestContext::new();
    let control = control_with(Some(clear_swapchain()));
    let mut frame_loop = ctx.frame_loop(&control);
    let fence = frame_loop.frame_sync(0).unwrap().in_flight;

    ctx.device
        .fail_next("end_command_buffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
    let err = frame_loop.render_frame().unwrap_err();
    assert!(matches!(
        err,
        RenderError::NativeApi {
            result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ..
        }
    ));
    assert!(ctx.device.is_fence_signaled(fence));
    assert_eq!(ctx.device.count_calls(|c| *c == DeviceCall::ResetFence(fence)), 0);
    assert_eq!(frame_loop.current_frame(), 0);

    // The same slot renders on the next attempt.
    let outcome = frame_loop.render_frame().unwrap();
    assert!(matches!(outcome, FrameOutcome::Presented { .. }));
    assert_eq!(frame_loop.current_frame(), 1);
}

#[test]
fn test_fence_timeout_is_fatal() {
    let ctx = TestContext::new();
    let control = control_with(Some(clear_swapchain()));
    let mut frame_loop = ctx.frame_loop(&control);

    ctx.device.script_fence_timeouts(1);
    let err = frame_loop.render_frame().unwrap_err();
    assert!(matches!(err, RenderError::FenceTimeout { frame: 0 }));
    assert!(!err.is_recoverable());
}

#[test]
fn test_graph_swap_recompiles_once() {
    let ctx = TestContext::new();
    let first = clear_swapchain();
    let control = control_with(Some(first.clone()));
    let mut frame_loop = ctx.frame_loop(&control);

    frame_loop.render_frame().unwrap();
    frame_loop.render_frame().unwrap();
    assert_eq!(ctx.device.count_calls(|c| matches!(c, DeviceCall::CreateRenderPass(_))), 1);

    // Setting the same graph again is not a change.
    control.set_render_graph(first.clone());
    frame_loop.render_frame().unwrap();
    assert_eq!(ctx.device.count_calls(|c| matches!(c, DeviceCall::CreateRenderPass(_))), 1);

    let log = RecordLog::default();
    let (second, _, _) = offscreen_then_present(&log);
    control.set_render_graph(second.clone());
    frame_loop.render_frame().unwrap();

    assert!(Arc::ptr_eq(frame_loop.executor().unwrap().graph(), &second));
    assert_eq!(ctx.device.live_render_passes(), 2);
    assert_eq!(log.lock().len(), 2);

    let destroy = ctx
        .rposition(|c| matches!(c, DeviceCall::DestroyRenderPass(_)))
        .unwrap();
    let idle = ctx.rposition(|c| *c == DeviceCall::DeviceWaitIdle).unwrap();
    assert!(idle < destroy);
}

#[test]
fn test_no_graph_is_idle() {
    let ctx = TestContext::new();
    let control = control_with(None);
    let mut frame_loop = ctx.frame_loop(&control);

    assert_eq!(frame_loop.render_frame().unwrap(), FrameOutcome::Idle);
    assert_eq!(ctx.device.count_calls(|c| matches!(c, DeviceCall::AcquireNextImage { .. })), 0);

    control.set_render_graph(clear_swapchain());
    assert!(matches!(
        frame_loop.render_frame().unwrap(),
        FrameOutcome::Presented { .. }
    ));

    control.clear_render_graph();
    assert_eq!(frame_loop.render_frame().unwrap(), FrameOutcome::Idle);
    assert!(frame_loop.executor().is_none());
    assert_eq!(ctx.device.live_render_passes(), 0);
}

#[test]
fn test_zero_sized_surface_waits() {
    let ctx = TestContext::new();
    let control = control_with(Some(clear_swapchain()));
    let mut frame_loop = ctx.frame_loop(&control);
    frame_loop.render_frame().unwrap();

    ctx.resize(0, 0);
    control.invalidate_swapchain();
    assert_eq!(frame_loop.render_frame().unwrap(), FrameOutcome::Skipped);
    assert_eq!(frame_loop.render_frame().unwrap(), FrameOutcome::Skipped);
    assert_eq!(swapchain_creations(&ctx).len(), 1);
    assert!(control.is_swapchain_invalid());

    ctx.resize(1280, 720);
    assert!(matches!(
        frame_loop.render_frame().unwrap(),
        FrameOutcome::Presented { .. }
    ));
    assert_eq!(
        frame_loop.swapchain().extent(),
        vk::Extent2D {
            width: 1280,
            height: 720
        }
    );
}

#[test]
fn test_resize_event_for_own_window_recreates() {
    let ctx = TestContext::new();
    let events = EventQueue::new();
    let control = control_with(Some(clear_swapchain()));
    let mut frame_loop = ctx.frame_loop(&control).with_events(events.subscribe());
    frame_loop.render_frame().unwrap();

    events.publish(WindowEvent::Resized {
        window: WINDOW + 1,
        width: 300,
        height: 200,
    });
    frame_loop.render_frame().unwrap();
    assert!(!control.is_swapchain_invalid());

    ctx.resize(1024, 768);
    events.publish(WindowEvent::Resized {
        window: WINDOW,
        width: 1024,
        height: 768,
    });
    // The resize is honored after this frame's present.
    frame_loop.render_frame().unwrap();
    assert!(control.is_swapchain_invalid());

    frame_loop.render_frame().unwrap();
    assert_eq!(swapchain_creations(&ctx).len(), 2);
    assert_eq!(frame_loop.swapchain().extent().width, 1024);
}

#[test]
fn test_pending_resource_frees_applied_between_frames() {
    let ctx = TestContext::new();
    let events = EventQueue::new();
    let resources = ResourceManager::new(ctx.gpu(), ctx.allocator.clone())
        .unwrap()
        .with_events(events.subscribe());
    let resources = Arc::new(Mutex::new(resources));
    resources.lock().load_mesh(7, &Mesh::quad()).unwrap();
    assert_eq!(ctx.device.live_buffers(), 2);

    let control = control_with(Some(clear_swapchain()));
    let mut frame_loop = ctx.frame_loop(&control).with_resources(resources.clone());
    frame_loop.render_frame().unwrap();
    assert_eq!(ctx.device.live_buffers(), 2);

    events.publish(ResourceEvent::Unloaded(7));
    frame_loop.render_frame().unwrap();

    assert_eq!(ctx.device.live_buffers(), 0);
    assert_eq!(resources.lock().cached_count(), 0);
    assert_eq!(resources.lock().pending_free_count(), 0);
}

#[test]
fn test_shutdown_releases_everything() {
    let ctx = TestContext::new();
    let log = RecordLog::default();
    let (graph, _, _) = offscreen_then_present(&log);
    let control = control_with(Some(graph));
    {
        let mut frame_loop = ctx.frame_loop(&control);
        frame_loop.render_frame().unwrap();
        frame_loop.render_frame().unwrap();
        frame_loop.shutdown().unwrap();
        // Dropping after an explicit shutdown is harmless.
    }
    assert_eq!(ctx.device.live_swapchains(), 0);
    assert_eq!(ctx.device.live_framebuffers(), 0);
    assert_eq!(ctx.device.live_render_passes(), 0);
    assert_eq!(ctx.device.live_fences(), 0);
    assert_eq!(ctx.device.live_semaphores(), 0);
    assert_eq!(ctx.device.live_command_buffers(), 0);
    assert_eq!(ctx.device.live_images(), 0);
    assert_eq!(ctx.device.live_image_views(), 0);
}
