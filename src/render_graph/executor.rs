//! Render graph executor
//!
//! Compiles a [`RenderGraph`] into native renderpasses and framebuffers and
//! records it into a command buffer every frame.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ash::vk;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::allocator::{GpuAllocator, ImageRequirements, ImageView};
use crate::backend::{ClearValue, FramebufferDesc, GpuDevice, RenderPassBegin};
use crate::config::RendererConfig;
use crate::error::{RenderError, RenderResult};
use crate::render_graph::compiler::{
    build_render_pass_layout, pass_order, repeated_subgraphs, traversal_order,
};
use crate::render_graph::graph::{RenderGraph, RenderSubgraphRef};
use crate::render_graph::pass::{PassContext, RenderPassRef};
use crate::render_graph::resource::*;
use crate::swapchain::Swapchain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutorState {
    Idle,
    Compiled,
    Failed,
}

/// Native objects built for one subgraph
struct CompiledSubgraph {
    name: String,
    render_pass: vk::RenderPass,
    pass_order: Vec<RenderPassRef>,
    /// Target bound at each attachment slot
    slot_targets: Vec<RenderTargetRef>,
    clear_values: Vec<ClearValue>,
    /// One per swapchain image
    framebuffers: Vec<vk::Framebuffer>,
    /// `on_destroy` only runs when `on_create` succeeded
    create_callback_ran: bool,
}

fn native_error(context: String, result: vk::Result) -> RenderError {
    error!(target: "executor", "{context} failed: {result}");
    RenderError::native(context, result)
}

fn same_extent(a: vk::Extent2D, b: vk::Extent2D) -> bool {
    a.width == b.width && a.height == b.height
}

/// Executor for running a compiled render graph
pub struct RenderGraphExecutor {
    device: Arc<dyn GpuDevice>,
    allocator: Arc<Mutex<GpuAllocator>>,
    graph: Arc<RenderGraph>,
    config: RendererConfig,
    formats: Option<FormatTable>,
    compiled: BTreeMap<RenderSubgraphRef, CompiledSubgraph>,
    /// Backing image per non-swapchain target, shared by every subgraph
    backing_images: HashMap<RenderTargetRef, ImageView>,
    traversal: Vec<RenderSubgraphRef>,
    extent: vk::Extent2D,
    state: ExecutorState,
}

impl RenderGraphExecutor {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        allocator: Arc<Mutex<GpuAllocator>>,
        graph: Arc<RenderGraph>,
        config: &RendererConfig,
    ) -> Self {
        Self {
            device,
            allocator,
            graph,
            config: config.clone(),
            formats: None,
            compiled: BTreeMap::new(),
            backing_images: HashMap::new(),
            traversal: Vec::new(),
            extent: vk::Extent2D::default(),
            state: ExecutorState::Idle,
        }
    }

    pub fn graph(&self) -> &Arc<RenderGraph> {
        &self.graph
    }

    pub fn is_compiled(&self) -> bool {
        self.state == ExecutorState::Compiled
    }

    pub fn render_pass(&self, subgraph: RenderSubgraphRef) -> Option<vk::RenderPass> {
        self.compiled.get(&subgraph).map(|c| c.render_pass)
    }

    pub fn framebuffers(&self, subgraph: RenderSubgraphRef) -> &[vk::Framebuffer] {
        self.compiled
            .get(&subgraph)
            .map_or(&[], |c| c.framebuffers.as_slice())
    }

    pub fn backing_image(&self, target: RenderTargetRef) -> Option<&ImageView> {
        self.backing_images.get(&target)
    }

    pub fn backing_image_count(&self) -> usize {
        self.backing_images.len()
    }

    /// Subgraphs in the order `execute` records them.
    pub fn execution_order(&self) -> &[RenderSubgraphRef] {
        &self.traversal
    }

    /// Build a renderpass per subgraph, run the creation callbacks, then
    /// build framebuffers for every swapchain image.
    ///
    /// On failure everything built so far is released and the executor stays
    /// unusable until the next successful `create`.
    pub fn create(&mut self, swapchain: &Swapchain) -> RenderResult<()> {
        if self.state != ExecutorState::Idle {
            self.destroy();
        }
        match self.compile(swapchain) {
            Ok(()) => {
                self.state = ExecutorState::Compiled;
                info!(
                    target: "executor",
                    "Compiled render graph: {} subgraphs, {} framebuffers each",
                    self.compiled.len(),
                    swapchain.image_count()
                );
                Ok(())
            }
            Err(err) => {
                error!(target: "executor", "Render graph compilation failed: {err}");
                self.destroy();
                self.state = ExecutorState::Failed;
                Err(err)
            }
        }
    }

    fn compile(&mut self, swapchain: &Swapchain) -> RenderResult<()> {
        let graph = self.graph.clone();
        graph.validate()?;
        let formats = FormatTable::from_config(&self.config, swapchain.format().format);
        self.formats = Some(formats);

        for (&subgraph_ref, subgraph) in &graph.subgraphs {
            let layout = build_render_pass_layout(&graph, subgraph, &formats)?;
            let render_pass = self.device.create_render_pass(&layout).map_err(|r| {
                native_error(format!("create renderpass for subgraph '{}'", subgraph.name), r)
            })?;

            let mut slot_targets = Vec::with_capacity(subgraph.attachments.len());
            let mut clear_values = Vec::with_capacity(subgraph.attachments.len());
            for (_, attachment) in subgraph.attachments_by_slot() {
                slot_targets.push(attachment.target);
                clear_values.push(
                    graph
                        .target(attachment.target)
                        .map_or(ClearValue::default(), |t| t.clear_value),
                );
            }

            self.compiled.insert(
                subgraph_ref,
                CompiledSubgraph {
                    name: subgraph.name.clone(),
                    render_pass,
                    pass_order: pass_order(subgraph),
                    slot_targets,
                    clear_values,
                    framebuffers: Vec::new(),
                    create_callback_ran: false,
                },
            );

            if let Some(on_create) = &subgraph.on_create {
                on_create(&*self.device, render_pass).inspect_err(|err| {
                    error!(
                        target: "executor",
                        "Creation callback of subgraph '{}' failed: {err}",
                        subgraph.name
                    )
                })?;
            }
            if let Some(compiled) = self.compiled.get_mut(&subgraph_ref) {
                compiled.create_callback_ran = true;
            }
            debug!(
                target: "executor",
                "Created renderpass {:?} for subgraph '{}' ({} subpasses, {} dependencies)",
                render_pass,
                subgraph.name,
                layout.subpasses.len(),
                layout.dependencies.len()
            );
        }

        self.traversal = traversal_order(&graph);
        for repeated in repeated_subgraphs(&self.traversal) {
            if let Some(subgraph) = graph.subgraph(repeated) {
                warn!(
                    target: "executor",
                    "Subgraph '{}' runs {} times per frame (reachable along several paths)",
                    subgraph.name,
                    self.traversal.iter().filter(|s| **s == repeated).count()
                );
            }
        }

        self.create_framebuffers(swapchain)
    }

    /// Build one framebuffer per (subgraph, swapchain image), allocating
    /// backing images for non-swapchain targets on first use.
    pub fn create_framebuffers(&mut self, swapchain: &Swapchain) -> RenderResult<()> {
        let image_count = swapchain.image_count();
        if image_count == 0 {
            return Err(RenderError::Configuration(
                "swapchain has no images to build framebuffers for".into(),
            ));
        }
        let formats = self.formats.ok_or(RenderError::NotCompiled)?;
        let extent = swapchain.extent();
        self.extent = extent;

        let Self {
            device,
            allocator,
            graph,
            compiled,
            backing_images,
            ..
        } = self;

        for compiled in compiled.values_mut() {
            for image_index in 0..image_count {
                let mut attachments = Vec::with_capacity(compiled.slot_targets.len());
                for target_ref in &compiled.slot_targets {
                    let target = graph.target(*target_ref).ok_or_else(|| {
                        RenderError::Configuration(format!(
                            "subgraph '{}' references unknown target {target_ref:?}",
                            compiled.name
                        ))
                    })?;
                    let view = match target.source {
                        TargetSource::Swapchain => swapchain.image_views()[image_index],
                        TargetSource::Image => {
                            if !backing_images.contains_key(target_ref) {
                                let image =
                                    allocate_backing_image(&**allocator, target, &formats, extent)?;
                                backing_images.insert(*target_ref, image);
                            }
                            backing_images[target_ref].view()?
                        }
                    };
                    attachments.push(view);
                }

                let framebuffer = device
                    .create_framebuffer(&FramebufferDesc {
                        render_pass: compiled.render_pass,
                        attachments,
                        extent,
                    })
                    .map_err(|r| {
                        native_error(
                            format!(
                                "create framebuffer {image_index} for subgraph '{}'",
                                compiled.name
                            ),
                            r,
                        )
                    })?;
                compiled.framebuffers.push(framebuffer);
            }
        }
        Ok(())
    }

    /// Rebuild framebuffers after a swapchain recreation. Backing images are
    /// reallocated when the extent changed; renderpasses (and any pipelines
    /// built against them) are untouched.
    pub fn recreate_framebuffers(&mut self, swapchain: &Swapchain) -> RenderResult<()> {
        if self.state != ExecutorState::Compiled {
            return Err(RenderError::NotCompiled);
        }
        self.destroy_framebuffers();
        if !same_extent(self.extent, swapchain.extent()) {
            self.free_backing_images();
        }
        self.create_framebuffers(swapchain).inspect_err(|_| {
            self.state = ExecutorState::Failed;
        })?;
        debug!(
            target: "executor",
            "Recreated framebuffers at {}x{}",
            self.extent.width,
            self.extent.height
        );
        Ok(())
    }

    /// Record every subgraph into `cmd`, breadth-first from the first
    /// subgraph, one renderpass instance per subgraph.
    pub fn execute(&self, image_index: u32, cmd: vk::CommandBuffer) -> RenderResult<()> {
        if self.state != ExecutorState::Compiled {
            return Err(RenderError::NotCompiled);
        }
        for subgraph_ref in &self.traversal {
            let (Some(compiled), Some(subgraph)) = (
                self.compiled.get(subgraph_ref),
                self.graph.subgraph(*subgraph_ref),
            ) else {
                continue;
            };
            let framebuffer = *compiled
                .framebuffers
                .get(image_index as usize)
                .ok_or_else(|| {
                    RenderError::InvalidArgument(format!(
                        "image index {image_index} out of range for subgraph '{}'",
                        compiled.name
                    ))
                })?;

            self.device.cmd_begin_render_pass(
                cmd,
                &RenderPassBegin {
                    render_pass: compiled.render_pass,
                    framebuffer,
                    extent: self.extent,
                    clear_values: compiled.clear_values.clone(),
                },
            );
            for (subpass, pass_ref) in compiled.pass_order.iter().enumerate() {
                if subpass > 0 {
                    self.device.cmd_next_subpass(cmd);
                }
                if let Some(pass) = subgraph.passes.get(pass_ref) {
                    pass.record(&PassContext {
                        device: &*self.device,
                        command_buffer: cmd,
                        image_index,
                        extent: self.extent,
                        subpass: subpass as u32,
                    });
                }
            }
            self.device.cmd_end_render_pass(cmd);
        }
        Ok(())
    }

    /// Destroy framebuffers, then renderpasses (after their destroy
    /// callbacks), then free the backing images.
    pub fn destroy(&mut self) {
        self.destroy_framebuffers();
        let graph = self.graph.clone();
        for (subgraph_ref, compiled) in std::mem::take(&mut self.compiled) {
            if compiled.create_callback_ran {
                let on_destroy = graph
                    .subgraph(subgraph_ref)
                    .and_then(|s| s.on_destroy.as_ref());
                if let Some(on_destroy) = on_destroy {
                    on_destroy(&*self.device, compiled.render_pass);
                }
            }
            self.device.destroy_render_pass(compiled.render_pass);
        }
        self.free_backing_images();
        self.traversal.clear();
        if self.state == ExecutorState::Compiled {
            debug!(target: "executor", "Render graph executor destroyed");
        }
        self.state = ExecutorState::Idle;
    }

    fn destroy_framebuffers(&mut self) {
        for compiled in self.compiled.values_mut() {
            for framebuffer in compiled.framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer);
            }
        }
    }

    fn free_backing_images(&mut self) {
        if self.backing_images.is_empty() {
            return;
        }
        let mut allocator = self.allocator.lock();
        for (_, image) in self.backing_images.drain() {
            allocator.free_image(&image);
        }
    }
}

impl Drop for RenderGraphExecutor {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn allocate_backing_image(
    allocator: &Mutex<GpuAllocator>,
    target: &RenderTarget,
    formats: &FormatTable,
    extent: vk::Extent2D,
) -> RenderResult<ImageView> {
    let usage = if target.is_depth() {
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            | vk::ImageUsageFlags::INPUT_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
    } else {
        vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::INPUT_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
    };
    let requirements = ImageRequirements::new_2d(
        extent.width,
        extent.height,
        formats.resolve(target.format),
        usage,
    )
    .with_samples(target.samples);
    let image = allocator.lock().allocate_image(requirements)?;
    debug!(
        target: "executor",
        "Allocated backing image for target '{}' ({}x{})",
        target.name,
        extent.width,
        extent.height
    );
    Ok(image)
}
