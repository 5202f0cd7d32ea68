//! Render pass definitions for the render graph
//!
//! A pass becomes one subpass of its subgraph's renderpass. Passes carry
//! attachment references, dependencies on sibling passes, and a recording
//! action invoked every frame while the renderpass is active.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use ash::vk;

use crate::backend::GpuDevice;
use crate::render_graph::resource::{AttachmentRef, RenderAttachmentRef};

/// Reference to a [`RenderPass`] within one subgraph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderPassRef(pub(crate) u32);

/// State handed to a pass's recording action
pub struct PassContext<'a> {
    pub device: &'a dyn GpuDevice,
    pub command_buffer: vk::CommandBuffer,
    /// Swapchain image being rendered this frame
    pub image_index: u32,
    pub extent: vk::Extent2D,
    /// Subpass index of the pass inside its renderpass
    pub subpass: u32,
}

/// Records commands for a pass
pub type RecordFn = Arc<dyn Fn(&PassContext<'_>) + Send + Sync>;

/// One subpass of a subgraph
#[derive(Clone)]
pub struct RenderPass {
    pub name: String,
    /// Ordering key; passes are sorted by `idx` to form subpass indices
    pub idx: u32,
    pub input_refs: Vec<AttachmentRef>,
    pub color_refs: Vec<AttachmentRef>,
    /// Resolve targets; when present, one per color ref
    pub resolve_refs: Vec<AttachmentRef>,
    pub depth_ref: Option<AttachmentRef>,
    pub dependencies: BTreeSet<RenderPassRef>,
    record: Option<RecordFn>,
}

impl RenderPass {
    pub fn new(name: impl Into<String>, idx: u32) -> Self {
        Self {
            name: name.into(),
            idx,
            input_refs: Vec::new(),
            color_refs: Vec::new(),
            resolve_refs: Vec::new(),
            depth_ref: None,
            dependencies: BTreeSet::new(),
            record: None,
        }
    }

    pub fn with_input(mut self, attachment: RenderAttachmentRef, layout: vk::ImageLayout) -> Self {
        self.input_refs.push(AttachmentRef::new(attachment, layout));
        self
    }

    pub fn with_color(mut self, attachment: RenderAttachmentRef, layout: vk::ImageLayout) -> Self {
        self.color_refs.push(AttachmentRef::new(attachment, layout));
        self
    }

    pub fn with_resolve(
        mut self,
        attachment: RenderAttachmentRef,
        layout: vk::ImageLayout,
    ) -> Self {
        self.resolve_refs.push(AttachmentRef::new(attachment, layout));
        self
    }

    pub fn with_depth(mut self, attachment: RenderAttachmentRef, layout: vk::ImageLayout) -> Self {
        self.depth_ref = Some(AttachmentRef::new(attachment, layout));
        self
    }

    /// Declare that this pass consumes the output of `pass`.
    pub fn depends_on(mut self, pass: RenderPassRef) -> Self {
        self.dependencies.insert(pass);
        self
    }

    /// Set the recording action.
    pub fn on_record<F>(mut self, record: F) -> Self
    where
        F: Fn(&PassContext<'_>) + Send + Sync + 'static,
    {
        self.record = Some(Arc::new(record));
        self
    }

    /// Every attachment reference of the pass, in input/color/resolve/depth order.
    pub fn attachment_refs(&self) -> impl Iterator<Item = &AttachmentRef> {
        self.input_refs
            .iter()
            .chain(self.color_refs.iter())
            .chain(self.resolve_refs.iter())
            .chain(self.depth_ref.iter())
    }

    /// Invoke the recording action, if any.
    pub fn record(&self, ctx: &PassContext<'_>) {
        if let Some(record) = &self.record {
            record(ctx);
        }
    }
}

impl fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPass")
            .field("name", &self.name)
            .field("idx", &self.idx)
            .field("input_refs", &self.input_refs)
            .field("color_refs", &self.color_refs)
            .field("resolve_refs", &self.resolve_refs)
            .field("depth_ref", &self.depth_ref)
            .field("dependencies", &self.dependencies)
            .field("has_record", &self.record.is_some())
            .finish()
    }
}
