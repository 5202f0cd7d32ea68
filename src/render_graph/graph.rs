//! Render graph definition and construction
//!
//! A graph is plain data plus closures: targets shared by every subgraph,
//! and subgraphs (one renderpass each) linked by `next` edges. Once built it
//! is handed to the renderer as an `Arc<RenderGraph>` and never mutated; a
//! new `Arc` means a new graph.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use ash::vk;

use crate::backend::GpuDevice;
use crate::error::{RenderError, RenderResult};
use crate::render_graph::pass::{RenderPass, RenderPassRef};
use crate::render_graph::resource::*;

/// Reference to a [`RenderSubgraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderSubgraphRef(pub(crate) u32);

/// Called after a subgraph's renderpass is created, e.g. to build pipelines.
pub type SubgraphCreateFn =
    Arc<dyn Fn(&dyn GpuDevice, vk::RenderPass) -> RenderResult<()> + Send + Sync>;

/// Called before a subgraph's renderpass is destroyed.
pub type SubgraphDestroyFn = Arc<dyn Fn(&dyn GpuDevice, vk::RenderPass) + Send + Sync>;

/// A set of passes compiled into one renderpass
#[derive(Clone)]
pub struct RenderSubgraph {
    pub name: String,
    pub attachments: BTreeMap<RenderAttachmentRef, RenderAttachment>,
    pub passes: BTreeMap<RenderPassRef, RenderPass>,
    /// Subgraphs executed after this one
    pub next: Vec<RenderSubgraphRef>,
    pub(crate) on_create: Option<SubgraphCreateFn>,
    pub(crate) on_destroy: Option<SubgraphDestroyFn>,
}

impl RenderSubgraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attachments: BTreeMap::new(),
            passes: BTreeMap::new(),
            next: Vec::new(),
            on_create: None,
            on_destroy: None,
        }
    }

    /// Attachments ordered by slot.
    pub fn attachments_by_slot(&self) -> Vec<(RenderAttachmentRef, &RenderAttachment)> {
        let mut attachments: Vec<_> = self.attachments.iter().map(|(r, a)| (*r, a)).collect();
        attachments.sort_by_key(|(_, a)| a.slot);
        attachments
    }

    fn validate(&self, targets: &BTreeMap<RenderTargetRef, RenderTarget>) -> RenderResult<()> {
        let name = &self.name;
        if self.passes.is_empty() {
            return Err(RenderError::Configuration(format!(
                "subgraph '{name}' has no passes"
            )));
        }

        let mut slots: Vec<u32> = self.attachments.values().map(|a| a.slot).collect();
        slots.sort_unstable();
        if slots.iter().enumerate().any(|(i, slot)| *slot != i as u32) {
            return Err(RenderError::Configuration(format!(
                "subgraph '{name}' attachment slots must be contiguous from 0, got {slots:?}"
            )));
        }
        for attachment in self.attachments.values() {
            if !targets.contains_key(&attachment.target) {
                return Err(RenderError::Configuration(format!(
                    "subgraph '{name}' slot {} references unknown target {:?}",
                    attachment.slot, attachment.target
                )));
            }
        }

        let mut indices = HashSet::new();
        for (pass_ref, pass) in &self.passes {
            let pass_name = &pass.name;
            if !indices.insert(pass.idx) {
                return Err(RenderError::Configuration(format!(
                    "subgraph '{name}' has two passes with idx {}",
                    pass.idx
                )));
            }
            if let Some(unknown) = pass
                .attachment_refs()
                .find(|r| !self.attachments.contains_key(&r.attachment))
            {
                return Err(RenderError::Configuration(format!(
                    "pass '{pass_name}' in subgraph '{name}' references unknown attachment {:?}",
                    unknown.attachment
                )));
            }
            if !pass.resolve_refs.is_empty() && pass.resolve_refs.len() != pass.color_refs.len() {
                return Err(RenderError::Configuration(format!(
                    "pass '{pass_name}' in subgraph '{name}' has {} resolve refs for {} color refs",
                    pass.resolve_refs.len(),
                    pass.color_refs.len()
                )));
            }
            for dependency in &pass.dependencies {
                if dependency == pass_ref || !self.passes.contains_key(dependency) {
                    return Err(RenderError::Configuration(format!(
                        "pass '{pass_name}' in subgraph '{name}' depends on invalid pass {:?}",
                        dependency
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RenderSubgraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderSubgraph")
            .field("name", &self.name)
            .field("attachments", &self.attachments)
            .field("passes", &self.passes)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

/// The full frame description
#[derive(Debug, Clone)]
pub struct RenderGraph {
    pub targets: BTreeMap<RenderTargetRef, RenderTarget>,
    pub subgraphs: BTreeMap<RenderSubgraphRef, RenderSubgraph>,
    pub first_subgraph: RenderSubgraphRef,
}

impl RenderGraph {
    pub fn target(&self, target: RenderTargetRef) -> Option<&RenderTarget> {
        self.targets.get(&target)
    }

    pub fn subgraph(&self, subgraph: RenderSubgraphRef) -> Option<&RenderSubgraph> {
        self.subgraphs.get(&subgraph)
    }

    /// Check every reference in the graph. Unknown references, mismatched
    /// resolve counts and cycles are configuration errors.
    pub fn validate(&self) -> RenderResult<()> {
        if !self.subgraphs.contains_key(&self.first_subgraph) {
            return Err(RenderError::Configuration(format!(
                "first subgraph {:?} does not exist",
                self.first_subgraph
            )));
        }
        for subgraph in self.subgraphs.values() {
            for next in &subgraph.next {
                if !self.subgraphs.contains_key(next) {
                    return Err(RenderError::Configuration(format!(
                        "subgraph '{}' links to unknown subgraph {next:?}",
                        subgraph.name
                    )));
                }
            }
            subgraph.validate(&self.targets)?;
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> RenderResult<()> {
        fn visit(
            graph: &RenderGraph,
            node: RenderSubgraphRef,
            path: &mut BTreeSet<RenderSubgraphRef>,
            done: &mut BTreeSet<RenderSubgraphRef>,
        ) -> RenderResult<()> {
            if done.contains(&node) {
                return Ok(());
            }
            if !path.insert(node) {
                let name = graph.subgraphs.get(&node).map_or("?", |s| s.name.as_str());
                return Err(RenderError::Configuration(format!(
                    "subgraph '{name}' is part of a cycle"
                )));
            }
            if let Some(subgraph) = graph.subgraphs.get(&node) {
                for &next in &subgraph.next {
                    visit(graph, next, path, done)?;
                }
            }
            path.remove(&node);
            done.insert(node);
            Ok(())
        }

        let mut path = BTreeSet::new();
        let mut done = BTreeSet::new();
        visit(self, self.first_subgraph, &mut path, &mut done)
    }
}

/// Populates one subgraph inside [`RenderGraphBuilder::add_subgraph`]
pub struct SubgraphBuilder<'a> {
    subgraph: &'a mut RenderSubgraph,
    next_id: &'a mut u32,
}

impl SubgraphBuilder<'_> {
    fn mint(&mut self) -> u32 {
        let id = *self.next_id;
        *self.next_id += 1;
        id
    }

    pub fn add_attachment(&mut self, attachment: RenderAttachment) -> RenderAttachmentRef {
        let id = RenderAttachmentRef(self.mint());
        self.subgraph.attachments.insert(id, attachment);
        id
    }

    pub fn add_pass(&mut self, pass: RenderPass) -> RenderPassRef {
        let id = RenderPassRef(self.mint());
        self.subgraph.passes.insert(id, pass);
        id
    }

    /// Called with the renderpass after it is created.
    pub fn on_create<F>(&mut self, callback: F)
    where
        F: Fn(&dyn GpuDevice, vk::RenderPass) -> RenderResult<()> + Send + Sync + 'static,
    {
        self.subgraph.on_create = Some(Arc::new(callback));
    }

    /// Called with the renderpass right before it is destroyed.
    pub fn on_destroy<F>(&mut self, callback: F)
    where
        F: Fn(&dyn GpuDevice, vk::RenderPass) + Send + Sync + 'static,
    {
        self.subgraph.on_destroy = Some(Arc::new(callback));
    }
}

/// Builder for creating render graphs
///
/// ```ignore
/// let mut builder = RenderGraphBuilder::new();
/// let backbuffer = builder.add_target(RenderTarget::swapchain("backbuffer"));
/// let main = builder.add_subgraph("main", |sg| {
///     let present = vk::ImageLayout::PRESENT_SRC_KHR;
///     let color = sg.add_attachment(RenderAttachment::new(backbuffer, 0, present));
///     let layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
///     sg.add_pass(RenderPass::new("clear", 0).with_color(color, layout));
/// });
/// let graph = builder.build(main)?;
/// ```
#[derive(Default)]
pub struct RenderGraphBuilder {
    targets: BTreeMap<RenderTargetRef, RenderTarget>,
    subgraphs: BTreeMap<RenderSubgraphRef, RenderSubgraph>,
    links: Vec<(RenderSubgraphRef, RenderSubgraphRef)>,
    next_id: u32,
}

impl RenderGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn mint(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_target(&mut self, target: RenderTarget) -> RenderTargetRef {
        let id = RenderTargetRef(self.mint());
        self.targets.insert(id, target);
        id
    }

    pub fn add_subgraph<F>(&mut self, name: impl Into<String>, build: F) -> RenderSubgraphRef
    where
        F: FnOnce(&mut SubgraphBuilder<'_>),
    {
        let id = RenderSubgraphRef(self.mint());
        let mut subgraph = RenderSubgraph::new(name);
        build(&mut SubgraphBuilder {
            subgraph: &mut subgraph,
            next_id: &mut self.next_id,
        });
        self.subgraphs.insert(id, subgraph);
        id
    }

    /// Execute `to` after `from`.
    pub fn link(&mut self, from: RenderSubgraphRef, to: RenderSubgraphRef) -> &mut Self {
        self.links.push((from, to));
        self
    }

    /// Validate and freeze the graph.
    pub fn build(mut self, first: RenderSubgraphRef) -> RenderResult<Arc<RenderGraph>> {
        for (from, to) in std::mem::take(&mut self.links) {
            let subgraph = self.subgraphs.get_mut(&from).ok_or_else(|| {
                RenderError::Configuration(format!("link from unknown subgraph {from:?}"))
            })?;
            subgraph.next.push(to);
        }
        let graph = RenderGraph {
            targets: self.targets,
            subgraphs: self.subgraphs,
            first_subgraph: first,
        };
        graph.validate()?;
        Ok(Arc::new(graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLOR: vk::ImageLayout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;

    #[test]
    fn test_build_simple_graph() {
        let mut builder = RenderGraphBuilder::new();
        let target = builder.add_target(RenderTarget::swapchain("backbuffer"));
        let main = builder.add_subgraph("main", |sg| {
            let color = sg.add_attachment(RenderAttachment::new(
                target,
                0,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ));
            sg.add_pass(RenderPass::new("clear", 0).with_color(color, COLOR));
        });
        let graph = builder.build(main).unwrap();
        assert_eq!(graph.first_subgraph, main);
        assert_eq!(graph.subgraphs[&main].passes.len(), 1);
    }

    #[test]
    fn test_unknown_attachment_is_rejected() {
        let mut builder = RenderGraphBuilder::new();
        let target = builder.add_target(RenderTarget::color("color"));
        let foreign = RenderAttachmentRef(999);
        let main = builder.add_subgraph("main", |sg| {
            sg.add_attachment(RenderAttachment::new(target, 0, COLOR));
            sg.add_pass(RenderPass::new("draw", 0).with_color(foreign, COLOR));
        });
        let err = builder.build(main).unwrap_err().to_string();
        assert!(err.contains("pass 'draw'"), "{err}");
        assert!(err.contains("subgraph 'main'"), "{err}");
    }

    #[test]
    fn test_resolve_count_must_match() {
        let mut builder = RenderGraphBuilder::new();
        let msaa = builder
            .add_target(RenderTarget::color("msaa").with_samples(vk::SampleCountFlags::TYPE_4));
        let resolved = builder.add_target(RenderTarget::color("resolved"));
        let main = builder.add_subgraph("main", |sg| {
            let a = sg.add_attachment(RenderAttachment::new(msaa, 0, COLOR));
            let b = sg.add_attachment(RenderAttachment::new(msaa, 1, COLOR));
            let r = sg.add_attachment(RenderAttachment::new(resolved, 2, COLOR));
            sg.add_pass(
                RenderPass::new("draw", 0)
                    .with_color(a, COLOR)
                    .with_color(b, COLOR)
                    .with_resolve(r, COLOR),
            );
        });
        assert!(matches!(builder.build(main), Err(RenderError::Configuration(_))));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut builder = RenderGraphBuilder::new();
        let target = builder.add_target(RenderTarget::color("color"));
        let subgraph = |builder: &mut RenderGraphBuilder, name: &str| {
            builder.add_subgraph(name, |sg| {
                let a = sg.add_attachment(RenderAttachment::new(target, 0, COLOR));
                sg.add_pass(RenderPass::new("p", 0).with_color(a, COLOR));
            })
        };
        let a = subgraph(&mut builder, "a");
        let b = subgraph(&mut builder, "b");
        builder.link(a, b).link(b, a);
        let err = builder.build(a).unwrap_err().to_string();
        assert!(err.contains("cycle"), "{err}");
    }

    #[test]
    fn test_slots_must_be_contiguous() {
        let mut builder = RenderGraphBuilder::new();
        let target = builder.add_target(RenderTarget::color("color"));
        let main = builder.add_subgraph("main", |sg| {
            let a = sg.add_attachment(RenderAttachment::new(target, 1, COLOR));
            sg.add_pass(RenderPass::new("p", 0).with_color(a, COLOR));
        });
        assert!(matches!(builder.build(main), Err(RenderError::Configuration(_))));
    }
}
