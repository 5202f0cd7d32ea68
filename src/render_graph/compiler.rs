//! Translation of render graph data into renderpass layouts
//!
//! Everything here is pure: it reads the graph and produces descriptors or
//! orderings without touching the device.

use std::collections::{BTreeMap, VecDeque};

use ash::vk;

use crate::backend::{RenderPassLayout, SubpassLayout};
use crate::error::{RenderError, RenderResult};
use crate::render_graph::graph::{RenderGraph, RenderSubgraph, RenderSubgraphRef};
use crate::render_graph::pass::RenderPassRef;
use crate::render_graph::resource::{AttachmentRef, FormatTable};

/// Pass refs of a subgraph sorted by `idx`; the position is the subpass index.
pub fn pass_order(subgraph: &RenderSubgraph) -> Vec<RenderPassRef> {
    let mut order: Vec<RenderPassRef> = subgraph.passes.keys().copied().collect();
    order.sort_by_key(|r| subgraph.passes[r].idx);
    order
}

fn color_dependency(src_subpass: u32, dst_subpass: u32) -> vk::SubpassDependency {
    let stage = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    let access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::COLOR_ATTACHMENT_READ;
    vk::SubpassDependency {
        src_subpass,
        dst_subpass,
        src_stage_mask: stage,
        dst_stage_mask: stage,
        src_access_mask: access,
        dst_access_mask: access,
        dependency_flags: vk::DependencyFlags::empty(),
    }
}

/// Subpass dependencies for a subgraph.
///
/// A pass without declared dependencies gets a single dependency on
/// `VK_SUBPASS_EXTERNAL`. A pass with N declared dependencies gets N, each
/// sourced from the subpass index of the pass it depends on.
pub fn synthesize_dependencies(
    subgraph: &RenderSubgraph,
    order: &[RenderPassRef],
) -> RenderResult<Vec<vk::SubpassDependency>> {
    let index_of: BTreeMap<RenderPassRef, u32> = order
        .iter()
        .enumerate()
        .map(|(i, r)| (*r, i as u32))
        .collect();

    let mut dependencies = Vec::new();
    for (dst, pass_ref) in order.iter().enumerate() {
        let dst = dst as u32;
        let pass = &subgraph.passes[pass_ref];
        if pass.dependencies.is_empty() {
            dependencies.push(color_dependency(vk::SUBPASS_EXTERNAL, dst));
            continue;
        }
        for dependency in &pass.dependencies {
            let src = *index_of.get(dependency).ok_or_else(|| {
                RenderError::Configuration(format!(
                    "pass '{}' in subgraph '{}' depends on unknown pass {dependency:?}",
                    pass.name, subgraph.name
                ))
            })?;
            if src > dst {
                return Err(RenderError::Configuration(format!(
                    "pass '{}' in subgraph '{}' depends on a pass ordered after it",
                    pass.name, subgraph.name
                )));
            }
            dependencies.push(color_dependency(src, dst));
        }
    }
    Ok(dependencies)
}

/// Build the renderpass layout of a subgraph: one attachment description per
/// slot, one subpass per pass in `idx` order, and synthesized dependencies.
pub fn build_render_pass_layout(
    graph: &RenderGraph,
    subgraph: &RenderSubgraph,
    formats: &FormatTable,
) -> RenderResult<RenderPassLayout> {
    let mut attachments = Vec::with_capacity(subgraph.attachments.len());
    for (_, attachment) in subgraph.attachments_by_slot() {
        let target = graph.target(attachment.target).ok_or_else(|| {
            RenderError::Configuration(format!(
                "subgraph '{}' slot {} references unknown target {:?}",
                subgraph.name, attachment.slot, attachment.target
            ))
        })?;
        attachments.push(vk::AttachmentDescription {
            flags: vk::AttachmentDescriptionFlags::empty(),
            format: formats.resolve(target.format),
            samples: target.samples,
            load_op: attachment.load_op,
            store_op: attachment.store_op,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: attachment.initial_layout,
            final_layout: attachment.final_layout,
        });
    }

    let order = pass_order(subgraph);
    let mut subpasses = Vec::with_capacity(order.len());
    for pass_ref in &order {
        let pass = &subgraph.passes[pass_ref];
        let resolve = |r: &AttachmentRef| -> RenderResult<vk::AttachmentReference> {
            let attachment = subgraph.attachments.get(&r.attachment).ok_or_else(|| {
                RenderError::Configuration(format!(
                    "pass '{}' in subgraph '{}' references unknown attachment {:?}",
                    pass.name, subgraph.name, r.attachment
                ))
            })?;
            Ok(vk::AttachmentReference {
                attachment: attachment.slot,
                layout: r.layout,
            })
        };

        if !pass.resolve_refs.is_empty() && pass.resolve_refs.len() != pass.color_refs.len() {
            return Err(RenderError::Configuration(format!(
                "pass '{}' in subgraph '{}' has {} resolve refs for {} color refs",
                pass.name,
                subgraph.name,
                pass.resolve_refs.len(),
                pass.color_refs.len()
            )));
        }

        subpasses.push(SubpassLayout {
            input: pass.input_refs.iter().map(&resolve).collect::<RenderResult<_>>()?,
            color: pass.color_refs.iter().map(&resolve).collect::<RenderResult<_>>()?,
            resolve: pass.resolve_refs.iter().map(&resolve).collect::<RenderResult<_>>()?,
            depth: pass.depth_ref.as_ref().map(&resolve).transpose()?,
        });
    }

    Ok(RenderPassLayout {
        attachments,
        subpasses,
        dependencies: synthesize_dependencies(subgraph, &order)?,
    })
}

/// Breadth-first order in which subgraphs execute, starting at the first
/// subgraph. Successors are enqueued every time they are reached, so a
/// subgraph reachable along several paths appears once per path.
pub fn traversal_order(graph: &RenderGraph) -> Vec<RenderSubgraphRef> {
    let mut order = Vec::new();
    let mut queue = VecDeque::from([graph.first_subgraph]);
    while let Some(current) = queue.pop_front() {
        let Some(subgraph) = graph.subgraph(current) else {
            continue;
        };
        order.push(current);
        queue.extend(subgraph.next.iter().copied());
    }
    order
}

/// Subgraphs that [`traversal_order`] visits more than once.
pub fn repeated_subgraphs(order: &[RenderSubgraphRef]) -> Vec<RenderSubgraphRef> {
    let mut counts: BTreeMap<RenderSubgraphRef, usize> = BTreeMap::new();
    for r in order {
        *counts.entry(*r).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(r, _)| r)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendererConfig;
    use crate::render_graph::{RenderAttachment, RenderGraphBuilder, RenderPass, RenderTarget};
    use rstest::rstest;

    const COLOR: vk::ImageLayout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;

    /// Subgraph with `deps.len()` passes; pass `i` depends on the passes listed in `deps[i]`.
    fn chain(deps: &[Vec<usize>]) -> (std::sync::Arc<RenderGraph>, RenderSubgraphRef) {
        let mut builder = RenderGraphBuilder::new();
        let target = builder.add_target(RenderTarget::color("color"));
        let main = builder.add_subgraph("main", |sg| {
            let color = sg.add_attachment(RenderAttachment::new(target, 0, COLOR));
            let mut refs = Vec::new();
            for (i, pass_deps) in deps.iter().enumerate() {
                let mut pass =
                    RenderPass::new(format!("pass{i}"), i as u32).with_color(color, COLOR);
                for d in pass_deps.iter() {
                    pass = pass.depends_on(refs[*d]);
                }
                refs.push(sg.add_pass(pass));
            }
        });
        (builder.build(main).unwrap(), main)
    }

    #[rstest]
    #[case::single(vec![vec![]], 1)]
    #[case::two_independent(vec![vec![], vec![]], 2)]
    #[case::linear(vec![vec![], vec![0], vec![1]], 3)]
    #[case::fan_in(vec![vec![], vec![], vec![0, 1]], 4)]
    fn test_dependency_count(#[case] deps: Vec<Vec<usize>>, #[case] expected: usize) {
        let (graph, main) = chain(&deps);
        let subgraph = &graph.subgraphs[&main];
        let dependencies = synthesize_dependencies(subgraph, &pass_order(subgraph)).unwrap();
        assert_eq!(dependencies.len(), expected);
    }

    #[test]
    fn test_dependency_sources() {
        let (graph, main) = chain(&[vec![], vec![0]]);
        let subgraph = &graph.subgraphs[&main];
        let dependencies = synthesize_dependencies(subgraph, &pass_order(subgraph)).unwrap();

        assert_eq!(dependencies[0].src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependencies[0].dst_subpass, 0);
        assert_eq!(dependencies[1].src_subpass, 0);
        assert_eq!(dependencies[1].dst_subpass, 1);
        for dependency in &dependencies {
            assert_eq!(dependency.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
            assert!(dependency.dst_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
            assert!(dependency.dst_access_mask.contains(vk::AccessFlags::COLOR_ATTACHMENT_READ));
        }
    }

    #[test]
    fn test_pass_order_follows_idx() {
        let mut builder = RenderGraphBuilder::new();
        let target = builder.add_target(RenderTarget::color("color"));
        let main = builder.add_subgraph("main", |sg| {
            let color = sg.add_attachment(RenderAttachment::new(target, 0, COLOR));
            sg.add_pass(RenderPass::new("late", 5).with_color(color, COLOR));
            sg.add_pass(RenderPass::new("early", 1).with_color(color, COLOR));
        });
        let graph = builder.build(main).unwrap();
        let subgraph = &graph.subgraphs[&main];
        let names: Vec<&str> = pass_order(subgraph)
            .iter()
            .map(|r| subgraph.passes[r].name.as_str())
            .collect();
        assert_eq!(names, ["early", "late"]);
    }

    #[test]
    fn test_layout_maps_slots_and_formats() {
        let mut builder = RenderGraphBuilder::new();
        let color = builder.add_target(RenderTarget::swapchain("backbuffer"));
        let depth = builder.add_target(RenderTarget::depth("depth"));
        let main = builder.add_subgraph("main", |sg| {
            let d = sg.add_attachment(RenderAttachment::new(
                depth,
                1,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ));
            let c = sg.add_attachment(RenderAttachment::new(
                color,
                0,
                vk::ImageLayout::PRESENT_SRC_KHR,
            ));
            sg.add_pass(
                RenderPass::new("draw", 0)
                    .with_color(c, COLOR)
                    .with_depth(d, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
        });
        let graph = builder.build(main).unwrap();
        let formats =
            FormatTable::from_config(&RendererConfig::default(), vk::Format::B8G8R8A8_SRGB);
        let layout = build_render_pass_layout(&graph, &graph.subgraphs[&main], &formats).unwrap();

        assert_eq!(layout.attachments.len(), 2);
        assert_eq!(layout.attachments[0].format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(layout.attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(layout.attachments[1].format, vk::Format::D32_SFLOAT);
        assert_eq!(layout.subpasses.len(), 1);
        assert_eq!(layout.subpasses[0].color[0].attachment, 0);
        assert_eq!(layout.subpasses[0].depth.map(|d| d.attachment), Some(1));
    }

    fn leaf(
        builder: &mut RenderGraphBuilder,
        target: crate::render_graph::RenderTargetRef,
        name: &str,
    ) -> RenderSubgraphRef {
        builder.add_subgraph(name, |sg| {
            let c = sg.add_attachment(RenderAttachment::new(target, 0, COLOR));
            sg.add_pass(RenderPass::new(name, 0).with_color(c, COLOR));
        })
    }

    #[test]
    fn test_traversal_is_breadth_first() {
        let mut builder = RenderGraphBuilder::new();
        let target = builder.add_target(RenderTarget::color("color"));
        let a = leaf(&mut builder, target, "a");
        let b = leaf(&mut builder, target, "b");
        let c = leaf(&mut builder, target, "c");
        let d = leaf(&mut builder, target, "d");
        builder.link(a, b).link(a, c).link(b, d);
        let graph = builder.build(a).unwrap();
        assert_eq!(traversal_order(&graph), vec![a, b, c, d]);
    }

    #[test]
    fn test_diamond_visits_shared_successor_twice() {
        let mut builder = RenderGraphBuilder::new();
        let target = builder.add_target(RenderTarget::color("color"));
        let a = leaf(&mut builder, target, "a");
        let b = leaf(&mut builder, target, "b");
        let c = leaf(&mut builder, target, "c");
        let d = leaf(&mut builder, target, "d");
        builder.link(a, b).link(a, c).link(b, d).link(c, d);
        let graph = builder.build(a).unwrap();
        let order = traversal_order(&graph);
        assert_eq!(order, vec![a, b, c, d, d]);
        assert_eq!(repeated_subgraphs(&order), vec![d]);
    }
}
