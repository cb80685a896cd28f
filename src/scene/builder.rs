//! Paint-ordered materialization of nodes into host primitives

use std::collections::{HashMap, HashSet};

use log::{debug, error, warn};
use serde::Serialize;

use crate::ir::{IrNode, NodeKind};
use crate::scene::{HostHandle, SceneHost};
use crate::stacking::PaintOrder;
use crate::Error;

/// Running counters for one session's scene graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub nodes_created: u64,
    pub max_depth: u32,
    pub frames: u64,
    pub texts: u64,
    pub images: u64,
    pub vectors: u64,
    pub rectangles: u64,
    pub placeholders: u64,
    /// Nodes attached to the root because their declared parent was missing
    pub orphans: u64,
    /// Nodes the host refused to create
    pub failures: u64,
}

impl BuildStats {
    fn count_kind(&mut self, kind: NodeKind) {
        match kind {
            NodeKind::Frame => self.frames += 1,
            NodeKind::Text => self.texts += 1,
            NodeKind::Image => self.images += 1,
            NodeKind::Vector => self.vectors += 1,
            NodeKind::Rectangle => self.rectangles += 1,
            NodeKind::Placeholder => self.placeholders += 1,
        }
    }
}

/// What one `materialize` call did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    pub created: usize,
    pub skipped: usize,
    pub orphans: usize,
    pub failed: usize,
}

/// Tracks which nodes already exist in the host and under which handle
#[derive(Debug, Default)]
pub struct SceneGraphBuilder {
    handles: HashMap<String, HostHandle>,
    depths: HashMap<String, u32>,
    /// Session-wide paint order, assigned per resolved batch
    paint_orders: HashMap<String, u64>,
    next_paint_order: u64,
    stats: BuildStats,
}

impl SceneGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    pub fn handle(&self, id: &str) -> Option<HostHandle> {
        self.handles.get(id).copied()
    }

    pub fn paint_order(&self, id: &str) -> Option<u64> {
        self.paint_orders.get(id).copied()
    }

    /// Record the orders of one resolved batch after every earlier batch.
    /// Ids that already have an order keep it.
    pub fn assign_paint_order(&mut self, order: &PaintOrder) {
        let offset = self.next_paint_order;
        for (index, id) in order.ids().iter().enumerate() {
            self.paint_orders
                .entry(id.clone())
                .or_insert(offset + index as u64);
        }
        self.next_paint_order += order.len() as u64;
    }

    pub fn is_materialized(&self, id: &str) -> bool {
        self.handles.contains_key(id)
    }

    /// Number of nodes created so far
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Create `nodes` in the host, back to front by their recorded paint
    /// order. Nodes without one keep their relative order and go last.
    ///
    /// Nodes that already exist are skipped, so a batch can be replayed after
    /// a deferred image resolves. A parent from the same call is created
    /// before its children even when it paints later. A parent that is
    /// unknown or not yet created is replaced by `root`. Such a node is an
    /// orphan: it stays under `root` and is never moved later. A host failure
    /// affects only its own node.
    pub fn materialize(
        &mut self,
        nodes: &[IrNode],
        root: HostHandle,
        host: &mut dyn SceneHost,
    ) -> MaterializeReport {
        let mut report = MaterializeReport::default();

        let mut ordered: Vec<&IrNode> = nodes.iter().collect();
        ordered.sort_by_key(|n| self.paint_order(&n.id).unwrap_or(u64::MAX));

        let mut waiting: HashMap<&str, &IrNode> = HashMap::new();
        for &node in &ordered {
            if !self.handles.contains_key(&node.id) {
                waiting.entry(node.id.as_str()).or_insert(node);
            }
        }
        let mut attempted: HashSet<&str> = HashSet::new();

        for node in ordered {
            if attempted.contains(node.id.as_str()) {
                continue;
            }
            if self.handles.contains_key(&node.id) {
                report.skipped += 1;
                continue;
            }

            // ancestors from this call that are still missing, nearest first
            let mut chain = vec![node];
            let mut cur = node.parent_id.as_deref();
            while let Some(pid) = cur {
                if self.handles.contains_key(pid) || attempted.contains(pid) {
                    break;
                }
                let Some(&parent) = waiting.get(pid) else { break };
                if chain.iter().any(|n| n.id == pid) {
                    break;
                }
                chain.push(parent);
                cur = parent.parent_id.as_deref();
            }

            for n in chain.into_iter().rev() {
                attempted.insert(n.id.as_str());
                self.create_one(n, root, host, &mut report);
            }
        }

        report
    }

    fn create_one(
        &mut self,
        node: &IrNode,
        root: HostHandle,
        host: &mut dyn SceneHost,
        report: &mut MaterializeReport,
    ) {
        let (parent, parent_depth, orphan) = match node.parent_id.as_deref() {
            None => (root, 0, false),
            Some(pid) => match self.handles.get(pid) {
                Some(&h) => (h, self.depths.get(pid).copied().unwrap_or(0), false),
                None => {
                    warn!("node {} has unresolved parent {pid}; attaching to root", node.id);
                    (root, 0, true)
                }
            },
        };

        let paint_order = self.paint_order(&node.id).unwrap_or(u64::MAX);
        match host.create_ordered(node, parent, paint_order) {
            Ok(handle) => {
                let depth = parent_depth + 1;
                debug!("created {} {} as {:?} at depth {depth}", node.kind, node.id, handle);
                self.handles.insert(node.id.clone(), handle);
                self.depths.insert(node.id.clone(), depth);
                self.stats.nodes_created += 1;
                self.stats.max_depth = self.stats.max_depth.max(depth);
                self.stats.count_kind(node.kind);
                report.created += 1;
                if orphan {
                    self.stats.orphans += 1;
                    report.orphans += 1;
                }
            }
            Err(reason) => {
                let err = Error::NodeCreation {
                    node_id: node.id.clone(),
                    reason,
                };
                error!("{err}");
                self.stats.failures += 1;
                report.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Position, ZIndex};
    use crate::scene::{FnHost, InMemoryScene};
    use crate::stacking::StackingOrderResolver;

    fn node(id: &str, parent: Option<&str>) -> IrNode {
        IrNode::new(id, parent)
    }

    #[test]
    fn builds_tree_in_paint_order() {
        let mut scene = InMemoryScene::new();
        let mut builder = SceneGraphBuilder::new();
        let nodes = vec![node("page", None), node("body", Some("page")), node("p", Some("body"))];
        let root = scene.root_handle();
        let report = builder.materialize(&nodes, root, &mut scene);

        assert_eq!(report.created, 3);
        assert_eq!(builder.stats().max_depth, 3);
        assert_eq!(builder.stats().frames, 3);
        let p = scene.find("p").unwrap();
        assert_eq!(p.parent, builder.handle("body"));
    }

    #[test]
    fn unresolved_parent_goes_to_root_and_counts_orphan() {
        let mut scene = InMemoryScene::new();
        let mut builder = SceneGraphBuilder::new();
        let root = scene.root_handle();
        let report = builder.materialize(&[node("stray", Some("ghost"))], root, &mut scene);

        assert_eq!(report.orphans, 1);
        assert_eq!(builder.stats().orphans, 1);
        assert_eq!(scene.find("stray").unwrap().parent, Some(root));
    }

    #[test]
    fn numbered_ids_keep_their_parents() {
        let mut scene = InMemoryScene::new();
        let mut builder = SceneGraphBuilder::new();
        let nodes = vec![
            node("node-1", None),
            node("node-9", Some("node-1")),
            node("node-10", Some("node-9")),
        ];
        builder.assign_paint_order(&StackingOrderResolver::new().resolve(&nodes));
        let report = builder.materialize(&nodes, scene.root_handle(), &mut scene);

        assert_eq!(report.orphans, 0);
        assert_eq!(builder.stats().max_depth, 3);
        assert_eq!(scene.find("node-10").unwrap().parent, builder.handle("node-9"));
    }

    #[test]
    fn parent_painting_above_child_is_created_first() {
        // the positioned child paints below its plain parent
        let mut below = node("below", Some("plain"));
        below.stacking.position = Position::Relative;
        below.stacking.z_index = ZIndex::Value(-1);
        let nodes = vec![node("page", None), node("plain", Some("page")), below];

        let mut scene = InMemoryScene::new();
        let mut builder = SceneGraphBuilder::new();
        builder.assign_paint_order(&StackingOrderResolver::new().resolve(&nodes));
        assert!(builder.paint_order("below") < builder.paint_order("plain"));

        let report = builder.materialize(&nodes, scene.root_handle(), &mut scene);
        assert_eq!(report.created, 3);
        assert_eq!(report.orphans, 0);
        assert_eq!(scene.find("below").unwrap().parent, builder.handle("plain"));
    }

    #[test]
    fn paint_orders_continue_across_batches() {
        let resolver = StackingOrderResolver::new();
        let mut builder = SceneGraphBuilder::new();
        let first = vec![node("a", None), node("b", Some("a"))];
        let second = vec![node("c", Some("a"))];
        builder.assign_paint_order(&resolver.resolve(&first));
        builder.assign_paint_order(&resolver.resolve(&second));
        assert_eq!(builder.paint_order("a"), Some(0));
        assert_eq!(builder.paint_order("b"), Some(1));
        assert_eq!(builder.paint_order("c"), Some(2));
    }

    #[test]
    fn rematerializing_is_a_no_op() {
        let mut scene = InMemoryScene::new();
        let mut builder = SceneGraphBuilder::new();
        let root = scene.root_handle();
        let nodes = vec![node("a", None)];
        builder.materialize(&nodes, root, &mut scene);
        let again = builder.materialize(&nodes, root, &mut scene);
        assert_eq!(again.skipped, 1);
        assert_eq!(again.created, 0);
        assert_eq!(scene.len(), 1);
    }

    #[test]
    fn host_failure_is_isolated() {
        let mut next = 0u64;
        let mut host = FnHost::new(HostHandle(0), move |n: &IrNode, _parent| {
            if n.id == "bad" {
                return Err("unsupported primitive".to_string());
            }
            next += 1;
            Ok(HostHandle(next))
        });
        let mut builder = SceneGraphBuilder::new();
        let nodes = vec![node("a", None), node("bad", Some("a")), node("c", Some("bad")), node("d", Some("a"))];
        let report = builder.materialize(&nodes, HostHandle(0), &mut host);

        assert_eq!(report.failed, 1);
        assert_eq!(report.created, 3);
        // "c" lost its parent to the failure and lands on the root
        assert_eq!(report.orphans, 1);
        assert!(builder.is_materialized("d"));
        assert!(!builder.is_materialized("bad"));
    }
}
