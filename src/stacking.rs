//! Stacking contexts and the global paint order.
//!
//! [CSS 2.1 Appendix E](https://www.w3.org/TR/CSS2/zindex.html): "Each box
//! belongs to one stacking context." A batch of nodes is grouped into a tree
//! of stacking contexts, coarser than the node tree. That tree is walked
//! depth-first to hand every node one integer paint order. Ordering inside a
//! context is (stack level, tree order). Tree order is a pre-order walk of the
//! batch with siblings sorted by (stack level, node id). It stands in for
//! document order, which the extractor does not provide, and keeps every
//! ancestor ahead of its descendants at equal levels.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};

use crate::ir::{IrNode, Isolation, Position, ZIndex};

/// Whether a node creates its own stacking context.
///
/// "Stacking contexts can be formed by several CSS properties:
/// - Root element of the document
/// - Positioned elements with z-index other than 'auto'
/// - Elements with opacity less than 1
/// - Elements with transform, filter, perspective, clip-path, ..."
pub fn establishes_context(node: &IrNode) -> bool {
    let s = &node.stacking;
    node.parent_id.is_none()
        || s.is_root
        || (s.position != Position::Static && s.z_index.is_numeric())
        || s.opacity < 1.0
        || s.has_transform
        || s.has_filter
        || s.has_clip_path
        || s.has_perspective
        || s.isolation == Isolation::Isolate
        || s.forces_layer
}

/// One stacking context, keyed by the node that owns it
#[derive(Debug, Clone, PartialEq)]
pub struct StackingContext {
    pub owner: String,
    pub z_index: ZIndex,
    /// Owner of the nearest enclosing context; `None` for a root context
    pub parent: Option<String>,
    /// Owners of nested contexts, in paint order
    pub children: Vec<String>,
    /// Paint order of the owning node
    pub paint_order: u32,
}

/// Memoized result of resolving one batch.
///
/// Paint orders are exactly `0..len()`, one per distinct node id.
#[derive(Debug, Clone, Default)]
pub struct PaintOrder {
    order: HashMap<String, u32>,
    sequence: Vec<String>,
    contexts: HashMap<String, StackingContext>,
    roots: Vec<String>,
}

impl PaintOrder {
    pub fn get(&self, id: &str) -> Option<u32> {
        self.order.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Node ids back to front
    pub fn ids(&self) -> &[String] {
        &self.sequence
    }

    pub fn context(&self, owner: &str) -> Option<&StackingContext> {
        self.contexts.get(owner)
    }

    /// Owners of the top-level contexts, back to front
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Reorder `nodes` back to front. Nodes the resolver never saw keep their
    /// relative order and go last.
    pub fn sort_nodes(&self, mut nodes: Vec<IrNode>) -> Vec<IrNode> {
        nodes.sort_by_key(|n| self.get(&n.id).unwrap_or(u32::MAX));
        nodes
    }
}

/// Builds the stacking-context tree for a batch and assigns paint orders
#[derive(Debug, Default, Clone, Copy)]
pub struct StackingOrderResolver;

struct Batch<'a> {
    nodes: HashMap<&'a str, &'a IrNode>,
    /// Parent inside the batch, or `None` if the node roots its own subtree
    parent: HashMap<&'a str, Option<&'a str>>,
    /// Position in a pre-order walk of the batch
    tree_order: HashMap<&'a str, usize>,
}

impl<'a> Batch<'a> {
    fn new(input: &'a [IrNode]) -> Self {
        let mut nodes: HashMap<&str, &IrNode> = HashMap::with_capacity(input.len());
        for node in input {
            if nodes.contains_key(node.id.as_str()) {
                warn!("duplicate node id {} in batch; keeping first", node.id);
                continue;
            }
            nodes.insert(node.id.as_str(), node);
        }

        let mut parent: HashMap<&str, Option<&str>> = nodes
            .iter()
            .map(|(&id, node)| {
                let p = if node.stacking.is_root {
                    None
                } else {
                    node.parent_id
                        .as_deref()
                        .filter(|p| nodes.contains_key(p))
                };
                (id, p)
            })
            .collect();

        // A node that can reach itself through parent links sits on a cycle.
        // Cut it loose so every chain ends at a root.
        let mut on_cycle = Vec::new();
        for &id in nodes.keys() {
            let mut seen = HashSet::new();
            let mut cur = parent.get(id).copied().flatten();
            while let Some(p) = cur {
                if p == id {
                    on_cycle.push(id);
                    break;
                }
                if !seen.insert(p) {
                    break;
                }
                cur = parent.get(p).copied().flatten();
            }
        }
        for id in on_cycle {
            warn!("node {id} is part of a parent cycle; treating it as a root");
            parent.insert(id, None);
        }

        let tree_order = Self::walk(&nodes, &parent);
        Self {
            nodes,
            parent,
            tree_order,
        }
    }

    /// Pre-order ranks, siblings sorted by (z level, id)
    fn walk(
        nodes: &HashMap<&'a str, &'a IrNode>,
        parent: &HashMap<&'a str, Option<&'a str>>,
    ) -> HashMap<&'a str, usize> {
        let level = |id: &str| nodes.get(id).map_or(0, |n| n.stacking.z_index.level());
        let mut children: HashMap<Option<&str>, Vec<&str>> = HashMap::new();
        for (&id, &p) in parent {
            children.entry(p).or_default().push(id);
        }
        for list in children.values_mut() {
            // reversed so popping from the stack yields the lowest first
            list.sort_by(|a, b| level(b).cmp(&level(a)).then_with(|| b.cmp(a)));
        }

        let mut rank = HashMap::with_capacity(nodes.len());
        let mut stack: Vec<&str> = children.get(&None).cloned().unwrap_or_default();
        while let Some(id) = stack.pop() {
            let next = rank.len();
            rank.insert(id, next);
            if let Some(kids) = children.get(&Some(id)) {
                stack.extend(kids.iter().copied());
            }
        }
        rank
    }

    fn is_root(&self, id: &str) -> bool {
        self.parent.get(id).copied().flatten().is_none()
    }

    fn owns_context(&self, id: &str) -> bool {
        self.is_root(id) || self.nodes.get(id).is_some_and(|n| establishes_context(n))
    }

    /// Nearest ancestor that owns a context; `None` for roots
    fn context_of(&self, id: &str) -> Option<&'a str> {
        let mut cur = self.parent.get(id).copied().flatten();
        while let Some(p) = cur {
            if self.owns_context(p) {
                return Some(p);
            }
            cur = self.parent.get(p).copied().flatten();
        }
        None
    }

    fn sort_key(&self, id: &str) -> (i32, usize) {
        let level = self
            .nodes
            .get(id)
            .map_or(0, |n| n.stacking.z_index.level());
        (level, self.tree_order.get(id).copied().unwrap_or(usize::MAX))
    }
}

impl StackingOrderResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the paint order of one batch. The result depends only on the
    /// set of nodes and their stacking inputs, not on their order in `nodes`.
    pub fn resolve(&self, nodes: &[IrNode]) -> PaintOrder {
        let batch = Batch::new(nodes);

        // Group every node under the context it paints in (`None` = top level)
        let mut members: HashMap<Option<&str>, Vec<&str>> = HashMap::new();
        for &id in batch.nodes.keys() {
            members.entry(batch.context_of(id)).or_default().push(id);
        }
        for list in members.values_mut() {
            list.sort_by_key(|id| batch.sort_key(id));
        }

        let mut result = PaintOrder::default();
        let mut counter = 0u32;
        Self::visit(&batch, &members, None, &mut counter, &mut result);

        result.roots = members
            .get(&None)
            .map(|ids| ids.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();

        for (&id, node) in &batch.nodes {
            if !batch.owns_context(id) {
                continue;
            }
            let children = members
                .get(&Some(id))
                .map(|ids| {
                    ids.iter()
                        .filter(|m| batch.owns_context(m))
                        .map(|m| m.to_string())
                        .collect()
                })
                .unwrap_or_default();
            let paint_order = result.order.get(id).copied().unwrap_or_default();
            result.contexts.insert(
                id.to_string(),
                StackingContext {
                    owner: id.to_string(),
                    z_index: node.stacking.z_index,
                    parent: batch.context_of(id).map(str::to_string),
                    children,
                    paint_order,
                },
            );
        }

        debug!(
            "resolved paint order for {} nodes in {} stacking contexts",
            result.len(),
            result.contexts.len()
        );
        result
    }

    fn visit<'b>(
        batch: &Batch<'_>,
        members: &HashMap<Option<&'b str>, Vec<&'b str>>,
        context: Option<&'b str>,
        counter: &mut u32,
        out: &mut PaintOrder,
    ) {
        let Some(ids) = members.get(&context) else {
            return;
        };
        for &id in ids {
            out.order.insert(id.to_string(), *counter);
            out.sequence.push(id.to_string());
            *counter += 1;
        }
        for &id in ids {
            if batch.owns_context(id) {
                Self::visit(batch, members, Some(id), counter, out);
            }
        }
    }
}
