//! In-memory scene host used by tests and the replay CLI

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::ir::{IrNode, NodeKind, Rect};
use crate::scene::{HostHandle, SceneHost};

/// One primitive recorded by [`InMemoryScene`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneEntry {
    pub handle: HostHandle,
    pub node_id: String,
    pub kind: NodeKind,
    pub rect: Rect,
    pub parent: Option<HostHandle>,
    /// Children back to front
    pub children: Vec<HostHandle>,
    /// Session paint order the primitive was created with
    pub paint_order: u64,
    /// Byte length of the attached image, if any
    pub image_len: Option<usize>,
    pub text: Option<String>,
}

/// Records every created primitive as a plain tree
#[derive(Debug, Clone, Serialize)]
pub struct InMemoryScene {
    entries: Vec<SceneEntry>,
    #[serde(skip)]
    by_node: HashMap<String, HostHandle>,
}

const ROOT: HostHandle = HostHandle(0);

impl InMemoryScene {
    pub fn new() -> Self {
        let root = SceneEntry {
            handle: ROOT,
            node_id: String::new(),
            kind: NodeKind::Frame,
            rect: Rect::default(),
            parent: None,
            children: Vec::new(),
            paint_order: 0,
            image_len: None,
            text: None,
        };
        InMemoryScene {
            entries: vec![root],
            by_node: HashMap::new(),
        }
    }

    pub fn root_handle(&self) -> HostHandle {
        ROOT
    }

    pub fn get(&self, handle: HostHandle) -> Option<&SceneEntry> {
        self.entries.get(handle.0 as usize)
    }

    /// Look up the primitive created for a node id. A later session that
    /// reuses the id shadows the earlier primitive.
    pub fn find(&self, node_id: &str) -> Option<&SceneEntry> {
        self.by_node.get(node_id).and_then(|h| self.get(*h))
    }

    pub fn children(&self, handle: HostHandle) -> &[HostHandle] {
        self.get(handle).map(|e| e.children.as_slice()).unwrap_or(&[])
    }

    /// Number of created primitives, not counting the root
    pub fn len(&self) -> usize {
        self.entries.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in creation order, root excluded
    pub fn entries(&self) -> &[SceneEntry] {
        &self.entries[1..]
    }

    /// Indented outline of the tree, children listed back to front
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let mut stack: Vec<(HostHandle, usize)> = self
            .children(ROOT)
            .iter()
            .rev()
            .map(|h| (*h, 0))
            .collect();
        while let Some((handle, depth)) = stack.pop() {
            let Some(entry) = self.get(handle) else { continue };
            let _ = write!(out, "{}{} [{}]", "  ".repeat(depth), entry.node_id, entry.kind);
            if let Some(len) = entry.image_len {
                let _ = write!(out, " {len} bytes");
            }
            out.push('\n');
            for child in entry.children.iter().rev() {
                stack.push((*child, depth + 1));
            }
        }
        out
    }
}

impl Default for InMemoryScene {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneHost for InMemoryScene {
    fn root(&self) -> HostHandle {
        ROOT
    }

    fn create(&mut self, node: &IrNode, parent: HostHandle) -> Result<HostHandle, String> {
        self.create_ordered(node, parent, u64::MAX)
    }

    fn create_ordered(
        &mut self,
        node: &IrNode,
        parent: HostHandle,
        paint_order: u64,
    ) -> Result<HostHandle, String> {
        if self.get(parent).is_none() {
            return Err(format!("unknown parent handle {:?}", parent));
        }
        let handle = HostHandle(self.entries.len() as u64);
        self.entries.push(SceneEntry {
            handle,
            node_id: node.id.clone(),
            kind: node.kind,
            rect: node.rect,
            parent: Some(parent),
            children: Vec::new(),
            paint_order,
            image_len: node.inline_image.as_ref().map(Vec::len),
            text: node.text.clone(),
        });

        let siblings = &self.entries[parent.0 as usize].children;
        let at = siblings.partition_point(|h| {
            self.entries
                .get(h.0 as usize)
                .is_some_and(|e| e.paint_order <= paint_order)
        });
        self.entries[parent.0 as usize].children.insert(at, handle);
        self.by_node.insert(node.id.clone(), handle);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_parent_child_links() {
        let mut scene = InMemoryScene::new();
        let a = scene.create(&IrNode::new("a", None), ROOT).unwrap();
        let b = scene.create(&IrNode::new("b", Some("a")), a).unwrap();
        assert_eq!(scene.len(), 2);
        assert_eq!(scene.children(a), &[b]);
        assert_eq!(scene.find("b").unwrap().parent, Some(a));
        assert_eq!(scene.dump(), "a [frame]\n  b [frame]\n");
    }

    #[test]
    fn late_child_is_inserted_by_paint_order() {
        let mut scene = InMemoryScene::new();
        let page = scene.create_ordered(&IrNode::new("page", None), ROOT, 0).unwrap();
        let caption = scene.create_ordered(&IrNode::new("caption", Some("page")), page, 2).unwrap();
        let hero = scene.create_ordered(&IrNode::new("hero", Some("page")), page, 1).unwrap();
        assert_eq!(scene.children(page), &[hero, caption]);
        assert_eq!(scene.dump(), "page [frame]\n  hero [frame]\n  caption [frame]\n");

        // unordered creation appends
        let tail = scene.create(&IrNode::new("tail", Some("page")), page).unwrap();
        assert_eq!(scene.children(page).last(), Some(&tail));
    }

    #[test]
    fn rejects_unknown_parent() {
        let mut scene = InMemoryScene::new();
        assert!(scene.create(&IrNode::new("a", None), HostHandle(42)).is_err());
        assert!(scene.is_empty());
    }

    #[test]
    fn repeated_id_shadows_earlier_primitive() {
        let mut scene = InMemoryScene::new();
        scene.create(&IrNode::new("a", None), ROOT).unwrap();
        let second = scene.create(&IrNode::new("a", None), ROOT).unwrap();
        assert_eq!(scene.len(), 2);
        assert_eq!(scene.find("a").unwrap().handle, second);
    }
}
