//! Scene-graph materialization.
//!
//! The host that owns the native primitives is abstracted by [`SceneHost`].
//! [`SceneGraphBuilder`] walks nodes in paint order and asks the host to
//! create each one under its resolved parent. [`InMemoryScene`] is a host
//! that records the resulting tree for tests and for the CLI.

pub mod builder;
pub mod memory;

pub use builder::{BuildStats, MaterializeReport, SceneGraphBuilder};
pub use memory::{InMemoryScene, SceneEntry};

use serde::{Deserialize, Serialize};

use crate::ir::IrNode;

/// Opaque handle to a primitive created by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostHandle(pub u64);

/// Native primitive factory supplied by the host.
///
/// `create` maps one node plus its already-resolved parent handle to exactly
/// one new primitive, or fails with a reason. The root handle persists for
/// the host's lifetime and adopts every node without a resolvable parent.
pub trait SceneHost: Send {
    fn root(&self) -> HostHandle;

    fn create(&mut self, node: &IrNode, parent: HostHandle) -> Result<HostHandle, String>;

    /// Like `create`, with the node's session paint order. Hosts that keep
    /// children sorted back to front use it to place a primitive that was
    /// created after siblings painting above it. The default appends.
    fn create_ordered(
        &mut self,
        node: &IrNode,
        parent: HostHandle,
        paint_order: u64,
    ) -> Result<HostHandle, String> {
        let _ = paint_order;
        self.create(node, parent)
    }
}

/// Adapter turning a closure into a [`SceneHost`]
pub struct FnHost<F> {
    root: HostHandle,
    create: F,
}

impl<F> FnHost<F>
where
    F: FnMut(&IrNode, HostHandle) -> Result<HostHandle, String> + Send,
{
    pub fn new(root: HostHandle, create: F) -> Self {
        Self { root, create }
    }
}

impl<F> SceneHost for FnHost<F>
where
    F: FnMut(&IrNode, HostHandle) -> Result<HostHandle, String> + Send,
{
    fn root(&self) -> HostHandle {
        self.root
    }

    fn create(&mut self, node: &IrNode, parent: HostHandle) -> Result<HostHandle, String> {
        (self.create)(node, parent)
    }
}
