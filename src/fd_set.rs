//! Tracking of the sockets the wrapped library currently owns.

use crate::engine::PolledFd;
use crate::library::SocketHandle;

/// One live socket the library created, paired with the poller adapter the
/// driver registered for it.
///
/// The node does not own the socket; the library closes it. What the node
/// tracks is whether a readiness callback is currently armed in each
/// direction and whether the adapter has already been handed a shutdown
/// notification. A node may only be dropped once both registration flags are
/// clear; until then it stays in the set awaiting callback drain.
pub(crate) struct FdNode {
    pub(crate) socket: SocketHandle,
    pub(crate) polled_fd: Box<dyn PolledFd>,
    pub(crate) readable_registered: bool,
    pub(crate) writable_registered: bool,
    pub(crate) already_shutdown: bool,
}

impl FdNode {
    pub(crate) fn new(socket: SocketHandle, polled_fd: Box<dyn PolledFd>) -> Self {
        FdNode {
            socket,
            polled_fd,
            readable_registered: false,
            writable_registered: false,
            already_shutdown: false,
        }
    }
}

/// The set of active fd nodes for one request.
///
/// The contract is pop-by-handle, push, iterate; a dense vector serves it.
#[derive(Default)]
pub(crate) struct FdSet {
    nodes: Vec<FdNode>,
}

impl FdSet {
    pub(crate) fn new() -> Self {
        FdSet::default()
    }

    pub(crate) fn push(&mut self, node: FdNode) {
        self.nodes.push(node);
    }

    /// Removes and returns the node wrapping `socket`, if tracked.
    pub(crate) fn pop(&mut self, socket: SocketHandle) -> Option<FdNode> {
        let idx = self.nodes.iter().position(|n| n.socket == socket)?;
        Some(self.nodes.swap_remove(idx))
    }

    /// Removes and returns an arbitrary node.
    pub(crate) fn pop_any(&mut self) -> Option<FdNode> {
        self.nodes.pop()
    }

    pub(crate) fn get_mut(&mut self, socket: SocketHandle) -> Option<&mut FdNode> {
        self.nodes.iter_mut().find(|n| n.socket == socket)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn node_at(&mut self, idx: usize) -> &mut FdNode {
        &mut self.nodes[idx]
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut FdNode> {
        self.nodes.iter_mut()
    }
}
