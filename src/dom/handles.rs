use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use kuchiki::{Node, NodeRef};

use super::{DomError, Handle};

/// Page-wide handle counter shared by every document of a page so that
/// document handles are unique keys for the backend registry.
#[derive(Debug, Clone, Default)]
pub struct HandleAllocator {
    next: Rc<Cell<u32>>,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            next: Rc::new(Cell::new(1)),
        }
    }

    pub fn allocate(&self) -> Handle {
        let value = self.next.get().max(1);
        self.next.set(value + 1);
        Handle(value)
    }
}

/// Two-way mapping between handles and the nodes of one document.
///
/// Handles are never reused; entries for nodes that were detached from the
/// document are dropped by [`HandleTable::release_detached`].
pub struct HandleTable {
    allocator: HandleAllocator,
    nodes: RefCell<HashMap<Handle, NodeRef>>,
    handles: RefCell<HashMap<*const Node, Handle>>,
}

impl HandleTable {
    pub fn new(allocator: HandleAllocator) -> Self {
        Self {
            allocator,
            nodes: RefCell::new(HashMap::new()),
            handles: RefCell::new(HashMap::new()),
        }
    }

    /// Handle for `node`, assigning a fresh one on first sight.
    pub fn handle_for(&self, node: &NodeRef) -> Handle {
        let key = Rc::as_ptr(&node.0);
        if let Some(handle) = self.handles.borrow().get(&key) {
            return *handle;
        }
        let handle = self.allocator.allocate();
        self.bind(handle, node);
        handle
    }

    /// Bind a pre-allocated handle, used for document nodes whose handle is
    /// chosen before the tree is built.
    pub fn bind(&self, handle: Handle, node: &NodeRef) {
        self.handles.borrow_mut().insert(Rc::as_ptr(&node.0), handle);
        self.nodes.borrow_mut().insert(handle, node.clone());
    }

    pub fn resolve(&self, handle: Handle) -> Result<NodeRef, DomError> {
        self.nodes
            .borrow()
            .get(&handle)
            .cloned()
            .ok_or(DomError::HandleResolution(handle))
    }

    /// Forget every node that is no longer attached under `root`.
    pub fn release_detached(&self, root: &NodeRef) -> usize {
        let detached: Vec<Handle> = self
            .nodes
            .borrow()
            .iter()
            .filter(|(_, node)| {
                node.inclusive_ancestors()
                    .last()
                    .map_or(true, |top| top != *root)
            })
            .map(|(handle, _)| *handle)
            .collect();

        let mut nodes = self.nodes.borrow_mut();
        let mut handles = self.handles.borrow_mut();
        for handle in &detached {
            if let Some(node) = nodes.remove(handle) {
                handles.remove(&Rc::as_ptr(&node.0));
            }
        }
        if !detached.is_empty() {
            tracing::debug!(target: "dom", released = detached.len(), "released detached handles");
        }
        detached.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }
}
