//! Arena-based DOM tree storage
//!
//! Nodes live in a single Vec and refer to each other by 4-byte index.
//! Scripts create and discard nodes freely; detached nodes stay in the
//! arena until the document is dropped.
//!
//! ```text
//! Arena: Vec<DomNode>
//!        [Node0][Node1][Node2]...
//!         ↑ 4-byte index, not 8-byte pointer
//! ```

use crate::error::{DomError, Result};
use crate::types::{DomNode, NodeId, NodeType};

/// Arena allocator for DOM nodes
#[derive(Debug, Clone)]
pub struct DomArena {
    /// All nodes stored sequentially (cache-friendly)
    nodes: Vec<DomNode>,

    /// Document node ID (if set)
    root_id: Option<NodeId>,
}

impl DomArena {
    pub fn new() -> Self {
        Self::with_capacity(1024) // Pre-allocate for typical page
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            root_id: None,
        }
    }

    /// Allocate a node, returns its ID. The node's own `node_id` is overwritten.
    pub fn add_node(&mut self, mut node: DomNode) -> NodeId {
        let node_id = self.nodes.len() as NodeId;
        node.node_id = node_id;
        self.nodes.push(node);
        node_id
    }

    pub fn get(&self, node_id: NodeId) -> Result<&DomNode> {
        self.nodes
            .get(node_id as usize)
            .ok_or(DomError::NodeNotFound(node_id))
    }

    pub fn get_mut(&mut self, node_id: NodeId) -> Result<&mut DomNode> {
        self.nodes
            .get_mut(node_id as usize)
            .ok_or(DomError::NodeNotFound(node_id))
    }

    pub fn set_root(&mut self, node_id: NodeId) -> Result<()> {
        self.get(node_id)?;
        self.root_id = Some(node_id);
        Ok(())
    }

    pub fn root_id(&self) -> Option<NodeId> {
        self.root_id
    }

    pub fn root(&self) -> Result<&DomNode> {
        let root_id = self.root_id.ok_or(DomError::NoRoot)?;
        self.get(root_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn children(&self, node_id: NodeId) -> Result<Vec<&DomNode>> {
        let node = self.get(node_id)?;
        node.children_ids
            .iter()
            .map(|&child_id| self.get(child_id))
            .collect()
    }

    pub fn parent(&self, node_id: NodeId) -> Result<Option<&DomNode>> {
        let node = self.get(node_id)?;
        match node.parent_id {
            Some(parent_id) => Ok(Some(self.get(parent_id)?)),
            None => Ok(None),
        }
    }

    /// Element children only
    pub fn element_children(&self, node_id: NodeId) -> Result<Vec<NodeId>> {
        Ok(self
            .children(node_id)?
            .into_iter()
            .filter(|n| n.is_element())
            .map(|n| n.node_id)
            .collect())
    }

    /// True if `ancestor` is `node` or one of its ancestors
    pub fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> Result<bool> {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return Ok(true);
            }
            current = self.get(id)?.parent_id;
        }
        Ok(false)
    }

    /// Traverse tree depth-first in document order (iterative, no recursion)
    pub fn traverse_df<F>(&self, start_id: NodeId, mut visit: F) -> Result<()>
    where
        F: FnMut(&DomNode) -> Result<()>,
    {
        let mut stack = vec![start_id];

        while let Some(node_id) = stack.pop() {
            let node = self.get(node_id)?;
            visit(node)?;

            // Push children in reverse order (so they're visited left-to-right)
            for &child_id in node.children_ids.iter().rev() {
                stack.push(child_id);
            }
        }

        Ok(())
    }

    /// Descendant elements of `scope` (excluding `scope`) in document order
    pub fn descendant_elements(&self, scope: NodeId) -> Result<Vec<NodeId>> {
        let mut found = Vec::new();
        self.traverse_df(scope, |node| {
            if node.node_id != scope && node.is_element() {
                found.push(node.node_id);
            }
            Ok(())
        })?;
        Ok(found)
    }

    /// Detach a node from its parent (no-op for parentless nodes)
    pub fn detach(&mut self, node_id: NodeId) -> Result<()> {
        let parent_id = self.get(node_id)?.parent_id;
        if let Some(parent_id) = parent_id {
            let parent = self.get_mut(parent_id)?;
            parent.children_ids.retain(|id| *id != node_id);
            self.get_mut(node_id)?.parent_id = None;
        }
        Ok(())
    }

    /// Insert `child` under `parent` before `reference` (append when None).
    ///
    /// Fragments are flattened: their children move, the fragment is left empty.
    pub fn insert_before(
        &mut self,
        parent_id: NodeId,
        child_id: NodeId,
        reference: Option<NodeId>,
    ) -> Result<()> {
        if let Some(reference) = reference {
            if self.get(reference)?.parent_id != Some(parent_id) {
                return Err(DomError::NotAChild {
                    parent: parent_id,
                    child: reference,
                });
            }
        }

        let child_type = self.get(child_id)?.node_type;
        if child_type == NodeType::Document {
            return Err(DomError::HierarchyRequest(
                "cannot insert a document node".to_string(),
            ));
        }

        let moving: Vec<NodeId> = if child_type == NodeType::DocumentFragment {
            self.get(child_id)?.children_ids.to_vec()
        } else {
            if self.is_inclusive_ancestor(child_id, parent_id)? {
                return Err(DomError::HierarchyRequest(format!(
                    "node {} is an ancestor of {}",
                    child_id, parent_id
                )));
            }
            vec![child_id]
        };

        for &id in &moving {
            self.detach(id)?;
        }

        let parent = self.get_mut(parent_id)?;
        let mut position = match reference {
            Some(reference) => parent
                .children_ids
                .iter()
                .position(|id| *id == reference)
                .unwrap_or(parent.children_ids.len()),
            None => parent.children_ids.len(),
        };
        for &id in &moving {
            parent.children_ids.insert(position, id);
            position += 1;
        }
        for &id in &moving {
            self.get_mut(id)?.parent_id = Some(parent_id);
        }

        Ok(())
    }

    pub fn append_child(&mut self, parent_id: NodeId, child_id: NodeId) -> Result<()> {
        self.insert_before(parent_id, child_id, None)
    }

    pub fn remove_child(&mut self, parent_id: NodeId, child_id: NodeId) -> Result<()> {
        if self.get(child_id)?.parent_id != Some(parent_id) {
            return Err(DomError::NotAChild {
                parent: parent_id,
                child: child_id,
            });
        }
        self.detach(child_id)
    }

    /// Detach every child of `parent_id`
    pub fn clear_children(&mut self, parent_id: NodeId) -> Result<()> {
        let children = std::mem::take(&mut self.get_mut(parent_id)?.children_ids);
        for child in children {
            self.get_mut(child)?.parent_id = None;
        }
        Ok(())
    }

    /// Copy a node (and, when `deep`, its subtree) into new parentless nodes
    pub fn clone_node(&mut self, node_id: NodeId, deep: bool) -> Result<NodeId> {
        let mut copy = self.get(node_id)?.clone();
        copy.parent_id = None;
        copy.children_ids.clear();
        let children = self.get(node_id)?.children_ids.to_vec();
        let copy_id = self.add_node(copy);

        if deep {
            for child in children {
                let child_copy = self.clone_node(child, true)?;
                self.append_child(copy_id, child_copy)?;
            }
        }
        Ok(copy_id)
    }

    /// Find first node in the whole arena matching predicate
    pub fn find_one<F>(&self, predicate: F) -> Option<NodeId>
    where
        F: Fn(&DomNode) -> bool,
    {
        self.nodes.iter().find(|node| predicate(node)).map(|node| node.node_id)
    }

    /// Find attached element by ID attribute
    pub fn find_by_id(&self, id: &str) -> Option<NodeId> {
        let root = self.root_id?;
        self.descendant_elements(root)
            .ok()?
            .into_iter()
            .find(|&node_id| {
                self.get(node_id)
                    .map(|node| node.attr("id") == Some(id))
                    .unwrap_or(false)
            })
    }

    /// Find attached elements by tag name
    pub fn find_by_tag(&self, scope: NodeId, tag: &str) -> Result<Vec<NodeId>> {
        let all = tag == "*";
        Ok(self
            .descendant_elements(scope)?
            .into_iter()
            .filter(|&id| all || self.get(id).map(|n| n.is_tag(tag)).unwrap_or(false))
            .collect())
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root_id = None;
    }
}

impl Default for DomArena {
    fn default() -> Self {
        Self::new()
    }
}
