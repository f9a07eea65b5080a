//! Mailbox hierarchy with persistent references.
//!
//! Nodes live in a generational arena. A [`MailboxRef`] names a slot together with
//! the generation it was handed out for, so a reference to a removed mailbox stops
//! resolving even if the slot is reused later. Moving or renaming a node keeps its
//! slot, and every reference to it stays valid.
//!
//! Nodes are reference counted, so a copy of the tree shares every node with the
//! original until one side edits it; only the edited node is duplicated.

use crate::imap::{same_mailbox, FolderAttribute, StatusItem};
use std::sync::Arc;

/// Persistent, checkable reference to a mailbox node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MailboxRef {
    index: usize,
    generation: u64,
}

/// Counters known for a mailbox
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub messages: Option<u32>,
    pub recent: Option<u32>,
    pub unseen: Option<u32>,
    pub uid_next: Option<u32>,
    pub uid_validity: Option<u32>,
    /// Sequence number of the first unseen message, as reported by SELECT
    pub first_unseen: Option<u32>,
}

impl MailboxStatus {
    pub fn apply(&mut self, item: StatusItem, value: u32) {
        match item {
            StatusItem::Messages => self.messages = Some(value),
            StatusItem::Recent => self.recent = Some(value),
            StatusItem::Unseen => self.unseen = Some(value),
            StatusItem::UidNext => self.uid_next = Some(value),
            StatusItem::UidValidity => self.uid_validity = Some(value),
        }
    }

    /// Overwrite every counter `other` knows
    pub fn merge(&mut self, other: &MailboxStatus) {
        self.messages = other.messages.or(self.messages);
        self.recent = other.recent.or(self.recent);
        self.unseen = other.unseen.or(self.unseen);
        self.uid_next = other.uid_next.or(self.uid_next);
        self.uid_validity = other.uid_validity.or(self.uid_validity);
        self.first_unseen = other.first_unseen.or(self.first_unseen);
    }
}

#[derive(Debug, Clone)]
pub struct MailboxNode {
    name: String,
    path: String,
    delimiter: Option<String>,
    attributes: Vec<FolderAttribute>,
    status: MailboxStatus,
    parent: Option<MailboxRef>,
    children: Vec<MailboxRef>,
    children_loaded: bool,
}

impl MailboxNode {
    fn new(
        name: &str,
        path: &str,
        delimiter: Option<String>,
        attributes: Vec<FolderAttribute>,
        parent: Option<MailboxRef>,
    ) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            delimiter,
            attributes,
            status: MailboxStatus::default(),
            parent,
            children: Vec::new(),
            children_loaded: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full server-side name
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn delimiter(&self) -> Option<&str> {
        self.delimiter.as_deref()
    }

    pub fn attributes(&self) -> &[FolderAttribute] {
        &self.attributes
    }

    pub fn status(&self) -> &MailboxStatus {
        &self.status
    }

    pub fn parent(&self) -> Option<MailboxRef> {
        self.parent
    }

    pub fn children(&self) -> &[MailboxRef] {
        &self.children
    }

    pub fn children_loaded(&self) -> bool {
        self.children_loaded
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_selectable(&self) -> bool {
        !self.is_root()
            && !self.attributes.contains(&FolderAttribute::Noselect)
            && !self.attributes.contains(&FolderAttribute::NonExistent)
    }
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u64,
    node: Option<Arc<MailboxNode>>,
}

/// Arena-backed mailbox tree rooted at an unnamed top-level node
#[derive(Debug, Clone)]
pub struct MailboxTree {
    slots: Vec<Slot>,
    free: Vec<usize>,
    root: MailboxRef,
    delimiter: Option<String>,
}

impl MailboxTree {
    /// Tree holding the root and `INBOX`, which every server has
    pub fn new() -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: MailboxRef {
                index: 0,
                generation: 0,
            },
            delimiter: None,
        };
        tree.root = tree.alloc(MailboxNode::new("", "", None, Vec::new(), None));
        tree.insert_child(tree.root, "INBOX", "INBOX", None, Vec::new());
        tree
    }

    fn alloc(&mut self, node: MailboxNode) -> MailboxRef {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.node = Some(Arc::new(node));
            MailboxRef {
                index,
                generation: slot.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                node: Some(Arc::new(node)),
            });
            MailboxRef {
                index: self.slots.len() - 1,
                generation: 0,
            }
        }
    }

    pub fn root(&self) -> MailboxRef {
        self.root
    }

    /// Hierarchy delimiter learned from the server
    pub fn delimiter(&self) -> Option<&str> {
        self.delimiter.as_deref()
    }

    pub fn set_delimiter(&mut self, delimiter: &str) {
        if self.delimiter.is_none() && !delimiter.is_empty() {
            self.delimiter = Some(delimiter.to_string());
        }
    }

    pub fn resolve(&self, mailbox: MailboxRef) -> Option<&MailboxNode> {
        self.slots
            .get(mailbox.index)
            .filter(|slot| slot.generation == mailbox.generation)
            .and_then(|slot| slot.node.as_deref())
    }

    /// Unshares the node first if a copy of the tree still holds it
    fn resolve_mut(&mut self, mailbox: MailboxRef) -> Option<&mut MailboxNode> {
        self.slots
            .get_mut(mailbox.index)
            .filter(|slot| slot.generation == mailbox.generation)
            .and_then(|slot| slot.node.as_mut())
            .map(Arc::make_mut)
    }

    pub fn is_valid(&self, mailbox: MailboxRef) -> bool {
        self.resolve(mailbox).is_some()
    }

    /// Look a mailbox up by full path; the empty path is the root
    pub fn find(&self, path: &str) -> Option<MailboxRef> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            let node = slot.node.as_ref()?;
            same_mailbox(&node.path, path).then_some(MailboxRef {
                index,
                generation: slot.generation,
            })
        })
    }

    /// Insert a child, or refresh the existing child with the same path
    pub fn insert_child(
        &mut self,
        parent: MailboxRef,
        name: &str,
        path: &str,
        delimiter: Option<String>,
        attributes: Vec<FolderAttribute>,
    ) -> Option<MailboxRef> {
        let existing = self.resolve(parent)?.children.iter().copied().find(|child| {
            self.resolve(*child)
                .map_or(false, |node| same_mailbox(&node.path, path))
        });
        if let Some(child) = existing {
            let node = self.resolve_mut(child)?;
            node.attributes = attributes;
            if delimiter.is_some() {
                node.delimiter = delimiter;
            }
            return Some(child);
        }

        let child = self.alloc(MailboxNode::new(name, path, delimiter, attributes, Some(parent)));
        self.resolve_mut(parent)?.children.push(child);
        Some(child)
    }

    /// Remove a node and its subtree; returns how many nodes went away
    pub fn remove(&mut self, mailbox: MailboxRef) -> usize {
        if mailbox == self.root || !self.is_valid(mailbox) {
            return 0;
        }
        if let Some(parent) = self.resolve(mailbox).and_then(|node| node.parent) {
            if let Some(parent) = self.resolve_mut(parent) {
                parent.children.retain(|child| *child != mailbox);
            }
        }

        let mut removed = 0;
        let mut stack = vec![mailbox];
        while let Some(current) = stack.pop() {
            let slot = &mut self.slots[current.index];
            if slot.generation != current.generation {
                continue;
            }
            if let Some(node) = slot.node.take() {
                stack.extend(node.children.iter().copied());
                slot.generation += 1;
                self.free.push(current.index);
                removed += 1;
            }
        }
        removed
    }

    /// Move or rename a node; references to it and its descendants stay valid
    pub fn relocate(&mut self, mailbox: MailboxRef, new_parent: MailboxRef, new_path: &str) -> bool {
        if mailbox == self.root || !self.is_valid(mailbox) || !self.is_valid(new_parent) {
            return false;
        }
        let mut cursor = Some(new_parent);
        while let Some(current) = cursor {
            if current == mailbox {
                return false;
            }
            cursor = self.resolve(current).and_then(|node| node.parent);
        }

        let (old_parent, old_path, delimiter) = match self.resolve(mailbox) {
            Some(node) => (
                node.parent,
                node.path.clone(),
                node.delimiter.clone().or_else(|| self.delimiter.clone()),
            ),
            None => return false,
        };
        if let Some(parent) = old_parent.and_then(|p| self.resolve_mut(p)) {
            parent.children.retain(|child| *child != mailbox);
        }
        if let Some(parent) = self.resolve_mut(new_parent) {
            parent.children.push(mailbox);
        }

        let mut descendants = Vec::new();
        if let Some(node) = self.resolve_mut(mailbox) {
            node.parent = Some(new_parent);
            node.path = new_path.to_string();
            node.name = match delimiter.as_deref() {
                Some(d) if !d.is_empty() => new_path.rsplit(d).next().unwrap_or(new_path).to_string(),
                _ => new_path.to_string(),
            };
            descendants.extend(node.children.iter().copied());
        }
        while let Some(current) = descendants.pop() {
            if let Some(node) = self.resolve_mut(current) {
                if let Some(suffix) = node.path.strip_prefix(old_path.as_str()) {
                    node.path = format!("{}{}", new_path, suffix);
                }
                descendants.extend(node.children.iter().copied());
            }
        }
        true
    }

    pub fn children(&self, mailbox: MailboxRef) -> Vec<MailboxRef> {
        self.resolve(mailbox)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    pub fn set_children_loaded(&mut self, mailbox: MailboxRef) {
        if let Some(node) = self.resolve_mut(mailbox) {
            node.children_loaded = true;
        }
    }

    /// Edit the counters of a live node; false when the reference no longer resolves
    pub fn update_status<F: FnOnce(&mut MailboxStatus)>(&mut self, mailbox: MailboxRef, f: F) -> bool {
        match self.resolve_mut(mailbox) {
            Some(node) => {
                f(&mut node.status);
                true
            }
            None => false,
        }
    }

    /// Live nodes, root included
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    /// Depth-first walk below the root as `(depth, reference)` pairs
    pub fn walk(&self) -> Vec<(usize, MailboxRef)> {
        let mut out = Vec::new();
        let mut stack: Vec<(usize, MailboxRef)> = self
            .children(self.root)
            .into_iter()
            .rev()
            .map(|child| (0, child))
            .collect();
        while let Some((depth, current)) = stack.pop() {
            out.push((depth, current));
            stack.extend(
                self.children(current)
                    .into_iter()
                    .rev()
                    .map(|child| (depth + 1, child)),
            );
        }
        out
    }
}

impl Default for MailboxTree {
    fn default() -> Self {
        Self::new()
    }
}
