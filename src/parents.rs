//! Parent cache: recently seen recovery nodes, looked up by child id.
//!
//! A miss on a child is healed through its parent, but a DAG only links
//! downwards. Every recovery node the getter hands out is remembered here;
//! on a miss the cache is scanned for a parent that links to the missing
//! id. A parent is removed when it is returned: one recovery attempt
//! reconstructs all of its lost children at once, so it is never needed
//! twice.
//!
//! Lookup is a linear scan over cached parents and their links, oldest
//! first. When the cache is full the oldest parent is evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::cid::Cid;
use crate::node::{Node, RecoveryNode};

struct Entries {
    nodes: HashMap<Cid, RecoveryNode>,
    /// Insertion order, oldest first.
    order: VecDeque<Cid>,
}

pub struct ParentCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl ParentCache {
    /// A cache holding at most `capacity` parents (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries {
                nodes: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remember `node` as a parent candidate. The cache keeps its own copy;
    /// re-inserting a parent replaces it and makes it the newest entry.
    pub fn insert(&self, node: &RecoveryNode) {
        let cid = node.cid();
        let mut entries = self.lock();
        if entries.nodes.insert(cid, node.clone()).is_some() {
            entries.order.retain(|c| c != &cid);
        }
        entries.order.push_back(cid);

        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.nodes.remove(&oldest);
            }
        }
    }

    /// Cache `node` if it is a recovery node, and return its plain view.
    pub fn observe(&self, node: Node) -> Node {
        if let Some(recovery) = node.as_recovery() {
            self.insert(recovery);
        }
        node.into_plain()
    }

    /// Remove and return the oldest cached parent linking to `child`.
    pub fn take_parent_of(&self, child: &Cid) -> Option<RecoveryNode> {
        let mut entries = self.lock();
        let position = entries.order.iter().position(|cid| {
            entries
                .nodes
                .get(cid)
                .is_some_and(|node| node.links().iter().any(|l| &l.cid == child))
        })?;
        let cid = entries.order.remove(position)?;
        entries.nodes.remove(&cid)
    }

    pub fn contains(&self, parent: &Cid) -> bool {
        self.lock().nodes.contains_key(parent)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ParentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
