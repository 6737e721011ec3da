//! [`PrefixMap`] – a trie keyed by address bytes.
//!
//! Used to find the subscribers of an event by the exact address chain of
//! the device that emitted it. Removing a value prunes every node that is
//! left with neither a value nor children.

use std::collections::HashMap;

#[derive(Debug)]
pub struct PrefixMap<V> {
    value: Option<V>,
    nodes: HashMap<u8, PrefixMap<V>>,
}

impl<V> Default for PrefixMap<V> {
    fn default() -> Self {
        Self {
            value: None,
            nodes: HashMap::new(),
        }
    }
}

impl<V> PrefixMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value stored at exactly `keys`.
    pub fn lookup(&self, keys: &[u8]) -> Option<&V> {
        let mut node = self;
        for key in keys {
            node = node.nodes.get(key)?;
        }
        node.value.as_ref()
    }

    pub fn lookup_mut(&mut self, keys: &[u8]) -> Option<&mut V> {
        let mut node = self;
        for key in keys {
            node = node.nodes.get_mut(key)?;
        }
        node.value.as_mut()
    }

    /// The value at `keys`, inserting `f()` when there is none yet. Missing
    /// intermediate nodes are created on the way.
    pub fn get_or_insert_with(&mut self, keys: &[u8], f: impl FnOnce() -> V) -> &mut V {
        let mut node = self;
        for key in keys {
            node = node.nodes.entry(*key).or_default();
        }
        node.value.get_or_insert_with(f)
    }

    /// Take the value at `keys` and prune the nodes it leaves empty.
    pub fn remove(&mut self, keys: &[u8]) -> Option<V> {
        let Some((first, rest)) = keys.split_first() else {
            return self.value.take();
        };
        let child = self.nodes.get_mut(first)?;
        let removed = child.remove(rest);
        if child.is_empty() {
            self.nodes.remove(first);
        }
        removed
    }

    /// No value here and no children.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.nodes.is_empty()
    }

    /// Number of nodes below this one, for pruning checks.
    pub fn node_count(&self) -> usize {
        self.nodes.values().map(|n| 1 + n.node_count()).sum()
    }
}
