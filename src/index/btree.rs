//! In-memory B+Tree multimap
//!
//! Ordered map from encoded key strings to record pointers. The comparator
//! is injected at construction, which is how composite and descending
//! indexes get their ordering. Equal keys share one leaf slot, so per-key
//! pointer order among duplicates is the insertion order of the pointers.
//!
//! Nodes split on overflow the usual way; removal prunes emptied nodes
//! instead of rebalancing. Trees are rebuilt from records on load, so
//! underfull nodes never accumulate across process lifetimes.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::keys::{is_null_key, KeyComparator};

/// Opaque pointer into the owning list (canonical identity token)
pub type Pointer = String;

/// Max keys per node before a split
pub const DEFAULT_ORDER: usize = 32;

enum Node {
    Leaf {
        keys: Vec<String>,
        slots: Vec<Vec<Pointer>>,
    },
    Internal {
        keys: Vec<String>,
        children: Vec<Node>,
    },
}

impl Node {
    fn empty_leaf() -> Node {
        Node::Leaf {
            keys: Vec::new(),
            slots: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Node::Leaf { keys, .. } => keys.is_empty(),
            Node::Internal { children, .. } => children.is_empty(),
        }
    }
}

enum InsertOutcome {
    Done,
    /// Separator key plus the new right sibling
    Split(String, Node),
    Duplicate,
}

/// One `(key, pointers)` slot in the portable dump of a tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortableEntry {
    pub key: String,
    pub pointers: Vec<Pointer>,
}

/// Ordered multimap with injected comparator
pub struct BPlusTree {
    root: Node,
    cmp: KeyComparator,
    unique: bool,
    order: usize,
    len: usize,
}

impl BPlusTree {
    pub fn new(cmp: KeyComparator, unique: bool) -> Self {
        Self::with_order(cmp, unique, DEFAULT_ORDER)
    }

    pub fn with_order(cmp: KeyComparator, unique: bool, order: usize) -> Self {
        Self {
            root: Node::empty_leaf(),
            cmp,
            unique,
            order: order.max(3),
            len: 0,
        }
    }

    /// Total number of `(key, pointer)` entries
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn comparator(&self) -> KeyComparator {
        self.cmp.clone()
    }

    /// Insert one entry. Returns `false` when unique mode rejects a
    /// duplicate key; the caller translates that into a constraint error.
    pub fn insert(&mut self, key: &str, pointer: Pointer) -> bool {
        match insert_node(&mut self.root, key, pointer, &self.cmp, self.unique, self.order) {
            InsertOutcome::Done => {
                self.len += 1;
                true
            }
            InsertOutcome::Split(sep, right) => {
                // root split: grow one level
                let old_root = std::mem::replace(&mut self.root, Node::empty_leaf());
                self.root = Node::Internal {
                    keys: vec![sep],
                    children: vec![old_root, right],
                };
                self.len += 1;
                true
            }
            InsertOutcome::Duplicate => false,
        }
    }

    /// Remove every entry with this key, returning the removed pointers.
    pub fn remove(&mut self, key: &str) -> Vec<Pointer> {
        let removed = remove_node(&mut self.root, key, None, &self.cmp);
        self.len -= removed.len();
        self.collapse_root();
        removed
    }

    /// Remove only entries for `key` whose pointer satisfies `pred`.
    pub fn remove_specific(&mut self, key: &str, pred: &dyn Fn(&Pointer) -> bool) -> Vec<Pointer> {
        let removed = remove_node(&mut self.root, key, Some(pred), &self.cmp);
        self.len -= removed.len();
        self.collapse_root();
        removed
    }

    fn collapse_root(&mut self) {
        loop {
            match &mut self.root {
                Node::Internal { children, .. } if children.len() == 1 => {
                    let child = children.pop().expect("single child");
                    self.root = child;
                }
                Node::Internal { children, .. } if children.is_empty() => {
                    self.root = Node::empty_leaf();
                }
                _ => break,
            }
        }
    }

    /// All pointers stored under `key`, in insertion order.
    pub fn find(&self, key: &str) -> Vec<Pointer> {
        let mut out = Vec::new();
        range_collect(&self.root, Some(key), Some(key), &self.cmp, &mut |_, p| {
            out.push(p.clone())
        });
        out
    }

    pub fn find_first(&self, key: &str) -> Option<Pointer> {
        self.find(key).into_iter().next()
    }

    pub fn find_last(&self, key: &str) -> Option<Pointer> {
        self.find(key).into_iter().last()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        !self.find(key).is_empty()
    }

    /// Entries with `lo <= key <= hi` (either bound may be open).
    pub fn range(&self, lo: Option<&str>, hi: Option<&str>) -> Vec<(String, Pointer)> {
        let mut out = Vec::new();
        range_collect(&self.root, lo, hi, &self.cmp, &mut |k, p| {
            out.push((k.to_string(), p.clone()))
        });
        out
    }

    /// Entries whose key starts at the partial key prefix.
    ///
    /// Prefix scans rely on the codec guarantee that extensions of a
    /// prefix sort immediately after it and before any greater key.
    pub fn scan_prefix(&self, prefix: &str, separator: char) -> Vec<(String, Pointer)> {
        let mut out = Vec::new();
        range_collect(&self.root, Some(prefix), None, &self.cmp, &mut |k, p| {
            out.push((k.to_string(), p.clone()))
        });
        out.retain(|(k, _)| {
            k == prefix || (k.starts_with(prefix) && k[prefix.len()..].starts_with(separator))
        });
        out
    }

    /// First entry in comparator order
    pub fn min(&self) -> Option<(String, Pointer)> {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { keys, slots } => {
                    return keys
                        .first()
                        .map(|k| (k.clone(), slots[0].first().cloned().unwrap_or_default()));
                }
                Node::Internal { children, .. } => node = children.first()?,
            }
        }
    }

    /// Last entry in comparator order
    pub fn max(&self) -> Option<(String, Pointer)> {
        let mut node = &self.root;
        loop {
            match node {
                Node::Leaf { keys, slots } => {
                    return keys.last().map(|k| {
                        let slot = slots.last().expect("slot for key");
                        (k.clone(), slot.last().cloned().unwrap_or_default())
                    });
                }
                Node::Internal { children, .. } => node = children.last()?,
            }
        }
    }

    /// Forward cursor over every `(key, pointer)` entry
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(&self.root, false)
    }

    /// Reverse cursor
    pub fn iter_rev(&self) -> Iter<'_> {
        Iter::new(&self.root, true)
    }

    /// Ordered dump for snapshots
    pub fn to_portable(&self) -> Vec<PortableEntry> {
        let mut out: Vec<PortableEntry> = Vec::new();
        range_collect(&self.root, None, None, &self.cmp, &mut |k, p| {
            match out.last_mut() {
                Some(entry) if entry.key == k => entry.pointers.push(p.clone()),
                _ => out.push(PortableEntry {
                    key: k.to_string(),
                    pointers: vec![p.clone()],
                }),
            }
        });
        out
    }

    /// Rebuild a tree from a portable dump.
    pub fn from_portable(
        entries: Vec<PortableEntry>,
        cmp: KeyComparator,
        unique: bool,
    ) -> Self {
        let mut tree = Self::new(cmp, unique);
        for entry in entries {
            for pointer in entry.pointers {
                tree.insert(&entry.key, pointer);
            }
        }
        tree
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.root = Node::empty_leaf();
        self.len = 0;
    }
}

/// Position of `key` among `keys` under `cmp` (same contract as
/// `slice::binary_search`).
fn search(keys: &[String], key: &str, cmp: &KeyComparator) -> std::result::Result<usize, usize> {
    let mut lo = 0usize;
    let mut hi = keys.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        match cmp(&keys[mid], key) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

fn insert_node(
    node: &mut Node,
    key: &str,
    pointer: Pointer,
    cmp: &KeyComparator,
    unique: bool,
    order: usize,
) -> InsertOutcome {
    match node {
        Node::Leaf { keys, slots } => match search(keys, key, cmp) {
            Ok(i) => {
                // unique mode rejects duplicate non-null keys only; null
                // keys may repeat
                if unique && !is_null_key(key) {
                    return InsertOutcome::Duplicate;
                }
                slots[i].push(pointer);
                InsertOutcome::Done
            }
            Err(i) => {
                keys.insert(i, key.to_string());
                slots.insert(i, vec![pointer]);
                if keys.len() > order {
                    let mid = keys.len() / 2;
                    let right_keys = keys.split_off(mid);
                    let right_slots = slots.split_off(mid);
                    let sep = right_keys[0].clone();
                    InsertOutcome::Split(
                        sep,
                        Node::Leaf {
                            keys: right_keys,
                            slots: right_slots,
                        },
                    )
                } else {
                    InsertOutcome::Done
                }
            }
        },
        Node::Internal { keys, children } => {
            // keys equal to a separator live in the right child
            let i = match search(keys, key, cmp) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            match insert_node(&mut children[i], key, pointer, cmp, unique, order) {
                InsertOutcome::Split(sep, right) => {
                    keys.insert(i, sep);
                    children.insert(i + 1, right);
                    if keys.len() > order {
                        let mid = keys.len() / 2;
                        let right_keys = keys.split_off(mid + 1);
                        let sep = keys.pop().expect("separator");
                        let right_children = children.split_off(mid + 1);
                        InsertOutcome::Split(
                            sep,
                            Node::Internal {
                                keys: right_keys,
                                children: right_children,
                            },
                        )
                    } else {
                        InsertOutcome::Done
                    }
                }
                other => other,
            }
        }
    }
}

fn remove_node(
    node: &mut Node,
    key: &str,
    pred: Option<&dyn Fn(&Pointer) -> bool>,
    cmp: &KeyComparator,
) -> Vec<Pointer> {
    match node {
        Node::Leaf { keys, slots } => match search(keys, key, cmp) {
            Ok(i) => {
                let removed = match pred {
                    None => std::mem::take(&mut slots[i]),
                    Some(pred) => {
                        let mut removed = Vec::new();
                        slots[i].retain(|p| {
                            if pred(p) {
                                removed.push(p.clone());
                                false
                            } else {
                                true
                            }
                        });
                        removed
                    }
                };
                if slots[i].is_empty() {
                    keys.remove(i);
                    slots.remove(i);
                }
                removed
            }
            Err(_) => Vec::new(),
        },
        Node::Internal { keys, children } => {
            let i = match search(keys, key, cmp) {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            let removed = remove_node(&mut children[i], key, pred, cmp);
            if children[i].is_empty() {
                children.remove(i);
                if !keys.is_empty() {
                    let k = if i < keys.len() { i } else { keys.len() - 1 };
                    keys.remove(k);
                }
            }
            removed
        }
    }
}

fn range_collect(
    node: &Node,
    lo: Option<&str>,
    hi: Option<&str>,
    cmp: &KeyComparator,
    visit: &mut dyn FnMut(&str, &Pointer),
) {
    match node {
        Node::Leaf { keys, slots } => {
            for (k, slot) in keys.iter().zip(slots) {
                if let Some(lo) = lo {
                    if cmp(k, lo) == Ordering::Less {
                        continue;
                    }
                }
                if let Some(hi) = hi {
                    if cmp(k, hi) == Ordering::Greater {
                        break;
                    }
                }
                for p in slot {
                    visit(k, p);
                }
            }
        }
        Node::Internal { keys, children } => {
            for (i, child) in children.iter().enumerate() {
                // child i holds keys in [keys[i-1], keys[i])
                if let Some(lo) = lo {
                    if i < keys.len() && cmp(&keys[i], lo) != Ordering::Greater {
                        continue;
                    }
                }
                if let Some(hi) = hi {
                    if i > 0 && cmp(&keys[i - 1], hi) == Ordering::Greater {
                        break;
                    }
                }
                range_collect(child, lo, hi, cmp, visit);
            }
        }
    }
}

/// Restartable cursor over the tree.
///
/// Holds a borrow on the tree; release it before mutating.
pub struct Iter<'a> {
    stack: Vec<(&'a Node, usize)>,
    slot: Option<(&'a str, &'a [Pointer], usize)>,
    reverse: bool,
}

impl<'a> Iter<'a> {
    fn new(root: &'a Node, reverse: bool) -> Self {
        let mut iter = Self {
            stack: Vec::new(),
            slot: None,
            reverse,
        };
        iter.push_node(root);
        iter
    }

    fn push_node(&mut self, node: &'a Node) {
        let start = if self.reverse {
            match node {
                Node::Leaf { keys, .. } => keys.len(),
                Node::Internal { children, .. } => children.len(),
            }
        } else {
            0
        };
        self.stack.push((node, start));
    }

    fn advance(&mut self) -> Option<(&'a str, &'a [Pointer])> {
        loop {
            let frame = self.stack.last_mut()?;
            let node: &'a Node = frame.0;
            match node {
                Node::Leaf { keys, slots } => {
                    if self.reverse {
                        if frame.1 == 0 {
                            self.stack.pop();
                            continue;
                        }
                        frame.1 -= 1;
                        let i = frame.1;
                        return Some((keys[i].as_str(), slots[i].as_slice()));
                    } else {
                        if frame.1 >= keys.len() {
                            self.stack.pop();
                            continue;
                        }
                        let i = frame.1;
                        frame.1 += 1;
                        return Some((keys[i].as_str(), slots[i].as_slice()));
                    }
                }
                Node::Internal { children, .. } => {
                    let child = if self.reverse {
                        if frame.1 == 0 {
                            self.stack.pop();
                            continue;
                        }
                        frame.1 -= 1;
                        &children[frame.1]
                    } else {
                        if frame.1 >= children.len() {
                            self.stack.pop();
                            continue;
                        }
                        let i = frame.1;
                        frame.1 += 1;
                        &children[i]
                    };
                    self.push_node(child);
                }
            }
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a Pointer);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, slot, pos)) = self.slot {
                if pos < slot.len() {
                    let i = if self.reverse { slot.len() - 1 - pos } else { pos };
                    self.slot = Some((key, slot, pos + 1));
                    return Some((key, &slot[i]));
                }
                self.slot = None;
            }
            let (key, slot) = self.advance()?;
            self.slot = Some((key, slot, 0));
        }
    }
}
