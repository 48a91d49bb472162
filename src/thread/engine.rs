// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The JWZ-style threading engine: a single deterministic pass that builds
//! a forest of [`Node`]s from a flat, ordered list of items.

use std::collections::HashMap;

use crate::primitives::arena::Arena;
use crate::thread::node::{Node, NodeId};
use crate::thread::subject::normalize;

/// Any record type the threading engine can build a tree over.
///
/// `lock`/`unlock` are modeled as [`ThreadableItem::with_locked`], a
/// default method most implementations never need to override.
pub trait ThreadableItem {
    fn uid(&self) -> &str;
    fn subject(&self) -> &str;
    fn message_id(&self) -> u64;
    fn references(&self) -> &[u64];
    fn date_sent(&self) -> i64;
    fn date_received(&self) -> i64;

    /// Runs `f` with this item "locked". The default just calls `f`
    /// directly; override if the concrete item type needs real locking
    /// while its accessors above are read.
    fn with_locked<R>(&self, f: impl FnOnce(&Self) -> R) -> R
    where
        Self: Sized,
    {
        f(self)
    }
}

/// Enables the two optional threading passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadConfig {
    /// Group root-level siblings that share a normalized subject.
    pub subject: bool,
    /// Sort every sibling chain by representative date, ties by order.
    pub sort: bool,
}

/// A pre-order `(depth, NodeId)` entry yielded by [`Thread::dump`].
pub struct DumpEntry {
    pub depth: usize,
    pub node: NodeId,
}

/// The forest built by threading a list of items.
pub struct Thread<T> {
    items: Vec<T>,
    nodes: Arena<Node>,
    roots_head: Option<NodeId>,
}

impl<T: ThreadableItem> Thread<T> {
    /// Builds a forest over `items` in a single deterministic pass.
    pub fn new(items: Vec<T>, config: ThreadConfig) -> Self {
        let mut thread = Self {
            nodes: Arena::with_batch_count((items.len() + 1).max(16)),
            items,
            roots_head: None,
        };
        thread.index();
        let roots = thread.collect_roots();
        let roots = thread.prune_siblings(roots, true);
        thread.set_root_chain(&roots);

        if config.subject {
            thread.group_by_subject();
        }
        if config.sort {
            let roots = thread.root_vec();
            let roots = thread.sort_recursive(roots);
            thread.set_root_chain(&roots);
        }

        thread.final_dummy_pass(config.sort);

        debug_assert!(
            thread.root_vec().iter().all(|&r| !(thread.node(r).is_empty()
                && thread.node(r).child.is_some()
                && thread.node(thread.node(r).child.unwrap()).next.is_none())),
            "a single-child dummy survived at the forest root"
        );
        debug_assert!(
            thread.root_vec().iter().all(|&r| thread.node(r).parent.is_none()),
            "every root's parent must be none"
        );

        thread
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(id)
    }

    // ---- pass 1: index ----------------------------------------------

    fn index(&mut self) {
        let mut id_table: HashMap<u64, NodeId> = HashMap::new();
        let mut no_id: Vec<NodeId> = Vec::new();

        for i in 0..self.items.len() {
            let order = (i + 1) as u32;
            let (mid, refs) = {
                let item = &self.items[i];
                (item.message_id(), item.references().to_vec())
            };

            let cur = if mid == 0 {
                let n = self.nodes.alloc(Node::real(i, order));
                no_id.push(n);
                n
            } else if let Some(&existing) = id_table.get(&mid) {
                if self.node(existing).is_empty() {
                    let node = self.node_mut(existing);
                    node.item = Some(i);
                    node.order = order;
                    existing
                } else {
                    log::debug!("duplicate message id on item {i}, demoting to id-less");
                    let n = self.nodes.alloc(Node::real(i, order));
                    no_id.push(n);
                    n
                }
            } else {
                let n = self.nodes.alloc(Node::real(i, order));
                id_table.insert(mid, n);
                n
            };

            self.link_references(cur, &refs, &mut id_table);
        }
    }

    fn link_references(&mut self, item_node: NodeId, refs: &[u64], id_table: &mut HashMap<u64, NodeId>) {
        let mut child = item_node;
        for &rid in refs.iter().rev() {
            let (rid_node, pre_existing) = match id_table.get(&rid) {
                Some(&id) => (id, true),
                None => {
                    let id = self.nodes.alloc(Node::dummy());
                    id_table.insert(rid, id);
                    (id, false)
                }
            };

            if rid_node == child || self.would_cycle(rid_node, child) {
                log::debug!("skipping reference link that would create a cycle");
                break;
            }

            if self.node(child).parent.is_none() {
                self.attach_child(rid_node, child);
            }

            if pre_existing {
                break;
            }
            child = rid_node;
        }
    }

    fn would_cycle(&self, rid_node: NodeId, child: NodeId) -> bool {
        let mut cur = Some(rid_node);
        let mut steps = 0usize;
        while let Some(c) = cur {
            if c == child {
                return true;
            }
            cur = self.node(c).parent;
            steps += 1;
            if steps > self.nodes.len() {
                return true;
            }
        }
        false
    }

    // ---- pass 2: collect roots ---------------------------------------

    fn collect_roots(&self) -> Vec<NodeId> {
        (0..self.nodes.len())
            .map(crate::primitives::arena::Id)
            .filter(|&id| self.node(id).parent.is_none())
            .collect()
    }

    // ---- pass 3 / 6a: prune empties -----------------------------------

    fn prune_siblings(&mut self, chain: Vec<NodeId>, at_root: bool) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(chain.len());
        for id in chain {
            let kids = self.children_vec(id);
            let kids = self.prune_siblings(kids, false);

            let is_empty = self.node(id).is_empty();
            if is_empty && kids.is_empty() {
                continue;
            }
            if is_empty && (!at_root || kids.len() == 1) {
                out.extend(kids);
                continue;
            }
            self.set_children(id, &kids);
            out.push(id);
        }
        out
    }

    // ---- pass 4: subject grouping --------------------------------------

    fn group_by_subject(&mut self) {
        let roots = self.root_vec();
        let mut table: HashMap<String, NodeId> = HashMap::new();
        let mut new_roots: Vec<NodeId> = Vec::new();

        for root in roots {
            let (subj, re) = normalize(self.representative_subject(root));
            {
                let node = self.node_mut(root);
                node.root_subject = Some(subj.clone());
                node.re = re;
            }

            if subj.is_empty() {
                new_roots.push(root);
                continue;
            }

            match table.get(&subj).copied() {
                None => {
                    table.insert(subj, root);
                    new_roots.push(root);
                }
                Some(existing) => {
                    let merged = self.merge_by_subject(existing, root);
                    table.insert(subj, merged);
                    if merged != existing {
                        if let Some(pos) = new_roots.iter().position(|&r| r == existing) {
                            new_roots[pos] = merged;
                        } else {
                            new_roots.push(merged);
                        }
                    }
                }
            }
        }

        self.set_root_chain(&new_roots);
    }

    fn representative_subject(&self, id: NodeId) -> &str {
        match self.node(id).item {
            Some(idx) => self.items[idx].subject(),
            None => match self.node(id).child {
                Some(child) => self.representative_subject(child),
                None => "",
            },
        }
    }

    fn merge_by_subject(&mut self, existing: NodeId, incoming: NodeId) -> NodeId {
        let existing_empty = self.node(existing).is_empty();
        let incoming_empty = self.node(incoming).is_empty();

        if existing_empty != incoming_empty {
            let (parent, child) = if existing_empty {
                (existing, incoming)
            } else {
                (incoming, existing)
            };
            self.attach_child(parent, child);
            log::debug!("subject-merged dummy/non-dummy root pair under {parent:?}");
            return parent;
        }

        if !existing_empty {
            let existing_re = self.node(existing).re;
            let incoming_re = self.node(incoming).re;
            if existing_re != incoming_re {
                let (established, reply) = if existing_re {
                    (incoming, existing)
                } else {
                    (existing, incoming)
                };
                if self.node(established).child.is_some() {
                    self.attach_child(established, reply);
                    log::debug!("subject-merged reply under established root {established:?}");
                    return established;
                }
            }
        }

        let parent = self.nodes.alloc(Node::dummy());
        self.node_mut(parent).synthesized_for_subject = true;
        let re = self.node(existing).re && self.node(incoming).re;
        self.node_mut(parent).re = re;
        self.attach_child(parent, existing);
        self.attach_child(parent, incoming);
        log::debug!("subject-merged two roots under synthesized dummy {parent:?}");
        parent
    }

    // ---- pass 5: sort ---------------------------------------------------

    fn representative(&self, id: NodeId) -> (i64, u32) {
        if let Some(cached) = self.node(id).rep_cache.get() {
            return cached;
        }
        let rep = match self.node(id).item {
            Some(idx) => {
                let item = &self.items[idx];
                let (ds, dr) = (item.date_sent(), item.date_received());
                let date = match (ds > 0, dr > 0) {
                    (true, true) => ds.min(dr),
                    (true, false) => ds,
                    (false, true) => dr,
                    (false, false) => i64::MAX,
                };
                (date, self.node(id).order)
            }
            None => match self.node(id).child {
                Some(child) => self.representative(child),
                None => (i64::MAX, u32::MAX),
            },
        };
        self.node(id).rep_cache.set(Some(rep));
        rep
    }

    fn sort_recursive(&mut self, mut chain: Vec<NodeId>) -> Vec<NodeId> {
        chain.sort_by_key(|&id| self.representative(id));
        for &id in &chain {
            let kids = self.children_vec(id);
            let kids = self.sort_recursive(kids);
            self.set_children(id, &kids);
        }
        chain
    }

    // ---- pass 6: final dummy promotion ----------------------------------

    fn final_dummy_pass(&mut self, sort_enabled: bool) {
        let roots = self.root_vec();
        let roots = self.prune_siblings(roots, true);
        self.set_root_chain(&roots);

        if sort_enabled {
            return;
        }

        let roots = self.root_vec();
        let mut final_roots = Vec::with_capacity(roots.len());
        for id in roots {
            let kids = self.children_vec(id);
            if self.node(id).is_empty() && kids.len() > 1 && !self.node(id).synthesized_for_subject {
                let best = kids
                    .iter()
                    .copied()
                    .min_by_key(|&k| self.representative(k))
                    .expect("kids.len() > 1");
                let rest: Vec<NodeId> = kids.into_iter().filter(|&k| k != best).collect();
                self.set_children(best, &rest);
                final_roots.push(best);
                log::debug!("swapped earliest child {best:?} into root dummy's position");
            } else {
                final_roots.push(id);
            }
        }
        self.set_root_chain(&final_roots);
    }

    // ---- linked-list helpers ---------------------------------------------

    fn children_vec(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.node(id).child;
        while let Some(c) = cur {
            out.push(c);
            cur = self.node(c).next;
        }
        out
    }

    fn root_vec(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.roots_head;
        while let Some(c) = cur {
            out.push(c);
            cur = self.node(c).next;
        }
        out
    }

    fn set_children(&mut self, owner: NodeId, kids: &[NodeId]) {
        for (i, &k) in kids.iter().enumerate() {
            self.node_mut(k).parent = Some(owner);
            self.node_mut(k).next = kids.get(i + 1).copied();
        }
        self.node_mut(owner).child = kids.first().copied();
    }

    fn set_root_chain(&mut self, roots: &[NodeId]) {
        for (i, &r) in roots.iter().enumerate() {
            self.node_mut(r).parent = None;
            self.node_mut(r).next = roots.get(i + 1).copied();
        }
        self.roots_head = roots.first().copied();
    }

    fn attach_child(&mut self, parent: NodeId, child: NodeId) {
        self.node_mut(child).parent = Some(parent);
        self.node_mut(child).next = None;
        match self.node(parent).child {
            None => self.node_mut(parent).child = Some(child),
            Some(mut cur) => {
                while let Some(next) = self.node(cur).next {
                    cur = next;
                }
                self.node_mut(cur).next = Some(child);
            }
        }
    }

    // ---- public navigation -------------------------------------------

    /// The first root of the sibling chain; walk with [`Thread::next_sibling`].
    #[must_use]
    pub fn get_tree(&self) -> Option<NodeId> {
        self.roots_head
    }

    /// The item backing `id`, or `None` for a dummy/phantom node.
    #[must_use]
    pub fn item(&self, id: NodeId) -> Option<&T> {
        self.node(id).item.map(|idx| &self.items[idx])
    }

    #[must_use]
    pub fn is_dummy(&self, id: NodeId) -> bool {
        self.node(id).is_empty()
    }

    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    #[must_use]
    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).child
    }

    #[must_use]
    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).next
    }

    #[must_use]
    pub fn root_subject(&self, id: NodeId) -> Option<&str> {
        self.node(id).root_subject.as_deref()
    }

    /// Total number of nodes in the forest (real items plus surviving
    /// dummies), for `dump()`'s node-count return value.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// A lazy, restartable pre-order walk over the forest (Design Notes §9
    /// "callback to stream").
    pub fn dump(&self) -> impl Iterator<Item = DumpEntry> + '_ {
        let mut stack: Vec<(usize, NodeId)> = self
            .root_vec()
            .into_iter()
            .rev()
            .map(|r| (0, r))
            .collect();
        std::iter::from_fn(move || {
            let (depth, id) = stack.pop()?;
            let mut child = self.node(id).child;
            let mut kids = Vec::new();
            while let Some(c) = child {
                kids.push((depth + 1, c));
                child = self.node(c).next;
            }
            kids.reverse();
            stack.extend(kids);
            Some(DumpEntry { depth, node: id })
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone)]
    struct Item {
        uid: String,
        subject: String,
        message_id: u64,
        references: Vec<u64>,
        date_sent: i64,
        date_received: i64,
    }

    impl ThreadableItem for Item {
        fn uid(&self) -> &str {
            &self.uid
        }
        fn subject(&self) -> &str {
            &self.subject
        }
        fn message_id(&self) -> u64 {
            self.message_id
        }
        fn references(&self) -> &[u64] {
            &self.references
        }
        fn date_sent(&self) -> i64 {
            self.date_sent
        }
        fn date_received(&self) -> i64 {
            self.date_received
        }
    }

    fn item(uid: &str, mid: u64, refs: &[u64], subject: &str, sent: i64) -> Item {
        Item {
            uid: uid.to_string(),
            subject: subject.to_string(),
            message_id: mid,
            references: refs.to_vec(),
            date_sent: sent,
            date_received: 0,
        }
    }

    fn chain_uids<T: ThreadableItem>(thread: &Thread<T>, start: NodeId) -> Vec<String>
    where
        T: Clone,
    {
        let mut out = Vec::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            out.push(thread.item(id).map(|i| i.uid().to_string()).unwrap_or_default());
            cur = thread.next_sibling(id);
        }
        out
    }

    #[test]
    fn e_c1_reference_chain_builds_grandchild() {
        let items = vec![
            item("A", 1, &[], "Hi", 10),
            item("B", 2, &[1], "Re: Hi", 20),
            item("C", 3, &[1, 2], "Re: Hi", 30),
        ];
        let thread = Thread::new(items, ThreadConfig { subject: false, sort: true });

        let root = thread.get_tree().expect("one root");
        assert!(thread.next_sibling(root).is_none());
        assert_eq!(thread.item(root).unwrap().uid(), "A");

        let child = thread.first_child(root).expect("A has a child");
        assert_eq!(thread.item(child).unwrap().uid(), "B");
        assert!(thread.next_sibling(child).is_none());

        let grandchild = thread.first_child(child).expect("B has a child");
        assert_eq!(thread.item(grandchild).unwrap().uid(), "C");
        assert!(thread.first_child(grandchild).is_none());
    }

    #[test]
    fn e_c2_subject_grouping_synthesizes_phantom_root() {
        let items = vec![
            item("A", 1, &[], "Design", 1),
            item("B", 2, &[], "Re: Design", 2),
        ];
        let thread = Thread::new(items, ThreadConfig { subject: true, sort: false });

        let root = thread.get_tree().expect("one root");
        assert!(thread.is_dummy(root));
        assert!(thread.next_sibling(root).is_none());

        let uids = chain_uids(&thread, thread.first_child(root).expect("phantom has children"));
        assert_eq!(uids, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn c1_every_real_item_appears_exactly_once() {
        let items = vec![
            item("A", 1, &[], "x", 1),
            item("B", 0, &[], "y", 2),
            item("C", 2, &[9], "z", 3),
        ];
        let count = items.len();
        let thread = Thread::new(items, ThreadConfig::default());

        let mut seen = std::collections::HashSet::new();
        for entry in thread.dump() {
            if let Some(it) = thread.item(entry.node) {
                assert!(seen.insert(it.uid().to_string()));
            }
        }
        assert_eq!(seen.len(), count);
    }

    #[test]
    fn c2_every_node_reaches_a_root_with_no_cycle() {
        let items = vec![item("A", 1, &[], "x", 1), item("B", 2, &[1], "y", 2)];
        let thread = Thread::new(items, ThreadConfig::default());

        for (id, _) in (0..thread.node_count()).map(|i| (crate::primitives::arena::Id(i), ())) {
            let mut cur = id;
            let mut steps = 0;
            while let Some(p) = thread.parent(cur) {
                cur = p;
                steps += 1;
                assert!(steps <= thread.node_count(), "cycle detected");
            }
        }
    }

    #[test]
    fn c3_sorted_siblings_are_date_ordered() {
        let items = vec![
            item("A", 0, &[], "x", 30),
            item("B", 0, &[], "y", 10),
            item("C", 0, &[], "z", 20),
        ];
        let thread = Thread::new(items, ThreadConfig { subject: false, sort: true });
        let root = thread.get_tree().unwrap();
        let uids = chain_uids(&thread, root);
        assert_eq!(uids, vec!["B".to_string(), "C".to_string(), "A".to_string()]);
    }

    #[test]
    fn c4_subject_off_keeps_same_subject_roots_separate() {
        let items = vec![item("A", 0, &[], "Hi", 1), item("B", 0, &[], "Hi", 2)];
        let thread = Thread::new(items, ThreadConfig { subject: false, sort: false });
        let root = thread.get_tree().unwrap();
        let uids = chain_uids(&thread, root);
        assert_eq!(uids, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn duplicate_message_id_demotes_to_id_less_root() {
        let items = vec![item("A", 1, &[], "x", 1), item("B", 1, &[], "y", 2)];
        let thread = Thread::new(items, ThreadConfig::default());
        let roots = {
            let mut v = Vec::new();
            let mut cur = thread.get_tree();
            while let Some(id) = cur {
                v.push(thread.item(id).unwrap().uid().to_string());
                cur = thread.next_sibling(id);
            }
            v
        };
        assert_eq!(roots.len(), 2);
        assert!(roots.contains(&"A".to_string()));
        assert!(roots.contains(&"B".to_string()));
    }
}
