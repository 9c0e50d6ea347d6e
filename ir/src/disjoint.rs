//! Union–find with stable, insertion-ordered set reporting.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct DisjointSets<K: Hash + Eq + Clone> {
    index: HashMap<K, usize>,
    keys: Vec<K>,
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl<K: Hash + Eq + Clone> Default for DisjointSets<K> {
    fn default() -> Self {
        Self { index: HashMap::new(), keys: Vec::new(), parent: Vec::new(), size: Vec::new() }
    }
}

impl<K: Hash + Eq + Clone> DisjointSets<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, k: &K) -> bool {
        self.index.contains_key(k)
    }

    /// Ensure `k` exists, as a singleton if new.
    pub fn entry(&mut self, k: K) -> usize {
        if let Some(&i) = self.index.get(&k) {
            return i;
        }
        let i = self.parent.len();
        self.index.insert(k.clone(), i);
        self.keys.push(k);
        self.parent.push(i);
        self.size.push(1);
        i
    }

    fn find(&mut self, mut i: usize) -> usize {
        // Path halving.
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    pub fn union(&mut self, a: K, b: K) {
        let ia = self.entry(a);
        let ib = self.entry(b);
        let (mut ra, mut rb) = (self.find(ia), self.find(ib));
        if ra == rb {
            return;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
    }

    pub fn same_set(&mut self, a: &K, b: &K) -> bool {
        match (self.index.get(a).copied(), self.index.get(b).copied()) {
            (Some(ia), Some(ib)) => self.find(ia) == self.find(ib),
            _ => false,
        }
    }

    /// All members of `k`'s set, in insertion order.
    pub fn set_of(&mut self, k: &K) -> Vec<K> {
        let Some(&i) = self.index.get(k) else {
            return Vec::new();
        };
        let root = self.find(i);
        let mut members = Vec::new();
        for j in 0..self.keys.len() {
            if self.find(j) == root {
                members.push(self.keys[j].clone());
            }
        }
        members
    }

    /// All sets, each in insertion order, ordered by first member.
    pub fn sets(&mut self) -> Vec<Vec<K>> {
        let mut by_root: HashMap<usize, Vec<K>> = HashMap::new();
        let mut root_order = Vec::new();
        for j in 0..self.keys.len() {
            let root = self.find(j);
            let entry = by_root.entry(root).or_default();
            if entry.is_empty() {
                root_order.push(root);
            }
            entry.push(self.keys[j].clone());
        }
        root_order.into_iter().filter_map(|r| by_root.remove(&r)).collect()
    }
}
