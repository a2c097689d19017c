//! Ordered index — probabilistic skip list with rank support
//!
//! Nodes live in a single arena (`Vec<Node>`) and link to each other by
//! index instead of by heap pointer. The head is not an arena slot: its
//! levels are stored inline and addressed as position `None`.
//!
//! Each level link carries a `span`, the number of level-0 steps it covers,
//! which gives O(log n) `rank` and `by_rank`. Level 0 also keeps a backward
//! link for reverse iteration and O(1) access to the tail.
//!
//! Keys are unique. `insert` on an existing key replaces the value in place
//! and leaves the node where it is.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Maximum tower height; enough for 4^64 entries at p = 0.25
pub const MAX_LEVEL: usize = 64;

/// Level promotion probability
pub const P: f64 = 0.25;

/// A link from a node (or the head) to its successor at one level.
#[derive(Debug, Clone, Copy, Default)]
struct Level {
    forward: Option<usize>,
    span: usize,
}

struct Node<K, V> {
    key: K,
    value: V,
    backward: Option<usize>,
    levels: Vec<Level>,
}

/// Bounds for `first_in_range` / `last_in_range`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange<K> {
    pub min: K,
    pub max: K,
    pub exclude_min: bool,
    pub exclude_max: bool,
}

impl<K: Ord> KeyRange<K> {
    /// `[min, max]`
    pub fn inclusive(min: K, max: K) -> Self {
        Self { min, max, exclude_min: false, exclude_max: false }
    }

    /// `[min, max)`
    pub fn half_open(min: K, max: K) -> Self {
        Self { min, max, exclude_min: false, exclude_max: true }
    }

    /// True if `key` satisfies the lower bound.
    pub fn gte_min(&self, key: &K) -> bool {
        if self.exclude_min { *key > self.min } else { *key >= self.min }
    }

    /// True if `key` satisfies the upper bound.
    pub fn lte_max(&self, key: &K) -> bool {
        if self.exclude_max { *key < self.max } else { *key <= self.max }
    }

    /// True if `key` lies inside both bounds.
    pub fn contains(&self, key: &K) -> bool {
        self.gte_min(key) && self.lte_max(key)
    }

    /// False for `min > max`, or `min == max` with either bound excluded.
    pub fn is_valid(&self) -> bool {
        if self.min > self.max {
            return false;
        }
        if self.min == self.max && (self.exclude_min || self.exclude_max) {
            return false;
        }
        true
    }
}

/// Skip list mapping ordered keys to values.
pub struct SkipList<K, V> {
    head: Vec<Level>,
    nodes: Vec<Node<K, V>>,
    tail: Option<usize>,
    level: usize,
    rng: StdRng,
}

impl<K: Ord, V> SkipList<K, V> {
    /// Empty list seeded from OS entropy.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Empty list with a deterministic level sequence.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            head: vec![Level::default(); MAX_LEVEL],
            nodes: Vec::new(),
            tail: None,
            level: 1,
            rng,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the list holds no entries.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current tower height of the list.
    pub fn height(&self) -> usize {
        self.level
    }

    /// Remove every entry. Keeps the RNG state.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head.iter_mut().for_each(|l| *l = Level::default());
        self.tail = None;
        self.level = 1;
    }

    fn levels(&self, pos: Option<usize>) -> &[Level] {
        match pos {
            None => &self.head,
            Some(idx) => &self.nodes[idx].levels,
        }
    }

    fn levels_mut(&mut self, pos: Option<usize>) -> &mut [Level] {
        match pos {
            None => &mut self.head,
            Some(idx) => &mut self.nodes[idx].levels,
        }
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen::<f64>() < P {
            level += 1;
        }
        level
    }

    /// Predecessor of `key` at each level: the last position whose
    /// successor is not strictly below `key`.
    fn find_update(&self, key: &K) -> [Option<usize>; MAX_LEVEL] {
        let mut update = [None; MAX_LEVEL];
        let mut cur = None;
        for i in (0..self.level).rev() {
            while let Some(next) = self.levels(cur)[i].forward {
                if self.nodes[next].key < *key {
                    cur = Some(next);
                } else {
                    break;
                }
            }
            update[i] = cur;
        }
        update
    }

    fn find_node(&self, key: &K) -> Option<usize> {
        let update = self.find_update(key);
        let candidate = self.levels(update[0])[0].forward?;
        if self.nodes[candidate].key == *key { Some(candidate) } else { None }
    }

    /// Insert `key`, or overwrite its value if already present.
    /// Returns the previous value on overwrite.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let mut update = [None; MAX_LEVEL];
        let mut rank = [0usize; MAX_LEVEL];

        let mut cur = None;
        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(next) = self.levels(cur)[i].forward {
                if self.nodes[next].key < key {
                    rank[i] += self.levels(cur)[i].span;
                    cur = Some(next);
                } else {
                    break;
                }
            }
            update[i] = cur;
        }

        if let Some(next) = self.levels(cur)[0].forward {
            if self.nodes[next].key == key {
                return Some(std::mem::replace(&mut self.nodes[next].value, value));
            }
        }

        let level = self.random_level();
        if level > self.level {
            let len = self.len();
            for i in self.level..level {
                rank[i] = 0;
                update[i] = None;
                self.head[i].span = len;
            }
            self.level = level;
        }

        let idx = self.nodes.len();
        let mut levels = Vec::with_capacity(level);
        for i in 0..level {
            let pred = self.levels(update[i])[i];
            levels.push(Level {
                forward: pred.forward,
                span: pred.span - (rank[0] - rank[i]),
            });
            let pred = &mut self.levels_mut(update[i])[i];
            pred.forward = Some(idx);
            pred.span = rank[0] - rank[i] + 1;
        }
        for i in level..self.level {
            self.levels_mut(update[i])[i].span += 1;
        }

        let successor = levels[0].forward;
        self.nodes.push(Node { key, value, backward: update[0], levels });

        match successor {
            Some(next) => self.nodes[next].backward = Some(idx),
            None => self.tail = Some(idx),
        }
        None
    }

    /// Remove `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let update = self.find_update(key);
        let target = self.levels(update[0])[0].forward?;
        if self.nodes[target].key != *key {
            return None;
        }
        self.unlink(&update, target);
        Some(self.release(target))
    }

    fn unlink(&mut self, update: &[Option<usize>; MAX_LEVEL], target: usize) {
        for i in 0..self.level {
            let target_level = self.nodes[target].levels.get(i).copied();
            let pred = &mut self.levels_mut(update[i])[i];
            match target_level {
                Some(tl) if pred.forward == Some(target) => {
                    pred.span = pred.span + tl.span - 1;
                    pred.forward = tl.forward;
                }
                _ => pred.span -= 1,
            }
        }

        let backward = self.nodes[target].backward;
        match self.nodes[target].levels[0].forward {
            Some(next) => self.nodes[next].backward = backward,
            None => self.tail = backward,
        }

        while self.level > 1 && self.head[self.level - 1].forward.is_none() {
            self.level -= 1;
        }
    }

    /// Free an unlinked arena slot. The last arena node moves into the
    /// freed slot, so every link to it is rewritten first.
    fn release(&mut self, slot: usize) -> V {
        let last = self.nodes.len() - 1;
        if slot != last {
            let update = self.find_update_by_index(last);
            for i in 0..self.nodes[last].levels.len() {
                let pred = &mut self.levels_mut(update[i])[i];
                if pred.forward == Some(last) {
                    pred.forward = Some(slot);
                }
            }
            match self.nodes[last].levels[0].forward {
                Some(next) => self.nodes[next].backward = Some(slot),
                None => self.tail = Some(slot),
            }
        }
        self.nodes.swap_remove(slot).value
    }

    fn find_update_by_index(&self, idx: usize) -> [Option<usize>; MAX_LEVEL] {
        let mut update = [None; MAX_LEVEL];
        let mut cur = None;
        for i in (0..self.level).rev() {
            while let Some(next) = self.levels(cur)[i].forward {
                if self.nodes[next].key < self.nodes[idx].key {
                    cur = Some(next);
                } else {
                    break;
                }
            }
            update[i] = cur;
        }
        update
    }

    /// Value for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.find_node(key).map(|idx| &self.nodes[idx].value)
    }

    /// Mutable value for `key`. The key itself cannot change.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = self.find_node(key)?;
        Some(&mut self.nodes[idx].value)
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.find_node(key).is_some()
    }

    /// Smallest entry.
    pub fn first(&self) -> Option<(&K, &V)> {
        self.head[0].forward.map(|idx| self.entry(idx))
    }

    /// Largest entry.
    pub fn last(&self) -> Option<(&K, &V)> {
        self.tail.map(|idx| self.entry(idx))
    }

    fn entry(&self, idx: usize) -> (&K, &V) {
        let node = &self.nodes[idx];
        (&node.key, &node.value)
    }

    /// Quick rejection of ranges that cannot match anything.
    fn may_intersect(&self, range: &KeyRange<K>) -> bool {
        if !range.is_valid() {
            return false;
        }
        match (self.first(), self.last()) {
            (Some((first, _)), Some((last, _))) => range.gte_min(last) && range.lte_max(first),
            _ => false,
        }
    }

    /// Smallest entry inside `range`.
    pub fn first_in_range(&self, range: &KeyRange<K>) -> Option<(&K, &V)> {
        if !self.may_intersect(range) {
            return None;
        }
        let mut cur = None;
        for i in (0..self.level).rev() {
            while let Some(next) = self.levels(cur)[i].forward {
                if range.gte_min(&self.nodes[next].key) {
                    break;
                }
                cur = Some(next);
            }
        }
        let candidate = self.levels(cur)[0].forward?;
        if range.lte_max(&self.nodes[candidate].key) {
            Some(self.entry(candidate))
        } else {
            None
        }
    }

    /// Largest entry inside `range`.
    pub fn last_in_range(&self, range: &KeyRange<K>) -> Option<(&K, &V)> {
        if !self.may_intersect(range) {
            return None;
        }
        let mut cur = None;
        for i in (0..self.level).rev() {
            while let Some(next) = self.levels(cur)[i].forward {
                if !range.lte_max(&self.nodes[next].key) {
                    break;
                }
                cur = Some(next);
            }
        }
        let candidate = cur?;
        if range.gte_min(&self.nodes[candidate].key) {
            Some(self.entry(candidate))
        } else {
            None
        }
    }

    /// 1-based position of `key`, or 0 if absent.
    pub fn rank(&self, key: &K) -> usize {
        let mut rank = 0;
        let mut cur = None;
        for i in (0..self.level).rev() {
            while let Some(next) = self.levels(cur)[i].forward {
                if self.nodes[next].key <= *key {
                    rank += self.levels(cur)[i].span;
                    cur = Some(next);
                } else {
                    break;
                }
            }
            if let Some(idx) = cur {
                if self.nodes[idx].key == *key {
                    return rank;
                }
            }
        }
        0
    }

    /// Entry at 1-based position `rank`.
    pub fn by_rank(&self, rank: usize) -> Option<(&K, &V)> {
        if rank == 0 || rank > self.len() {
            return None;
        }
        let mut traversed = 0;
        let mut cur = None;
        for i in (0..self.level).rev() {
            while let Some(next) = self.levels(cur)[i].forward {
                let span = self.levels(cur)[i].span;
                if traversed + span > rank {
                    break;
                }
                traversed += span;
                cur = Some(next);
            }
            if traversed == rank {
                return cur.map(|idx| self.entry(idx));
            }
        }
        None
    }

    /// Ascending iterator. Each call starts from the smallest key.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter { list: self, next: self.head[0].forward, reverse: false }
    }

    /// Descending iterator. Each call starts from the largest key.
    pub fn iter_rev(&self) -> Iter<'_, K, V> {
        Iter { list: self, next: self.tail, reverse: true }
    }

    /// Ascending iterator starting at the first key inside `range` and
    /// stopping after its upper bound.
    pub fn range(&self, range: KeyRange<K>) -> RangeIter<'_, K, V> {
        let start = if self.may_intersect(&range) {
            let mut cur = None;
            for i in (0..self.level).rev() {
                while let Some(next) = self.levels(cur)[i].forward {
                    if range.gte_min(&self.nodes[next].key) {
                        break;
                    }
                    cur = Some(next);
                }
            }
            self.levels(cur)[0].forward
        } else {
            None
        };
        RangeIter { inner: Iter { list: self, next: start, reverse: false }, range }
    }
}

impl<K: Ord, V> Default for SkipList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for SkipList<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipList")
            .field("len", &self.nodes.len())
            .field("level", &self.level)
            .finish()
    }
}

/// Lazy ordered walk over a skip list.
pub struct Iter<'a, K, V> {
    list: &'a SkipList<K, V>,
    next: Option<usize>,
    reverse: bool,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let node = &self.list.nodes[idx];
        self.next = if self.reverse { node.backward } else { node.levels[0].forward };
        Some((&node.key, &node.value))
    }
}

/// Ascending walk bounded by a `KeyRange`.
pub struct RangeIter<'a, K, V> {
    inner: Iter<'a, K, V>,
    range: KeyRange<K>,
}

impl<'a, K: Ord, V> Iterator for RangeIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let (k, v) = self.inner.next()?;
        if self.range.lte_max(k) {
            Some((k, v))
        } else {
            self.inner.next = None;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn keys<V>(list: &SkipList<u32, V>) -> Vec<u32> {
        list.iter().map(|(k, _)| *k).collect()
    }

    #[test]
    fn test_insert_get_overwrite() {
        let mut list = SkipList::with_seed(1);
        for k in ["03", "01", "04", "10", "08", "02"] {
            assert!(list.insert(k.to_string(), k.len()).is_none());
        }
        assert_eq!(list.insert("08".to_string(), 88), Some(2));
        assert_eq!(list.len(), 6);
        assert_eq!(list.get(&"08".to_string()), Some(&88));
        assert_eq!(list.get(&"06".to_string()), None);

        let ordered: Vec<&str> = list.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(ordered, ["01", "02", "03", "04", "08", "10"]);
    }

    #[test]
    fn test_remove_missing_and_present() {
        let mut list: SkipList<u32, u32> = SkipList::with_seed(2);
        assert_eq!(list.remove(&3), None);
        list.insert(3, 30);
        assert_eq!(list.remove(&3), Some(30));
        assert!(list.is_empty());
        assert!(list.first().is_none());
        assert!(list.last().is_none());

        list.insert(1, 10);
        list.insert(2, 20);
        assert_eq!(list.remove(&5), None);
        assert_eq!(list.remove(&1), Some(10));
        assert_eq!(keys(&list), vec![2]);
        assert_eq!(list.last(), Some((&2, &20)));
    }

    #[test]
    fn test_reverse_iteration_and_restart() {
        let mut list = SkipList::with_seed(3);
        for k in [5u32, 1, 9, 3, 7] {
            list.insert(k, ());
        }
        let rev: Vec<u32> = list.iter_rev().map(|(k, _)| *k).collect();
        assert_eq!(rev, vec![9, 7, 5, 3, 1]);

        // Restartable: a fresh iterator walks from the start again
        let mut it = list.iter();
        it.next();
        it.next();
        assert_eq!(keys(&list), vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_range_queries() {
        let mut list = SkipList::with_seed(4);
        for k in [10u32, 20, 30, 40, 50] {
            list.insert(k, k * 10);
        }

        let r = KeyRange::inclusive(15, 45);
        assert_eq!(list.first_in_range(&r), Some((&20, &200)));
        assert_eq!(list.last_in_range(&r), Some((&40, &400)));

        let r = KeyRange { min: 20, max: 40, exclude_min: true, exclude_max: true };
        assert_eq!(list.first_in_range(&r).map(|(k, _)| *k), Some(30));
        assert_eq!(list.last_in_range(&r).map(|(k, _)| *k), Some(30));

        let r = KeyRange::half_open(0, 10);
        assert!(list.first_in_range(&r).is_none());
        assert!(list.last_in_range(&r).is_none());

        // Gaps between keys
        assert!(list.first_in_range(&KeyRange::inclusive(21, 29)).is_none());
        assert!(list.last_in_range(&KeyRange::inclusive(21, 29)).is_none());

        // Beyond both ends
        assert!(list.first_in_range(&KeyRange::inclusive(60, 70)).is_none());
        assert_eq!(list.last_in_range(&KeyRange::inclusive(0, 1000)).map(|(k, _)| *k), Some(50));

        let bounded: Vec<u32> = list.range(KeyRange::inclusive(20, 40)).map(|(k, _)| *k).collect();
        assert_eq!(bounded, vec![20, 30, 40]);
    }

    #[test]
    fn test_invalid_ranges_short_circuit() {
        let mut list = SkipList::with_seed(5);
        list.insert(5u32, ());

        assert!(!KeyRange::inclusive(9, 1).is_valid());
        assert!(list.first_in_range(&KeyRange::inclusive(9, 1)).is_none());

        let r = KeyRange { min: 5, max: 5, exclude_min: true, exclude_max: true };
        assert!(!r.is_valid());
        assert!(list.last_in_range(&r).is_none());

        assert_eq!(list.first_in_range(&KeyRange::inclusive(5, 5)).map(|(k, _)| *k), Some(5));

        let empty: SkipList<u32, ()> = SkipList::with_seed(6);
        assert!(empty.first_in_range(&KeyRange::inclusive(0, 10)).is_none());
        assert_eq!(empty.range(KeyRange::inclusive(0, 10)).count(), 0);
    }

    #[test]
    fn test_rank_and_by_rank() {
        let mut list = SkipList::with_seed(7);
        for k in [40u32, 10, 30, 20] {
            list.insert(k, ());
        }
        assert_eq!(list.rank(&10), 1);
        assert_eq!(list.rank(&20), 2);
        assert_eq!(list.rank(&40), 4);
        assert_eq!(list.rank(&25), 0);

        assert_eq!(list.by_rank(3).map(|(k, _)| *k), Some(30));
        assert!(list.by_rank(0).is_none());
        assert!(list.by_rank(5).is_none());
    }

    #[test]
    fn test_clear() {
        let mut list = SkipList::with_seed(8);
        for k in 0..100u32 {
            list.insert(k, k);
        }
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.height(), 1);
        list.insert(7, 7);
        assert_eq!(keys(&list), vec![7]);
    }

    #[test]
    fn test_get_mut() {
        let mut list = SkipList::with_seed(9);
        list.insert(1u32, vec![1u8]);
        if let Some(v) = list.get_mut(&1) {
            v.push(2);
        }
        assert_eq!(list.get(&1), Some(&vec![1u8, 2]));
        assert!(list.get_mut(&2).is_none());
    }

    /// Random insert/remove sequences checked against a BTreeMap model.
    #[test]
    fn test_matches_btreemap_model() {
        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut list = SkipList::with_seed(seed ^ 0xdead_beef);
            let mut model = BTreeMap::new();

            for step in 0..2000u32 {
                let key = rng.gen_range(0..300u32);
                if rng.gen_bool(0.35) {
                    assert_eq!(list.remove(&key), model.remove(&key), "seed {} step {}", seed, step);
                } else {
                    assert_eq!(list.insert(key, step), model.insert(key, step), "seed {} step {}", seed, step);
                }
            }

            assert_eq!(list.len(), model.len());
            let forward: Vec<(u32, u32)> = list.iter().map(|(k, v)| (*k, *v)).collect();
            let expected: Vec<(u32, u32)> = model.iter().map(|(k, v)| (*k, *v)).collect();
            assert_eq!(forward, expected);

            let mut backward: Vec<(u32, u32)> = list.iter_rev().map(|(k, v)| (*k, *v)).collect();
            backward.reverse();
            assert_eq!(backward, expected);

            for (pos, key) in model.keys().enumerate() {
                assert_eq!(list.rank(key), pos + 1);
                assert_eq!(list.by_rank(pos + 1).map(|(k, _)| *k), Some(*key));
            }
            for absent in 0..300u32 {
                if !model.contains_key(&absent) {
                    assert_eq!(list.rank(&absent), 0);
                }
            }

            for _ in 0..200 {
                let a = rng.gen_range(0..320u32);
                let b = rng.gen_range(0..320u32);
                let (lo, hi) = (a.min(b), a.max(b));
                let r = KeyRange::inclusive(lo, hi);
                assert_eq!(list.first_in_range(&r).map(|(k, _)| *k), model.range(lo..=hi).next().map(|(k, _)| *k));
                assert_eq!(
                    list.last_in_range(&r).map(|(k, _)| *k),
                    model.range(lo..=hi).next_back().map(|(k, _)| *k)
                );
                let walked: Vec<u32> = list.range(KeyRange::inclusive(lo, hi)).map(|(k, _)| *k).collect();
                let modeled: Vec<u32> = model.range(lo..=hi).map(|(k, _)| *k).collect();
                assert_eq!(walked, modeled);
            }
        }
    }
}
