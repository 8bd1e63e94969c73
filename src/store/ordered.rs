// src/store/ordered.rs - Insertion-ordered map: arena-backed doubly linked list + hash index

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
}

/// Invariants: every live arena slot is reachable from `head` exactly once,
/// `index[key]` points at the slot holding `key`, and `free` lists only
/// empty slots. `links` always has the same length as `slots`.
#[derive(Debug)]
pub struct OrderedMap<S, V> {
    slots: Vec<Option<(S, V)>>,
    links: Vec<Link>,
    free: Vec<usize>,
    index: HashMap<S, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<S: Hash + Eq + Clone, V> Default for OrderedMap<S, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Hash + Eq + Clone, V> OrderedMap<S, V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            links: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &S) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &S) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_ref().map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &S) -> Option<&mut V> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_mut().map(|(_, v)| v)
    }

    fn unlink(&mut self, idx: usize) {
        let Link { prev, next } = self.links[idx];
        match prev {
            Some(p) => self.links[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.links[n].prev = prev,
            None => self.tail = prev,
        }
        self.links[idx] = Link::default();
    }

    fn link_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        self.links[idx] = Link {
            prev: old_tail,
            next: None,
        };
        match old_tail {
            Some(t) => self.links[t].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    /// Insert or replace `key` and move it to the back. Returns the previous value.
    pub fn insert_back(&mut self, key: S, value: V) -> Option<V> {
        if let Some(&idx) = self.index.get(&key) {
            self.unlink(idx);
            self.link_back(idx);
            return self.slots[idx]
                .as_mut()
                .map(|(_, old)| std::mem::replace(old, value));
        }
        let entry = Some((key.clone(), value));
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = entry;
                idx
            }
            None => {
                self.slots.push(entry);
                self.links.push(Link::default());
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.link_back(idx);
        None
    }

    pub fn move_to_back(&mut self, key: &S) -> bool {
        match self.index.get(key).copied() {
            Some(idx) => {
                if self.tail != Some(idx) {
                    self.unlink(idx);
                    self.link_back(idx);
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &S) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.unlink(idx);
        self.free.push(idx);
        self.slots[idx].take().map(|(_, v)| v)
    }

    pub fn pop_front(&mut self) -> Option<(S, V)> {
        let idx = self.head?;
        self.unlink(idx);
        self.free.push(idx);
        let (key, value) = self.slots[idx].take()?;
        self.index.remove(&key);
        Some((key, value))
    }

    pub fn front(&self) -> Option<(&S, &V)> {
        let idx = self.head?;
        self.slots[idx].as_ref().map(|(k, v)| (k, v))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.links.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    pub fn keys(&self) -> impl Iterator<Item = &S> + '_ {
        self.iter().map(|(k, _)| k)
    }

    /// Front (oldest) to back (newest)
    pub fn iter(&self) -> Iter<'_, S, V> {
        Iter {
            map: self,
            cursor: self.head,
            back: false,
        }
    }

    /// Back (newest) to front (oldest)
    pub fn iter_rev(&self) -> Iter<'_, S, V> {
        Iter {
            map: self,
            cursor: self.tail,
            back: true,
        }
    }
}

pub struct Iter<'a, S, V> {
    map: &'a OrderedMap<S, V>,
    cursor: Option<usize>,
    back: bool,
}

impl<'a, S, V> Iterator for Iter<'a, S, V> {
    type Item = (&'a S, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let (key, value) = self.map.slots[idx].as_ref()?;
        let link = self.map.links[idx];
        self.cursor = if self.back { link.prev } else { link.next };
        Some((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(map: &OrderedMap<&'static str, u32>) -> Vec<&'static str> {
        map.keys().copied().collect()
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut map = OrderedMap::new();
        map.insert_back("a", 1);
        map.insert_back("b", 2);
        map.insert_back("c", 3);
        assert_eq!(keys(&map), vec!["a", "b", "c"]);

        map.remove(&"b");
        assert_eq!(keys(&map), vec!["a", "c"]);

        map.insert_back("d", 4);
        assert_eq!(keys(&map), vec!["a", "c", "d"]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_reinsert_moves_to_back() {
        let mut map = OrderedMap::new();
        map.insert_back("a", 1);
        map.insert_back("b", 2);
        assert_eq!(map.insert_back("a", 10), Some(1));
        assert_eq!(keys(&map), vec!["b", "a"]);
        let newest: Vec<&str> = map.iter_rev().map(|(k, _)| *k).collect();
        assert_eq!(newest, vec!["a", "b"]);
        assert_eq!(map.get(&"a"), Some(&10));

        assert!(map.move_to_back(&"b"));
        assert_eq!(keys(&map), vec!["a", "b"]);
        assert!(!map.move_to_back(&"zzz"));
    }

    #[test]
    fn test_pop_front_and_slot_reuse() {
        let mut map = OrderedMap::new();
        for (i, k) in ["a", "b", "c"].into_iter().enumerate() {
            map.insert_back(k, i as u32);
        }
        assert_eq!(map.pop_front(), Some(("a", 0)));
        assert_eq!(map.front(), Some((&"b", &1)));
        map.insert_back("e", 9);
        assert_eq!(keys(&map), vec!["b", "c", "e"]);
        assert_eq!(map.slots.len(), 3);

        map.remove(&"c");
        map.remove(&"b");
        map.remove(&"e");
        assert!(map.is_empty());
        assert_eq!(map.pop_front(), None);
        assert_eq!(map.iter().count(), 0);
    }
}
