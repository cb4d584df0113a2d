//! Bounded in-memory LRU tier.
//!
//! Nodes live in a slab (`Vec<Node>`) linked into a doubly-linked recency list by
//! index, so lookups, promotions and evictions are all O(1). The tier itself is not
//! synchronized; `InferenceCache` wraps it in a mutex.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

struct Node {
    key: String,
    entry: MemoryEntry,
    prev: usize,
    next: usize,
}

pub struct MemoryLru {
    capacity: usize,
    index: HashMap<String, usize>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used; evicted first.
    tail: usize,
}

impl MemoryLru {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns a clone of the entry and marks it most recently used.
    pub fn get(&mut self, key: &str) -> Option<MemoryEntry> {
        let idx = *self.index.get(key)?;
        self.detach(idx);
        self.push_front(idx);
        Some(self.nodes[idx].entry.clone())
    }

    /// Inserts or replaces an entry. Returns the key evicted to make room, if any.
    pub fn insert(&mut self, key: String, entry: MemoryEntry) -> Option<String> {
        if self.capacity == 0 {
            return None;
        }

        if let Some(&idx) = self.index.get(&key) {
            self.nodes[idx].entry = entry;
            self.detach(idx);
            self.push_front(idx);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.pop_back()
        } else {
            None
        };

        let node = Node {
            key: key.clone(),
            entry,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<MemoryEntry> {
        let idx = self.index.remove(key)?;
        self.detach(idx);
        self.free.push(idx);
        Some(self.nodes[idx].entry.clone())
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn pop_back(&mut self) -> Option<String> {
        if self.tail == NIL {
            return None;
        }
        let idx = self.tail;
        self.detach(idx);
        let key = std::mem::take(&mut self.nodes[idx].key);
        self.index.remove(&key);
        self.free.push(idx);
        Some(key)
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else if self.head == idx {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else if self.tail == idx {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(value: &str) -> MemoryEntry {
        MemoryEntry {
            value: value.to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn test_get_returns_inserted_value() {
        let mut lru = MemoryLru::new(2);
        lru.insert("a".into(), entry("1"));
        assert_eq!(lru.get("a").map(|e| e.value), Some("1".to_string()));
        assert!(lru.get("missing").is_none());
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut lru = MemoryLru::new(2);
        lru.insert("a".into(), entry("1"));
        lru.insert("b".into(), entry("2"));
        // Touch "a" so "b" becomes the LRU tail.
        lru.get("a");
        let evicted = lru.insert("c".into(), entry("3"));
        assert_eq!(evicted.as_deref(), Some("b"));
        assert!(lru.get("b").is_none());
        assert!(lru.get("a").is_some());
        assert!(lru.get("c").is_some());
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_replacing_existing_key_does_not_evict() {
        let mut lru = MemoryLru::new(2);
        lru.insert("a".into(), entry("1"));
        lru.insert("b".into(), entry("2"));
        assert!(lru.insert("a".into(), entry("updated")).is_none());
        assert_eq!(lru.get("a").unwrap().value, "updated");
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_removed_slots_are_reused() {
        let mut lru = MemoryLru::new(3);
        lru.insert("a".into(), entry("1"));
        lru.insert("b".into(), entry("2"));
        assert!(lru.remove("a").is_some());
        lru.insert("c".into(), entry("3"));
        lru.insert("d".into(), entry("4"));
        assert_eq!(lru.len(), 3);
        assert!(lru.nodes.len() <= 3, "freed slot should be reused");
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let mut lru = MemoryLru::new(0);
        assert!(lru.insert("a".into(), entry("1")).is_none());
        assert!(lru.get("a").is_none());
    }

    #[test]
    fn test_clear_empties_tier() {
        let mut lru = MemoryLru::new(4);
        lru.insert("a".into(), entry("1"));
        lru.insert("b".into(), entry("2"));
        lru.clear();
        assert_eq!(lru.len(), 0);
        assert!(lru.get("a").is_none());
        lru.insert("c".into(), entry("3"));
        assert!(lru.get("c").is_some());
    }

    #[test]
    fn test_expiry_check() {
        let past = MemoryEntry {
            value: "v".into(),
            expires_at: Utc::now() - Duration::seconds(1),
        };
        assert!(past.is_expired(Utc::now()));
        assert!(!entry("v").is_expired(Utc::now()));
    }
}
