//! Bounded FIFO of recently freed blocks.
//!
//! One queue per *freeing* thread. Entries stay until the queue exceeds its
//! entry or byte budget; the oldest are then handed back to the heap, which
//! validates them before their blocks can be reused. The most recent entry is
//! never evicted, so a single oversized free still gets a quarantine window.

use std::collections::VecDeque;

use crate::heap::AllocId;

/// One quarantined block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantineEntry {
    pub id: AllocId,
    /// Block size charged against the byte budget.
    pub bytes: usize,
}

#[derive(Debug, Clone)]
pub struct Quarantine {
    queue: VecDeque<QuarantineEntry>,
    bytes: usize,
    max_entries: usize,
    max_bytes: usize,
}

impl Quarantine {
    #[must_use]
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            bytes: 0,
            max_entries: max_entries.max(1),
            max_bytes,
        }
    }

    /// Enqueue `entry` and return the entries pushed out, oldest first.
    pub fn push(&mut self, entry: QuarantineEntry) -> Vec<QuarantineEntry> {
        self.queue.push_back(entry);
        self.bytes += entry.bytes;
        let mut evicted = Vec::new();
        while self.queue.len() > 1
            && (self.queue.len() > self.max_entries || self.bytes > self.max_bytes)
        {
            let Some(old) = self.queue.pop_front() else {
                break;
            };
            self.bytes -= old.bytes;
            evicted.push(old);
        }
        evicted
    }

    /// Drop `id` from the queue without evicting it through the heap.
    pub fn remove(&mut self, id: AllocId) -> bool {
        match self.queue.iter().position(|e| e.id == id) {
            Some(pos) => {
                if let Some(e) = self.queue.remove(pos) {
                    self.bytes -= e.bytes;
                }
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, id: AllocId) -> bool {
        self.queue.iter().any(|e| e.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuarantineEntry> {
        self.queue.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadId;

    fn entry(serial: u64, bytes: usize) -> QuarantineEntry {
        QuarantineEntry {
            id: AllocId {
                thread: ThreadId(0),
                serial,
            },
            bytes,
        }
    }

    #[test]
    fn evicts_oldest_beyond_entry_budget() {
        let mut q = Quarantine::new(3, usize::MAX);
        for s in 0..3 {
            assert!(q.push(entry(s, 64)).is_empty());
        }
        let out = q.push(entry(3, 64));
        assert_eq!(out, vec![entry(0, 64)]);
        assert_eq!(q.len(), 3);
        assert_eq!(q.bytes(), 192);
    }

    #[test]
    fn byte_budget_keeps_newest_entry() {
        let mut q = Quarantine::new(100, 256);
        q.push(entry(0, 128));
        q.push(entry(1, 128));
        let out = q.push(entry(2, 1024));
        assert_eq!(out.len(), 2);
        assert!(q.contains(entry(2, 1024).id));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_updates_accounting() {
        let mut q = Quarantine::new(8, usize::MAX);
        q.push(entry(0, 64));
        q.push(entry(1, 128));
        assert!(q.remove(entry(0, 64).id));
        assert!(!q.remove(entry(0, 64).id));
        assert_eq!(q.bytes(), 128);
        assert_eq!(q.iter().count(), 1);
    }
}
