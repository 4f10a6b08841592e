//! LRU tracking for closeable connections
//!
//! A linked LRU of close handles with O(1) touch and close-oldest. Entries
//! self-remove on natural close; close-oldest only signals the owner, which
//! performs its own cleanup asynchronously.

use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio_util::sync::CancellationToken;

struct LruState {
    entries: LruCache<u64, CancellationToken>,
    next_key: u64,
}

/// A set of connections ordered by last activity
#[derive(Clone)]
pub struct LruConns {
    state: Arc<Mutex<LruState>>,
}

impl LruConns {
    pub fn new() -> LruConns {
        LruConns {
            state: Arc::new(Mutex::new(LruState {
                entries: LruCache::unbounded(),
                next_key: 0,
            })),
        }
    }

    /// Registers a connection's close handle as the most recently used entry
    pub fn add(&self, close: CancellationToken) -> LruEntry {
        let mut state = self.state.lock().unwrap();
        let key = state.next_key;
        state.next_key += 1;
        state.entries.push(key, close);
        LruEntry {
            state: self.state.clone(),
            key,
        }
    }

    /// Signals close on the least recently used connection and drops its
    /// entry. The connection's owner completes cleanup asynchronously.
    pub fn close_oldest(&self) {
        let oldest = self.state.lock().unwrap().entries.pop_lru();
        if let Some((_, close)) = oldest {
            close.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LruConns {
    fn default() -> LruConns {
        LruConns::new()
    }
}

/// Handle to one entry in a [`LruConns`]
pub struct LruEntry {
    state: Arc<Mutex<LruState>>,
    key: u64,
}

impl LruEntry {
    /// Marks the connection as the most recently used
    pub fn touch(&self) {
        self.state.lock().unwrap().entries.get(&self.key);
    }

    /// Removes the entry; called by the connection's owner when it closes
    pub fn remove(&self) {
        self.state.lock().unwrap().entries.pop(&self.key);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_close_oldest_order() {
        let conns = LruConns::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        let _first_entry = conns.add(first.clone());
        let _second_entry = conns.add(second.clone());

        conns.close_oldest();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(conns.len(), 1);
    }

    #[test]
    fn test_touch_promotes() {
        let conns = LruConns::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        let first_entry = conns.add(first.clone());
        let _second_entry = conns.add(second.clone());

        first_entry.touch();
        conns.close_oldest();
        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_remove_skips_entry() {
        let conns = LruConns::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        let first_entry = conns.add(first.clone());
        let _second_entry = conns.add(second.clone());

        first_entry.remove();
        conns.close_oldest();
        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(conns.is_empty());
    }
}
