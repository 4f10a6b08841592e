//! Open-connection tracking
//!
//! The meek HTTP front keeps persistent client connections open between
//! requests; on shutdown every tracked connection must be force-closed so
//! the accept loop's exit is not held up by idle keep-alives.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio_util::sync::CancellationToken;

struct ConnSetState {
    conns: HashMap<u64, CancellationToken>,
    next_key: u64,
    stopped: bool,
}

/// The set of currently open connections' close handles
#[derive(Clone)]
pub struct ConnSet {
    state: Arc<Mutex<ConnSetState>>,
}

impl ConnSet {
    pub fn new() -> ConnSet {
        ConnSet {
            state: Arc::new(Mutex::new(ConnSetState {
                conns: HashMap::new(),
                next_key: 0,
                stopped: false,
            })),
        }
    }

    /// Registers a connection, returning a guard that unregisters it on
    /// drop. After [`close_all`](Self::close_all) the returned handle is
    /// already closed.
    pub fn add(&self) -> ConnGuard {
        let close = CancellationToken::new();
        let mut state = self.state.lock().unwrap();
        if state.stopped {
            close.cancel();
        }
        let key = state.next_key;
        state.next_key += 1;
        state.conns.insert(key, close.clone());
        ConnGuard {
            state: self.state.clone(),
            key,
            close,
        }
    }

    /// Force-closes every tracked connection and marks the set stopped
    pub fn close_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        for close in state.conns.values() {
            close.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnSet {
    fn default() -> ConnSet {
        ConnSet::new()
    }
}

pub struct ConnGuard {
    state: Arc<Mutex<ConnSetState>>,
    key: u64,
    close: CancellationToken,
}

impl ConnGuard {
    /// The connection's close handle; fires on shutdown
    pub fn close_handle(&self) -> CancellationToken {
        self.close.clone()
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.state.lock().unwrap().conns.remove(&self.key);
    }
}
