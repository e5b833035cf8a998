//! Session id allocation shared by every component of one run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::types::{IdempotencyKey, SessionId};

/// First sequence number used on a freshly minted session.
pub const FIRST_SEQUENCE: u64 = 1;

/// Hands out unique session ids. Clones share the same counter.
#[derive(Clone, Debug)]
pub struct SessionAllocator {
    next: Arc<AtomicU64>,
}

impl SessionAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(first)),
        }
    }

    pub fn next_session(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Fresh session paired with its first sequence number.
    pub fn next_key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.next_session(), FIRST_SEQUENCE)
    }
}

impl Default for SessionAllocator {
    fn default() -> Self {
        Self::new()
    }
}
