//! Lifecycle state shared between the manager and its probe responder
//!
//! Three independent flags:
//! - `started`: set once when the responder is accepting probe traffic
//! - `ready`: set by the application
//! - `shutting_down`: set once when the drain sequence begins
//!
//! `started` and `shutting_down` are monotonic. Every access is a single
//! sequentially consistent atomic operation, so no call blocks or allocates.

use std::sync::atomic::{AtomicBool, Ordering};

/// The three lifecycle flags
///
/// Constructed explicitly and passed around as `Arc<LifecycleState>`, so
/// independent managers in one process never share flags.
#[derive(Debug, Default)]
pub struct LifecycleState {
    started: AtomicBool,
    ready: AtomicBool,
    shutting_down: AtomicBool,
}

/// Point-in-time copy of [`LifecycleState`], pushed into responders
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    /// Responder is accepting probe traffic
    pub started: bool,
    /// Application reported ready
    pub ready: bool,
    /// Drain sequence has begun
    pub shutting_down: bool,
}

impl LifecycleState {
    /// All flags false
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the responder as started. Idempotent.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Set the application readiness flag
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Begin shutting down. Idempotent; returns `true` only for the call that flipped the flag.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    /// Whether the responder has started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether the application reported ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Whether the drain sequence has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Read all three flags
    pub fn snapshot(&self) -> LifecycleSnapshot {
        LifecycleSnapshot {
            started: self.is_started(),
            ready: self.is_ready(),
            shutting_down: self.is_shutting_down(),
        }
    }
}
