//! In-flight guards serializing operations per server id.
//!
//! A driver owns one [`InFlight`] registry for its process lifetime. Guards
//! are plain in-memory markers: they only suppress redundant concurrent calls
//! and never represent durable state, so a crash-restart clearing them is
//! safe. The registry is the unit of mutual exclusion for a single
//! orchestrator process; multi-replica exclusion is out of scope here.

use crate::server::ServerId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// The guarded operation kinds. Start and stop hold distinct guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Start,
    Stop,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Start => write!(f, "start"),
            Op::Stop => write!(f, "stop"),
        }
    }
}

/// Outcome of trying to begin a guarded operation.
#[derive(Debug)]
pub enum BeginOutcome {
    /// The guard was acquired; it is released when the handle drops.
    Started(OpGuard),
    /// The same operation is already in flight for this id; the caller
    /// should no-op.
    AlreadyRunning,
    /// A different operation is in flight for this id; the caller should
    /// reject rather than race it.
    Conflict(Op),
}

/// Registry of operations currently in flight, keyed by `(server, op)`.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<Mutex<HashSet<(ServerId, Op)>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to begin `op` for `id`. Both the duplicate check and the conflict
    /// check happen under one lock so two callers cannot interleave between
    /// them.
    pub fn begin(&self, id: ServerId, op: Op) -> BeginOutcome {
        let mut set = self.inner.lock().expect("in-flight registry poisoned");
        if set.contains(&(id, op)) {
            return BeginOutcome::AlreadyRunning;
        }
        if let Some(&(_, other)) = set.iter().find(|(i, o)| *i == id && *o != op) {
            return BeginOutcome::Conflict(other);
        }
        set.insert((id, op));
        BeginOutcome::Started(OpGuard {
            registry: Arc::clone(&self.inner),
            key: (id, op),
        })
    }

    /// Whether `op` is currently in flight for `id`.
    pub fn contains(&self, id: ServerId, op: Op) -> bool {
        self.inner
            .lock()
            .expect("in-flight registry poisoned")
            .contains(&(id, op))
    }

    /// Whether any operation is in flight for `id`.
    pub fn busy(&self, id: ServerId) -> Option<Op> {
        self.inner
            .lock()
            .expect("in-flight registry poisoned")
            .iter()
            .find(|(i, _)| *i == id)
            .map(|&(_, op)| op)
    }
}

/// RAII marker for an in-flight operation; removing it on drop gives the
/// release-on-every-exit-path semantics the drivers rely on.
#[derive(Debug)]
pub struct OpGuard {
    registry: Arc<Mutex<HashSet<(ServerId, Op)>>>,
    key: (ServerId, Op),
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.registry.lock() {
            set.remove(&self.key);
        }
    }
}
