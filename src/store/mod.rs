// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable task store.
//!
//! One SQLite database holds four tables:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `tasks` | one row per task, status as its upper-case name |
//! | `task_events` | append-only `(task_id, seq, kind, payload_json)` |
//! | `task_checkpoints` | one row per executed step |
//! | `decision_nonces` | single-use approval tokens |
//!
//! [`TaskStorage`] is synchronous. Async callers share it through
//! [`SharedStorage`] and hold the lock only for the duration of one call.

mod events;
mod storage;
mod types;

use std::sync::Arc;

pub use events::{EventRecord, TaskEvent};
pub use storage::{TaskStorage, SCHEMA_VERSION};
pub use types::{
    generate_nonce, generate_task_id, now, Checkpoint, DecisionNonce, NewCheckpoint, NewTask,
    Task, TaskSource, TaskStatus, TaskUpdate,
};

/// Storage handle shared between workers.
pub type SharedStorage = Arc<tokio::sync::Mutex<TaskStorage>>;

/// Wrap a storage for sharing.
pub fn shared(storage: TaskStorage) -> SharedStorage {
    Arc::new(tokio::sync::Mutex::new(storage))
}
