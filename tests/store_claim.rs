// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Claim and nonce races across separate connections to one database file.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::TempDir;

use foreman::store::{NewTask, TaskSource, TaskStatus, TaskStorage};

fn new_task(goal: &str) -> NewTask {
    NewTask {
        id: None,
        platform: "test".to_string(),
        channel_id: "chan".to_string(),
        thread_id: "thread".to_string(),
        created_by: "alice".to_string(),
        source: TaskSource::Command,
        goal: goal.to_string(),
        original_request: None,
        preferred_agent: None,
        status: TaskStatus::Pending,
        max_steps: 8,
        max_minutes: 20,
        test_command: "true".to_string(),
        blocked_reason: None,
    }
}

fn seed(path: &Path, count: usize) -> Vec<String> {
    let storage = TaskStorage::open_at(path).unwrap();
    (0..count)
        .map(|i| storage.create(new_task(&format!("task {}", i))).unwrap().id)
        .collect()
}

// ============================================================================
// Claims
// ============================================================================

#[test]
fn test_each_pending_task_is_claimed_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.db");
    let created: HashSet<String> = seed(&path, 20).into_iter().collect();

    // Open connections one at a time so schema setup does not race.
    let connections: Vec<TaskStorage> = (0..4)
        .map(|_| TaskStorage::open_at(&path).unwrap())
        .collect();
    let barrier = Arc::new(Barrier::new(connections.len()));

    let handles: Vec<_> = connections
        .into_iter()
        .map(|mut storage| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut claimed = Vec::new();
                while let Some(task) = storage.claim_pending().unwrap() {
                    assert_eq!(task.status, TaskStatus::Running);
                    assert!(task.started_at.is_some());
                    claimed.push(task.id);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    let unique: HashSet<String> = all.iter().cloned().collect();
    assert_eq!(all.len(), 20, "a task was claimed twice");
    assert_eq!(unique, created);

    let storage = TaskStorage::open_at(&path).unwrap();
    assert!(storage
        .list_recent(Some(TaskStatus::Pending), 50)
        .unwrap()
        .is_empty());
}

#[test]
fn test_claim_order_is_oldest_first() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.db");
    let ids = seed(&path, 3);

    let mut storage = TaskStorage::open_at(&path).unwrap();
    for id in &ids {
        assert_eq!(&storage.claim_pending().unwrap().unwrap().id, id);
    }
    assert!(storage.claim_pending().unwrap().is_none());

    // A restart puts them back in the queue
    assert_eq!(storage.requeue_inflight().unwrap(), 3);
    assert_eq!(storage.claim_pending().unwrap().unwrap().id, ids[0]);
}

// ============================================================================
// Nonces
// ============================================================================

#[test]
fn test_nonce_is_consumed_exactly_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.db");
    let task_id = seed(&path, 1).remove(0);
    let nonce = TaskStorage::open_at(&path)
        .unwrap()
        .create_nonce(&task_id, 30)
        .unwrap();

    let connections: Vec<TaskStorage> = (0..4)
        .map(|_| TaskStorage::open_at(&path).unwrap())
        .collect();
    let barrier = Arc::new(Barrier::new(connections.len()));

    let handles: Vec<_> = connections
        .into_iter()
        .enumerate()
        .map(|(i, storage)| {
            let barrier = barrier.clone();
            let task_id = task_id.clone();
            let nonce = nonce.clone();
            thread::spawn(move || {
                barrier.wait();
                storage
                    .consume_nonce(&task_id, &nonce, &format!("actor-{}", i), "approve", "button")
                    .unwrap()
            })
        })
        .collect();

    let wins = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(wins, 1);

    let storage = TaskStorage::open_at(&path).unwrap();
    let record = storage.get_nonce(&task_id, &nonce).unwrap().unwrap();
    assert!(record.consumed_at.is_some());
    assert_eq!(record.action.as_deref(), Some("approve"));
    assert!(storage.active_nonce(&task_id).unwrap().is_none());
}

#[test]
fn test_new_nonce_supersedes_old_one() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.db");
    let task_id = seed(&path, 1).remove(0);

    let mut storage = TaskStorage::open_at(&path).unwrap();
    let first = storage.create_nonce(&task_id, 30).unwrap();
    let second = storage.create_nonce(&task_id, 30).unwrap();
    assert_ne!(first, second);
    assert_eq!(storage.active_nonce(&task_id).unwrap(), Some(second.clone()));

    assert!(!storage
        .consume_nonce(&task_id, &first, "alice", "approve", "button")
        .unwrap());
    assert!(storage
        .consume_nonce(&task_id, &second, "alice", "approve", "button")
        .unwrap());
}
