// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task event kinds.
//!
//! Events are stored as `(kind, payload_json)`; [`TaskEvent`] is the closed
//! set of kinds with their payload fields. Serialized adjacently tagged so
//! the kind and payload map straight onto the two columns.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum TaskEvent {
    #[serde(rename = "task.created")]
    Created {
        source: String,
        status: TaskStatus,
        #[serde(default)]
        risk_reasons: Vec<String>,
    },
    #[serde(rename = "task.started")]
    Started { workspace: String },
    #[serde(rename = "task.agent_progress")]
    AgentProgress { step: u32, elapsed_secs: u64 },
    #[serde(rename = "task.test_progress")]
    TestProgress { step: u32, elapsed_secs: u64 },
    #[serde(rename = "task.step")]
    Step {
        step: u32,
        agent: String,
        state: String,
        exit_code: Option<i32>,
        files_changed: Vec<String>,
    },
    #[serde(rename = "task.blocked")]
    Blocked { reason: String },
    #[serde(rename = "task.failed")]
    Failed { error: String },
    #[serde(rename = "task.timeout")]
    TimedOut { reason: String },
    #[serde(rename = "task.waiting_merge")]
    WaitingMerge { nonce: String },
    #[serde(rename = "task.applied")]
    Applied {},
    #[serde(rename = "task.decision")]
    Decision {
        action: String,
        actor: String,
        source: String,
        #[serde(default)]
        note: Option<String>,
    },
    #[serde(rename = "task.decision_rejected")]
    DecisionRejected {
        action: String,
        actor: String,
        nonce: String,
    },
    #[serde(rename = "task.merge_started")]
    MergeStarted { actor: String },
    #[serde(rename = "task.merged")]
    Merged { commit_hash: Option<String> },
    #[serde(rename = "task.merge_failed")]
    MergeFailed { error: String },
    #[serde(rename = "task.discarded")]
    Discarded { actor: String },
    #[serde(rename = "task.paused")]
    Paused { actor: String },
    #[serde(rename = "task.resumed")]
    Resumed { actor: String, instruction: String },
    #[serde(rename = "task.stopped")]
    Stopped { actor: String },
    #[serde(rename = "task.requeued")]
    Requeued { reason: String },
    #[serde(rename = "task.cleaned")]
    Cleaned { workspace: String },
    #[serde(rename = "task.cleanup_failed")]
    CleanupFailed { error: String },
}

impl TaskEvent {
    /// Split into the stored `(kind, payload)` pair.
    pub fn to_parts(&self) -> Result<(String, Value), serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payload = value
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok((kind, payload))
    }

    pub fn kind(&self) -> String {
        self.to_parts().map(|(kind, _)| kind).unwrap_or_default()
    }
}

/// A stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Per-task sequence number starting at 1.
    pub seq: i64,
    pub kind: String,
    pub payload: Value,
    pub created_at: i64,
}

impl EventRecord {
    /// Decode into a known kind. `None` for kinds written by a newer build.
    pub fn event(&self) -> Option<TaskEvent> {
        serde_json::from_value(serde_json::json!({
            "kind": self.kind,
            "payload": self.payload,
        }))
        .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_layout() {
        let event = TaskEvent::Blocked {
            reason: "missing key".to_string(),
        };
        let (kind, payload) = event.to_parts().unwrap();
        assert_eq!(kind, "task.blocked");
        assert_eq!(payload, serde_json::json!({"reason": "missing key"}));
    }

    #[test]
    fn test_empty_payload_variant() {
        let (kind, payload) = TaskEvent::Applied {}.to_parts().unwrap();
        assert_eq!(kind, "task.applied");
        assert_eq!(payload, serde_json::json!({}));

        let record = EventRecord {
            seq: 1,
            kind,
            payload,
            created_at: 0,
        };
        assert_eq!(record.event(), Some(TaskEvent::Applied {}));
    }

    #[test]
    fn test_record_decodes_known_kind() {
        let record = EventRecord {
            seq: 3,
            kind: "task.created".to_string(),
            payload: serde_json::json!({"source": "command", "status": "DRAFT"}),
            created_at: 0,
        };
        assert_eq!(
            record.event(),
            Some(TaskEvent::Created {
                source: "command".to_string(),
                status: TaskStatus::Draft,
                risk_reasons: vec![],
            })
        );
    }

    #[test]
    fn test_unknown_kind_is_none() {
        let record = EventRecord {
            seq: 1,
            kind: "task.teleported".to_string(),
            payload: serde_json::json!({}),
            created_at: 0,
        };
        assert!(record.event().is_none());
    }
}
