//! Work-order instance model.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle of an instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, waiting for the creator to submit
    Draft,
    /// Moving through approval/task steps
    Processing,
    /// Reached an end step
    Completed,
    /// Cancelled by the creator
    Cancelled,
    /// Rejected at some step
    Rejected,
}

impl InstanceStatus {
    /// Terminal instances accept no further actions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Cancelled | InstanceStatus::Rejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Draft => "draft",
            InstanceStatus::Processing => "processing",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Cancelled => "cancelled",
            InstanceStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(InstanceStatus::Draft),
            "processing" => Ok(InstanceStatus::Processing),
            "completed" => Ok(InstanceStatus::Completed),
            "cancelled" => Ok(InstanceStatus::Cancelled),
            "rejected" => Ok(InstanceStatus::Rejected),
            other => Err(format!("unknown instance status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// A running execution of one published definition version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: Uuid,
    pub definition_id: String,
    /// Pinned at creation; later publishes never affect this instance.
    pub definition_version: u32,
    pub title: String,
    pub creator_id: String,
    pub priority: Priority,
    pub status: InstanceStatus,
    pub current_step: String,
    pub assignees: BTreeSet<String>,
    /// Assignees that already acted on a parallel step.
    pub acted: BTreeSet<String>,
    pub form_data: Map<String, Value>,
    pub step_entered_at: DateTime<Utc>,
    /// Incremented on every step entry; keys escalation markers.
    pub step_entry: u32,
    pub due_at: Option<DateTime<Utc>>,
    /// Strictly increases on every committed change.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `actor_id` still owes an action on the current step.
    pub fn is_pending_for(&self, actor_id: &str) -> bool {
        !self.is_terminal() && self.assignees.contains(actor_id) && !self.acted.contains(actor_id)
    }

    /// Form data overlaid with the reserved fields conditions may reference.
    pub fn evaluation_document(&self) -> Map<String, Value> {
        let mut doc = self.form_data.clone();
        doc.insert(
            "priority".to_string(),
            Value::String(self.priority.as_str().to_string()),
        );
        doc.insert(
            "creator_id".to_string(),
            Value::String(self.creator_id.clone()),
        );
        doc.insert("title".to_string(), Value::String(self.title.clone()));
        doc
    }

    pub fn state(&self) -> InstanceState {
        InstanceState {
            id: self.id,
            status: self.status,
            current_step: self.current_step.clone(),
            assignees: self.assignees.iter().cloned().collect(),
            version: self.version,
            due_at: self.due_at,
        }
    }
}

/// Compact view returned by `get_instance_state`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceState {
    pub id: Uuid,
    pub status: InstanceStatus,
    pub current_step: String,
    pub assignees: Vec<String>,
    pub version: i64,
    pub due_at: Option<DateTime<Utc>>,
}
