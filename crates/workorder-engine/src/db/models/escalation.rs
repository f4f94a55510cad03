//! Escalation markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claim that `rule_id` fired for one entry into `step_id`.
///
/// Unique on `(instance_id, step_id, rule_id, step_entry)`; re-entering the
/// step bumps `step_entry`, so the rule may fire again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EscalationMarker {
    pub instance_id: Uuid,
    pub step_id: String,
    pub rule_id: String,
    pub step_entry: u32,
    pub claimed_at: DateTime<Utc>,
}

/// Position in the overdue scan: the last `(due_at, id)` handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    pub due_at: DateTime<Utc>,
    pub id: Uuid,
}

impl EscalationMarker {
    /// Uniqueness key, ignoring the claim time.
    pub fn key(&self) -> (Uuid, String, String, u32) {
        (
            self.instance_id,
            self.step_id.clone(),
            self.rule_id.clone(),
            self.step_entry,
        )
    }
}
