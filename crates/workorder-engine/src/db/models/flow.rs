//! Flow records: the append-only history of an instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::definition::Action;

/// One accepted action. Every committed transition writes exactly one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceFlow {
    pub id: Uuid,
    pub instance_id: Uuid,
    /// Step the action was taken on.
    pub step_id: String,
    /// Step the instance rests on afterwards.
    pub to_step: String,
    /// Every step entered by this action, auto-advanced ones included.
    pub route: Vec<String>,
    pub action: Action,
    pub actor_id: String,
    pub comment: Option<String>,
    pub form_delta: Map<String, Value>,
    /// Instance version produced by this action.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}
