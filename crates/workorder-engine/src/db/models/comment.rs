//! Comment model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommentStatus {
    #[default]
    Active,
    Hidden,
    Deleted,
}

impl CommentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommentStatus::Active => "active",
            CommentStatus::Hidden => "hidden",
            CommentStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for CommentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CommentStatus::Active),
            "hidden" => Ok(CommentStatus::Hidden),
            "deleted" => Ok(CommentStatus::Deleted),
            other => Err(format!("unknown comment status: {}", other)),
        }
    }
}

/// A comment on an instance, optionally replying to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceComment {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub author_id: String,
    pub content: String,
    pub status: CommentStatus,
    /// Written by the engine rather than a user.
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceComment {
    pub fn is_visible(&self) -> bool {
        self.status == CommentStatus::Active
    }
}
