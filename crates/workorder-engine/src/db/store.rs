//! Persistence seam.
//!
//! The engine talks to storage only through [`Store`]. Two implementations
//! ship with the crate: [`MemoryStore`](super::MemoryStore) for tests and
//! embedding, and [`PgStore`](super::PgStore) backed by PostgreSQL.
//!
//! The contract every implementation honors:
//! - `commit_instance` is a compare-and-swap on `version`: the write succeeds
//!   only when the stored version equals `expected_version`, and the flow row
//!   (if any) is written atomically with the instance.
//! - `claim_escalation` inserts a marker if absent and reports whether this
//!   caller won the claim.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{
    CommentStatus, EscalationMarker, Instance, InstanceComment, InstanceFlow, ScanCursor,
};
use crate::definition::{DefinitionStatus, ProcessDefinition};
use crate::error::EngineResult;

#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Store a definition version. `Conflict` if `(id, version)` exists.
    async fn insert_definition(&self, definition: &ProcessDefinition) -> EngineResult<()>;

    async fn get_definition(&self, id: &str, version: u32)
        -> EngineResult<Option<ProcessDefinition>>;

    /// Highest stored version of `id`, whatever its status.
    async fn latest_definition_version(&self, id: &str) -> EngineResult<Option<u32>>;

    /// Highest version of `id` currently in `published` status.
    async fn latest_published_definition(&self, id: &str)
        -> EngineResult<Option<ProcessDefinition>>;

    /// Returns `false` when no such version exists.
    async fn set_definition_status(
        &self,
        id: &str,
        version: u32,
        status: DefinitionStatus,
    ) -> EngineResult<bool>;

    // ------------------------------------------------------------------
    // Instances and flows
    // ------------------------------------------------------------------

    async fn insert_instance(&self, instance: &Instance) -> EngineResult<()>;

    async fn get_instance(&self, id: Uuid) -> EngineResult<Option<Instance>>;

    /// Replace the instance if its stored version is `expected_version`.
    ///
    /// `NotFound` for an unknown id, `Conflict` on a version mismatch.
    async fn commit_instance(
        &self,
        expected_version: i64,
        instance: &Instance,
        flow: Option<&InstanceFlow>,
    ) -> EngineResult<()>;

    /// Flow rows of an instance, oldest first.
    async fn list_flows(&self, instance_id: Uuid) -> EngineResult<Vec<InstanceFlow>>;

    /// Processing instances whose `due_at` is before `now`, ordered by
    /// `(due_at, id)` and starting after `after`.
    ///
    /// Instances already holding a marker for their current step entry are
    /// left out.
    async fn list_overdue(
        &self,
        now: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> EngineResult<Vec<Instance>>;

    /// Non-terminal instances where `actor_id` is an assignee that has not acted.
    async fn list_pending_for(&self, actor_id: &str) -> EngineResult<Vec<Instance>>;

    /// Pending-assignment count per actor. Actors with none map to zero.
    async fn open_assignment_counts(&self, actors: &[String]) -> EngineResult<HashMap<String, u64>>;

    // ------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------

    async fn insert_comment(&self, comment: &InstanceComment) -> EngineResult<()>;

    async fn get_comment(&self, id: Uuid) -> EngineResult<Option<InstanceComment>>;

    /// Comments of an instance, oldest first, every status included.
    async fn list_comments(&self, instance_id: Uuid) -> EngineResult<Vec<InstanceComment>>;

    async fn set_comment_status(
        &self,
        id: Uuid,
        status: CommentStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<()>;

    // ------------------------------------------------------------------
    // Escalation markers
    // ------------------------------------------------------------------

    /// Insert the marker if absent. `true` when this call created it.
    async fn claim_escalation(&self, marker: &EscalationMarker) -> EngineResult<bool>;

    /// Remove a marker whose escalation could not be applied.
    async fn release_escalation(&self, marker: &EscalationMarker) -> EngineResult<()>;
}
