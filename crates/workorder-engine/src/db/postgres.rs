//! PostgreSQL-backed [`Store`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{
    CommentStatus, EscalationMarker, Instance, InstanceComment, InstanceFlow, ScanCursor,
};
use crate::db::queries::{comment, definition, escalation, flow, instance};
use crate::db::store::Store;
use crate::db::DbPool;
use crate::definition::{DefinitionStatus, ProcessDefinition};
use crate::error::EngineResult;

/// Schema DDL. Safe to run on every start.
pub const SCHEMA: &str = include_str!("../../sql/schema.sql");

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Create the `workorder` schema and tables if missing.
    pub async fn init_schema(&self) -> EngineResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        tracing::info!("Database schema initialized");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_definition(&self, def: &ProcessDefinition) -> EngineResult<()> {
        definition::insert_definition(&self.pool, def).await
    }

    async fn get_definition(
        &self,
        id: &str,
        version: u32,
    ) -> EngineResult<Option<ProcessDefinition>> {
        definition::get_definition(&self.pool, id, version).await
    }

    async fn latest_definition_version(&self, id: &str) -> EngineResult<Option<u32>> {
        definition::latest_version(&self.pool, id).await
    }

    async fn latest_published_definition(
        &self,
        id: &str,
    ) -> EngineResult<Option<ProcessDefinition>> {
        definition::latest_published(&self.pool, id).await
    }

    async fn set_definition_status(
        &self,
        id: &str,
        version: u32,
        status: DefinitionStatus,
    ) -> EngineResult<bool> {
        definition::set_status(&self.pool, id, version, status).await
    }

    async fn insert_instance(&self, inst: &Instance) -> EngineResult<()> {
        instance::insert_instance(&self.pool, inst).await
    }

    async fn get_instance(&self, id: Uuid) -> EngineResult<Option<Instance>> {
        instance::get_instance(&self.pool, id).await
    }

    async fn commit_instance(
        &self,
        expected_version: i64,
        inst: &Instance,
        flow_row: Option<&InstanceFlow>,
    ) -> EngineResult<()> {
        instance::commit_instance(&self.pool, expected_version, inst, flow_row).await
    }

    async fn list_flows(&self, instance_id: Uuid) -> EngineResult<Vec<InstanceFlow>> {
        flow::list_flows(&self.pool, instance_id).await
    }

    async fn list_overdue(
        &self,
        now: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> EngineResult<Vec<Instance>> {
        instance::list_overdue(&self.pool, now, after, limit).await
    }

    async fn list_pending_for(&self, actor_id: &str) -> EngineResult<Vec<Instance>> {
        instance::list_pending_for(&self.pool, actor_id).await
    }

    async fn open_assignment_counts(
        &self,
        actors: &[String],
    ) -> EngineResult<HashMap<String, u64>> {
        instance::open_assignment_counts(&self.pool, actors).await
    }

    async fn insert_comment(&self, c: &InstanceComment) -> EngineResult<()> {
        comment::insert_comment(&self.pool, c).await
    }

    async fn get_comment(&self, id: Uuid) -> EngineResult<Option<InstanceComment>> {
        comment::get_comment(&self.pool, id).await
    }

    async fn list_comments(&self, instance_id: Uuid) -> EngineResult<Vec<InstanceComment>> {
        comment::list_comments(&self.pool, instance_id).await
    }

    async fn set_comment_status(
        &self,
        id: Uuid,
        status: CommentStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        comment::set_status(&self.pool, id, status, at).await
    }

    async fn claim_escalation(&self, marker: &EscalationMarker) -> EngineResult<bool> {
        escalation::claim(&self.pool, marker).await
    }

    async fn release_escalation(&self, marker: &EscalationMarker) -> EngineResult<()> {
        escalation::release(&self.pool, marker).await
    }
}
