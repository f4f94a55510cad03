//! Instance queries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::{decode_err, flow, TERMINAL_STATUSES};
use crate::db::models::{Instance, InstanceFlow, ScanCursor};
use crate::db::DbPool;
use crate::error::{EngineError, EngineResult};

const COLUMNS: &str = "id, definition_id, definition_version, title, creator_id, priority, \
     status, current_step, assignees, acted, form_data, step_entered_at, step_entry, due_at, \
     version, created_at, updated_at, completed_at";

#[derive(Debug, FromRow)]
struct InstanceRow {
    id: Uuid,
    definition_id: String,
    definition_version: i32,
    title: String,
    creator_id: String,
    priority: String,
    status: String,
    current_step: String,
    assignees: Vec<String>,
    acted: Vec<String>,
    form_data: serde_json::Value,
    step_entered_at: DateTime<Utc>,
    step_entry: i32,
    due_at: Option<DateTime<Utc>>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = EngineError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        let form_data = match row.form_data {
            serde_json::Value::Object(map) => map,
            other => return Err(decode_err("instance", format!("form_data is {}", other))),
        };
        Ok(Instance {
            id: row.id,
            definition_id: row.definition_id,
            definition_version: u32::try_from(row.definition_version)
                .map_err(|e| decode_err("instance", e))?,
            title: row.title,
            creator_id: row.creator_id,
            priority: row.priority.parse().map_err(|e| decode_err("instance", e))?,
            status: row.status.parse().map_err(|e| decode_err("instance", e))?,
            current_step: row.current_step,
            assignees: row.assignees.into_iter().collect(),
            acted: row.acted.into_iter().collect(),
            form_data,
            step_entered_at: row.step_entered_at,
            step_entry: u32::try_from(row.step_entry).map_err(|e| decode_err("instance", e))?,
            due_at: row.due_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

fn collect(rows: Vec<InstanceRow>) -> EngineResult<Vec<Instance>> {
    rows.into_iter().map(Instance::try_from).collect()
}

pub async fn insert_instance(pool: &DbPool, instance: &Instance) -> EngineResult<()> {
    let result = sqlx::query(&format!(
        r#"
        INSERT INTO workorder.instance ({COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT (id) DO NOTHING
        "#
    ))
    .bind(instance.id)
    .bind(&instance.definition_id)
    .bind(instance.definition_version as i32)
    .bind(&instance.title)
    .bind(&instance.creator_id)
    .bind(instance.priority.as_str())
    .bind(instance.status.as_str())
    .bind(&instance.current_step)
    .bind(instance.assignees.iter().cloned().collect::<Vec<_>>())
    .bind(instance.acted.iter().cloned().collect::<Vec<_>>())
    .bind(serde_json::Value::Object(instance.form_data.clone()))
    .bind(instance.step_entered_at)
    .bind(instance.step_entry as i32)
    .bind(instance.due_at)
    .bind(instance.version)
    .bind(instance.created_at)
    .bind(instance.updated_at)
    .bind(instance.completed_at)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::Conflict(format!(
            "instance {} already exists",
            instance.id
        )));
    }
    Ok(())
}

pub async fn get_instance(pool: &DbPool, id: Uuid) -> EngineResult<Option<Instance>> {
    let row = sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {COLUMNS} FROM workorder.instance WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Instance::try_from).transpose()
}

/// Version-checked update, written in one transaction with its flow row.
pub async fn commit_instance(
    pool: &DbPool,
    expected_version: i64,
    instance: &Instance,
    flow_row: Option<&InstanceFlow>,
) -> EngineResult<()> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE workorder.instance
        SET status = $3, current_step = $4, assignees = $5, acted = $6, form_data = $7,
            step_entered_at = $8, step_entry = $9, due_at = $10, version = $11,
            updated_at = $12, completed_at = $13
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(instance.id)
    .bind(expected_version)
    .bind(instance.status.as_str())
    .bind(&instance.current_step)
    .bind(instance.assignees.iter().cloned().collect::<Vec<_>>())
    .bind(instance.acted.iter().cloned().collect::<Vec<_>>())
    .bind(serde_json::Value::Object(instance.form_data.clone()))
    .bind(instance.step_entered_at)
    .bind(instance.step_entry as i32)
    .bind(instance.due_at)
    .bind(instance.version)
    .bind(instance.updated_at)
    .bind(instance.completed_at)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        let stored: Option<i64> =
            sqlx::query_scalar("SELECT version FROM workorder.instance WHERE id = $1")
                .bind(instance.id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.rollback().await?;
        return Err(match stored {
            None => EngineError::NotFound(format!("instance {}", instance.id)),
            Some(version) => EngineError::Conflict(format!(
                "instance {} is at version {}, expected {}",
                instance.id, version, expected_version
            )),
        });
    }

    if let Some(flow_row) = flow_row {
        flow::insert_flow(&mut tx, flow_row).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Overdue page after `after`, skipping step entries that already hold a
/// marker.
pub async fn list_overdue(
    pool: &DbPool,
    now: DateTime<Utc>,
    after: Option<ScanCursor>,
    limit: usize,
) -> EngineResult<Vec<Instance>> {
    let rows = sqlx::query_as::<_, InstanceRow>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM workorder.instance i
        WHERE i.status = 'processing'
          AND i.due_at IS NOT NULL
          AND i.due_at < $1
          AND ($2::timestamptz IS NULL OR (i.due_at, i.id) > ($2, $3))
          AND NOT EXISTS (
              SELECT 1 FROM workorder.escalation_marker m
              WHERE m.instance_id = i.id
                AND m.step_id = i.current_step
                AND m.step_entry = i.step_entry
          )
        ORDER BY i.due_at ASC, i.id ASC
        LIMIT $4
        "#
    ))
    .bind(now)
    .bind(after.map(|c| c.due_at))
    .bind(after.map(|c| c.id))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    collect(rows)
}

pub async fn list_pending_for(pool: &DbPool, actor_id: &str) -> EngineResult<Vec<Instance>> {
    let rows = sqlx::query_as::<_, InstanceRow>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM workorder.instance
        WHERE status NOT IN {TERMINAL_STATUSES}
          AND $1 = ANY(assignees)
          AND NOT ($1 = ANY(acted))
        ORDER BY created_at ASC
        "#
    ))
    .bind(actor_id)
    .fetch_all(pool)
    .await?;

    collect(rows)
}

pub async fn open_assignment_counts(
    pool: &DbPool,
    actors: &[String],
) -> EngineResult<HashMap<String, u64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
        r#"
        SELECT a.actor, COUNT(i.id)
        FROM UNNEST($1::text[]) AS a(actor)
        LEFT JOIN workorder.instance i
          ON a.actor = ANY(i.assignees)
         AND NOT (a.actor = ANY(i.acted))
         AND i.status NOT IN {TERMINAL_STATUSES}
        GROUP BY a.actor
        "#
    ))
    .bind(actors)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(actor, count)| (actor, count.max(0) as u64))
        .collect())
}
