//! Flow queries.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use super::decode_err;
use crate::db::models::InstanceFlow;
use crate::db::DbPool;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, FromRow)]
struct FlowRow {
    id: Uuid,
    instance_id: Uuid,
    step_id: String,
    to_step: String,
    route: Vec<String>,
    action: String,
    actor_id: String,
    comment: Option<String>,
    form_delta: serde_json::Value,
    version: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<FlowRow> for InstanceFlow {
    type Error = EngineError;

    fn try_from(row: FlowRow) -> Result<Self, Self::Error> {
        let form_delta = match row.form_delta {
            serde_json::Value::Object(map) => map,
            other => return Err(decode_err("flow", format!("form_delta is {}", other))),
        };
        Ok(InstanceFlow {
            id: row.id,
            instance_id: row.instance_id,
            step_id: row.step_id,
            to_step: row.to_step,
            route: row.route,
            action: row.action.parse().map_err(|e| decode_err("flow", e))?,
            actor_id: row.actor_id,
            comment: row.comment,
            form_delta,
            version: row.version,
            created_at: row.created_at,
        })
    }
}

/// Append a flow row inside the caller's transaction.
pub async fn insert_flow(
    tx: &mut Transaction<'_, Postgres>,
    flow: &InstanceFlow,
) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO workorder.flow (
            id, instance_id, step_id, to_step, route, action, actor_id,
            comment, form_delta, version, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(flow.id)
    .bind(flow.instance_id)
    .bind(&flow.step_id)
    .bind(&flow.to_step)
    .bind(&flow.route)
    .bind(flow.action.as_str())
    .bind(&flow.actor_id)
    .bind(&flow.comment)
    .bind(serde_json::Value::Object(flow.form_delta.clone()))
    .bind(flow.version)
    .bind(flow.created_at)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

pub async fn list_flows(pool: &DbPool, instance_id: Uuid) -> EngineResult<Vec<InstanceFlow>> {
    let rows = sqlx::query_as::<_, FlowRow>(
        r#"
        SELECT id, instance_id, step_id, to_step, route, action, actor_id,
               comment, form_delta, version, created_at
        FROM workorder.flow
        WHERE instance_id = $1
        ORDER BY version ASC
        "#,
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(InstanceFlow::try_from).collect()
}
