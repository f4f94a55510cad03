//! Definition queries.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::decode_err;
use crate::db::DbPool;
use crate::definition::{DefinitionStatus, ProcessDefinition};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, FromRow)]
struct DefinitionRow {
    version: i32,
    status: String,
    document: serde_json::Value,
    published_at: Option<DateTime<Utc>>,
}

impl TryFrom<DefinitionRow> for ProcessDefinition {
    type Error = EngineError;

    fn try_from(row: DefinitionRow) -> Result<Self, Self::Error> {
        let mut def: ProcessDefinition =
            serde_json::from_value(row.document).map_err(|e| decode_err("definition", e))?;
        def.version = u32::try_from(row.version).map_err(|e| decode_err("definition", e))?;
        def.status = DefinitionStatus::from(row.status.as_str());
        def.published_at = row.published_at;
        Ok(def)
    }
}

/// Insert a definition version.
pub async fn insert_definition(pool: &DbPool, def: &ProcessDefinition) -> EngineResult<()> {
    let document = serde_json::to_value(def)?;

    let result = sqlx::query(
        r#"
        INSERT INTO workorder.definition (id, version, name, status, document, published_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id, version) DO NOTHING
        "#,
    )
    .bind(&def.id)
    .bind(def.version as i32)
    .bind(&def.name)
    .bind(def.status.to_string())
    .bind(&document)
    .bind(def.published_at)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::Conflict(format!(
            "definition {} version {} already exists",
            def.id, def.version
        )));
    }
    Ok(())
}

pub async fn get_definition(
    pool: &DbPool,
    id: &str,
    version: u32,
) -> EngineResult<Option<ProcessDefinition>> {
    let row = sqlx::query_as::<_, DefinitionRow>(
        r#"
        SELECT version, status, document, published_at
        FROM workorder.definition
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(id)
    .bind(version as i32)
    .fetch_optional(pool)
    .await?;

    row.map(ProcessDefinition::try_from).transpose()
}

pub async fn latest_version(pool: &DbPool, id: &str) -> EngineResult<Option<u32>> {
    let version: Option<i32> =
        sqlx::query_scalar("SELECT MAX(version) FROM workorder.definition WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await?;

    version
        .map(|v| u32::try_from(v).map_err(|e| decode_err("definition", e)))
        .transpose()
}

pub async fn latest_published(pool: &DbPool, id: &str) -> EngineResult<Option<ProcessDefinition>> {
    let row = sqlx::query_as::<_, DefinitionRow>(
        r#"
        SELECT version, status, document, published_at
        FROM workorder.definition
        WHERE id = $1 AND status = 'published'
        ORDER BY version DESC
        LIMIT 1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(ProcessDefinition::try_from).transpose()
}

/// Returns whether a row was updated.
pub async fn set_status(
    pool: &DbPool,
    id: &str,
    version: u32,
    status: DefinitionStatus,
) -> EngineResult<bool> {
    let result = sqlx::query(
        "UPDATE workorder.definition SET status = $3 WHERE id = $1 AND version = $2",
    )
    .bind(id)
    .bind(version as i32)
    .bind(status.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
