//! Comment queries.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::decode_err;
use crate::db::models::{CommentStatus, InstanceComment};
use crate::db::DbPool;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, FromRow)]
struct CommentRow {
    id: Uuid,
    instance_id: Uuid,
    parent_id: Option<Uuid>,
    author_id: String,
    content: String,
    status: String,
    is_system: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CommentRow> for InstanceComment {
    type Error = EngineError;

    fn try_from(row: CommentRow) -> Result<Self, Self::Error> {
        Ok(InstanceComment {
            id: row.id,
            instance_id: row.instance_id,
            parent_id: row.parent_id,
            author_id: row.author_id,
            content: row.content,
            status: row.status.parse().map_err(|e| decode_err("comment", e))?,
            is_system: row.is_system,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub async fn insert_comment(pool: &DbPool, comment: &InstanceComment) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO workorder.comment (
            id, instance_id, parent_id, author_id, content, status, is_system,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(comment.id)
    .bind(comment.instance_id)
    .bind(comment.parent_id)
    .bind(&comment.author_id)
    .bind(&comment.content)
    .bind(comment.status.as_str())
    .bind(comment.is_system)
    .bind(comment.created_at)
    .bind(comment.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_comment(pool: &DbPool, id: Uuid) -> EngineResult<Option<InstanceComment>> {
    let row = sqlx::query_as::<_, CommentRow>(
        r#"
        SELECT id, instance_id, parent_id, author_id, content, status, is_system,
               created_at, updated_at
        FROM workorder.comment
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(InstanceComment::try_from).transpose()
}

pub async fn list_comments(pool: &DbPool, instance_id: Uuid) -> EngineResult<Vec<InstanceComment>> {
    let rows = sqlx::query_as::<_, CommentRow>(
        r#"
        SELECT id, instance_id, parent_id, author_id, content, status, is_system,
               created_at, updated_at
        FROM workorder.comment
        WHERE instance_id = $1
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(InstanceComment::try_from).collect()
}

pub async fn set_status(
    pool: &DbPool,
    id: Uuid,
    status: CommentStatus,
    at: DateTime<Utc>,
) -> EngineResult<()> {
    let result = sqlx::query("UPDATE workorder.comment SET status = $2, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .bind(at)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::NotFound(format!("comment {}", id)));
    }
    Ok(())
}
