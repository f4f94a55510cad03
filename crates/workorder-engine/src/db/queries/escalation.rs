//! Escalation marker queries.

use crate::db::models::EscalationMarker;
use crate::db::DbPool;
use crate::error::EngineResult;

/// Insert the marker unless it exists. `true` when this call inserted it.
pub async fn claim(pool: &DbPool, marker: &EscalationMarker) -> EngineResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO workorder.escalation_marker (instance_id, step_id, rule_id, step_entry, claimed_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (instance_id, step_id, rule_id, step_entry) DO NOTHING
        "#,
    )
    .bind(marker.instance_id)
    .bind(&marker.step_id)
    .bind(&marker.rule_id)
    .bind(marker.step_entry as i32)
    .bind(marker.claimed_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn release(pool: &DbPool, marker: &EscalationMarker) -> EngineResult<()> {
    sqlx::query(
        r#"
        DELETE FROM workorder.escalation_marker
        WHERE instance_id = $1 AND step_id = $2 AND rule_id = $3 AND step_entry = $4
        "#,
    )
    .bind(marker.instance_id)
    .bind(&marker.step_id)
    .bind(&marker.rule_id)
    .bind(marker.step_entry as i32)
    .execute(pool)
    .await?;

    Ok(())
}
