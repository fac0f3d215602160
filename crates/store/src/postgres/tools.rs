//! Tool execution SQL: the capability-filtered claim, the terminal writes,
//! and the snooze/retry reschedules.

use am_domain::tool_execution::ToolExecution;
use am_domain::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::{channels, payloads};

use super::rows::{self, enum_str};
use super::PostgresStore;

impl PostgresStore {
    /// Insert one pending execution and queue its `tool_pending` notify.
    pub(super) async fn insert_tool_execution_in_tx(
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        te: &ToolExecution,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO tool_executions (id, run_id, iteration_id, state, tool_use_id, \
             tool_name, tool_input, is_agent_tool, agent_id, child_run_id, tool_output, \
             is_error, error_message, attempt_count, max_attempts, scheduled_at, \
             claimed_by_instance_id, created_at, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, NULL, FALSE, NULL, 0, $10, \
             $11, NULL, $12, NULL, NULL)",
        )
        .bind(te.id)
        .bind(te.run_id)
        .bind(te.iteration_id)
        .bind(enum_str(&te.state))
        .bind(&te.tool_use_id)
        .bind(&te.tool_name)
        .bind(&te.tool_input)
        .bind(te.is_agent_tool)
        .bind(te.agent_id)
        .bind(te.max_attempts as i32)
        .bind(te.scheduled_at)
        .bind(te.created_at)
        .execute(&mut **tx)
        .await
        .map_err(Error::storage)?;

        let payload = serde_json::to_string(&payloads::ToolPending {
            tool_execution_id: te.id,
            run_id: te.run_id,
            tool_name: te.tool_name.clone(),
        })?;
        Self::notify_in_tx(tx, channels::TOOL_PENDING, &payload).await
    }

    pub(super) async fn create_tool_executions_sql(&self, executions: &[ToolExecution]) -> Result<()> {
        let mut tx = self.begin().await?;
        for te in executions {
            Self::insert_tool_execution_in_tx(&mut tx, te).await?;
        }
        tx.commit().await.map_err(Error::storage)
    }

    pub(super) async fn get_tool_execution_sql(&self, id: Uuid) -> Result<ToolExecution> {
        let row = sqlx::query("SELECT * FROM tool_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "tool_execution",
                id: id.to_string(),
            })?;
        rows::tool_execution_from_row(&row)
    }

    pub(super) async fn list_tool_executions_sql(&self, iteration_id: Uuid) -> Result<Vec<ToolExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM tool_executions WHERE iteration_id = $1 ORDER BY created_at",
        )
        .bind(iteration_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;
        rows.iter().map(rows::tool_execution_from_row).collect()
    }

    pub(super) async fn claim_tool_executions_sql(
        &self,
        instance_id: Uuid,
        max: usize,
    ) -> Result<Vec<ToolExecution>> {
        let mut tx = self.begin().await?;
        // A claim consumes an attempt; snooze refunds it.
        let claimed = sqlx::query(
            "WITH picked AS ( \
               SELECT te.id FROM tool_executions te \
               WHERE te.state = 'pending' AND te.scheduled_at <= now() \
                 AND ( \
                   (te.is_agent_tool AND EXISTS ( \
                      SELECT 1 FROM instance_agents ia \
                      WHERE ia.instance_id = $1 AND ia.agent_name = te.tool_name)) \
                   OR (NOT te.is_agent_tool AND EXISTS ( \
                      SELECT 1 FROM instance_tools it \
                      WHERE it.instance_id = $1 AND it.tool_name = te.tool_name)) \
                 ) \
               ORDER BY te.scheduled_at, te.created_at \
               LIMIT $2 \
               FOR UPDATE OF te SKIP LOCKED \
             ) \
             UPDATE tool_executions SET state = 'running', claimed_by_instance_id = $1, \
               started_at = now(), attempt_count = attempt_count + 1 \
             WHERE id IN (SELECT id FROM picked) \
             RETURNING *",
        )
        .bind(instance_id)
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::storage)?;

        if !claimed.is_empty() {
            sqlx::query("UPDATE instances SET active_tool_count = active_tool_count + $2 WHERE id = $1")
                .bind(instance_id)
                .bind(claimed.len() as i32)
                .execute(&mut *tx)
                .await
                .map_err(Error::storage)?;
        }
        tx.commit().await.map_err(Error::storage)?;

        claimed.iter().map(rows::tool_execution_from_row).collect()
    }

    pub(super) async fn terminalize_tool_execution_sql(
        &self,
        id: Uuid,
        state: &str,
        output: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        let claimant = Self::lock_running_execution(&mut tx, id, state).await?;

        sqlx::query(
            "UPDATE tool_executions SET state = $2, tool_output = $3, is_error = $4, \
               error_message = $5, completed_at = now(), claimed_by_instance_id = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(state)
        .bind(output)
        .bind(error_message.is_some())
        .bind(error_message)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        Self::decrement_tool_counter(&mut tx, claimant).await?;
        tx.commit().await.map_err(Error::storage)
    }

    pub(super) async fn reschedule_tool_execution_sql(
        &self,
        id: Uuid,
        scheduled_at: DateTime<Utc>,
        refund_attempt: bool,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        let claimant = Self::lock_running_execution(&mut tx, id, "pending").await?;

        sqlx::query(
            "UPDATE tool_executions SET state = 'pending', scheduled_at = $2, \
               claimed_by_instance_id = NULL, \
               attempt_count = GREATEST(attempt_count - CASE WHEN $3 THEN 1 ELSE 0 END, 0) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(scheduled_at)
        .bind(refund_attempt)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        Self::decrement_tool_counter(&mut tx, claimant).await?;
        tx.commit().await.map_err(Error::storage)
    }

    /// Lock the execution row, require `running`, and return the claimant.
    async fn lock_running_execution(
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        id: Uuid,
        requested: &str,
    ) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT state, claimed_by_instance_id FROM tool_executions WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::storage)?
        .ok_or(Error::NotFound {
            entity: "tool_execution",
            id: id.to_string(),
        })?;
        let current: String = row.try_get("state").map_err(Error::storage)?;
        if current != "running" {
            return Err(Error::StateTransitionFailed {
                entity: "tool_execution",
                current,
                requested: requested.to_string(),
            });
        }
        row.try_get("claimed_by_instance_id").map_err(Error::storage)
    }

    async fn decrement_tool_counter(
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        claimant: Option<Uuid>,
    ) -> Result<()> {
        if let Some(instance_id) = claimant {
            sqlx::query(
                "UPDATE instances SET active_tool_count = GREATEST(active_tool_count - 1, 0) \
                 WHERE id = $1",
            )
            .bind(instance_id)
            .execute(&mut **tx)
            .await
            .map_err(Error::storage)?;
        }
        Ok(())
    }

    pub(super) async fn set_tool_execution_child_run_sql(&self, id: Uuid, child_run_id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE tool_executions SET child_run_id = $2 WHERE id = $1")
            .bind(id)
            .bind(child_run_id)
            .execute(self.pool())
            .await
            .map_err(Error::storage)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound {
                entity: "tool_execution",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub(super) async fn get_tool_execution_by_child_run_sql(
        &self,
        child_run_id: Uuid,
    ) -> Result<Option<ToolExecution>> {
        let row = sqlx::query("SELECT * FROM tool_executions WHERE child_run_id = $1")
            .bind(child_run_id)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?;
        row.as_ref().map(rows::tool_execution_from_row).transpose()
    }

    pub(super) async fn release_expired_tool_claims_sql(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "UPDATE tool_executions SET state = 'pending', claimed_by_instance_id = NULL, \
               scheduled_at = now() \
             WHERE state = 'running' AND started_at < $1 \
             RETURNING id",
        )
        .bind(older_than)
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(Error::storage))
            .collect()
    }
}
