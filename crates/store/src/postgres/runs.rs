//! Run and iteration SQL: the claim path, the guarded state machine, and
//! the gap-free iteration ledger.

use am_domain::iteration::{BatchStatus, Iteration};
use am_domain::run::{Run, RunMode, RunState};
use am_domain::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::types::{IterationOutcome, RunFilter, RunStateUpdate};
use crate::{channels, payloads};

use super::rows::{self, enum_str, parse_enum};
use super::PostgresStore;

fn transition_refused(current: &str, requested: &str) -> Error {
    Error::StateTransitionFailed {
        entity: "run",
        current: current.to_string(),
        requested: requested.to_string(),
    }
}

impl PostgresStore {
    pub(super) async fn create_run_sql(&self, run: &Run) -> Result<()> {
        let mut tx = self.begin().await?;

        match run.parent_run_id {
            None if run.depth != 0 => {
                return Err(Error::BuildError("top-level run must have depth 0".into()));
            }
            Some(parent_id) => {
                let parent_depth: i32 = sqlx::query("SELECT depth FROM runs WHERE id = $1")
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(Error::storage)?
                    .ok_or(Error::NotFound {
                        entity: "run",
                        id: parent_id.to_string(),
                    })?
                    .try_get("depth")
                    .map_err(Error::storage)?;
                if run.depth as i32 != parent_depth + 1 {
                    return Err(Error::BuildError(format!(
                        "child run depth {} does not extend parent depth {parent_depth}",
                        run.depth
                    )));
                }
            }
            None => {}
        }

        sqlx::query(
            "INSERT INTO runs (id, session_id, agent_id, run_mode, prompt, state, depth, \
             parent_run_id, parent_tool_execution_id, iteration_count, input_tokens, \
             output_tokens, cache_creation_tokens, cache_read_tokens, response_text, error, \
             created_by_instance_id, claimed_by_instance_id, claimed_at, created_at, started_at, \
             finalized_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0, 0, 0, 0, NULL, NULL, $10, NULL, \
             NULL, $11, NULL, NULL)",
        )
        .bind(run.id)
        .bind(run.session_id)
        .bind(run.agent_id)
        .bind(enum_str(&run.run_mode))
        .bind(&run.prompt)
        .bind(enum_str(&run.state))
        .bind(run.depth as i32)
        .bind(run.parent_run_id)
        .bind(run.parent_tool_execution_id)
        .bind(run.created_by_instance_id)
        .bind(run.created_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        let payload = serde_json::to_string(&payloads::RunCreated {
            run_id: run.id,
            session_id: run.session_id,
            agent_id: run.agent_id,
        })?;
        Self::notify_in_tx(&mut tx, channels::RUN_CREATED, &payload).await?;
        tx.commit().await.map_err(Error::storage)
    }

    pub(super) async fn get_run_sql(&self, id: Uuid) -> Result<Run> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "run",
                id: id.to_string(),
            })?;
        rows::run_from_row(&row)
    }

    pub(super) async fn list_runs_sql(&self, filter: &RunFilter) -> Result<(Vec<Run>, usize)> {
        // Optional filters collapse via "IS NULL OR" so one statement
        // serves every combination.
        let state = filter.state.map(|s| enum_str(&s));
        let mode = filter.run_mode.map(|m| enum_str(&m));
        let limit = if filter.limit == 0 { i64::MAX } else { filter.limit as i64 };

        let total: i64 = sqlx::query(
            "SELECT count(*) AS n FROM runs \
             WHERE ($1::text IS NULL OR state = $1) \
               AND ($2::text IS NULL OR run_mode = $2) \
               AND ($3::uuid IS NULL OR session_id = $3) \
               AND ($4::uuid IS NULL OR agent_id = $4)",
        )
        .bind(&state)
        .bind(&mode)
        .bind(filter.session_id)
        .bind(filter.agent_id)
        .fetch_one(self.pool())
        .await
        .map_err(Error::storage)?
        .try_get("n")
        .map_err(Error::storage)?;

        let page = sqlx::query(
            "SELECT * FROM runs \
             WHERE ($1::text IS NULL OR state = $1) \
               AND ($2::text IS NULL OR run_mode = $2) \
               AND ($3::uuid IS NULL OR session_id = $3) \
               AND ($4::uuid IS NULL OR agent_id = $4) \
             ORDER BY created_at DESC \
             LIMIT $5 OFFSET $6",
        )
        .bind(&state)
        .bind(&mode)
        .bind(filter.session_id)
        .bind(filter.agent_id)
        .bind(limit)
        .bind(filter.offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;

        let runs: Result<Vec<Run>> = page.iter().map(rows::run_from_row).collect();
        Ok((runs?, total as usize))
    }

    pub(super) async fn claim_runs_sql(
        &self,
        instance_id: Uuid,
        max: usize,
        run_mode: RunMode,
    ) -> Result<Vec<Run>> {
        let mut tx = self.begin().await?;
        let claimed = sqlx::query(
            "WITH picked AS ( \
               SELECT r.id FROM runs r \
               JOIN agents a ON a.id = r.agent_id \
               JOIN instance_agents ia ON ia.instance_id = $1 AND ia.agent_name = a.name \
               WHERE r.state = 'pending' AND r.run_mode = $2 \
                 AND r.claimed_by_instance_id IS NULL \
               ORDER BY r.created_at \
               LIMIT $3 \
               FOR UPDATE OF r SKIP LOCKED \
             ) \
             UPDATE runs SET state = 'pending_api', claimed_by_instance_id = $1, \
               claimed_at = now(), started_at = COALESCE(started_at, now()) \
             WHERE id IN (SELECT id FROM picked) \
             RETURNING *",
        )
        .bind(instance_id)
        .bind(enum_str(&run_mode))
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::storage)?;

        if !claimed.is_empty() {
            sqlx::query("UPDATE instances SET active_run_count = active_run_count + $2 WHERE id = $1")
                .bind(instance_id)
                .bind(claimed.len() as i32)
                .execute(&mut *tx)
                .await
                .map_err(Error::storage)?;
        }
        for row in &claimed {
            let run_id: Uuid = row.try_get("id").map_err(Error::storage)?;
            Self::notify_in_tx(&mut tx, channels::RUN_STATE_CHANGED, &run_id.to_string()).await?;
        }
        tx.commit().await.map_err(Error::storage)?;

        claimed.iter().map(rows::run_from_row).collect()
    }

    pub(super) async fn list_claimed_runs_sql(&self, instance_id: Uuid, state: RunState) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE claimed_by_instance_id = $1 AND state = $2 ORDER BY created_at",
        )
        .bind(instance_id)
        .bind(enum_str(&state))
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;
        rows.iter().map(rows::run_from_row).collect()
    }

    pub(super) async fn update_run_state_sql(
        &self,
        id: Uuid,
        new_state: RunState,
        update: RunStateUpdate,
        required_state: Option<RunState>,
    ) -> Result<Run> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT state, claimed_by_instance_id FROM runs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "run",
                id: id.to_string(),
            })?;
        let current_raw: String = row.try_get("state").map_err(Error::storage)?;
        let claimant: Option<Uuid> = row.try_get("claimed_by_instance_id").map_err(Error::storage)?;
        let current: RunState = parse_enum(&current_raw)?;

        if let Some(required) = required_state {
            if current != required {
                return Err(transition_refused(current.as_str(), new_state.as_str()));
            }
        }
        if !current.can_transition_to(new_state) {
            return Err(transition_refused(current.as_str(), new_state.as_str()));
        }

        let error_json = match &update.error {
            Some(error) => Some(serde_json::to_value(error)?),
            None => None,
        };
        let usage = update.add_usage.unwrap_or_default();
        let terminal = new_state.is_terminal();

        sqlx::query(
            "UPDATE runs SET state = $2, \
               response_text = COALESCE($3, response_text), \
               error = COALESCE($4, error), \
               input_tokens = input_tokens + $5, \
               output_tokens = output_tokens + $6, \
               cache_creation_tokens = cache_creation_tokens + $7, \
               cache_read_tokens = cache_read_tokens + $8, \
               finalized_at = CASE WHEN $9 THEN now() ELSE finalized_at END, \
               claimed_by_instance_id = CASE WHEN $9 THEN NULL ELSE claimed_by_instance_id END, \
               claimed_at = CASE WHEN $9 THEN NULL ELSE claimed_at END \
             WHERE id = $1",
        )
        .bind(id)
        .bind(enum_str(&new_state))
        .bind(&update.response_text)
        .bind(error_json)
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cache_creation_tokens as i64)
        .bind(usage.cache_read_tokens as i64)
        .bind(terminal)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        if terminal {
            if let Some(instance_id) = claimant {
                sqlx::query(
                    "UPDATE instances SET active_run_count = GREATEST(active_run_count - 1, 0) \
                     WHERE id = $1",
                )
                .bind(instance_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::storage)?;
            }
        }

        Self::notify_in_tx(&mut tx, channels::RUN_STATE_CHANGED, &id.to_string()).await?;
        let updated = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::storage)?;
        let updated = rows::run_from_row(&updated)?;
        tx.commit().await.map_err(Error::storage)?;
        Ok(updated)
    }

    pub(super) async fn release_run_sql(&self, id: Uuid) -> Result<()> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT state, claimed_by_instance_id FROM runs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "run",
                id: id.to_string(),
            })?;
        let current_raw: String = row.try_get("state").map_err(Error::storage)?;
        let claimant: Option<Uuid> = row.try_get("claimed_by_instance_id").map_err(Error::storage)?;
        let current: RunState = parse_enum(&current_raw)?;
        if current.is_terminal() {
            return Err(transition_refused(current.as_str(), "pending"));
        }

        sqlx::query(
            "UPDATE runs SET state = 'pending', claimed_by_instance_id = NULL, claimed_at = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;
        if let Some(instance_id) = claimant {
            sqlx::query(
                "UPDATE instances SET active_run_count = GREATEST(active_run_count - 1, 0) WHERE id = $1",
            )
            .bind(instance_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;
        }
        Self::notify_in_tx(&mut tx, channels::RUN_STATE_CHANGED, &id.to_string()).await?;
        tx.commit().await.map_err(Error::storage)
    }

    pub(super) async fn release_expired_run_claims_sql(&self, older_than: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut tx = self.begin().await?;
        let requeued = sqlx::query(
            "UPDATE runs SET state = 'pending', claimed_by_instance_id = NULL, claimed_at = NULL \
             WHERE claimed_by_instance_id IS NOT NULL AND claimed_at < $1 \
               AND state IN ('pending_api', 'streaming') \
             RETURNING id",
        )
        .bind(older_than)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::storage)?;
        let detached = sqlx::query(
            "UPDATE runs SET claimed_by_instance_id = NULL, claimed_at = NULL \
             WHERE claimed_by_instance_id IS NOT NULL AND claimed_at < $1 \
               AND state IN ('batch_pending', 'batch_processing', 'pending_tools') \
             RETURNING id",
        )
        .bind(older_than)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::storage)?;

        let mut released = Vec::with_capacity(requeued.len() + detached.len());
        for row in requeued.iter().chain(detached.iter()) {
            let run_id: Uuid = row.try_get("id").map_err(Error::storage)?;
            Self::notify_in_tx(&mut tx, channels::RUN_STATE_CHANGED, &run_id.to_string()).await?;
            released.push(run_id);
        }
        tx.commit().await.map_err(Error::storage)?;
        Ok(released)
    }

    pub(super) async fn runs_with_all_tools_terminal_sql(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT r.id FROM runs r \
             JOIN iterations i ON i.run_id = r.id AND i.iteration_number = r.iteration_count \
             WHERE r.state = 'pending_tools' \
               AND EXISTS (SELECT 1 FROM tool_executions te WHERE te.iteration_id = i.id) \
               AND NOT EXISTS (SELECT 1 FROM tool_executions te \
                 WHERE te.iteration_id = i.id \
                   AND te.state NOT IN ('completed', 'failed', 'skipped'))",
        )
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(Error::storage))
            .collect()
    }

    pub(super) async fn record_iteration_result_sql(
        &self,
        record: crate::types::RecordIterationResult,
    ) -> Result<Run> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT state, claimed_by_instance_id FROM runs WHERE id = $1 FOR UPDATE")
            .bind(record.run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "run",
                id: record.run_id.to_string(),
            })?;
        let current_raw: String = row.try_get("state").map_err(Error::storage)?;
        let claimant: Option<Uuid> = row.try_get("claimed_by_instance_id").map_err(Error::storage)?;
        let current: RunState = parse_enum(&current_raw)?;
        if current != record.required_state || !current.can_transition_to(record.new_state) {
            return Err(transition_refused(current.as_str(), record.new_state.as_str()));
        }

        // Iteration close, guarded against double completion.
        let outcome = &record.iteration_outcome;
        let closed = sqlx::query(
            "UPDATE iterations SET stop_reason = $2, has_tool_use = $3, tool_execution_count = $4, \
               input_tokens = $5, output_tokens = $6, cache_creation_tokens = $7, \
               cache_read_tokens = $8, completed_at = now() \
             WHERE id = $1 AND completed_at IS NULL",
        )
        .bind(record.iteration_id)
        .bind(&outcome.stop_reason)
        .bind(outcome.has_tool_use)
        .bind(outcome.tool_execution_count as i32)
        .bind(outcome.usage.input_tokens as i64)
        .bind(outcome.usage.output_tokens as i64)
        .bind(outcome.usage.cache_creation_tokens as i64)
        .bind(outcome.usage.cache_read_tokens as i64)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;
        if closed.rows_affected() == 0 {
            return Err(Error::StateTransitionFailed {
                entity: "iteration",
                current: "completed".into(),
                requested: "completed".into(),
            });
        }

        Self::insert_message_in_tx(&mut tx, &record.assistant_message).await?;
        for te in &record.tool_executions {
            Self::insert_tool_execution_in_tx(&mut tx, te).await?;
        }

        let error_json = match &record.update.error {
            Some(error) => Some(serde_json::to_value(error)?),
            None => None,
        };
        let usage = record.update.add_usage.unwrap_or_default();
        let terminal = record.new_state.is_terminal();
        sqlx::query(
            "UPDATE runs SET state = $2, \
               response_text = COALESCE($3, response_text), \
               error = COALESCE($4, error), \
               input_tokens = input_tokens + $5, \
               output_tokens = output_tokens + $6, \
               cache_creation_tokens = cache_creation_tokens + $7, \
               cache_read_tokens = cache_read_tokens + $8, \
               finalized_at = CASE WHEN $9 THEN now() ELSE finalized_at END, \
               claimed_by_instance_id = CASE WHEN $9 THEN NULL ELSE claimed_by_instance_id END, \
               claimed_at = CASE WHEN $9 THEN NULL ELSE claimed_at END \
             WHERE id = $1",
        )
        .bind(record.run_id)
        .bind(enum_str(&record.new_state))
        .bind(&record.update.response_text)
        .bind(error_json)
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cache_creation_tokens as i64)
        .bind(usage.cache_read_tokens as i64)
        .bind(terminal)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        if terminal {
            if let Some(instance_id) = claimant {
                sqlx::query(
                    "UPDATE instances SET active_run_count = GREATEST(active_run_count - 1, 0) \
                     WHERE id = $1",
                )
                .bind(instance_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::storage)?;
            }
        }

        Self::notify_in_tx(&mut tx, channels::RUN_STATE_CHANGED, &record.run_id.to_string()).await?;
        let updated = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(record.run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::storage)?;
        let updated = rows::run_from_row(&updated)?;
        tx.commit().await.map_err(Error::storage)?;
        Ok(updated)
    }

    // ── Iterations ───────────────────────────────────────────────────

    pub(super) async fn create_iteration_sql(&self, iteration: &Iteration) -> Result<()> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT iteration_count FROM runs WHERE id = $1 FOR UPDATE")
            .bind(iteration.run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "run",
                id: iteration.run_id.to_string(),
            })?;
        let count: i32 = row.try_get("iteration_count").map_err(Error::storage)?;
        let expected = (count + 1) as u32;
        if iteration.iteration_number != expected {
            return Err(Error::StateTransitionFailed {
                entity: "iteration",
                current: format!("next number {expected}"),
                requested: iteration.iteration_number.to_string(),
            });
        }
        let open: Option<_> = sqlx::query("SELECT 1 FROM iterations WHERE run_id = $1 AND completed_at IS NULL")
            .bind(iteration.run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::storage)?;
        if open.is_some() {
            return Err(Error::StateTransitionFailed {
                entity: "iteration",
                current: "open".into(),
                requested: "second open iteration".into(),
            });
        }

        sqlx::query(
            "INSERT INTO iterations (id, run_id, iteration_number, is_streaming, trigger_type, \
             batch_id, batch_status, batch_poll_count, stop_reason, has_tool_use, \
             tool_execution_count, input_tokens, output_tokens, cache_creation_tokens, \
             cache_read_tokens, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, NULL, NULL, 0, NULL, FALSE, 0, 0, 0, 0, 0, $6, NULL)",
        )
        .bind(iteration.id)
        .bind(iteration.run_id)
        .bind(iteration.iteration_number as i32)
        .bind(iteration.is_streaming)
        .bind(enum_str(&iteration.trigger_type))
        .bind(iteration.started_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        sqlx::query("UPDATE runs SET iteration_count = $2 WHERE id = $1")
            .bind(iteration.run_id)
            .bind(expected as i32)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;
        tx.commit().await.map_err(Error::storage)
    }

    pub(super) async fn get_iteration_sql(&self, id: Uuid) -> Result<Iteration> {
        let row = sqlx::query("SELECT * FROM iterations WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "iteration",
                id: id.to_string(),
            })?;
        rows::iteration_from_row(&row)
    }

    pub(super) async fn list_iterations_sql(&self, run_id: Uuid) -> Result<Vec<Iteration>> {
        let rows = sqlx::query("SELECT * FROM iterations WHERE run_id = $1 ORDER BY iteration_number")
            .bind(run_id)
            .fetch_all(self.pool())
            .await
            .map_err(Error::storage)?;
        rows.iter().map(rows::iteration_from_row).collect()
    }

    pub(super) async fn get_open_iteration_sql(&self, run_id: Uuid) -> Result<Option<Iteration>> {
        let row = sqlx::query("SELECT * FROM iterations WHERE run_id = $1 AND completed_at IS NULL")
            .bind(run_id)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?;
        row.as_ref().map(rows::iteration_from_row).transpose()
    }

    pub(super) async fn complete_iteration_sql(&self, id: Uuid, outcome: IterationOutcome) -> Result<()> {
        let result = sqlx::query(
            "UPDATE iterations SET stop_reason = $2, has_tool_use = $3, tool_execution_count = $4, \
               input_tokens = $5, output_tokens = $6, cache_creation_tokens = $7, \
               cache_read_tokens = $8, completed_at = now() \
             WHERE id = $1 AND completed_at IS NULL",
        )
        .bind(id)
        .bind(&outcome.stop_reason)
        .bind(outcome.has_tool_use)
        .bind(outcome.tool_execution_count as i32)
        .bind(outcome.usage.input_tokens as i64)
        .bind(outcome.usage.output_tokens as i64)
        .bind(outcome.usage.cache_creation_tokens as i64)
        .bind(outcome.usage.cache_read_tokens as i64)
        .execute(self.pool())
        .await
        .map_err(Error::storage)?;
        if result.rows_affected() == 0 {
            return Err(Error::StateTransitionFailed {
                entity: "iteration",
                current: "completed".into(),
                requested: "completed".into(),
            });
        }
        Ok(())
    }

    pub(super) async fn update_iteration_batch_sql(
        &self,
        id: Uuid,
        batch_id: &str,
        batch_status: BatchStatus,
        increment_poll_count: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE iterations SET batch_id = $2, batch_status = $3, \
               batch_poll_count = batch_poll_count + CASE WHEN $4 THEN 1 ELSE 0 END \
             WHERE id = $1",
        )
        .bind(id)
        .bind(batch_id)
        .bind(enum_str(&batch_status))
        .bind(increment_poll_count)
        .execute(self.pool())
        .await
        .map_err(Error::storage)?;
        Ok(())
    }

    pub(super) async fn list_open_batch_iterations_sql(&self) -> Result<Vec<Iteration>> {
        let rows = sqlx::query(
            "SELECT * FROM iterations WHERE completed_at IS NULL AND batch_id IS NOT NULL \
             ORDER BY started_at",
        )
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;
        rows.iter().map(rows::iteration_from_row).collect()
    }
}
