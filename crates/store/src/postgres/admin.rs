//! Sessions, the agent/tool catalog, instances, and the leader lease.

use am_domain::catalog::{AgentDefinition, ToolRecord};
use am_domain::instance::{Instance, Leader};
use am_domain::session::Session;
use am_domain::{Error, Result};
use chrono::Duration;
use sqlx::Row;
use uuid::Uuid;

use crate::types::EvictionReport;
use crate::channels;

use super::rows;
use super::PostgresStore;

impl PostgresStore {
    // ── Sessions ─────────────────────────────────────────────────────

    pub(super) async fn create_session_sql(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, tenant_id, identifier, parent_session_id, metadata, \
             compaction_count, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(session.id)
        .bind(&session.tenant_id)
        .bind(&session.identifier)
        .bind(session.parent_session_id)
        .bind(&session.metadata)
        .bind(session.compaction_count as i32)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(self.pool())
        .await
        .map_err(Error::storage)?;
        Ok(())
    }

    pub(super) async fn get_session_sql(&self, id: Uuid) -> Result<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "session",
                id: id.to_string(),
            })?;
        rows::session_from_row(&row)
    }

    // ── Agent / tool catalog ─────────────────────────────────────────

    pub(super) async fn upsert_agent_sql(&self, agent: &AgentDefinition) -> Result<()> {
        sqlx::query(
            "INSERT INTO agents (id, name, description, model, system_prompt, max_output_tokens, \
             tool_names, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (name) DO UPDATE SET \
               description = EXCLUDED.description, \
               model = EXCLUDED.model, \
               system_prompt = EXCLUDED.system_prompt, \
               max_output_tokens = EXCLUDED.max_output_tokens, \
               tool_names = EXCLUDED.tool_names",
        )
        .bind(agent.id)
        .bind(&agent.name)
        .bind(&agent.description)
        .bind(&agent.model)
        .bind(&agent.system_prompt)
        .bind(agent.max_output_tokens as i32)
        .bind(serde_json::to_value(&agent.tool_names)?)
        .bind(agent.created_at)
        .execute(self.pool())
        .await
        .map_err(Error::storage)?;
        Ok(())
    }

    pub(super) async fn get_agent_sql(&self, id: Uuid) -> Result<AgentDefinition> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "agent",
                id: id.to_string(),
            })?;
        rows::agent_from_row(&row)
    }

    pub(super) async fn get_agent_by_name_sql(&self, name: &str) -> Result<AgentDefinition> {
        let row = sqlx::query("SELECT * FROM agents WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "agent",
                id: name.to_string(),
            })?;
        rows::agent_from_row(&row)
    }

    pub(super) async fn list_agents_sql(&self) -> Result<Vec<AgentDefinition>> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY name")
            .fetch_all(self.pool())
            .await
            .map_err(Error::storage)?;
        rows.iter().map(rows::agent_from_row).collect()
    }

    pub(super) async fn upsert_tool_sql(&self, tool: &ToolRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO tools (id, name, description, input_schema, created_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (name) DO UPDATE SET \
               description = EXCLUDED.description, \
               input_schema = EXCLUDED.input_schema",
        )
        .bind(tool.id)
        .bind(&tool.name)
        .bind(&tool.description)
        .bind(&tool.input_schema)
        .bind(tool.created_at)
        .execute(self.pool())
        .await
        .map_err(Error::storage)?;
        Ok(())
    }

    pub(super) async fn get_tool_by_name_sql(&self, name: &str) -> Result<ToolRecord> {
        let row = sqlx::query("SELECT * FROM tools WHERE name = $1")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "tool",
                id: name.to_string(),
            })?;
        rows::tool_from_row(&row)
    }

    pub(super) async fn list_tools_sql(&self) -> Result<Vec<ToolRecord>> {
        let rows = sqlx::query("SELECT * FROM tools ORDER BY name")
            .fetch_all(self.pool())
            .await
            .map_err(Error::storage)?;
        rows.iter().map(rows::tool_from_row).collect()
    }

    // ── Instances ────────────────────────────────────────────────────

    pub(super) async fn register_instance_sql(
        &self,
        instance: &Instance,
        agent_names: &[String],
        tool_names: &[String],
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query(
            "INSERT INTO instances (id, name, hostname, pid, version, max_concurrent_runs, \
             max_concurrent_tools, active_run_count, active_tool_count, metadata, created_at, \
             last_heartbeat_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 0, 0, $8, $9, $10)",
        )
        .bind(instance.id)
        .bind(&instance.name)
        .bind(&instance.hostname)
        .bind(instance.pid as i32)
        .bind(&instance.version)
        .bind(instance.max_concurrent_runs as i32)
        .bind(instance.max_concurrent_tools as i32)
        .bind(&instance.metadata)
        .bind(instance.created_at)
        .bind(instance.last_heartbeat_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        Self::replace_capabilities(&mut tx, instance.id, agent_names, tool_names).await?;
        Self::notify_in_tx(&mut tx, channels::INSTANCE_REGISTERED, &instance.id.to_string()).await?;
        tx.commit().await.map_err(Error::storage)
    }

    async fn replace_capabilities(
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        instance_id: Uuid,
        agent_names: &[String],
        tool_names: &[String],
    ) -> Result<()> {
        sqlx::query("DELETE FROM instance_agents WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut **tx)
            .await
            .map_err(Error::storage)?;
        sqlx::query("DELETE FROM instance_tools WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&mut **tx)
            .await
            .map_err(Error::storage)?;
        for name in agent_names {
            sqlx::query("INSERT INTO instance_agents (instance_id, agent_name) VALUES ($1, $2)")
                .bind(instance_id)
                .bind(name)
                .execute(&mut **tx)
                .await
                .map_err(Error::storage)?;
        }
        for name in tool_names {
            sqlx::query("INSERT INTO instance_tools (instance_id, tool_name) VALUES ($1, $2)")
                .bind(instance_id)
                .bind(name)
                .execute(&mut **tx)
                .await
                .map_err(Error::storage)?;
        }
        Ok(())
    }

    pub(super) async fn heartbeat_instance_sql(
        &self,
        id: Uuid,
        agent_names: &[String],
        tool_names: &[String],
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        // Heartbeat doubles as counter reconciliation: recompute the
        // advisory counters from actual claims.
        let updated = sqlx::query(
            "UPDATE instances SET \
               last_heartbeat_at = now(), \
               active_run_count = (SELECT count(*) FROM runs r \
                  WHERE r.claimed_by_instance_id = instances.id \
                    AND r.state NOT IN ('completed', 'failed', 'cancelled')), \
               active_tool_count = (SELECT count(*) FROM tool_executions te \
                  WHERE te.claimed_by_instance_id = instances.id AND te.state = 'running') \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;
        if updated.rows_affected() == 0 {
            return Err(Error::NotFound {
                entity: "instance",
                id: id.to_string(),
            });
        }
        Self::replace_capabilities(&mut tx, id, agent_names, tool_names).await?;
        tx.commit().await.map_err(Error::storage)
    }

    pub(super) async fn deregister_instance_sql(&self, id: Uuid) -> Result<()> {
        let mut tx = self.begin().await?;
        sqlx::query("DELETE FROM instances WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;
        Self::notify_in_tx(&mut tx, channels::INSTANCE_DEREGISTERED, &id.to_string()).await?;
        tx.commit().await.map_err(Error::storage)
    }

    pub(super) async fn get_instance_sql(&self, id: Uuid) -> Result<Instance> {
        let row = sqlx::query("SELECT * FROM instances WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "instance",
                id: id.to_string(),
            })?;
        rows::instance_from_row(&row)
    }

    pub(super) async fn list_instances_sql(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY created_at")
            .fetch_all(self.pool())
            .await
            .map_err(Error::storage)?;
        rows.iter().map(rows::instance_from_row).collect()
    }

    pub(super) async fn evict_instance_sql(&self, id: Uuid) -> Result<EvictionReport> {
        let mut tx = self.begin().await?;

        // Runs that need a live claimant go back to pending; batch and
        // tool waits progress without one, so only the claim is cleared.
        let requeued = sqlx::query(
            "UPDATE runs SET state = 'pending', claimed_by_instance_id = NULL, claimed_at = NULL \
             WHERE claimed_by_instance_id = $1 AND state IN ('pending_api', 'streaming') \
             RETURNING id",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::storage)?;
        let detached = sqlx::query(
            "UPDATE runs SET claimed_by_instance_id = NULL, claimed_at = NULL \
             WHERE claimed_by_instance_id = $1 \
               AND state IN ('batch_pending', 'batch_processing', 'pending_tools') \
             RETURNING id",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::storage)?;

        let tools = sqlx::query(
            "UPDATE tool_executions SET state = 'pending', claimed_by_instance_id = NULL, \
               scheduled_at = now() \
             WHERE claimed_by_instance_id = $1 AND state = 'running' \
             RETURNING id",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::storage)?;

        sqlx::query("DELETE FROM instances WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;

        for row in &requeued {
            let run_id: Uuid = row.try_get("id").map_err(Error::storage)?;
            Self::notify_in_tx(&mut tx, channels::RUN_STATE_CHANGED, &run_id.to_string()).await?;
        }
        Self::notify_in_tx(&mut tx, channels::INSTANCE_DEREGISTERED, &id.to_string()).await?;
        tx.commit().await.map_err(Error::storage)?;

        Ok(EvictionReport {
            released_runs: (requeued.len() + detached.len()) as u32,
            released_tools: tools.len() as u32,
        })
    }

    // ── Leader ───────────────────────────────────────────────────────

    pub(super) async fn leader_attempt_elect_sql(&self, id: Uuid, ttl: Duration) -> Result<bool> {
        let mut tx = self.begin().await?;
        let row = sqlx::query(
            "INSERT INTO leader (singleton, leader_id, elected_at, expires_at) \
             VALUES (TRUE, $1, now(), now() + make_interval(secs => $2)) \
             ON CONFLICT (singleton) DO UPDATE SET \
               leader_id = EXCLUDED.leader_id, \
               elected_at = EXCLUDED.elected_at, \
               expires_at = EXCLUDED.expires_at \
             WHERE leader.expires_at <= now() \
             RETURNING leader_id",
        )
        .bind(id)
        .bind(ttl.num_milliseconds() as f64 / 1000.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::storage)?;

        let elected = row.is_some();
        if elected {
            Self::notify_in_tx(&mut tx, channels::LEADER_CHANGED, &id.to_string()).await?;
        }
        tx.commit().await.map_err(Error::storage)?;
        Ok(elected)
    }

    pub(super) async fn leader_attempt_reelect_sql(&self, id: Uuid, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE leader SET expires_at = now() + make_interval(secs => $2) WHERE leader_id = $1",
        )
        .bind(id)
        .bind(ttl.num_milliseconds() as f64 / 1000.0)
        .execute(self.pool())
        .await
        .map_err(Error::storage)?;
        Ok(result.rows_affected() > 0)
    }

    pub(super) async fn leader_resign_sql(&self, id: Uuid) -> Result<()> {
        let mut tx = self.begin().await?;
        let result = sqlx::query("DELETE FROM leader WHERE leader_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;
        if result.rows_affected() > 0 {
            Self::notify_in_tx(&mut tx, channels::LEADER_CHANGED, "").await?;
        }
        tx.commit().await.map_err(Error::storage)
    }

    pub(super) async fn current_leader_sql(&self) -> Result<Option<Leader>> {
        let row = sqlx::query("SELECT leader_id, elected_at, expires_at FROM leader")
            .fetch_optional(self.pool())
            .await
            .map_err(Error::storage)?;
        match row {
            Some(row) => Ok(Some(Leader {
                leader_id: row.try_get("leader_id").map_err(Error::storage)?,
                elected_at: row.try_get("elected_at").map_err(Error::storage)?,
                expires_at: row.try_get("expires_at").map_err(Error::storage)?,
            })),
            None => Ok(None),
        }
    }
}
