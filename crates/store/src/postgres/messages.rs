//! Message, content-block, and compaction SQL.

use std::collections::HashMap;

use am_domain::compaction::{CompactionEvent, MessageArchive};
use am_domain::message::{ContentBlock, Message, Role};
use am_domain::run::RunState;
use am_domain::{Error, Result};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::types::ApplyCompaction;
use crate::channels;

use super::rows::{self, enum_str, parse_enum};
use super::PostgresStore;

impl PostgresStore {
    pub(super) async fn insert_message_in_tx(
        tx: &mut Transaction<'static, Postgres>,
        message: &Message,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, session_id, run_id, role, input_tokens, output_tokens, \
             cache_creation_tokens, cache_read_tokens, is_preserved, is_summary, metadata, \
             created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(message.id)
        .bind(message.session_id)
        .bind(message.run_id)
        .bind(enum_str(&message.role))
        .bind(message.usage.input_tokens as i64)
        .bind(message.usage.output_tokens as i64)
        .bind(message.usage.cache_creation_tokens as i64)
        .bind(message.usage.cache_read_tokens as i64)
        .bind(message.is_preserved)
        .bind(message.is_summary)
        .bind(&message.metadata)
        .bind(message.created_at)
        .execute(&mut **tx)
        .await
        .map_err(Error::storage)?;

        for (index, block) in message.blocks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO content_blocks (message_id, block_index, block) VALUES ($1, $2, $3)",
            )
            .bind(message.id)
            .bind(index as i32)
            .bind(serde_json::to_value(block)?)
            .execute(&mut **tx)
            .await
            .map_err(Error::storage)?;
        }

        sqlx::query("UPDATE sessions SET updated_at = now() WHERE id = $1")
            .bind(message.session_id)
            .execute(&mut **tx)
            .await
            .map_err(Error::storage)?;
        Ok(())
    }

    /// Refuse tool_result blocks whose tool_use id is unknown to the
    /// session.
    async fn validate_tool_results_in_tx(
        tx: &mut Transaction<'static, Postgres>,
        message: &Message,
    ) -> Result<()> {
        for block in &message.blocks {
            let ContentBlock::ToolResult { tool_use_id, .. } = block else {
                continue;
            };
            let ok: bool = sqlx::query(
                "SELECT EXISTS ( \
                   SELECT 1 FROM content_blocks cb \
                   JOIN messages m ON m.id = cb.message_id \
                   WHERE m.session_id = $1 \
                     AND cb.block->>'type' = 'tool_use' \
                     AND cb.block->>'id' = $2 \
                 ) AS ok",
            )
            .bind(message.session_id)
            .bind(tool_use_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::storage)?
            .try_get("ok")
            .map_err(Error::storage)?;
            if !ok {
                return Err(Error::BuildError(format!(
                    "tool_result references unknown tool_use id {tool_use_id}"
                )));
            }
        }
        Ok(())
    }

    pub(super) async fn append_message_sql(&self, message: &Message) -> Result<()> {
        let mut tx = self.begin().await?;
        Self::validate_tool_results_in_tx(&mut tx, message).await?;
        Self::insert_message_in_tx(&mut tx, message).await?;
        tx.commit().await.map_err(Error::storage)
    }

    /// Fetch blocks for a set of message rows and assemble full messages.
    async fn assemble_messages(&self, message_rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Message>> {
        if message_rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = message_rows
            .iter()
            .map(|row| row.try_get("id").map_err(Error::storage))
            .collect::<Result<_>>()?;

        let block_rows = sqlx::query(
            "SELECT message_id, block_index, block FROM content_blocks \
             WHERE message_id = ANY($1) ORDER BY message_id, block_index",
        )
        .bind(&ids)
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;

        let mut blocks_by_message: HashMap<Uuid, Vec<serde_json::Value>> = HashMap::new();
        for row in block_rows {
            let message_id: Uuid = row.try_get("message_id").map_err(Error::storage)?;
            let block: serde_json::Value = row.try_get("block").map_err(Error::storage)?;
            blocks_by_message.entry(message_id).or_default().push(block);
        }

        let mut messages = Vec::with_capacity(message_rows.len());
        for row in &message_rows {
            let id: Uuid = row.try_get("id").map_err(Error::storage)?;
            let blocks = blocks_by_message.remove(&id).unwrap_or_default();
            messages.push(rows::message_from_row(row, blocks)?);
        }
        Ok(messages)
    }

    pub(super) async fn get_messages_sql(&self, session_id: Uuid) -> Result<Vec<Message>> {
        let message_rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = $1 ORDER BY created_at, seq",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;
        self.assemble_messages(message_rows).await
    }

    pub(super) async fn get_messages_for_run_context_sql(&self, run_id: Uuid) -> Result<Vec<Message>> {
        let message_rows = sqlx::query(
            "WITH RECURSIVE descendants AS ( \
               SELECT id FROM runs WHERE parent_run_id = $1 \
               UNION ALL \
               SELECT r.id FROM runs r JOIN descendants d ON r.parent_run_id = d.id \
             ) \
             SELECT m.* FROM messages m \
             WHERE m.session_id = (SELECT session_id FROM runs WHERE id = $1) \
               AND (m.run_id IS NULL OR m.run_id NOT IN (SELECT id FROM descendants)) \
             ORDER BY m.created_at, m.seq",
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;
        self.assemble_messages(message_rows).await
    }

    pub(super) async fn complete_tools_and_continue_run_sql(
        &self,
        session_id: Uuid,
        run_id: Uuid,
        blocks: Vec<ContentBlock>,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        let row = sqlx::query("SELECT state, claimed_by_instance_id FROM runs WHERE id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::storage)?
            .ok_or(Error::NotFound {
                entity: "run",
                id: run_id.to_string(),
            })?;
        let current_raw: String = row.try_get("state").map_err(Error::storage)?;
        let current: RunState = parse_enum(&current_raw)?;
        if current != RunState::PendingTools {
            return Err(Error::StateTransitionFailed {
                entity: "run",
                current: current_raw,
                requested: "pending_api".to_string(),
            });
        }
        let claimant: Option<Uuid> = row.try_get("claimed_by_instance_id").map_err(Error::storage)?;
        // An orphaned claim routes the continuation through `pending` so
        // any instance can pick it up.
        let next_state = if claimant.is_some() { "pending_api" } else { "pending" };

        let message = Message::new(session_id, Role::User, blocks).for_run(run_id);
        Self::validate_tool_results_in_tx(&mut tx, &message).await?;
        Self::insert_message_in_tx(&mut tx, &message).await?;

        sqlx::query("UPDATE runs SET state = $2 WHERE id = $1")
            .bind(run_id)
            .bind(next_state)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;

        Self::notify_in_tx(&mut tx, channels::RUN_STATE_CHANGED, &run_id.to_string()).await?;
        tx.commit().await.map_err(Error::storage)
    }

    // ── Compaction ───────────────────────────────────────────────────

    pub(super) async fn apply_compaction_sql(&self, apply: ApplyCompaction) -> Result<()> {
        let mut tx = self.begin().await?;
        let event = &apply.event;

        sqlx::query(
            "INSERT INTO compaction_events (id, session_id, strategy, original_tokens, \
             compacted_tokens, messages_removed, summary_content, preserved_message_ids, \
             model_used, duration_ms, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(event.id)
        .bind(event.session_id)
        .bind(&event.strategy)
        .bind(event.original_tokens as i64)
        .bind(event.compacted_tokens as i64)
        .bind(event.messages_removed as i32)
        .bind(&event.summary_content)
        .bind(serde_json::to_value(&event.preserved_message_ids)?)
        .bind(&event.model_used)
        .bind(event.duration_ms as i64)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        // Archive full message bodies before deletion.
        let archive_rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = $1 AND id = ANY($2) ORDER BY created_at, seq",
        )
        .bind(apply.session_id)
        .bind(&apply.archive_message_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::storage)?;
        if archive_rows.len() != apply.archive_message_ids.len() {
            return Err(Error::NotFound {
                entity: "message",
                id: "archive set references unknown messages".into(),
            });
        }
        for row in &archive_rows {
            let message_id: Uuid = row.try_get("id").map_err(Error::storage)?;
            let block_rows = sqlx::query(
                "SELECT block FROM content_blocks WHERE message_id = $1 ORDER BY block_index",
            )
            .bind(message_id)
            .fetch_all(&mut *tx)
            .await
            .map_err(Error::storage)?;
            let blocks: Vec<serde_json::Value> = block_rows
                .iter()
                .map(|b| b.try_get("block").map_err(Error::storage))
                .collect::<Result<_>>()?;
            let message = rows::message_from_row(row, blocks)?;

            sqlx::query(
                "INSERT INTO message_archive (id, compaction_event_id, message_id, session_id, \
                 body, archived_at) VALUES ($1, $2, $3, $4, $5, now())",
            )
            .bind(Uuid::new_v4())
            .bind(event.id)
            .bind(message_id)
            .bind(apply.session_id)
            .bind(serde_json::to_value(&message)?)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;
        }

        // In-place rewrites (hybrid tool-output pruning): replace blocks
        // and usage, keep the message row.
        for rewrite in &apply.rewrite_messages {
            sqlx::query("DELETE FROM content_blocks WHERE message_id = $1")
                .bind(rewrite.id)
                .execute(&mut *tx)
                .await
                .map_err(Error::storage)?;
            for (index, block) in rewrite.blocks.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO content_blocks (message_id, block_index, block) VALUES ($1, $2, $3)",
                )
                .bind(rewrite.id)
                .bind(index as i32)
                .bind(serde_json::to_value(block)?)
                .execute(&mut *tx)
                .await
                .map_err(Error::storage)?;
            }
            sqlx::query(
                "UPDATE messages SET input_tokens = $2, output_tokens = $3, \
                   cache_creation_tokens = $4, cache_read_tokens = $5 \
                 WHERE id = $1",
            )
            .bind(rewrite.id)
            .bind(rewrite.usage.input_tokens as i64)
            .bind(rewrite.usage.output_tokens as i64)
            .bind(rewrite.usage.cache_creation_tokens as i64)
            .bind(rewrite.usage.cache_read_tokens as i64)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;
        }

        // content_blocks rows go with their messages (ON DELETE CASCADE).
        sqlx::query("DELETE FROM messages WHERE session_id = $1 AND id = ANY($2)")
            .bind(apply.session_id)
            .bind(&apply.archive_message_ids)
            .execute(&mut *tx)
            .await
            .map_err(Error::storage)?;

        if let Some(summary) = &apply.summary_message {
            Self::insert_message_in_tx(&mut tx, summary).await?;
        }

        sqlx::query(
            "UPDATE sessions SET compaction_count = compaction_count + 1, updated_at = now() \
             WHERE id = $1",
        )
        .bind(apply.session_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::storage)?;

        tx.commit().await.map_err(Error::storage)
    }

    pub(super) async fn list_compaction_events_sql(&self, session_id: Uuid) -> Result<Vec<CompactionEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM compaction_events WHERE session_id = $1 ORDER BY created_at",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;
        rows.iter().map(rows::compaction_event_from_row).collect()
    }

    pub(super) async fn list_archived_messages_sql(&self, event_id: Uuid) -> Result<Vec<MessageArchive>> {
        let rows = sqlx::query(
            "SELECT * FROM message_archive WHERE compaction_event_id = $1 ORDER BY archived_at",
        )
        .bind(event_id)
        .fetch_all(self.pool())
        .await
        .map_err(Error::storage)?;
        rows.iter().map(rows::archive_from_row).collect()
    }
}
