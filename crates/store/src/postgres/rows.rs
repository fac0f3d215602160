//! Row ↔ entity mapping for the Postgres store. Enums ride as TEXT in
//! their serde snake_case form; JSONB carries metadata, tool inputs, and
//! content blocks.

use am_domain::catalog::{AgentDefinition, ToolRecord};
use am_domain::compaction::{CompactionEvent, MessageArchive};
use am_domain::instance::Instance;
use am_domain::iteration::Iteration;
use am_domain::message::{Message, TokenUsage};
use am_domain::run::{Run, RunError};
use am_domain::session::Session;
use am_domain::tool_execution::ToolExecution;
use am_domain::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

/// Parse a TEXT column holding a serde snake_case enum value.
pub(super) fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| Error::Other(format!("unknown enum value {raw:?}: {e}")))
}

/// Serialize an enum to its serde snake_case TEXT form.
pub(super) fn enum_str<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        other => {
            tracing::error!(?other, "enum did not serialize to a string");
            String::new()
        }
    }
}

fn usage_from_row(row: &PgRow) -> Result<TokenUsage> {
    Ok(TokenUsage {
        input_tokens: row.try_get::<i64, _>("input_tokens").map_err(Error::storage)? as u64,
        output_tokens: row.try_get::<i64, _>("output_tokens").map_err(Error::storage)? as u64,
        cache_creation_tokens: row
            .try_get::<i64, _>("cache_creation_tokens")
            .map_err(Error::storage)? as u64,
        cache_read_tokens: row.try_get::<i64, _>("cache_read_tokens").map_err(Error::storage)? as u64,
    })
}

pub(super) fn session_from_row(row: &PgRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id").map_err(Error::storage)?,
        tenant_id: row.try_get("tenant_id").map_err(Error::storage)?,
        identifier: row.try_get("identifier").map_err(Error::storage)?,
        parent_session_id: row.try_get("parent_session_id").map_err(Error::storage)?,
        metadata: row.try_get("metadata").map_err(Error::storage)?,
        compaction_count: row.try_get::<i32, _>("compaction_count").map_err(Error::storage)? as u32,
        created_at: row.try_get("created_at").map_err(Error::storage)?,
        updated_at: row.try_get("updated_at").map_err(Error::storage)?,
    })
}

pub(super) fn agent_from_row(row: &PgRow) -> Result<AgentDefinition> {
    let tool_names: serde_json::Value = row.try_get("tool_names").map_err(Error::storage)?;
    Ok(AgentDefinition {
        id: row.try_get("id").map_err(Error::storage)?,
        name: row.try_get("name").map_err(Error::storage)?,
        description: row.try_get("description").map_err(Error::storage)?,
        model: row.try_get("model").map_err(Error::storage)?,
        system_prompt: row.try_get("system_prompt").map_err(Error::storage)?,
        max_output_tokens: row.try_get::<i32, _>("max_output_tokens").map_err(Error::storage)? as u32,
        tool_names: serde_json::from_value(tool_names)?,
        created_at: row.try_get("created_at").map_err(Error::storage)?,
    })
}

pub(super) fn tool_from_row(row: &PgRow) -> Result<ToolRecord> {
    Ok(ToolRecord {
        id: row.try_get("id").map_err(Error::storage)?,
        name: row.try_get("name").map_err(Error::storage)?,
        description: row.try_get("description").map_err(Error::storage)?,
        input_schema: row.try_get("input_schema").map_err(Error::storage)?,
        created_at: row.try_get("created_at").map_err(Error::storage)?,
    })
}

pub(super) fn instance_from_row(row: &PgRow) -> Result<Instance> {
    Ok(Instance {
        id: row.try_get("id").map_err(Error::storage)?,
        name: row.try_get("name").map_err(Error::storage)?,
        hostname: row.try_get("hostname").map_err(Error::storage)?,
        pid: row.try_get::<i32, _>("pid").map_err(Error::storage)? as u32,
        version: row.try_get("version").map_err(Error::storage)?,
        max_concurrent_runs: row.try_get::<i32, _>("max_concurrent_runs").map_err(Error::storage)? as u32,
        max_concurrent_tools: row.try_get::<i32, _>("max_concurrent_tools").map_err(Error::storage)? as u32,
        active_run_count: row.try_get::<i32, _>("active_run_count").map_err(Error::storage)?.max(0) as u32,
        active_tool_count: row.try_get::<i32, _>("active_tool_count").map_err(Error::storage)?.max(0) as u32,
        metadata: row.try_get("metadata").map_err(Error::storage)?,
        created_at: row.try_get("created_at").map_err(Error::storage)?,
        last_heartbeat_at: row.try_get("last_heartbeat_at").map_err(Error::storage)?,
    })
}

pub(super) fn run_from_row(row: &PgRow) -> Result<Run> {
    let state: String = row.try_get("state").map_err(Error::storage)?;
    let run_mode: String = row.try_get("run_mode").map_err(Error::storage)?;
    let error: Option<serde_json::Value> = row.try_get("error").map_err(Error::storage)?;
    let error: Option<RunError> = match error {
        Some(value) => Some(serde_json::from_value(value)?),
        None => None,
    };
    Ok(Run {
        id: row.try_get("id").map_err(Error::storage)?,
        session_id: row.try_get("session_id").map_err(Error::storage)?,
        agent_id: row.try_get("agent_id").map_err(Error::storage)?,
        run_mode: parse_enum(&run_mode)?,
        prompt: row.try_get("prompt").map_err(Error::storage)?,
        state: parse_enum(&state)?,
        depth: row.try_get::<i32, _>("depth").map_err(Error::storage)? as u32,
        parent_run_id: row.try_get("parent_run_id").map_err(Error::storage)?,
        parent_tool_execution_id: row.try_get("parent_tool_execution_id").map_err(Error::storage)?,
        iteration_count: row.try_get::<i32, _>("iteration_count").map_err(Error::storage)? as u32,
        usage: usage_from_row(row)?,
        response_text: row.try_get("response_text").map_err(Error::storage)?,
        error,
        created_by_instance_id: row.try_get("created_by_instance_id").map_err(Error::storage)?,
        claimed_by_instance_id: row.try_get("claimed_by_instance_id").map_err(Error::storage)?,
        claimed_at: row.try_get("claimed_at").map_err(Error::storage)?,
        created_at: row.try_get("created_at").map_err(Error::storage)?,
        started_at: row.try_get("started_at").map_err(Error::storage)?,
        finalized_at: row.try_get("finalized_at").map_err(Error::storage)?,
    })
}

pub(super) fn iteration_from_row(row: &PgRow) -> Result<Iteration> {
    let trigger: String = row.try_get("trigger_type").map_err(Error::storage)?;
    let batch_status: Option<String> = row.try_get("batch_status").map_err(Error::storage)?;
    let batch_status = match batch_status {
        Some(raw) => Some(parse_enum(&raw)?),
        None => None,
    };
    Ok(Iteration {
        id: row.try_get("id").map_err(Error::storage)?,
        run_id: row.try_get("run_id").map_err(Error::storage)?,
        iteration_number: row.try_get::<i32, _>("iteration_number").map_err(Error::storage)? as u32,
        is_streaming: row.try_get("is_streaming").map_err(Error::storage)?,
        trigger_type: parse_enum(&trigger)?,
        batch_id: row.try_get("batch_id").map_err(Error::storage)?,
        batch_status,
        batch_poll_count: row.try_get::<i32, _>("batch_poll_count").map_err(Error::storage)? as u32,
        stop_reason: row.try_get("stop_reason").map_err(Error::storage)?,
        has_tool_use: row.try_get("has_tool_use").map_err(Error::storage)?,
        tool_execution_count: row.try_get::<i32, _>("tool_execution_count").map_err(Error::storage)? as u32,
        usage: usage_from_row(row)?,
        started_at: row.try_get("started_at").map_err(Error::storage)?,
        completed_at: row.try_get("completed_at").map_err(Error::storage)?,
    })
}

pub(super) fn tool_execution_from_row(row: &PgRow) -> Result<ToolExecution> {
    let state: String = row.try_get("state").map_err(Error::storage)?;
    Ok(ToolExecution {
        id: row.try_get("id").map_err(Error::storage)?,
        run_id: row.try_get("run_id").map_err(Error::storage)?,
        iteration_id: row.try_get("iteration_id").map_err(Error::storage)?,
        state: parse_enum(&state)?,
        tool_use_id: row.try_get("tool_use_id").map_err(Error::storage)?,
        tool_name: row.try_get("tool_name").map_err(Error::storage)?,
        tool_input: row.try_get("tool_input").map_err(Error::storage)?,
        is_agent_tool: row.try_get("is_agent_tool").map_err(Error::storage)?,
        agent_id: row.try_get("agent_id").map_err(Error::storage)?,
        child_run_id: row.try_get("child_run_id").map_err(Error::storage)?,
        tool_output: row.try_get("tool_output").map_err(Error::storage)?,
        is_error: row.try_get("is_error").map_err(Error::storage)?,
        error_message: row.try_get("error_message").map_err(Error::storage)?,
        attempt_count: row.try_get::<i32, _>("attempt_count").map_err(Error::storage)? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(Error::storage)? as u32,
        scheduled_at: row.try_get("scheduled_at").map_err(Error::storage)?,
        claimed_by_instance_id: row.try_get("claimed_by_instance_id").map_err(Error::storage)?,
        created_at: row.try_get("created_at").map_err(Error::storage)?,
        started_at: row.try_get("started_at").map_err(Error::storage)?,
        completed_at: row.try_get("completed_at").map_err(Error::storage)?,
    })
}

/// Build a message from its row and the already-fetched blocks.
pub(super) fn message_from_row(row: &PgRow, blocks: Vec<serde_json::Value>) -> Result<Message> {
    let role: String = row.try_get("role").map_err(Error::storage)?;
    let mut parsed_blocks = Vec::with_capacity(blocks.len());
    for block in blocks {
        parsed_blocks.push(serde_json::from_value(block)?);
    }
    Ok(Message {
        id: row.try_get("id").map_err(Error::storage)?,
        session_id: row.try_get("session_id").map_err(Error::storage)?,
        run_id: row.try_get("run_id").map_err(Error::storage)?,
        role: parse_enum(&role)?,
        blocks: parsed_blocks,
        usage: usage_from_row(row)?,
        is_preserved: row.try_get("is_preserved").map_err(Error::storage)?,
        is_summary: row.try_get("is_summary").map_err(Error::storage)?,
        metadata: row.try_get("metadata").map_err(Error::storage)?,
        created_at: row.try_get("created_at").map_err(Error::storage)?,
    })
}

pub(super) fn compaction_event_from_row(row: &PgRow) -> Result<CompactionEvent> {
    let preserved: serde_json::Value = row.try_get("preserved_message_ids").map_err(Error::storage)?;
    let preserved_message_ids: Vec<Uuid> = serde_json::from_value(preserved)?;
    Ok(CompactionEvent {
        id: row.try_get("id").map_err(Error::storage)?,
        session_id: row.try_get("session_id").map_err(Error::storage)?,
        strategy: row.try_get("strategy").map_err(Error::storage)?,
        original_tokens: row.try_get::<i64, _>("original_tokens").map_err(Error::storage)? as u64,
        compacted_tokens: row.try_get::<i64, _>("compacted_tokens").map_err(Error::storage)? as u64,
        messages_removed: row.try_get::<i32, _>("messages_removed").map_err(Error::storage)? as u32,
        summary_content: row.try_get("summary_content").map_err(Error::storage)?,
        preserved_message_ids,
        model_used: row.try_get("model_used").map_err(Error::storage)?,
        duration_ms: row.try_get::<i64, _>("duration_ms").map_err(Error::storage)? as u64,
        created_at: row.try_get("created_at").map_err(Error::storage)?,
    })
}

pub(super) fn archive_from_row(row: &PgRow) -> Result<MessageArchive> {
    Ok(MessageArchive {
        id: row.try_get("id").map_err(Error::storage)?,
        compaction_event_id: row.try_get("compaction_event_id").map_err(Error::storage)?,
        message_id: row.try_get("message_id").map_err(Error::storage)?,
        session_id: row.try_get("session_id").map_err(Error::storage)?,
        body: row.try_get("body").map_err(Error::storage)?,
        archived_at: row.try_get("archived_at").map_err(Error::storage)?,
    })
}
