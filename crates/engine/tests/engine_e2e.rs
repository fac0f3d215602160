//! End-to-end scenarios over the in-memory store and the scripted model
//! client: full engine wiring, notification-driven workers, real timing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use am_domain::catalog::AgentDefinition;
use am_domain::config::EngineConfig;
use am_domain::message::{ContentBlock, Role};
use am_domain::run::{RunErrorType, RunState};
use am_domain::tool::{InputSchema, Tool, ToolError, ToolResult};
use am_domain::tool_execution::ToolExecutionState;
use am_engine::{Client, RunOptions};
use am_model::mock::MockModelClient;
use am_store::{MemoryStore, Store};
use tokio_util::sync::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixtures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workers.run_poll_interval_secs = 1;
    config.workers.tool_poll_interval_secs = 1;
    config.workers.batch_poll_interval_secs = 1;
    config.workers.stuck_scan_interval_secs = 2;
    config.workers.leader_ttl_secs = 3;
    config.tools.retry_base_delay_ms = 500;
    config.compaction.use_token_counting_api = false;
    config
}

async fn engine(model: Arc<MockModelClient>) -> (Client, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let client = Client::new(store.clone(), model, test_config()).expect("valid config");
    (client, store)
}

async fn finished(client: &Client, run_id: uuid::Uuid) -> am_domain::run::Run {
    tokio::time::timeout(Duration::from_secs(20), client.wait_for_run(run_id))
        .await
        .expect("run did not reach a terminal state in time")
        .expect("run lookup failed")
}

struct WeatherTool;

#[async_trait::async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }
    fn description(&self) -> &str {
        "Current weather for a location."
    }
    fn input_schema(&self) -> InputSchema {
        InputSchema::empty().with_property("location", "string", "City name", true)
    }
    async fn execute(&self, _cancel: &CancellationToken, _input: serde_json::Value) -> ToolResult {
        Ok("sunny".into())
    }
}

/// Fails once with an ordinary error, then succeeds.
struct FlakyTool {
    calls: AtomicU32,
}

#[async_trait::async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }
    fn description(&self) -> &str {
        "Fails on its first call."
    }
    fn input_schema(&self) -> InputSchema {
        InputSchema::empty()
    }
    async fn execute(&self, _cancel: &CancellationToken, _input: serde_json::Value) -> ToolResult {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ToolError::failed("transient backend hiccup"))
        } else {
            Ok("recovered".into())
        }
    }
}

/// Snoozes once, then succeeds.
struct SnoozeOnceTool {
    snoozed: AtomicBool,
}

#[async_trait::async_trait]
impl Tool for SnoozeOnceTool {
    fn name(&self) -> &str {
        "rate_limited"
    }
    fn description(&self) -> &str {
        "Asks to be called again shortly."
    }
    fn input_schema(&self) -> InputSchema {
        InputSchema::empty()
    }
    async fn execute(&self, _cancel: &CancellationToken, _input: serde_json::Value) -> ToolResult {
        if !self.snoozed.swap(true, Ordering::SeqCst) {
            Err(ToolError::Snooze(Duration::from_millis(200)))
        } else {
            Ok("done after snooze".into())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single-turn completion: one iteration, end_turn, non-empty assistant
/// text, usage recorded.
#[tokio::test(flavor = "multi_thread")]
async fn single_turn_completion() {
    let model = Arc::new(MockModelClient::new());
    model.push_text("Hello! How can I help you today?");
    let (client, store) = engine(model).await;
    client.register_agent(AgentDefinition::new("writer", "mock", "You are a helpful writer.", 1024));
    client.start().await.unwrap();

    let session = client.new_session(None, serde_json::json!({})).await.unwrap();
    let outcome = client.run_fast_sync(session, "writer", "Hi").await.unwrap();
    assert!(!outcome.text.is_empty());
    assert!(outcome.usage.output_tokens > 0);

    let run = client.get_run(outcome.run_id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.iteration_count, 1);
    assert!(run.finalized_at.is_some());

    let iterations = store.list_iterations(run.id).await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].stop_reason.as_deref(), Some("end_turn"));
    assert!(!iterations[0].has_tool_use);

    // The assistant message leads with non-empty text.
    let messages = store.get_messages(session).await.unwrap();
    let assistant = messages.iter().find(|m| m.role == Role::Assistant).unwrap();
    match &assistant.blocks[0] {
        ContentBlock::Text { text } => assert!(!text.is_empty()),
        other => panic!("expected text block, got {other:?}"),
    }

    client.stop().await.unwrap();
}

/// One tool round-trip: two iterations with a completed execution between
/// them, final answer built on the tool output.
#[tokio::test(flavor = "multi_thread")]
async fn tool_round_trip() {
    let model = Arc::new(MockModelClient::new());
    model.push_tool_use(
        Some("Let me check."),
        "toolu_1",
        "get_weather",
        serde_json::json!({"location": "Tokyo"}),
    );
    model.push_text("It is sunny in Tokyo.");

    let (client, store) = engine(model).await;
    client.register_agent(
        AgentDefinition::new("assistant", "mock", "You answer questions.", 1024).with_tools(["get_weather"]),
    );
    client.register_tool(Arc::new(WeatherTool));
    client.start().await.unwrap();

    let session = client.new_session(None, serde_json::json!({})).await.unwrap();
    let outcome = client
        .run_fast_sync(session, "assistant", "weather in Tokyo?")
        .await
        .unwrap();
    assert!(outcome.text.contains("sunny"));

    let run = client.get_run(outcome.run_id).await.unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.iteration_count, 2);

    let iterations = store.list_iterations(run.id).await.unwrap();
    assert!(iterations[0].has_tool_use);
    assert_eq!(iterations[0].tool_execution_count, 1);

    let executions = store.list_tool_executions(iterations[0].id).await.unwrap();
    assert_eq!(executions.len(), 1);
    let te = &executions[0];
    assert_eq!(te.tool_name, "get_weather");
    assert_eq!(te.tool_use_id, "toolu_1");
    assert_eq!(te.tool_input["location"], "Tokyo");
    assert_eq!(te.tool_output.as_deref(), Some("sunny"));
    assert_eq!(te.state, ToolExecutionState::Completed);

    // The tool_result message references the tool_use id.
    let messages = store.get_messages(session).await.unwrap();
    let result_msg = messages.iter().find(|m| m.has_tool_result()).unwrap();
    match &result_msg.blocks[0] {
        ContentBlock::ToolResult { tool_use_id, content, is_error } => {
            assert_eq!(tool_use_id, "toolu_1");
            assert_eq!(content, "sunny");
            assert!(!is_error);
        }
        other => panic!("expected tool_result, got {other:?}"),
    }

    client.stop().await.unwrap();
}

/// Retry then succeed: an ordinary failure consumes one attempt and
/// schedules a quartic-backoff retry; the execution ends completed on
/// attempt two.
#[tokio::test(flavor = "multi_thread")]
async fn tool_retry_then_succeed() {
    let model = Arc::new(MockModelClient::new());
    model.push_tool_use(None, "toolu_f", "flaky", serde_json::json!({}));
    model.push_text("Recovered fine.");

    let (client, store) = engine(model).await;
    client.register_agent(AgentDefinition::new("assistant", "mock", "You persist.", 1024).with_tools(["flaky"]));
    client.register_tool(Arc::new(FlakyTool {
        calls: AtomicU32::new(0),
    }));
    client.start().await.unwrap();

    let session = client.new_session(None, serde_json::json!({})).await.unwrap();
    let outcome = client.run_fast_sync(session, "assistant", "try the flaky one").await.unwrap();
    assert!(outcome.text.contains("Recovered"));

    let run = client.get_run(outcome.run_id).await.unwrap();
    let iterations = store.list_iterations(run.id).await.unwrap();
    let te = &store.list_tool_executions(iterations[0].id).await.unwrap()[0];
    assert_eq!(te.state, ToolExecutionState::Completed);
    assert_eq!(te.attempt_count, 2);
    assert_eq!(te.tool_output.as_deref(), Some("recovered"));
    // The retry was scheduled ~base_delay * 1⁴ after the failure.
    let delay = te.scheduled_at - te.created_at;
    assert!(delay >= chrono::Duration::milliseconds(400), "retry delay was {delay}");

    client.stop().await.unwrap();
}

/// Snooze does not consume an attempt and delays completion by at least
/// the snooze duration.
#[tokio::test(flavor = "multi_thread")]
async fn tool_snooze_then_succeed() {
    let model = Arc::new(MockModelClient::new());
    model.push_tool_use(None, "toolu_s", "rate_limited", serde_json::json!({}));
    model.push_text("Done.");

    let (client, store) = engine(model).await;
    client.register_agent(
        AgentDefinition::new("assistant", "mock", "You wait politely.", 1024).with_tools(["rate_limited"]),
    );
    client.register_tool(Arc::new(SnoozeOnceTool {
        snoozed: AtomicBool::new(false),
    }));
    client.start().await.unwrap();

    let session = client.new_session(None, serde_json::json!({})).await.unwrap();
    let outcome = client.run_fast_sync(session, "assistant", "go").await.unwrap();
    assert_eq!(outcome.text, "Done.");

    let run = client.get_run(outcome.run_id).await.unwrap();
    let iterations = store.list_iterations(run.id).await.unwrap();
    let te = &store.list_tool_executions(iterations[0].id).await.unwrap()[0];
    assert_eq!(te.state, ToolExecutionState::Completed);
    assert_eq!(te.attempt_count, 1, "snooze must not consume an attempt");
    let elapsed = te.completed_at.unwrap() - te.created_at;
    assert!(elapsed >= chrono::Duration::milliseconds(200), "snooze elapsed {elapsed}");

    client.stop().await.unwrap();
}

/// Agent-as-tool: the delegate execution spawns a depth-1 child run whose
/// final text becomes the parent's tool output; the parent context never
/// sees the child's internal messages.
#[tokio::test(flavor = "multi_thread")]
async fn agent_as_tool_delegation() {
    let model = Arc::new(MockModelClient::new());
    // Parent iteration 1: delegate to the researcher.
    model.push_tool_use(
        None,
        "toolu_d",
        "researcher",
        serde_json::json!({"prompt": "find the answer"}),
    );
    // Child run: its single iteration.
    model.push_text("42 is the answer");
    // Parent iteration 2: wrap up with the delegate's result.
    model.push_text("The researcher says: 42 is the answer");

    let (client, store) = engine(model).await;
    client.register_agent(
        AgentDefinition::new("planner", "mock", "You delegate.", 1024).with_tools(["researcher"]),
    );
    client.register_agent(AgentDefinition::new("researcher", "mock", "You research.", 1024));
    client.start().await.unwrap();

    let session = client.new_session(None, serde_json::json!({})).await.unwrap();
    let outcome = client
        .run_fast_sync(session, "planner", "use the researcher")
        .await
        .unwrap();
    assert!(outcome.text.contains("42"));

    let parent = client.get_run(outcome.run_id).await.unwrap();
    assert_eq!(parent.state, RunState::Completed);
    assert_eq!(parent.depth, 0);

    let iterations = store.list_iterations(parent.id).await.unwrap();
    let te = &store.list_tool_executions(iterations[0].id).await.unwrap()[0];
    assert!(te.is_agent_tool);
    assert_eq!(te.state, ToolExecutionState::Completed);

    let child_id = te.child_run_id.expect("child run attached");
    let child = client.get_run(child_id).await.unwrap();
    assert_eq!(child.state, RunState::Completed);
    assert_eq!(child.depth, 1);
    assert_eq!(child.parent_run_id, Some(parent.id));
    assert_eq!(child.parent_tool_execution_id, Some(te.id));
    assert_eq!(te.tool_output.as_deref(), child.response_text.as_deref());
    assert_eq!(child.response_text.as_deref(), Some("42 is the answer"));

    // Parent context excludes every child-run message.
    let context = store.get_messages_for_run_context(parent.id).await.unwrap();
    assert!(context.iter().all(|m| m.run_id != Some(child_id)));
    // The child's own context still sees everything.
    let child_context = store.get_messages_for_run_context(child_id).await.unwrap();
    assert!(child_context.iter().any(|m| m.run_id == Some(child_id)));

    client.stop().await.unwrap();
}

/// Batch mode: submit, poll to ended, ingest the result, complete.
#[tokio::test(flavor = "multi_thread")]
async fn batch_run_completes_via_poller() {
    let model = Arc::new(MockModelClient::new());
    model.push_text("batch hello");
    model.set_batch_polls_before_done(1);

    let (client, store) = engine(model).await;
    client.register_agent(AgentDefinition::new("writer", "mock", "You write.", 1024));
    client.start().await.unwrap();

    let session = client.new_session(None, serde_json::json!({})).await.unwrap();
    let run_id = client.run(session, "writer", "Hi", RunOptions::default()).await.unwrap();

    let run = finished(&client, run_id).await;
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.response_text.as_deref(), Some("batch hello"));

    let iterations = store.list_iterations(run_id).await.unwrap();
    assert_eq!(iterations.len(), 1);
    assert!(iterations[0].batch_id.is_some());
    assert!(iterations[0].batch_poll_count >= 1);
    assert!(!iterations[0].is_streaming);

    client.stop().await.unwrap();
}

/// An empty model content list terminalizes the run as `empty_response`.
#[tokio::test(flavor = "multi_thread")]
async fn empty_model_response_fails_run() {
    let model = Arc::new(MockModelClient::new());
    model.push_empty();

    let (client, _store) = engine(model).await;
    client.register_agent(AgentDefinition::new("writer", "mock", "You write.", 1024));
    client.start().await.unwrap();

    let session = client.new_session(None, serde_json::json!({})).await.unwrap();
    let run_id = client
        .run_fast(session, "writer", "Hi", RunOptions::default())
        .await
        .unwrap();
    let run = finished(&client, run_id).await;
    assert_eq!(run.state, RunState::Failed);
    let error = run.error.expect("error recorded");
    assert_eq!(error.error_type, RunErrorType::EmptyResponse);

    client.stop().await.unwrap();
}

/// Cancelling a waiting run terminalizes it write-once.
#[tokio::test(flavor = "multi_thread")]
async fn cancel_waiting_run() {
    let model = Arc::new(MockModelClient::new());
    model.push_text("never delivered");
    // Keep the batch in progress long enough to cancel.
    model.set_batch_polls_before_done(1000);

    let (client, store) = engine(model).await;
    client.register_agent(AgentDefinition::new("writer", "mock", "You write.", 1024));
    client.start().await.unwrap();

    let session = client.new_session(None, serde_json::json!({})).await.unwrap();
    let run_id = client.run(session, "writer", "Hi", RunOptions::default()).await.unwrap();

    // Wait until the batch is actually submitted.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let run = client.get_run(run_id).await.unwrap();
            if matches!(run.state, RunState::BatchPending | RunState::BatchProcessing) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("batch never submitted");

    let cancelled = client.cancel_run(run_id).await.unwrap();
    assert_eq!(cancelled.state, RunState::Cancelled);
    assert!(cancelled.finalized_at.is_some());

    // Terminal states are write-once.
    let err = store
        .update_run_state(run_id, RunState::Completed, Default::default(), None)
        .await
        .unwrap_err();
    assert!(err.is_state_transition_failed());

    client.stop().await.unwrap();
}
