//! Model-input assembly: session history → one [`ModelRequest`].

use am_domain::catalog::AgentDefinition;
use am_domain::message::Role;
use am_domain::run::Run;
use am_domain::{Error, Result};
use am_model::{ModelMessage, ModelRequest};
use am_store::Store;

use crate::registry::Registry;

/// Build the request for the run's next iteration from its session
/// history. Fails with [`Error::BuildError`] on malformed history; the
/// model call is never attempted in that case.
pub async fn build_model_request(
    store: &dyn Store,
    registry: &Registry,
    run: &Run,
    agent: &AgentDefinition,
) -> Result<ModelRequest> {
    let messages = store.get_messages_for_run_context(run.id).await?;
    if messages.is_empty() {
        return Err(Error::BuildError("run has no context messages".into()));
    }

    // System-role messages fold into the system prompt; the rest convert
    // in order.
    let mut system = agent.system_prompt.clone();
    let mut model_messages: Vec<ModelMessage> = Vec::with_capacity(messages.len());
    for message in &messages {
        if message.role == Role::System {
            let text = message.text();
            if !text.is_empty() {
                system.push_str("\n\n");
                system.push_str(&text);
            }
            continue;
        }
        if message.blocks.is_empty() {
            return Err(Error::BuildError(format!("message {} has no content blocks", message.id)));
        }
        model_messages.push(ModelMessage::from(message));
    }

    match model_messages.last() {
        Some(last) if last.role == Role::User => {}
        Some(_) => {
            return Err(Error::BuildError(
                "conversation does not end with a user message".into(),
            ));
        }
        None => return Err(Error::BuildError("no sendable messages in context".into())),
    }

    Ok(ModelRequest {
        model: agent.model.clone(),
        max_tokens: agent.max_output_tokens,
        system: (!system.is_empty()).then_some(system),
        messages: model_messages,
        tools: registry.tool_specs_for_agent(agent),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_domain::message::Message;
    use am_domain::run::RunMode;
    use am_domain::session::Session;
    use am_store::{MemoryStore, Store};
    use std::sync::Arc;
    use uuid::Uuid;

    async fn seeded() -> (Arc<MemoryStore>, Session, AgentDefinition, Run) {
        let store = Arc::new(MemoryStore::new());
        let session = Session::new("t", "s");
        store.create_session(&session).await.unwrap();
        let agent = AgentDefinition::new("a", "mock", "Be helpful.", 512);
        store.upsert_agent(&agent).await.unwrap();
        let run = Run::new(session.id, agent.id, RunMode::Streaming, "hi", Uuid::new_v4());
        store.create_run(&run).await.unwrap();
        (store, session, agent, run)
    }

    #[tokio::test]
    async fn empty_history_is_a_build_error() {
        let (store, _session, agent, run) = seeded().await;
        let registry = Registry::new();
        let err = build_model_request(store.as_ref(), &registry, &run, &agent)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BuildError(_)));
    }

    #[tokio::test]
    async fn system_messages_fold_into_prompt() {
        let (store, session, agent, run) = seeded().await;
        store
            .append_message(&Message::new(
                session.id,
                Role::System,
                vec![am_domain::message::ContentBlock::text("tenant context")],
            ))
            .await
            .unwrap();
        store
            .append_message(&Message::user_text(session.id, "hello").for_run(run.id))
            .await
            .unwrap();

        let registry = Registry::new();
        let req = build_model_request(store.as_ref(), &registry, &run, &agent)
            .await
            .unwrap();
        assert_eq!(req.messages.len(), 1);
        let system = req.system.unwrap();
        assert!(system.starts_with("Be helpful."));
        assert!(system.contains("tenant context"));
        assert_eq!(req.model, "mock");
        assert_eq!(req.max_tokens, 512);
    }

    #[tokio::test]
    async fn trailing_assistant_message_is_a_build_error() {
        let (store, session, agent, run) = seeded().await;
        store
            .append_message(&Message::user_text(session.id, "hello"))
            .await
            .unwrap();
        store
            .append_message(&Message::assistant_text(session.id, "answer"))
            .await
            .unwrap();
        let registry = Registry::new();
        let err = build_model_request(store.as_ref(), &registry, &run, &agent)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BuildError(_)));
    }
}
