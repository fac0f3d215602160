//! Process-local catalog of agent and tool implementations.
//!
//! Populated at startup (and on explicit registration calls), read-only
//! afterwards: registration takes the writer side, every worker lookup
//! takes the reader side. The instance heartbeat advertises the names
//! held here as the capability sets claims are filtered against.

use std::collections::HashMap;
use std::sync::Arc;

use am_domain::catalog::{AgentDefinition, ToolRecord};
use am_domain::tool::Tool;
use am_domain::Result;
use am_model::ToolSpec;
use am_store::Store;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct Registry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    agents: RwLock<HashMap<String, AgentDefinition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.tools.write().insert(tool.name().to_string(), tool);
    }

    pub fn register_agent(&self, agent: AgentDefinition) {
        self.agents.write().insert(agent.name.clone(), agent);
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    pub fn get_agent(&self, name: &str) -> Option<AgentDefinition> {
        self.agents.read().get(name).cloned()
    }

    pub fn is_agent(&self, name: &str) -> bool {
        self.agents.read().contains_key(name)
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Tool definitions exposed to the model for one agent. Names that
    /// resolve to a registered agent get the synthesized delegate schema.
    pub fn tool_specs_for_agent(&self, agent: &AgentDefinition) -> Vec<ToolSpec> {
        let tools = self.tools.read();
        let agents = self.agents.read();
        let mut specs = Vec::with_capacity(agent.tool_names.len());
        for name in &agent.tool_names {
            if let Some(tool) = tools.get(name) {
                specs.push(ToolSpec {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    input_schema: serde_json::to_value(tool.input_schema()).unwrap_or_default(),
                });
            } else if let Some(delegate) = agents.get(name) {
                specs.push(agent_tool_spec(delegate));
            } else {
                tracing::warn!(tool = %name, agent = %agent.name, "agent references unknown tool");
            }
        }
        specs
    }

    /// Push the local catalog into the store (idempotent upserts).
    pub async fn sync_catalog(&self, store: &dyn Store) -> Result<()> {
        for agent in self.agents.read().values().cloned().collect::<Vec<_>>() {
            store.upsert_agent(&agent).await?;
        }
        let records: Vec<ToolRecord> = self
            .tools
            .read()
            .values()
            .map(|tool| ToolRecord {
                id: Uuid::new_v4(),
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: serde_json::to_value(tool.input_schema()).unwrap_or_default(),
                created_at: Utc::now(),
            })
            .collect();
        for record in records {
            store.upsert_tool(&record).await?;
        }
        Ok(())
    }
}

/// The synthesized one-argument schema for an agent exposed as a tool.
fn agent_tool_spec(agent: &AgentDefinition) -> ToolSpec {
    ToolSpec {
        name: agent.name.clone(),
        description: if agent.description.is_empty() {
            format!("Delegate a task to the {} agent.", agent.name)
        } else {
            agent.description.clone()
        },
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The task for the delegate agent."
                }
            },
            "required": ["prompt"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_domain::tool::{InputSchema, ToolError, ToolResult};
    use tokio_util::sync::CancellationToken;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes its input back."
        }
        fn input_schema(&self) -> InputSchema {
            InputSchema::empty().with_property("text", "string", "Text to echo", true)
        }
        async fn execute(&self, _cancel: &CancellationToken, input: serde_json::Value) -> ToolResult {
            input
                .get("text")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| ToolError::discard("missing text"))
        }
    }

    #[test]
    fn specs_resolve_tools_and_delegate_agents() {
        let registry = Registry::new();
        registry.register_tool(Arc::new(EchoTool));
        registry.register_agent(
            AgentDefinition::new("researcher", "mock", "You research.", 1024),
        );

        let caller = AgentDefinition::new("planner", "mock", "You plan.", 1024)
            .with_tools(["echo", "researcher", "missing"]);
        let specs = registry.tool_specs_for_agent(&caller);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "echo");
        assert_eq!(specs[0].input_schema["required"][0], "text");
        assert_eq!(specs[1].name, "researcher");
        assert_eq!(specs[1].input_schema["required"][0], "prompt");
    }

    #[test]
    fn name_listings_are_sorted() {
        let registry = Registry::new();
        registry.register_agent(AgentDefinition::new("zeta", "mock", "", 1));
        registry.register_agent(AgentDefinition::new("alpha", "mock", "", 1));
        assert_eq!(registry.agent_names(), vec!["alpha", "zeta"]);
    }
}
