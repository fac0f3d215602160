//! The top-level façade: wires the store, model client, registry,
//! notifier, and workers into one embeddable engine instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use am_compaction::{CompactionResult, Compactor};
use am_domain::catalog::AgentDefinition;
use am_domain::config::EngineConfig;
use am_domain::message::{Message, TokenUsage};
use am_domain::run::{Run, RunMode, RunState};
use am_domain::session::Session;
use am_domain::tool::Tool;
use am_domain::{Error, Result};
use am_model::ModelClient;
use am_store::{channels, Store};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch_poller::BatchPoller;
use crate::instance::InstanceManager;
use crate::notifier::{Notifier, Subscription};
use crate::registry::Registry;
use crate::run_worker::RunWorker;
use crate::tool_worker::ToolWorker;

/// Per-run submission options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Pin the prompt message so compaction never removes it.
    pub preserve_prompt: bool,
}

/// What a synchronous run returns.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub text: String,
    pub usage: TokenUsage,
}

struct Inner {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    config: EngineConfig,
    notifier: Arc<Notifier>,
    manager: Arc<InstanceManager>,
    compactor: Arc<Compactor>,
    model: Arc<dyn ModelClient>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    started: AtomicBool,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(store: Arc<dyn Store>, model: Arc<dyn ModelClient>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::new());
        let notifier = Arc::new(Notifier::new(
            store.clone(),
            Duration::from_secs(config.workers.notify_reconnect_delay_secs),
            Duration::from_secs(config.workers.run_poll_interval_secs),
        ));
        let manager = Arc::new(InstanceManager::new(store.clone(), registry.clone(), config.clone()));
        let compactor = Arc::new(Compactor::new(store.clone(), model.clone(), config.compaction.clone()));
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                registry,
                config,
                notifier,
                manager,
                compactor,
                model,
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.manager.instance_id()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn register_agent(&self, agent: AgentDefinition) {
        self.inner.registry.register_agent(agent);
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.inner.registry.register_tool(tool);
    }

    /// Sync the catalog, register the instance, and start every worker
    /// loop. Idempotent-hostile by design: calling twice is a bug.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidConfig("client already started".into()));
        }
        let inner = &self.inner;
        inner.registry.sync_catalog(inner.store.as_ref()).await?;
        inner.manager.register().await?;

        let mut tasks = inner.tasks.lock();
        tasks.push(tokio::spawn(inner.notifier.clone().run(inner.shutdown.clone())));
        tasks.push(tokio::spawn(inner.manager.clone().run(inner.shutdown.clone())));

        // One run worker per mode; each gets its own wake channel fed by
        // the channels that can make run work appear.
        for run_mode in [RunMode::Streaming, RunMode::Batch] {
            let (tx, rx) = mpsc::channel::<()>(16);
            let mut subs = inner.subscriptions.lock();
            for channel in [channels::RUN_CREATED, channels::RUN_TOOLS_COMPLETE, channels::RUN_STATE_CHANGED] {
                let tx = tx.clone();
                subs.push(inner.notifier.subscribe(channel, move |_| {
                    let _ = tx.try_send(());
                }));
            }
            drop(subs);
            let worker = RunWorker::new(
                inner.store.clone(),
                inner.model.clone(),
                inner.registry.clone(),
                inner.compactor.clone(),
                inner.config.clone(),
                inner.manager.instance_id(),
                run_mode,
                rx,
            );
            tasks.push(tokio::spawn(worker.run(inner.shutdown.clone())));
        }

        // Tool worker: claim wakeups plus child-run completion events.
        let (tool_tx, tool_rx) = mpsc::channel::<()>(16);
        let (child_tx, child_rx) = mpsc::channel::<Uuid>(64);
        {
            let mut subs = inner.subscriptions.lock();
            let tx = tool_tx.clone();
            subs.push(inner.notifier.subscribe(channels::TOOL_PENDING, move |_| {
                let _ = tx.try_send(());
            }));
            subs.push(inner.notifier.subscribe(channels::RUN_STATE_CHANGED, move |n| {
                if let Ok(run_id) = n.payload.parse::<Uuid>() {
                    let _ = child_tx.try_send(run_id);
                }
            }));
        }
        let tool_worker = ToolWorker::new(
            inner.store.clone(),
            inner.registry.clone(),
            inner.config.clone(),
            inner.manager.instance_id(),
            tool_rx,
            child_rx,
        );
        tasks.push(tokio::spawn(tool_worker.run(inner.shutdown.clone())));

        let poller = BatchPoller::new(
            inner.store.clone(),
            inner.model.clone(),
            inner.config.clone(),
            inner.manager.instance_id(),
        );
        tasks.push(tokio::spawn(poller.run(inner.shutdown.clone())));
        drop(tasks);

        tracing::info!(instance_id = %self.instance_id(), "engine started");
        Ok(())
    }

    /// Stop the workers, resign leadership, and deregister.
    pub async fn stop(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.inner.subscriptions.lock().clear();
        if self.inner.started.load(Ordering::Acquire) {
            self.inner.manager.shutdown().await?;
        }
        tracing::info!("engine stopped");
        Ok(())
    }

    // ── Sessions & runs ──────────────────────────────────────────────

    pub async fn new_session(&self, parent: Option<Uuid>, metadata: serde_json::Value) -> Result<Uuid> {
        let mut session = Session::new("default", Uuid::new_v4().to_string()).with_metadata(metadata);
        session.parent_session_id = parent;
        self.inner.store.create_session(&session).await?;
        Ok(session.id)
    }

    /// Start a batch-mode run (asynchronous; poll [`Client::get_run`] or
    /// wait on notifications).
    pub async fn run(
        &self,
        session_id: Uuid,
        agent_name: &str,
        prompt: &str,
        opts: RunOptions,
    ) -> Result<Uuid> {
        self.submit(session_id, agent_name, prompt, RunMode::Batch, opts).await
    }

    /// Start a streaming-mode run (asynchronous).
    pub async fn run_fast(
        &self,
        session_id: Uuid,
        agent_name: &str,
        prompt: &str,
        opts: RunOptions,
    ) -> Result<Uuid> {
        self.submit(session_id, agent_name, prompt, RunMode::Streaming, opts).await
    }

    /// Streaming run that waits for the terminal state.
    pub async fn run_fast_sync(&self, session_id: Uuid, agent_name: &str, prompt: &str) -> Result<RunOutcome> {
        let run_id = self
            .run_fast(session_id, agent_name, prompt, RunOptions::default())
            .await?;
        let run = self.wait_for_run(run_id).await?;
        match run.state {
            RunState::Completed => Ok(RunOutcome {
                run_id,
                text: run.response_text.unwrap_or_default(),
                usage: run.usage,
            }),
            RunState::Cancelled => Err(Error::Cancelled),
            _ => Err(Error::Other(
                run.error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "run failed without error detail".into()),
            )),
        }
    }

    /// Poll until the run reaches a terminal state.
    pub async fn wait_for_run(&self, run_id: Uuid) -> Result<Run> {
        loop {
            let run = self.inner.store.get_run(run_id).await?;
            if run.is_terminal() {
                return Ok(run);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        self.inner.store.get_run(run_id).await
    }

    /// Cancel a non-terminal run.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        self.inner
            .store
            .update_run_state(run_id, RunState::Cancelled, Default::default(), None)
            .await
    }

    // ── Compaction ───────────────────────────────────────────────────

    pub async fn compact(&self, session_id: Uuid) -> Result<CompactionResult> {
        self.inner.compactor.compact(session_id).await
    }

    pub async fn compact_if_needed(&self, session_id: Uuid) -> Result<Option<CompactionResult>> {
        self.inner.compactor.compact_if_needed(session_id).await
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn submit(
        &self,
        session_id: Uuid,
        agent_name: &str,
        prompt: &str,
        run_mode: RunMode,
        opts: RunOptions,
    ) -> Result<Uuid> {
        let agent = self.inner.store.get_agent_by_name(agent_name).await?;
        let run = Run::new(session_id, agent.id, run_mode, prompt, self.instance_id());

        let mut message = Message::user_text(session_id, prompt).for_run(run.id);
        message.is_preserved = opts.preserve_prompt;
        self.inner.store.append_message(&message).await?;
        self.inner.store.create_run(&run).await?;
        tracing::info!(
            run_id = %run.id,
            session_id = %session_id,
            agent = agent_name,
            mode = run_mode.as_str(),
            "run submitted"
        );
        Ok(run.id)
    }
}
