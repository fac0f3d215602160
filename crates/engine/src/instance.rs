//! Instance lifecycle — registration, heartbeats, leader election, and
//! the leader-only maintenance duties (stale-peer eviction, expired-claim
//! reaping).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use am_domain::config::EngineConfig;
use am_domain::instance::Instance;
use am_domain::Result;
use am_store::Store;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::registry::Registry;

pub struct InstanceManager {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    config: EngineConfig,
    instance: Instance,
    is_leader: AtomicBool,
}

impl InstanceManager {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>, config: EngineConfig) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let pid = std::process::id();
        let name = if config.instance.name.is_empty() {
            format!("{hostname}-{pid}")
        } else {
            config.instance.name.clone()
        };
        let instance = Instance::new(
            name,
            hostname,
            pid,
            env!("CARGO_PKG_VERSION"),
            config.instance.max_concurrent_runs,
            config.instance.max_concurrent_tools,
        );
        Self {
            store,
            registry,
            config,
            instance,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance.id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub async fn register(&self) -> Result<()> {
        self.store
            .register_instance(&self.instance, &self.registry.agent_names(), &self.registry.tool_names())
            .await?;
        tracing::info!(
            instance_id = %self.instance.id,
            name = %self.instance.name,
            "instance registered"
        );
        Ok(())
    }

    /// Resign (when leading), release every claim this instance still
    /// holds, and deregister. Called on shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        if self.is_leader() {
            self.store.leader_resign(self.instance.id).await?;
            self.is_leader.store(false, Ordering::Release);
        }
        let report = self.store.evict_instance(self.instance.id).await?;
        tracing::info!(
            instance_id = %self.instance.id,
            released_runs = report.released_runs,
            released_tools = report.released_tools,
            "instance deregistered"
        );
        Ok(())
    }

    /// Heartbeat + election + maintenance loops, until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let heartbeat_every = Duration::from_secs(self.config.instance.heartbeat_interval_secs);
        // Re-elect at a third of the lease so two missed rounds still
        // keep the lease alive.
        let elect_every = Duration::from_secs((self.config.workers.leader_ttl_secs / 3).max(1));
        let maintain_every = Duration::from_secs(self.config.workers.stuck_scan_interval_secs);

        let mut heartbeat = tokio::time::interval(heartbeat_every);
        let mut election = tokio::time::interval(elect_every);
        let mut maintenance = tokio::time::interval(maintain_every);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = heartbeat.tick() => {
                    if let Err(e) = self
                        .store
                        .heartbeat_instance(
                            self.instance.id,
                            &self.registry.agent_names(),
                            &self.registry.tool_names(),
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "heartbeat failed");
                    }
                }
                _ = election.tick() => self.election_round().await,
                _ = maintenance.tick() => {
                    if self.is_leader() {
                        if let Err(e) = self.maintenance_round().await {
                            tracing::warn!(error = %e, "maintenance round failed");
                        }
                    }
                }
            }
        }
    }

    async fn election_round(&self) {
        let ttl = chrono::Duration::seconds(self.config.workers.leader_ttl_secs as i64);
        let result = if self.is_leader() {
            self.store.leader_attempt_reelect(self.instance.id, ttl).await
        } else {
            self.store.leader_attempt_elect(self.instance.id, ttl).await
        };
        match result {
            Ok(holding) => {
                let was_leader = self.is_leader.swap(holding, Ordering::AcqRel);
                if holding && !was_leader {
                    tracing::info!(instance_id = %self.instance.id, "became leader");
                } else if !holding && was_leader {
                    tracing::warn!(instance_id = %self.instance.id, "lost leadership");
                }
            }
            Err(e) => tracing::warn!(error = %e, "leader election attempt failed"),
        }
    }

    /// Singleton duties: evict stale peers and release expired claims.
    async fn maintenance_round(&self) -> Result<()> {
        let now = Utc::now();
        let stale_after = chrono::Duration::seconds(self.config.instance.stale_after_secs as i64);
        for peer in self.store.list_instances().await? {
            if peer.id != self.instance.id && peer.is_stale(now, stale_after) {
                let report = self.store.evict_instance(peer.id).await?;
                tracing::warn!(
                    peer = %peer.id,
                    name = %peer.name,
                    released_runs = report.released_runs,
                    released_tools = report.released_tools,
                    "evicted stale instance"
                );
            }
        }

        let cutoff = now - chrono::Duration::seconds(self.config.workers.claim_timeout_secs as i64);
        let released_runs = self.store.release_expired_run_claims(cutoff).await?;
        if !released_runs.is_empty() {
            tracing::warn!(count = released_runs.len(), "released expired run claims");
        }
        let released_tools = self.store.release_expired_tool_claims(cutoff).await?;
        if !released_tools.is_empty() {
            tracing::warn!(count = released_tools.len(), "released expired tool claims");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_store::MemoryStore;

    fn manager(store: Arc<MemoryStore>) -> Arc<InstanceManager> {
        Arc::new(InstanceManager::new(
            store,
            Arc::new(Registry::new()),
            EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn register_and_shutdown_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let m = manager(store.clone());
        m.register().await.unwrap();
        assert!(store.get_instance(m.instance_id()).await.is_ok());

        m.election_round().await;
        assert!(m.is_leader());
        assert_eq!(
            store.current_leader().await.unwrap().unwrap().leader_id,
            m.instance_id()
        );

        m.shutdown().await.unwrap();
        assert!(store.current_leader().await.unwrap().is_none());
        assert!(store.get_instance(m.instance_id()).await.is_err());
    }

    #[tokio::test]
    async fn second_instance_does_not_steal_leadership() {
        let store = Arc::new(MemoryStore::new());
        let a = manager(store.clone());
        let b = manager(store.clone());
        a.register().await.unwrap();
        b.register().await.unwrap();

        a.election_round().await;
        b.election_round().await;
        assert!(a.is_leader());
        assert!(!b.is_leader());

        // Leader resigns; next round hands the lease over.
        a.shutdown().await.unwrap();
        b.election_round().await;
        assert!(b.is_leader());
    }

    #[tokio::test]
    async fn maintenance_evicts_stale_peers() {
        let store = Arc::new(MemoryStore::new());
        let m = manager(store.clone());
        m.register().await.unwrap();
        m.election_round().await;

        // A peer whose heartbeat is far in the past.
        let mut stale = Instance::new("dead", "host", 9, "0.1.0", 1, 1);
        stale.last_heartbeat_at = Utc::now() - chrono::Duration::seconds(600);
        store.register_instance(&stale, &[], &[]).await.unwrap();

        m.maintenance_round().await.unwrap();
        assert!(store.get_instance(stale.id).await.is_err());
        assert!(store.get_instance(m.instance_id()).await.is_ok());
    }
}
