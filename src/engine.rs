use crate::cache::HealthCheckCache;
use crate::checker::{
    CheckerConfig, CheckerKind, HealthChecker, Leadership, PeerProbe, QueryResult,
};
use crate::collab::dispatcher::{Dispatcher, DispatcherConfig};
use crate::collab::leader::LeaderChangeEvent;
use crate::registry::RegistryEvent;
use crate::utils::current_time_sec;
use crate::worker::status::{StatusSaveManager, StatusSink};
use crate::worker::{CheckScheduler, CheckState, SchedulerConfig};
use anyhow::{Context, Result, bail};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use utoipa::ToSchema;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub checker: CheckerConfig,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    /// Registry service the checker nodes themselves register under.
    pub self_service: String,
    pub status_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checker: CheckerConfig::default(),
            scheduler: SchedulerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            self_service: "heartbeat-checker".to_string(),
            status_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EngineStatus {
    pub node: String,
    pub kind: CheckerKind,
    pub ready: bool,
    /// Nodes heartbeat records are spread over.
    pub peers: Vec<String>,
    /// Alive checker fleet the entities are split over.
    pub fleet: Vec<String>,
    pub owned_instances: usize,
    pub owned_clients: usize,
    pub scheduled: usize,
    pub pending_timers: usize,
    pub adopted: usize,
    pub monitored_instances: usize,
    pub monitored_clients: usize,
    pub suspended_at_sec: i64,
    pub topology_changed_at_sec: i64,
}

/// One checker node: heartbeat intake, record storage and the checks of
/// the entities this node owns.
pub struct Engine {
    checker: Arc<HealthChecker>,
    cache: Arc<HealthCheckCache>,
    scheduler: Arc<CheckScheduler>,
    dispatcher: Arc<Dispatcher>,
    leader_events: Option<broadcast::Sender<LeaderChangeEvent>>,
}

impl Engine {
    /// Wires the components. Must run inside a tokio runtime; nothing is
    /// checked until [`start`](Self::start).
    pub fn new(
        config: EngineConfig,
        leadership: Option<Leadership>,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self> {
        if config.self_service.is_empty() {
            bail!("self service name must not be empty");
        }

        let leader_events = leadership.as_ref().map(|leadership| leadership.events.clone());
        let checker = Arc::new(HealthChecker::new(config.checker, leadership)?);
        let cache = Arc::new(HealthCheckCache::new(checker.clone(), config.self_service));
        let scheduler = Arc::new(CheckScheduler::new(
            config.scheduler,
            cache.clone(),
            StatusSaveManager::new(sink, config.status_concurrency),
        )?);
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatcher,
            cache.clone(),
            checker.clone(),
            scheduler.clone(),
        ));

        Ok(Self {
            checker,
            cache,
            scheduler,
            dispatcher,
            leader_events,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.checker
            .start()
            .await
            .context("failed to start the checker")?;
        self.scheduler.start();
        self.dispatcher.start();

        info!("Engine {} started", self.checker.local_id());
        Ok(())
    }

    pub async fn close(&self) {
        self.dispatcher.close().await;
        self.scheduler.close().await;
        self.checker.close().await;

        info!("Engine {} stopped", self.checker.local_id());
    }

    pub fn local_id(&self) -> String {
        self.checker.local_id()
    }

    /// Records a heartbeat of `id` sent by `host`, at `timestamp_sec` or now.
    pub async fn report(&self, id: &str, host: &str, timestamp_sec: Option<i64>) -> Result<()> {
        let timestamp_sec = timestamp_sec.unwrap_or_else(current_time_sec);

        self.checker.report(id, host, timestamp_sec).await
    }

    pub async fn query(&self, id: &str) -> Result<QueryResult> {
        self.checker.query(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.checker.delete(id).await
    }

    /// Check state of `id` if this node is the one checking it.
    pub async fn check_state(&self, id: &str) -> Option<CheckState> {
        self.scheduler.describe(id).await
    }

    pub fn add_to_check(&self, ids: &[String]) {
        self.checker.add_to_check(ids);
    }

    pub fn remove_from_check(&self, ids: &[String]) {
        self.checker.remove_from_check(ids);
    }

    pub async fn probe_peers(&self) -> Vec<PeerProbe> {
        self.checker.probe_peers().await
    }

    pub fn suspend(&self) {
        self.checker.suspend();
    }

    pub fn suspend_time_sec(&self) -> i64 {
        self.checker.suspend_time_sec()
    }

    /// Feeds a registry change into the cache. The dispatcher picks it up on
    /// its next event tick.
    pub fn apply(&self, event: RegistryEvent) {
        self.cache.apply(event);
    }

    /// Publishes an election outcome to the leader checker. Other kinds have
    /// no leader and ignore it.
    pub fn publish_leader_change(&self, event: LeaderChangeEvent) -> Result<()> {
        let Some(events) = &self.leader_events else {
            warn!(
                "{} checker ignores leader change for {}",
                self.checker.kind(),
                event.key
            );
            return Ok(());
        };

        events
            .send(event)
            .context("leader checker is not listening")?;

        Ok(())
    }

    pub async fn status(&self) -> EngineStatus {
        let (owned_instances, owned_clients) = self.dispatcher.owned_count().await;
        let (monitored_instances, monitored_clients) = self.cache.monitored_count();

        EngineStatus {
            node: self.checker.local_id(),
            kind: self.checker.kind(),
            ready: self.checker.is_ready(),
            peers: self.checker.peers(),
            fleet: self.dispatcher.fleet().await,
            owned_instances,
            owned_clients,
            scheduled: self.scheduler.len(),
            pending_timers: self.scheduler.pending_timers(),
            adopted: self.checker.adopted_count(),
            monitored_instances,
            monitored_clients,
            suspended_at_sec: self.checker.suspend_time_sec(),
            topology_changed_at_sec: self.checker.topology_change_time_sec(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::collab::leader::StaticLeaderElection;
    use crate::registry::Instance;
    use crate::worker::status::LogSink;
    use std::time::Duration;
    use tokio::time::{Instant, sleep};

    pub(crate) fn fast_config() -> EngineConfig {
        EngineConfig {
            scheduler: SchedulerConfig {
                adoption: BatchConfig {
                    label: "adoption".to_string(),
                    wait_time: Duration::from_millis(10),
                    ..BatchConfig::default()
                },
                ..SchedulerConfig::default()
            },
            dispatcher: DispatcherConfig {
                event_interval: Duration::from_millis(20),
                ensure_interval: Duration::from_secs(60),
            },
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_heartbeat_round_trip() -> Result<()> {
        let engine = Engine::new(fast_config(), None, Arc::new(LogSink))?;
        engine.start().await?;

        engine.report("svc-1", "10.1.0.7", Some(1_700_000_000)).await?;
        engine.report("svc-1", "10.1.0.7", None).await?;

        let result = engine.query("svc-1").await?;
        assert!(result.exists);
        assert_eq!(result.count, 2);
        assert!(result.last_heartbeat_sec >= 1_700_000_000);

        engine.delete("svc-1").await?;
        assert!(!engine.query("svc-1").await?.exists);

        engine.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_registered_entities_get_scheduled() -> Result<()> {
        let engine = Engine::new(fast_config(), None, Arc::new(LogSink))?;
        engine.start().await?;

        engine.apply(RegistryEvent::InstanceUpserted {
            instance: Instance::fleet_member("heartbeat-checker", "127.0.0.1", 0),
        });
        for i in 0..5 {
            engine.apply(RegistryEvent::InstanceUpserted {
                instance: Instance::example(&format!("svc-{i}"), 5),
            });
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut status = engine.status().await;
        while status.adopted < 5 && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
            status = engine.status().await;
        }

        assert_eq!(status.fleet, vec!["127.0.0.1:0"]);
        assert_eq!(status.owned_instances, 5);
        assert_eq!(status.scheduled, 5);
        assert_eq!(status.adopted, 5);
        assert_eq!(status.monitored_instances, 5);
        assert!(status.ready);
        // The fleet appeared, so checks start suspended
        assert!(status.suspended_at_sec > 0);

        let state = engine.check_state("svc-3").await;
        assert!(state.is_some_and(|state| state.healthy && state.expire_sec == 15));
        assert!(engine.check_state("127.0.0.1:0").await.is_none());

        engine.close().await;
        Ok(())
    }

    async fn wait_for_peers(engine: &Engine, peers: Vec<String>) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if engine.status().await.peers == peers {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }

        false
    }

    #[tokio::test]
    async fn test_leader_changes_reach_the_checker() -> Result<()> {
        let (events, _) = broadcast::channel(16);
        // Nothing listens on the announced leader
        let election = StaticLeaderElection::new("127.0.0.1:9", "127.0.0.1:1", events.clone());
        let leadership = Leadership {
            election: Arc::new(election),
            events,
        };
        let config = EngineConfig {
            checker: CheckerConfig {
                kind: CheckerKind::Leader,
                listen_host: "127.0.0.1".to_string(),
                ..CheckerConfig::default()
            },
            ..fast_config()
        };

        let engine = Engine::new(config, Some(leadership), Arc::new(LogSink))?;
        engine.start().await?;
        assert!(wait_for_peers(&engine, vec!["127.0.0.1:1".to_string()]).await);

        engine.publish_leader_change(LeaderChangeEvent {
            key: "heartbeat-checker".to_string(),
            is_leader: true,
            leader_host: engine.local_id(),
        })?;
        assert!(wait_for_peers(&engine, vec![engine.local_id()]).await);

        engine.report("svc-1", "10.1.0.7", None).await?;
        assert!(engine.query("svc-1").await?.exists);

        engine.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_leader_change_without_leader_checker_is_ignored() -> Result<()> {
        let engine = Engine::new(fast_config(), None, Arc::new(LogSink))?;

        engine.publish_leader_change(LeaderChangeEvent {
            key: "heartbeat-checker".to_string(),
            is_leader: true,
            leader_host: "10.0.0.1:8100".to_string(),
        })?;

        engine.close().await;
        Ok(())
    }
}
