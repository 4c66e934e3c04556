//! Heartbeat checkers.
//!
//! A [`HealthChecker`] records heartbeats and turns them into liveness
//! verdicts. Where the records live depends on its [`CheckerKind`]:
//!
//! - `memory`: this node only.
//! - `p2p`: sharded over the checker peers with a consistent hash ring.
//! - `leader`: held by the elected leader, followers forward to it.
//!
//! Every kind shares the check decision and its suppression windows.

mod leader;
mod memory;
mod p2p;
pub mod window;

use crate::batch::BatchConfig;
use crate::cache::segment_map::{SegmentMap, hash_string};
use crate::collab::network::endpoint;
use crate::store::{HeartbeatRecord, RecordStore};
use crate::utils::current_time_sec;
use anyhow::{Result, bail};
use leader::LeaderBackend;
use log::{debug, info, trace, warn};
use memory::MemoryBackend;
use p2p::P2pBackend;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use utoipa::ToSchema;
use window::SuppressionMarks;

pub use leader::Leadership;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CheckerKind {
    Memory,
    P2p,
    Leader,
}

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub kind: CheckerKind,
    /// Host other checkers use to reach this node.
    pub advertise_host: String,
    /// Interface the peer listener binds to.
    pub listen_host: String,
    /// Peer listener port, 0 picks a free one.
    pub peer_port: u16,
    pub leader_key: String,
    pub batch: BatchConfig,
    pub request_timeout: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            kind: CheckerKind::Memory,
            advertise_host: "127.0.0.1".to_string(),
            listen_host: "0.0.0.0".to_string(),
            peer_port: 0,
            leader_key: "heartbeat-checker".to_string(),
            batch: BatchConfig {
                label: "peer".to_string(),
                ..BatchConfig::default()
            },
            request_timeout: Duration::from_secs(3),
        }
    }
}

impl CheckerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.advertise_host.is_empty() {
            bail!("advertise host must not be empty");
        }
        if self.request_timeout.is_zero() {
            bail!("peer request timeout must be positive");
        }
        if self.kind == CheckerKind::Leader && self.leader_key.is_empty() {
            bail!("leader checker needs an election key");
        }

        self.batch.validate()
    }

    #[cfg(test)]
    pub fn memory() -> Self {
        Self::default()
    }

    /// Loopback settings for checkers talking to each other in tests.
    #[cfg(test)]
    pub fn loopback(kind: CheckerKind) -> Self {
        Self {
            kind,
            listen_host: "127.0.0.1".to_string(),
            batch: BatchConfig {
                label: "peer".to_string(),
                wait_time: Duration::from_millis(5),
                ..BatchConfig::default()
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub key: String,
    pub expire_sec: i64,
    /// Verdict currently held for the entity.
    pub healthy: bool,
    pub cur_time_sec: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResponse {
    pub healthy: bool,
    /// Set when the verdict came from a real evaluation of a live record.
    pub regular: bool,
    /// Set when the held verdict stands.
    pub stay_unchanged: bool,
    pub last_heartbeat_sec: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueryResult {
    pub exists: bool,
    pub last_heartbeat_sec: i64,
    pub server: Option<String>,
    pub count: i64,
}

impl From<Option<HeartbeatRecord>> for QueryResult {
    fn from(record: Option<HeartbeatRecord>) -> Self {
        match record {
            Some(record) => Self {
                exists: true,
                last_heartbeat_sec: record.last_time_sec,
                server: Some(record.server),
                count: record.count,
            },
            None => Self {
                exists: false,
                last_heartbeat_sec: 0,
                server: None,
                count: 0,
            },
        }
    }
}

/// Reachability of one peer the records are spread over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PeerProbe {
    pub id: String,
    pub local: bool,
    pub reachable: bool,
}

/// Verdict for an entity whose last heartbeat was at `last_heartbeat_sec`
/// (0 when none is recorded). Only a flip of the held verdict is a change.
pub fn decide(request: &CheckRequest, last_heartbeat_sec: i64) -> CheckResponse {
    let healthy = request.cur_time_sec - last_heartbeat_sec < request.expire_sec;

    CheckResponse {
        healthy,
        regular: healthy,
        stay_unchanged: healthy == request.healthy,
        last_heartbeat_sec,
    }
}

fn unchanged(request: &CheckRequest) -> CheckResponse {
    CheckResponse {
        healthy: request.healthy,
        regular: false,
        stay_unchanged: true,
        last_heartbeat_sec: 0,
    }
}

enum Backend {
    Memory(MemoryBackend),
    P2p(P2pBackend),
    Leader(LeaderBackend),
}

/// State shared by a checker and its backend.
pub(crate) struct Shared {
    pub(crate) config: CheckerConfig,
    pub(crate) store: Arc<RecordStore>,
    pub(crate) marks: SuppressionMarks,
    local_id: RwLock<String>,
}

impl Shared {
    pub(crate) fn local_id(&self) -> String {
        self.local_id.read().clone()
    }

    pub(crate) fn set_local_port(&self, port: u16) {
        *self.local_id.write() = endpoint(&self.config.advertise_host, port);
    }
}

pub struct HealthChecker {
    shared: Arc<Shared>,
    adopted: SegmentMap<String, ()>,
    backend: Backend,
}

impl HealthChecker {
    /// Builds a checker of the configured kind. Nothing runs until
    /// [`start`](Self::start). The leader kind needs `leadership`.
    pub fn new(config: CheckerConfig, leadership: Option<Leadership>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            local_id: RwLock::new(endpoint(&config.advertise_host, config.peer_port)),
            store: Arc::new(RecordStore::new()),
            marks: SuppressionMarks::default(),
            config,
        });

        let backend = match shared.config.kind {
            CheckerKind::Memory => Backend::Memory(MemoryBackend::new(shared.clone())),
            CheckerKind::P2p => Backend::P2p(P2pBackend::new(shared.clone())),
            CheckerKind::Leader => {
                let Some(leadership) = leadership else {
                    bail!("leader checker needs a leader election");
                };
                Backend::Leader(LeaderBackend::new(shared.clone(), leadership))
            }
        };

        Ok(Self {
            shared,
            adopted: SegmentMap::with_default_shards(hash_string),
            backend,
        })
    }

    pub fn kind(&self) -> CheckerKind {
        self.shared.config.kind
    }

    /// Endpoint identifying this node among the checker peers.
    pub fn local_id(&self) -> String {
        self.shared.local_id()
    }

    /// Records held on this node, whatever their owner.
    pub fn local_store(&self) -> &Arc<RecordStore> {
        &self.shared.store
    }

    /// Peers the records are currently spread over.
    pub fn peers(&self) -> Vec<String> {
        match &self.backend {
            Backend::Memory(_) => vec![self.local_id()],
            Backend::P2p(backend) => backend.peer_ids(),
            Backend::Leader(backend) => backend.leader().into_iter().collect(),
        }
    }

    /// Pings every peer records are currently spread over.
    pub async fn probe_peers(&self) -> Vec<PeerProbe> {
        match &self.backend {
            Backend::Memory(_) => vec![PeerProbe {
                id: self.local_id(),
                local: true,
                reachable: true,
            }],
            Backend::P2p(backend) => backend.probe_peers().await,
            Backend::Leader(backend) => backend.probe_leader().await.into_iter().collect(),
        }
    }

    /// Starts listeners and background tasks. Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        match &self.backend {
            Backend::Memory(_) => {}
            Backend::P2p(backend) => backend.start().await?,
            Backend::Leader(backend) => backend.start().await?,
        }

        info!("{} checker {} started", self.kind(), self.local_id());
        Ok(())
    }

    pub async fn close(&self) {
        match &self.backend {
            Backend::Memory(_) => {}
            Backend::P2p(backend) => backend.close().await,
            Backend::Leader(backend) => backend.close().await,
        }

        info!("{} checker {} stopped", self.kind(), self.local_id());
    }

    /// Whether the backend knows where records live.
    pub fn is_ready(&self) -> bool {
        match &self.backend {
            Backend::Memory(_) => true,
            Backend::P2p(backend) => backend.is_ready(),
            Backend::Leader(backend) => backend.is_ready(),
        }
    }

    pub async fn report(&self, key: &str, host: &str, timestamp_sec: i64) -> Result<()> {
        let record = HeartbeatRecord::new(host, timestamp_sec);
        trace!("heartbeat {key} from {host} at {timestamp_sec}");

        match &self.backend {
            Backend::Memory(backend) => backend.put(key.to_string(), record),
            Backend::P2p(backend) => backend.put(key.to_string(), record).await,
            Backend::Leader(backend) => backend.put(key.to_string(), record).await,
        }
    }

    pub async fn query(&self, key: &str) -> Result<QueryResult> {
        let record = match &self.backend {
            Backend::Memory(backend) => backend.get(key),
            Backend::P2p(backend) => backend.get(key.to_string()).await?,
            Backend::Leader(backend) => backend.get(key.to_string()).await?,
        };

        Ok(record.into())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match &self.backend {
            Backend::Memory(backend) => backend.del(key),
            Backend::P2p(backend) => backend.del(key.to_string()).await,
            Backend::Leader(backend) => backend.del(key.to_string()).await,
        }
    }

    /// Evaluates one entity. Frozen windows, an unknown record location and
    /// lookup failures all keep the held verdict.
    pub async fn check(&self, request: &CheckRequest) -> CheckResponse {
        if !self.is_ready() {
            debug!("{} checker not ready, keeping {}", self.kind(), request.key);
            return unchanged(request);
        }

        if let Some(freeze) = self
            .shared
            .marks
            .active(request.cur_time_sec, request.expire_sec)
        {
            trace!("check of {} frozen: {freeze:?}", request.key);
            return unchanged(request);
        }

        match self.query(&request.key).await {
            Ok(result) => decide(request, result.last_heartbeat_sec),
            Err(e) => {
                warn!("failed to look up heartbeat of {}: {e:#}", request.key);
                unchanged(request)
            }
        }
    }

    pub fn add_to_check(&self, ids: &[String]) {
        for id in ids {
            if !self.adopted.put_if_absent(id.clone(), ()).1 {
                trace!("{id} is already watched");
            }
        }
    }

    pub fn remove_from_check(&self, ids: &[String]) {
        for id in ids {
            self.adopted.delete(id);
        }
    }

    #[cfg(test)]
    pub fn is_adopted(&self, id: &str) -> bool {
        self.adopted.load(&id.to_string()).is_some()
    }

    pub fn adopted_count(&self) -> usize {
        self.adopted.len()
    }

    /// Holds back verdict changes for one expiry window from now.
    pub fn suspend(&self) {
        let now = current_time_sec();
        self.shared.marks.suspend(now);

        info!("checker suspended at {now}");
    }

    pub fn suspend_time_sec(&self) -> i64 {
        self.shared.marks.suspended_at()
    }

    /// Last time the peers or the leader changed, 0 if they never did.
    pub fn topology_change_time_sec(&self) -> i64 {
        self.shared.marks.topology_changed_at()
    }

    /// Replaces the peer set records are sharded over. Only the p2p kind
    /// shards, the others ignore it.
    pub async fn set_checker_peers(&self, peers: Vec<String>) -> Result<()> {
        match &self.backend {
            Backend::P2p(backend) => backend.set_checker_peers(peers).await,
            _ => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn marks(&self) -> &SuppressionMarks {
        &self.shared.marks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_700_000_000;

    fn request(key: &str, healthy: bool, cur_time_sec: i64) -> CheckRequest {
        CheckRequest {
            key: key.to_string(),
            expire_sec: 15,
            healthy,
            cur_time_sec,
        }
    }

    #[test]
    fn test_transitions_are_changes_only_once() {
        let fresh = decide(&request("svc", true, T + 10), T);
        assert!(fresh.healthy && fresh.regular && fresh.stay_unchanged);

        let expired = decide(&request("svc", true, T + 16), T);
        assert!(!expired.healthy);
        assert!(!expired.stay_unchanged);

        let still_expired = decide(&request("svc", false, T + 20), T);
        assert!(!still_expired.healthy);
        assert!(still_expired.stay_unchanged);

        let recovered = decide(&request("svc", false, T + 21), T + 20);
        assert!(recovered.healthy && !recovered.stay_unchanged);
    }

    #[test]
    fn test_missing_record_is_expired() {
        let response = decide(&request("svc", true, T), 0);

        assert!(!response.healthy);
        assert!(!response.stay_unchanged);
    }

    #[test]
    fn test_kind_parses_from_config_strings() -> Result<()> {
        assert_eq!("p2p".parse::<CheckerKind>()?, CheckerKind::P2p);
        assert_eq!("leader".parse::<CheckerKind>()?, CheckerKind::Leader);
        assert_eq!(CheckerKind::Memory.to_string(), "memory");
        assert!("raft".parse::<CheckerKind>().is_err());

        Ok(())
    }

    #[test]
    fn test_leader_kind_needs_election() {
        let config = CheckerConfig {
            kind: CheckerKind::Leader,
            ..CheckerConfig::default()
        };

        assert!(HealthChecker::new(config, None).is_err());
    }

    #[tokio::test]
    async fn test_memory_round_trip() -> Result<()> {
        let checker = HealthChecker::new(CheckerConfig::memory(), None)?;
        checker.start().await?;

        checker.report("svc-1", "10.0.0.5", T).await?;
        let result = checker.query("svc-1").await?;
        assert!(result.exists);
        assert_eq!(result.last_heartbeat_sec, T);
        assert_eq!(result.server.as_deref(), Some("10.0.0.5"));

        checker.delete("svc-1").await?;
        assert!(!checker.query("svc-1").await?.exists);

        checker.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_check_follows_heartbeats() -> Result<()> {
        let checker = HealthChecker::new(CheckerConfig::memory(), None)?;
        checker.report("svc-1", "10.0.0.5", T).await?;

        let response = checker.check(&request("svc-1", true, T + 10)).await;
        assert!(response.healthy && response.stay_unchanged);
        assert_eq!(response.last_heartbeat_sec, T);

        let response = checker.check(&request("svc-1", true, T + 16)).await;
        assert!(!response.healthy && !response.stay_unchanged);

        let response = checker.check(&request("svc-1", false, T + 20)).await;
        assert!(!response.healthy && response.stay_unchanged);

        Ok(())
    }

    #[tokio::test]
    async fn test_suspend_freezes_verdicts() -> Result<()> {
        let checker = HealthChecker::new(CheckerConfig::memory(), None)?;
        checker.suspend();
        let suspended_at = checker.suspend_time_sec();
        assert!(suspended_at > 0);

        // Nothing reported, yet the healthy verdict holds during the window
        let response = checker.check(&request("svc-1", true, suspended_at + 1)).await;
        assert!(response.healthy && response.stay_unchanged && !response.regular);

        let response = checker.check(&request("svc-1", true, suspended_at + 15)).await;
        assert!(!response.healthy && !response.stay_unchanged);

        Ok(())
    }

    #[test]
    fn test_adoption_bookkeeping() -> Result<()> {
        let checker = HealthChecker::new(CheckerConfig::memory(), None)?;
        let ids = vec!["a".to_string(), "b".to_string()];

        checker.add_to_check(&ids);
        checker.add_to_check(&ids);
        assert_eq!(checker.adopted_count(), 2);

        checker.remove_from_check(&ids[..1]);
        assert!(!checker.is_adopted("a"));
        assert!(checker.is_adopted("b"));

        Ok(())
    }
}
