use super::{PeerProbe, Shared};
use crate::collab::continuum::{Bucket, Continuum};
use crate::collab::internode::{LocalPeer, Peer, PeerServer, RemotePeer};
use crate::store::HeartbeatRecord;
use crate::utils::current_time_sec;
use anyhow::{Context, Result, anyhow};
use futures::future::join_all;
use itertools::Itertools;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

#[derive(Default)]
struct Topology {
    peers: HashMap<String, Arc<Peer>>,
    continuum: Option<Continuum>,
}

impl Topology {
    fn owner(&self, key: &str) -> Option<Arc<Peer>> {
        let continuum = self.continuum.as_ref()?;

        self.peers.get(continuum.locate_key(key)).cloned()
    }
}

/// Shards records over the checker peers.
///
/// Each key belongs to the peer the ring over the peer set picks for it.
/// The topology is swapped whole, so a lookup runs against either the old
/// or the new peer set and never a mix.
pub(super) struct P2pBackend {
    shared: Arc<Shared>,
    topology: RwLock<Arc<Topology>>,
    membership: tokio::sync::Mutex<()>,
    server: tokio::sync::Mutex<Option<PeerServer>>,
}

impl P2pBackend {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            topology: RwLock::new(Arc::new(Topology::default())),
            membership: tokio::sync::Mutex::new(()),
            server: tokio::sync::Mutex::new(None),
        }
    }

    pub(super) async fn start(&self) -> Result<()> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }

        let config = &self.shared.config;
        let ip: IpAddr = config
            .listen_host
            .parse()
            .with_context(|| format!("invalid listen host '{}'", config.listen_host))?;
        let bound = PeerServer::bind(
            SocketAddr::new(ip, config.peer_port),
            self.shared.store.clone(),
        )
        .await?;

        self.shared.set_local_port(bound.local_addr().port());
        *server = Some(bound);

        Ok(())
    }

    pub(super) async fn close(&self) {
        let _membership = self.membership.lock().await;

        let topology = std::mem::take(&mut *self.topology.write());
        for peer in topology.peers.values() {
            peer.close().await;
        }

        if let Some(server) = self.server.lock().await.take() {
            server.close().await;
        }
    }

    pub(super) fn is_ready(&self) -> bool {
        self.topology.read().continuum.is_some()
    }

    fn owner(&self, key: &str) -> Result<Arc<Peer>> {
        // Clone the Arc so the lock is not held across the request
        let topology = self.topology.read().clone();

        topology
            .owner(key)
            .ok_or_else(|| anyhow!("no checker peer owns {key}"))
    }

    pub(super) async fn put(&self, key: String, record: HeartbeatRecord) -> Result<()> {
        self.owner(&key)?.put(key, record).await
    }

    pub(super) async fn get(&self, key: String) -> Result<Option<HeartbeatRecord>> {
        self.owner(&key)?.get(key).await
    }

    pub(super) async fn del(&self, key: String) -> Result<()> {
        self.owner(&key)?.del(key).await
    }

    #[cfg(test)]
    pub(super) fn owner_of(&self, key: &str) -> Option<String> {
        self.topology
            .read()
            .owner(key)
            .map(|peer| peer.id().to_string())
    }

    pub(super) async fn probe_peers(&self) -> Vec<PeerProbe> {
        let topology = self.topology.read().clone();

        let probes = topology.peers.values().map(|peer| async move {
            let reachable = match peer.ping().await {
                Ok(()) => true,
                Err(e) => {
                    debug!("peer {} unreachable: {e:#}", peer.id());
                    false
                }
            };

            PeerProbe {
                id: peer.id().to_string(),
                local: peer.is_local(),
                reachable,
            }
        });

        let mut probes = join_all(probes).await;
        probes.sort_by(|a, b| a.id.cmp(&b.id));
        probes
    }

    pub(super) fn peer_ids(&self) -> Vec<String> {
        self.topology.read().peers.keys().cloned().sorted().collect()
    }

    /// Moves to the peer set `peers` (`host:port` endpoints).
    ///
    /// Peers present before and after keep their connection, new ones are
    /// connected and departed ones closed once the new ring is in place.
    /// Any actual change opens a suppression window.
    pub(super) async fn set_checker_peers(&self, peers: Vec<String>) -> Result<()> {
        let _membership = self.membership.lock().await;

        let wanted: BTreeSet<String> = peers.into_iter().collect();
        let current = self.topology.read().clone();

        if current.peers.len() == wanted.len()
            && wanted.iter().all(|id| current.peers.contains_key(id))
        {
            return Ok(());
        }

        let local_id = self.shared.local_id();
        let config = &self.shared.config;
        let mut next = HashMap::with_capacity(wanted.len());

        for id in &wanted {
            let peer = match current.peers.get(id) {
                Some(existing) => existing.clone(),
                None if *id == local_id => Arc::new(Peer::Local(LocalPeer {
                    id: id.clone(),
                    store: self.shared.store.clone(),
                })),
                None => Arc::new(Peer::Remote(RemotePeer::connect(
                    id,
                    &config.batch,
                    config.request_timeout,
                )?)),
            };
            next.insert(id.clone(), peer);
        }

        let continuum = if wanted.is_empty() {
            None
        } else {
            let buckets: Vec<Bucket> = wanted.iter().map(|id| Bucket::new(id, 1)).collect();
            Some(Continuum::new(&buckets)?)
        };

        if !wanted.contains(&local_id) && !wanted.is_empty() {
            warn!("checker peer set does not include this node ({local_id})");
        }

        let removed: Vec<Arc<Peer>> = current
            .peers
            .iter()
            .filter(|(id, _)| !wanted.contains(*id))
            .map(|(_, peer)| peer.clone())
            .collect();

        *self.topology.write() = Arc::new(Topology {
            peers: next,
            continuum,
        });
        self.shared.marks.mark_topology_change(current_time_sec());

        info!(
            "checker peers changed to [{}], {} removed",
            wanted.iter().join(", "),
            removed.len()
        );

        for peer in removed {
            peer.close().await;
        }

        Ok(())
    }

    #[cfg(test)]
    pub(super) async fn wait_connected(&self, timeout: std::time::Duration) -> bool {
        let topology = self.topology.read().clone();

        for peer in topology.peers.values() {
            if let Peer::Remote(remote) = peer.as_ref() {
                if !remote.connection().wait_connected(timeout).await {
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use crate::checker::window::Freeze;
    use crate::checker::{Backend, CheckRequest, CheckerConfig, CheckerKind, HealthChecker};
    use crate::utils::{current_time_sec, init_logging};
    use anyhow::Result;
    use log::LevelFilter;
    use std::time::Duration;

    fn p2p(checker: &HealthChecker) -> &super::P2pBackend {
        match &checker.backend {
            Backend::P2p(backend) => backend,
            _ => unreachable!("not a p2p checker"),
        }
    }

    async fn fleet(size: usize) -> Result<Vec<HealthChecker>> {
        let mut nodes = Vec::new();
        for _ in 0..size {
            let node = HealthChecker::new(CheckerConfig::loopback(CheckerKind::P2p), None)?;
            node.start().await?;
            nodes.push(node);
        }

        let ids: Vec<String> = nodes.iter().map(|node| node.local_id()).collect();
        for node in &nodes {
            node.set_checker_peers(ids.clone()).await?;
        }
        for node in &nodes {
            assert!(p2p(node).wait_connected(Duration::from_secs(3)).await);
        }

        Ok(nodes)
    }

    #[tokio::test]
    async fn test_peers_agree_on_owners_and_records() -> Result<()> {
        init_logging(LevelFilter::Warn);
        let nodes = fleet(3).await?;

        let keys: Vec<String> = (0..30).map(|i| format!("instance-{i}")).collect();
        for key in &keys {
            let owners: Vec<Option<String>> =
                nodes.iter().map(|node| p2p(node).owner_of(key)).collect();
            assert!(owners[0].is_some());
            assert!(owners.iter().all(|owner| *owner == owners[0]));
        }

        // Report through one node, read through every other
        for (i, key) in keys.iter().enumerate() {
            let reporter = &nodes[i % nodes.len()];
            reporter.report(key, "10.0.0.8", 1_000 + i as i64).await?;
            // Answered on the same stream as the put, so the owner has applied it
            assert!(reporter.query(key).await?.exists);
        }
        for (i, key) in keys.iter().enumerate() {
            for node in &nodes {
                let result = node.query(key).await?;
                assert!(result.exists, "{key} missing on {}", node.local_id());
                assert_eq!(result.last_heartbeat_sec, 1_000 + i as i64);
            }
        }

        // Every record sits on exactly one node
        let stored: usize = nodes.iter().map(|node| node.local_store().len()).sum();
        assert_eq!(stored, keys.len());

        let probes = nodes[0].probe_peers().await;
        assert_eq!(probes.len(), nodes.len());
        assert!(probes.iter().all(|probe| probe.reachable));
        assert_eq!(probes.iter().filter(|probe| probe.local).count(), 1);

        nodes[2].delete(&keys[0]).await?;
        assert!(!nodes[1].query(&keys[0]).await?.exists);

        for node in &nodes {
            node.close().await;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_refresh_opens_window() -> Result<()> {
        let node = HealthChecker::new(CheckerConfig::loopback(CheckerKind::P2p), None)?;
        node.start().await?;

        // Without peers nobody owns a key, the verdict stays
        let request = CheckRequest {
            key: "svc-1".to_string(),
            expire_sec: 15,
            healthy: true,
            cur_time_sec: current_time_sec(),
        };
        assert!(node.check(&request).await.stay_unchanged);

        node.set_checker_peers(vec![node.local_id()]).await?;
        let refreshed_at = node.marks().topology_changed_at();
        assert!(refreshed_at > 0);
        assert_eq!(
            node.marks().active(refreshed_at, 15),
            Some(Freeze::TopologyChanged)
        );
        assert_eq!(p2p(&node).peer_ids(), vec![node.local_id()]);

        // No heartbeat at all, still unchanged inside the window
        let inside = CheckRequest {
            cur_time_sec: refreshed_at + 14,
            ..request.clone()
        };
        let response = node.check(&inside).await;
        assert!(response.healthy && response.stay_unchanged);

        let after = CheckRequest {
            cur_time_sec: refreshed_at + 15,
            ..request
        };
        let response = node.check(&after).await;
        assert!(!response.healthy && !response.stay_unchanged);

        // The same set again is not a refresh
        node.marks().mark_topology_change(1);
        node.set_checker_peers(vec![node.local_id()]).await?;
        assert_eq!(node.marks().topology_changed_at(), 1);

        node.close().await;
        Ok(())
    }
}
