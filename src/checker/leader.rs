use super::{PeerProbe, Shared};
use crate::collab::internode::{PeerServer, RemotePeer};
use crate::collab::leader::{LeaderChangeEvent, LeaderElection};
use crate::store::HeartbeatRecord;
use crate::utils::{current_time_sec, guarded};
use anyhow::{Context, Result};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The election a leader checker takes part in, and the channel its
/// outcomes are published on.
#[derive(Clone)]
pub struct Leadership {
    pub election: Arc<dyn LeaderElection>,
    pub events: broadcast::Sender<LeaderChangeEvent>,
}

enum Role {
    Uninitialized,
    Leader,
    Follower {
        leader: String,
        remote: Arc<RemotePeer>,
    },
}

enum Route {
    Uninitialized,
    Local,
    Remote(Arc<RemotePeer>),
}

struct LeaderState {
    shared: Arc<Shared>,
    role: Mutex<Role>,
    transition: tokio::sync::Mutex<()>,
}

impl LeaderState {
    fn route(&self) -> Route {
        match &*self.role.lock() {
            Role::Uninitialized => Route::Uninitialized,
            Role::Leader => Route::Local,
            Role::Follower { remote, .. } => Route::Remote(remote.clone()),
        }
    }

    /// Applies an election outcome. Only real role changes open a
    /// suppression window.
    async fn handle_leader_change(&self, event: LeaderChangeEvent) -> Result<()> {
        let config = &self.shared.config;
        if event.key != config.leader_key {
            trace!("ignoring leader change for {}", event.key);
            return Ok(());
        }

        let _transition = self.transition.lock().await;
        let local_id = self.shared.local_id();

        if event.is_leader || event.leader_host == local_id {
            if matches!(*self.role.lock(), Role::Leader) {
                return Ok(());
            }

            let previous = std::mem::replace(&mut *self.role.lock(), Role::Leader);
            self.shared.marks.mark_topology_change(current_time_sec());
            info!("{local_id} became leader for {}", event.key);

            if let Role::Follower { remote, .. } = previous {
                // Best effort: the previous leader may already be gone
                match remote.snapshot().await {
                    Ok(records) => {
                        let merged = self.shared.store.merge(records);
                        info!("took over {merged} records from {}", remote.id());
                    }
                    Err(e) => debug!("no records taken over from {}: {e:#}", remote.id()),
                }
                remote.close().await;
            }
            return Ok(());
        }

        let same_leader = match &*self.role.lock() {
            Role::Follower { leader, .. } => *leader == event.leader_host,
            _ => false,
        };
        if same_leader {
            return Ok(());
        }

        let remote =
            RemotePeer::connect(&event.leader_host, &config.batch, config.request_timeout)?;
        let previous = std::mem::replace(
            &mut *self.role.lock(),
            Role::Follower {
                leader: event.leader_host.clone(),
                remote: Arc::new(remote),
            },
        );
        self.shared.marks.mark_topology_change(current_time_sec());
        info!("{local_id} follows leader {}", event.leader_host);

        match previous {
            Role::Follower { remote, .. } => remote.close().await,
            Role::Leader => {
                debug!("dropping {} records held as leader", self.shared.store.len());
                self.shared.store.clear();
            }
            Role::Uninitialized => {}
        }

        Ok(())
    }

    async fn reset(&self) {
        let _transition = self.transition.lock().await;
        let previous = std::mem::replace(&mut *self.role.lock(), Role::Uninitialized);

        if let Role::Follower { remote, .. } = previous {
            remote.close().await;
        }
    }
}

/// Keeps every record on the elected leader.
///
/// The leader answers from its local store, followers forward each operation
/// to it. Until the first election outcome arrives the backend is
/// uninitialized: writes are dropped, reads come back empty and checks keep
/// their verdict.
pub(super) struct LeaderBackend {
    state: Arc<LeaderState>,
    leadership: Leadership,
    server: tokio::sync::Mutex<Option<PeerServer>>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl LeaderBackend {
    pub(super) fn new(shared: Arc<Shared>, leadership: Leadership) -> Self {
        Self {
            state: Arc::new(LeaderState {
                shared,
                role: Mutex::new(Role::Uninitialized),
                transition: tokio::sync::Mutex::new(()),
            }),
            leadership,
            server: tokio::sync::Mutex::new(None),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub(super) async fn start(&self) -> Result<()> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }

        let shared = &self.state.shared;
        let ip: IpAddr = shared
            .config
            .listen_host
            .parse()
            .with_context(|| format!("invalid listen host '{}'", shared.config.listen_host))?;
        let bound = PeerServer::bind(
            SocketAddr::new(ip, shared.config.peer_port),
            shared.store.clone(),
        )
        .await?;
        shared.set_local_port(bound.local_addr().port());
        *server = Some(bound);

        // Subscribe before joining so the first outcome is not missed
        let events = self.leadership.events.subscribe();
        self.tracker
            .spawn(follow_leader_changes(self.state.clone(), events, self.stop.clone()));

        self.leadership
            .election
            .start_leader_election(&shared.config.leader_key)?;

        Ok(())
    }

    pub(super) async fn close(&self) {
        self.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        self.state.reset().await;

        if let Some(server) = self.server.lock().await.take() {
            server.close().await;
        }
    }

    pub(super) fn is_ready(&self) -> bool {
        !matches!(self.state.route(), Route::Uninitialized)
    }

    pub(super) fn leader(&self) -> Option<String> {
        match &*self.state.role.lock() {
            Role::Uninitialized => None,
            Role::Leader => Some(self.state.shared.local_id()),
            Role::Follower { leader, .. } => Some(leader.clone()),
        }
    }

    pub(super) async fn probe_leader(&self) -> Option<PeerProbe> {
        match self.state.route() {
            Route::Uninitialized => None,
            Route::Local => Some(PeerProbe {
                id: self.state.shared.local_id(),
                local: true,
                reachable: true,
            }),
            Route::Remote(remote) => Some(PeerProbe {
                id: remote.id().to_string(),
                local: false,
                reachable: remote.ping().await.is_ok(),
            }),
        }
    }

    pub(super) async fn put(&self, key: String, record: HeartbeatRecord) -> Result<()> {
        match self.state.route() {
            Route::Uninitialized => {
                debug!("no leader known yet, dropping heartbeat of {key}");
                Ok(())
            }
            Route::Local => {
                self.state.shared.store.put([(key, record)]);
                Ok(())
            }
            Route::Remote(remote) => remote.put(key, record).await,
        }
    }

    pub(super) async fn get(&self, key: String) -> Result<Option<HeartbeatRecord>> {
        match self.state.route() {
            Route::Uninitialized => {
                debug!("no leader known yet, {key} reads as absent");
                Ok(None)
            }
            Route::Local => Ok(self.state.shared.store.get_one(&key)),
            Route::Remote(remote) => remote.get(key).await,
        }
    }

    pub(super) async fn del(&self, key: String) -> Result<()> {
        match self.state.route() {
            Route::Uninitialized => {
                debug!("no leader known yet, ignoring delete of {key}");
                Ok(())
            }
            Route::Local => {
                self.state.shared.store.del(&[key]);
                Ok(())
            }
            Route::Remote(remote) => remote.del(key).await,
        }
    }

    #[cfg(test)]
    pub(super) async fn wait_connected(&self, timeout: std::time::Duration) -> bool {
        match self.state.route() {
            Route::Remote(remote) => remote.connection().wait_connected(timeout).await,
            Route::Local => true,
            Route::Uninitialized => false,
        }
    }
}

async fn follow_leader_changes(
    state: Arc<LeaderState>,
    mut events: broadcast::Receiver<LeaderChangeEvent>,
    stop: CancellationToken,
) {
    info!("following leader changes");

    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => {
                let handled = guarded("leader change", state.handle_leader_change(event)).await;
                if let Some(Err(e)) = handled {
                    error!("failed to apply leader change: {e:#}");
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!("missed {skipped} leader change events"),
            Err(RecvError::Closed) => break,
        }
    }

    info!("stopped following leader changes");
}
