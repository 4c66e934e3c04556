use crate::cache::{HealthCheckCache, ItemKind, ItemWithChecker};
use crate::checker::HealthChecker;
use crate::collab::continuum::{Bucket, Continuum};
use crate::collab::network::endpoint;
use crate::utils::guarded;
use crate::worker::CheckScheduler;
use anyhow::Result;
use itertools::Itertools;
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Pace at which raised change flags are picked up.
    pub event_interval: Duration,
    /// Pace of the unconditional full reassignment.
    pub ensure_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            event_interval: Duration::from_millis(500),
            ensure_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct DispatchState {
    buckets: BTreeSet<Bucket>,
    continuum: Option<Arc<Continuum>>,
    managed_instances: HashMap<String, ItemWithChecker>,
    managed_clients: HashMap<String, ItemWithChecker>,
}

fn owns(continuum: Option<&Continuum>, hash: u32, local_id: &str) -> bool {
    continuum.is_some_and(|continuum| continuum.locate(hash) == local_id)
}

/// Decides which monitored entities this node checks.
///
/// The checker fleet forms a ring; an entity belongs to the node its hash
/// lands on. The event tick acts only when the cache raised a change flag,
/// the ensure tick recomputes everything regardless. Only ownership changes
/// reach the scheduler.
pub struct Dispatcher {
    config: DispatcherConfig,
    cache: Arc<HealthCheckCache>,
    checker: Arc<HealthChecker>,
    scheduler: Arc<CheckScheduler>,
    state: Mutex<DispatchState>,
    started: AtomicBool,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        cache: Arc<HealthCheckCache>,
        checker: Arc<HealthChecker>,
        scheduler: Arc<CheckScheduler>,
    ) -> Self {
        Self {
            config,
            cache,
            checker,
            scheduler,
            state: Mutex::new(DispatchState::default()),
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let dispatcher = self.clone();
        self.tracker.spawn(async move { dispatcher.run().await });

        info!("Dispatcher started");
    }

    async fn run(&self) {
        let mut events = time::interval(self.config.event_interval);
        let mut ensure = time::interval(self.config.ensure_interval);
        events.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ensure.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let force = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ensure.tick() => true,
                _ = events.tick() => false,
            };

            if let Some(Err(e)) = guarded("dispatch tick", self.tick(force)).await {
                error!("error dispatching health checks: {e:#}");
            }
        }
    }

    pub async fn close(&self) {
        self.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        info!("Dispatcher stopped");
    }

    /// One dispatch round. Without `force` nothing happens unless a change
    /// flag was raised since the last round.
    pub async fn tick(&self, force: bool) -> Result<()> {
        let mut state = self.state.lock().await;

        let mut dirty = false;
        if self.cache.take_fleet_changed() || force {
            dirty = self.refresh_fleet(&mut state).await?;
        }

        // Taken after the ring is settled so a failed refresh loses no change
        let instances_changed = self.cache.take_instances_changed();
        let clients_changed = self.cache.take_clients_changed();

        if force || dirty || instances_changed {
            self.reassign(&mut state, ItemKind::Instance).await;
        }
        if force || dirty || clients_changed {
            self.reassign(&mut state, ItemKind::Client).await;
        }

        Ok(())
    }

    /// Rebuilds the ring from the alive fleet. Returns whether it changed.
    ///
    /// Members weighing 0 take no work and stay off the ring.
    async fn refresh_fleet(&self, state: &mut DispatchState) -> Result<bool> {
        let buckets: BTreeSet<Bucket> = self
            .cache
            .alive_fleet_members()
            .iter()
            .filter(|member| member.weight > 0)
            .map(|member| Bucket::new(endpoint(&member.host, member.port), member.weight))
            .collect();

        if buckets == state.buckets {
            return Ok(false);
        }

        let was_empty = state.buckets.is_empty();
        state.continuum = if buckets.is_empty() {
            None
        } else {
            Some(Arc::new(Continuum::new(&buckets)?))
        };

        match &state.continuum {
            Some(continuum) => {
                info!(
                    "checker fleet changed to [{}], {} ring points",
                    buckets.iter().join(", "),
                    continuum.point_count()
                );

                if was_empty {
                    self.checker.suspend();
                }

                let peers = continuum.hosts().to_vec();
                if let Err(e) = self.checker.set_checker_peers(peers).await {
                    warn!("failed to update checker peers: {e:#}");
                }
            }
            // Keep the last peers so heartbeats still land somewhere
            None => warn!("no weighted alive checker in the fleet, this node checks nothing"),
        }

        state.buckets = buckets;
        Ok(true)
    }

    async fn reassign(&self, state: &mut DispatchState, kind: ItemKind) {
        let continuum = state.continuum.clone();
        let local_id = self.checker.local_id();

        let mut wanted: HashMap<String, ItemWithChecker> = HashMap::new();
        let mut collect = |id: &String, item: &ItemWithChecker| {
            if owns(continuum.as_deref(), item.hash, &local_id) {
                wanted.insert(id.clone(), item.clone());
            }
        };
        match kind {
            ItemKind::Instance => self.cache.range_monitored_instances(&mut collect),
            ItemKind::Client => self.cache.range_monitored_clients(&mut collect),
        }

        let managed = match kind {
            ItemKind::Instance => &mut state.managed_instances,
            ItemKind::Client => &mut state.managed_clients,
        };

        let removed: Vec<String> = managed
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        let changed: Vec<ItemWithChecker> = wanted
            .iter()
            .filter(|(id, item)| managed.get(*id) != Some(*item))
            .map(|(_, item)| item.clone())
            .collect();

        if removed.is_empty() && changed.is_empty() {
            debug!("{kind} assignment unchanged ({} owned)", wanted.len());
        } else {
            info!(
                "{kind} assignment: {} owned, {} added or changed, {} released",
                wanted.len(),
                changed.len(),
                removed.len()
            );
        }

        self.scheduler.remove(&removed).await;
        self.scheduler.upsert(changed).await;
        *managed = wanted;
    }

    pub async fn owned_count(&self) -> (usize, usize) {
        let state = self.state.lock().await;

        (state.managed_instances.len(), state.managed_clients.len())
    }

    pub async fn fleet(&self) -> Vec<String> {
        let state = self.state.lock().await;

        state.buckets.iter().map(|bucket| bucket.host.clone()).collect()
    }
}
