//! Per-entity heartbeat checks.
//!
//! Every entity this node owns has exactly one timer on the [`TimeWheel`].
//! When it fires the entity is checked, a verdict flip goes to the status
//! sink, and the timer is armed again: shortly before the heartbeat would
//! expire while healthy, at a fixed pace otherwise.

pub mod status;
pub mod timewheel;

use crate::batch::{BatchConfig, BatchController, Task, handler};
use crate::cache::segment_map::{SegmentMap, hash_string};
use crate::cache::{HealthCheckCache, ItemKind, ItemWithChecker, MonitoredEntity};
use crate::checker::{CheckRequest, HealthChecker};
use crate::utils::current_time_sec;
use anyhow::{Result, bail};
use futures::FutureExt;
use itertools::Itertools;
use log::{debug, error, info, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};
use status::{StatusSaveManager, StatusTransition};
use std::sync::{Arc, Weak};
use std::time::Duration;
use timewheel::TimeWheel;
use utoipa::ToSchema;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Lower bound of the delay before a healthy entity is checked again.
    pub min_check_interval_sec: i64,
    /// Pace of checks for unhealthy or frozen entities.
    pub max_check_interval_sec: i64,
    /// Upper bound of the random delay added to every timer.
    pub jitter: Duration,
    pub wheel_interval: Duration,
    pub wheel_slots: usize,
    pub adoption: BatchConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_check_interval_sec: 1,
            max_check_interval_sec: 5,
            jitter: Duration::from_millis(500),
            wheel_interval: Duration::from_millis(100),
            wheel_slots: 512,
            adoption: BatchConfig {
                label: "adoption".to_string(),
                max_batch_count: 100,
                wait_time: Duration::from_millis(500),
                ..BatchConfig::default()
            },
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_check_interval_sec <= 0 {
            bail!("min check interval must be positive");
        }
        if self.max_check_interval_sec < self.min_check_interval_sec {
            bail!(
                "max check interval ({}s) is below the min check interval ({}s)",
                self.max_check_interval_sec,
                self.min_check_interval_sec
            );
        }

        self.adoption.validate()
    }
}

/// Seconds until a healthy entity is due again: when its heartbeat would
/// expire, kept within `[min_interval, expire]`.
pub fn healthy_delay(
    expire_sec: i64,
    last_heartbeat_sec: i64,
    now_sec: i64,
    min_interval_sec: i64,
) -> i64 {
    let remaining = expire_sec - (now_sec - last_heartbeat_sec);
    let floor = min_interval_sec.min(expire_sec).max(1);

    remaining.clamp(floor, expire_sec.max(floor))
}

/// Seconds until an unhealthy (or frozen) entity is due again.
pub fn unhealthy_delay(expire_sec: i64, max_interval_sec: i64) -> i64 {
    expire_sec.min(max_interval_sec).max(1)
}

/// Where the check of one scheduled entity stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CheckState {
    pub id: String,
    pub kind: ItemKind,
    pub healthy: bool,
    pub expire_sec: i64,
    /// Last verdict flip, or the scheduling time when it never flipped.
    pub last_event_time_sec: i64,
}

struct ItemState {
    healthy: bool,
    last_event_time_sec: i64,
}

struct MonitoredItem {
    entity: MonitoredEntity,
    checker: Arc<HealthChecker>,
    state: tokio::sync::Mutex<ItemState>,
}

impl MonitoredItem {
    fn same_target(&self, item: &ItemWithChecker) -> bool {
        self.entity == item.item && Arc::ptr_eq(&self.checker, &item.checker)
    }
}

/// Start or stop watching one key on a checker.
struct Adoption {
    checker: Arc<HealthChecker>,
    id: String,
    watch: bool,
}

fn flush_adoptions(tasks: Vec<Task<Adoption, ()>>) {
    let groups = tasks
        .into_iter()
        .chunk_by(|task| (Arc::as_ptr(&task.input.checker), task.input.watch));

    for ((_, watch), group) in &groups {
        let tasks: Vec<Task<Adoption, ()>> = group.collect();
        let ids: Vec<String> = tasks.iter().map(|task| task.input.id.clone()).collect();

        let checker = &tasks[0].input.checker;
        if watch {
            checker.add_to_check(&ids);
        } else {
            checker.remove_from_check(&ids);
        }
        trace!("{} {} keys", if watch { "adopted" } else { "released" }, ids.len());

        for task in tasks {
            task.complete(Ok(()));
        }
    }
}

struct Inner {
    config: SchedulerConfig,
    cache: Arc<HealthCheckCache>,
    wheel: Arc<TimeWheel>,
    items: SegmentMap<String, Arc<MonitoredItem>>,
    status: StatusSaveManager,
    adoption: BatchController<Adoption, ()>,
}

impl Inner {
    fn jitter(&self) -> Duration {
        let max = self.config.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }

        Duration::from_millis(rand::rng().random_range(0..max))
    }

    fn arm(self: &Arc<Self>, item: Arc<MonitoredItem>, delay_sec: i64) {
        let delay = Duration::from_secs(delay_sec.max(0) as u64) + self.jitter();
        let scheduler: Weak<Self> = Arc::downgrade(self);

        self.wheel.schedule(
            delay,
            Box::new(move || {
                async move {
                    if let Some(scheduler) = scheduler.upgrade() {
                        scheduler.fire(item).await;
                    }
                }
                .boxed()
            }),
        );
    }

    async fn fire(self: Arc<Self>, item: Arc<MonitoredItem>) {
        let id = &item.entity.id;
        let mut state = item.state.lock().await;

        let current = self.items.load(id);
        if !current.is_some_and(|current| Arc::ptr_eq(&current, &item)) {
            trace!("timer of {id} is stale");
            return;
        }

        if !self.cache.is_monitored(&item.entity) {
            debug!("{} {id} is gone, dropping its check", item.entity.kind);
            self.items.delete_if(id, |current| Arc::ptr_eq(current, &item));
            self.adopt(&item.checker, id, false).await;
            return;
        }

        let now = current_time_sec();
        let expire_sec = item.entity.expire_sec();
        let request = CheckRequest {
            key: id.clone(),
            expire_sec,
            healthy: state.healthy,
            cur_time_sec: now,
        };
        let response = item.checker.check(&request).await;

        if !response.stay_unchanged {
            state.healthy = response.healthy;
            state.last_event_time_sec = now;

            if item.entity.kind == ItemKind::Instance {
                self.cache.set_instance_health(id, response.healthy);
            }

            let transition = StatusTransition {
                id: id.clone(),
                kind: item.entity.kind,
                healthy: response.healthy,
                last_heartbeat_sec: response.last_heartbeat_sec,
                checked_at_sec: now,
            };
            if let Err(e) = self.status.save(transition) {
                error!("Failed to queue status of {id}: {e}");
            }
        }

        let delay_sec = if response.healthy && response.regular {
            healthy_delay(
                expire_sec,
                response.last_heartbeat_sec,
                now,
                self.config.min_check_interval_sec,
            )
        } else {
            unhealthy_delay(expire_sec, self.config.max_check_interval_sec)
        };
        drop(state);

        self.arm(item, delay_sec);
    }

    async fn adopt(&self, checker: &Arc<HealthChecker>, id: &str, watch: bool) {
        // Resolved by the flush, nobody waits on it
        let _ = self
            .adoption
            .submit(Adoption {
                checker: checker.clone(),
                id: id.to_string(),
                watch,
            })
            .await;
    }
}

/// Keeps one check timer per owned entity.
pub struct CheckScheduler {
    inner: Arc<Inner>,
}

impl CheckScheduler {
    pub fn new(
        config: SchedulerConfig,
        cache: Arc<HealthCheckCache>,
        status: StatusSaveManager,
    ) -> Result<Self> {
        config.validate()?;

        let wheel = Arc::new(TimeWheel::new(config.wheel_interval, config.wheel_slots)?);
        let adoption = BatchController::start(
            config.adoption.clone(),
            handler(|tasks| async move { flush_adoptions(tasks) }),
        )?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cache,
                wheel,
                items: SegmentMap::with_default_shards(hash_string),
                status,
                adoption,
            }),
        })
    }

    pub fn start(&self) {
        self.inner.wheel.start();

        info!("CheckScheduler started");
    }

    /// Schedules `items`. An item already scheduled with the same entity and
    /// checker keeps its timer; a changed one replaces the old timer.
    pub async fn upsert(&self, items: Vec<ItemWithChecker>) {
        for item in items {
            let id = item.item.id.clone();

            let previous = self.inner.items.load(&id);
            if previous.as_ref().is_some_and(|previous| previous.same_target(&item)) {
                continue;
            }

            let healthy = match item.item.kind {
                ItemKind::Instance => self
                    .inner
                    .cache
                    .get_instance(&id)
                    .is_none_or(|instance| instance.healthy),
                ItemKind::Client => true,
            };
            let expire_sec = item.item.expire_sec();
            let monitored = Arc::new(MonitoredItem {
                entity: item.item,
                checker: item.checker,
                state: tokio::sync::Mutex::new(ItemState {
                    healthy,
                    last_event_time_sec: current_time_sec(),
                }),
            });

            self.inner.items.store(id.clone(), monitored.clone());
            match previous {
                Some(previous) if !Arc::ptr_eq(&previous.checker, &monitored.checker) => {
                    self.inner.adopt(&previous.checker, &id, false).await;
                    self.inner.adopt(&monitored.checker, &id, true).await;
                }
                Some(_) => debug!("check of {id} replaced"),
                None => self.inner.adopt(&monitored.checker, &id, true).await,
            }

            self.inner.arm(
                monitored,
                unhealthy_delay(expire_sec, self.inner.config.max_check_interval_sec),
            );
        }
    }

    /// Stops checking `ids`. Their pending timers find nothing and end.
    pub async fn remove(&self, ids: &[String]) {
        for id in ids {
            if let Some(item) = self.inner.items.delete(id) {
                self.inner.adopt(&item.checker, id, false).await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.items.load(&id.to_string()).is_some()
    }

    /// Timers armed on the wheel, stale ones included.
    pub fn pending_timers(&self) -> usize {
        self.inner.wheel.pending()
    }

    /// Current check state of `id`, `None` when this node does not check it.
    pub async fn describe(&self, id: &str) -> Option<CheckState> {
        let item = self.inner.items.load(&id.to_string())?;
        let state = item.state.lock().await;

        Some(CheckState {
            id: item.entity.id.clone(),
            kind: item.entity.kind,
            healthy: state.healthy,
            expire_sec: item.entity.expire_sec(),
            last_event_time_sec: state.last_event_time_sec,
        })
    }

    /// Stops the timers, then drains pending adoptions and statuses.
    pub async fn close(&self) {
        self.inner.wheel.stop().await;
        self.inner.adoption.stop().await;
        self.inner.status.close().await;

        info!("CheckScheduler stopped");
    }
}
