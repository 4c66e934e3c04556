pub mod segment_map;

use crate::checker::HealthChecker;
use crate::collab::continuum::hash_key;
use crate::registry::{Client, HealthCheckSpec, Instance, RegistryEvent};
use log::{debug, trace};
use segment_map::{SegmentMap, hash_string};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use strum::{Display, EnumString};
use utoipa::ToSchema;

/// Heartbeat windows are this many TTLs long.
const EXPIRE_TTL_MULTIPLIER: i64 = 3;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ItemKind {
    Instance,
    Client,
}

/// The part of a registry entity that drives its health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredEntity {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub kind: ItemKind,
    pub ttl_sec: u32,
}

impl MonitoredEntity {
    pub fn expire_sec(&self) -> i64 {
        self.ttl_sec as i64 * EXPIRE_TTL_MULTIPLIER
    }

    fn from_instance(instance: &Instance, spec: &HealthCheckSpec) -> Self {
        Self {
            id: instance.id.clone(),
            host: instance.host.clone(),
            port: instance.port,
            kind: ItemKind::Instance,
            ttl_sec: spec.ttl_sec,
        }
    }

    fn from_client(client: &Client, spec: &HealthCheckSpec) -> Self {
        Self {
            id: client.id.clone(),
            host: client.host.clone(),
            port: 0,
            kind: ItemKind::Client,
            ttl_sec: spec.ttl_sec,
        }
    }
}

/// A monitored entity with the checker that evaluates it and its position
/// on the ring.
#[derive(Clone)]
pub struct ItemWithChecker {
    pub item: MonitoredEntity,
    pub checker: Arc<HealthChecker>,
    pub hash: u32,
}

impl ItemWithChecker {
    pub fn new(item: MonitoredEntity, checker: Arc<HealthChecker>) -> Self {
        let hash = hash_key(&item.id);

        Self {
            item,
            checker,
            hash,
        }
    }
}

impl PartialEq for ItemWithChecker {
    fn eq(&self, other: &Self) -> bool {
        self.item == other.item
            && self.hash == other.hash
            && Arc::ptr_eq(&self.checker, &other.checker)
    }
}

impl std::fmt::Debug for ItemWithChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemWithChecker")
            .field("item", &self.item)
            .field("hash", &self.hash)
            .finish()
    }
}

/// Registry view used by the dispatcher and the scheduler.
///
/// Registry events keep three sets current: every instance and client, the
/// subset that carries a health-check spec (stored with its checker), and
/// the instances of the checker fleet itself. Each set raises a change flag
/// when its membership or check parameters move; the dispatcher takes the
/// flags on its event tick. A health change alone raises nothing.
pub struct HealthCheckCache {
    checker: Arc<HealthChecker>,
    self_service: String,
    instances: SegmentMap<String, Instance>,
    clients: SegmentMap<String, Client>,
    fleet: SegmentMap<String, Instance>,
    monitored_instances: SegmentMap<String, ItemWithChecker>,
    monitored_clients: SegmentMap<String, ItemWithChecker>,
    instances_changed: AtomicBool,
    clients_changed: AtomicBool,
    fleet_changed: AtomicBool,
}

impl HealthCheckCache {
    pub fn new(checker: Arc<HealthChecker>, self_service: impl Into<String>) -> Self {
        Self {
            checker,
            self_service: self_service.into(),
            instances: SegmentMap::with_default_shards(hash_string),
            clients: SegmentMap::with_default_shards(hash_string),
            fleet: SegmentMap::with_default_shards(hash_string),
            monitored_instances: SegmentMap::with_default_shards(hash_string),
            monitored_clients: SegmentMap::with_default_shards(hash_string),
            instances_changed: AtomicBool::new(false),
            clients_changed: AtomicBool::new(false),
            fleet_changed: AtomicBool::new(false),
        }
    }

    pub fn apply(&self, event: RegistryEvent) {
        trace!("applying registry event {event:?}");

        match event {
            RegistryEvent::InstanceUpserted { instance } => self.upsert_instance(instance),
            RegistryEvent::InstanceDeleted { id } => self.delete_instance(&id),
            RegistryEvent::ClientUpserted { client } => self.upsert_client(client),
            RegistryEvent::ClientDeleted { id } => self.delete_client(&id),
        }
    }

    fn upsert_instance(&self, instance: Instance) {
        if instance.service == self.self_service {
            let previous = self.fleet.store(instance.id.clone(), instance.clone());
            if previous.as_ref() != Some(&instance) {
                debug!("checker fleet member {} changed", instance.id);
                self.fleet_changed.store(true, Ordering::Release);
            }
            return;
        }

        let monitored = instance
            .health_check
            .as_ref()
            .map(|spec| MonitoredEntity::from_instance(&instance, spec));
        let id = instance.id.clone();
        self.instances.store(id.clone(), instance);

        self.track(
            &self.monitored_instances,
            &self.instances_changed,
            id,
            monitored,
        );
    }

    fn delete_instance(&self, id: &str) {
        let id = id.to_string();

        if self.fleet.delete(&id).is_some() {
            debug!("checker fleet member {id} left");
            self.fleet_changed.store(true, Ordering::Release);
        }

        self.instances.delete(&id);
        self.track(&self.monitored_instances, &self.instances_changed, id, None);
    }

    fn upsert_client(&self, client: Client) {
        let monitored = client
            .health_check
            .as_ref()
            .map(|spec| MonitoredEntity::from_client(&client, spec));
        let id = client.id.clone();
        self.clients.store(id.clone(), client);

        self.track(
            &self.monitored_clients,
            &self.clients_changed,
            id,
            monitored,
        );
    }

    fn delete_client(&self, id: &str) {
        let id = id.to_string();

        self.clients.delete(&id);
        self.track(&self.monitored_clients, &self.clients_changed, id, None);
    }

    /// Stores or drops the monitored entry for `id` and raises `flag` when
    /// the entry actually changed.
    fn track(
        &self,
        monitored: &SegmentMap<String, ItemWithChecker>,
        flag: &AtomicBool,
        id: String,
        entity: Option<MonitoredEntity>,
    ) {
        let changed = match entity {
            Some(entity) => {
                let next = ItemWithChecker::new(entity, self.checker.clone());
                monitored.store(id, next.clone()).as_ref() != Some(&next)
            }
            None => monitored.delete(&id).is_some(),
        };

        if changed {
            flag.store(true, Ordering::Release);
        }
    }

    pub fn get_instance(&self, id: &str) -> Option<Instance> {
        self.instances.load(&id.to_string())
    }

    pub fn get_client(&self, id: &str) -> Option<Client> {
        self.clients.load(&id.to_string())
    }

    /// Whether the entity behind `item` is still registered with a health check.
    pub fn is_monitored(&self, item: &MonitoredEntity) -> bool {
        match item.kind {
            ItemKind::Instance => self
                .get_instance(&item.id)
                .is_some_and(|instance| instance.health_check.is_some()),
            ItemKind::Client => self
                .get_client(&item.id)
                .is_some_and(|client| client.health_check.is_some()),
        }
    }

    /// Records a verdict on the cached instance. Returns whether the
    /// instance exists.
    pub fn set_instance_health(&self, id: &str, healthy: bool) -> bool {
        let id = id.to_string();
        let Some(mut instance) = self.instances.load(&id) else {
            return false;
        };

        instance.healthy = healthy;
        self.instances.store(id, instance);

        true
    }

    pub fn range_monitored_instances(&self, visit: impl FnMut(&String, &ItemWithChecker)) {
        self.monitored_instances.range(visit);
    }

    pub fn range_monitored_clients(&self, visit: impl FnMut(&String, &ItemWithChecker)) {
        self.monitored_clients.range(visit);
    }

    /// Healthy, non-isolated members of the checker fleet.
    pub fn alive_fleet_members(&self) -> Vec<Instance> {
        let mut members = Vec::new();
        self.fleet.range(|_, instance| {
            if instance.healthy && !instance.isolated {
                members.push(instance.clone());
            }
        });

        members
    }

    pub fn monitored_count(&self) -> (usize, usize) {
        (self.monitored_instances.len(), self.monitored_clients.len())
    }

    pub fn take_instances_changed(&self) -> bool {
        self.instances_changed.swap(false, Ordering::AcqRel)
    }

    pub fn take_clients_changed(&self) -> bool {
        self.clients_changed.swap(false, Ordering::AcqRel)
    }

    pub fn take_fleet_changed(&self) -> bool {
        self.fleet_changed.swap(false, Ordering::AcqRel)
    }
}
