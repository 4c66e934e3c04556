mod batch;
mod cache;
mod checker;
mod collab;
mod eager_env;
mod engine;
mod registry;
mod server;
mod store;
mod utils;
mod worker;

use crate::{
    batch::BatchConfig,
    checker::{CheckerConfig, CheckerKind, Leadership},
    collab::{
        dispatcher::DispatcherConfig,
        leader::StaticLeaderElection,
        network::{endpoint, get_first_network_address},
    },
    eager_env::check_env,
    engine::{Engine, EngineConfig},
    registry::{Instance, RegistryEvent},
    server::{AppStateInner, start_server},
    worker::{
        SchedulerConfig,
        status::{LogSink, StatusSink, WebhookSink},
    },
};
use log::{info, warn};
use std::{
    env,
    net::{IpAddr, SocketAddr, TcpListener},
    sync::Arc,
    time::Duration,
};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Fleet entry for a `host:port` peer endpoint, as the registry would list it.
fn fleet_member(peer: &str, service: &str) -> Option<Instance> {
    let (host, port) = match peer.parse::<SocketAddr>() {
        Ok(addr) => (addr.ip().to_string(), addr.port()),
        Err(_) => {
            let (host, port) = peer.rsplit_once(':')?;
            (host.to_string(), port.parse().ok()?)
        }
    };

    Some(Instance {
        id: endpoint(&host, port),
        service: service.to_string(),
        host,
        port,
        weight: 100,
        healthy: true,
        isolated: false,
        health_check: None,
    })
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();
    check_env();

    let process_id = Uuid::new_v4();
    let kind: CheckerKind = eager_env::CHECKER_KIND
        .parse()
        .expect("Invalid CHECKER_KIND");

    let advertise_host = env::var("ADVERTISE_HOST")
        .ok()
        .or_else(|| {
            get_first_network_address(*eager_env::PEER_PORT).map(|addr| addr.ip().to_string())
        })
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let listen_host = match advertise_host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => "::",
        _ => "0.0.0.0",
    };
    let local_id = endpoint(&advertise_host, *eager_env::PEER_PORT);

    let fleet: Vec<String> = eager_env::CHECKER_FLEET
        .split(',')
        .map(str::trim)
        .filter(|peer| !peer.is_empty())
        .map(str::to_string)
        .collect();

    let leadership = (kind == CheckerKind::Leader).then(|| {
        let (events, _) = broadcast::channel(16);
        let leader_host = env::var("LEADER_HOST")
            .ok()
            .or_else(|| StaticLeaderElection::leader_of(fleet.iter().map(String::as_str)))
            .unwrap_or_else(|| local_id.clone());
        let election = StaticLeaderElection::new(local_id.clone(), leader_host, events.clone());

        Leadership {
            election: Arc::new(election),
            events,
        }
    });

    let sink: Arc<dyn StatusSink> = match env::var("STATUS_WEBHOOK_URL") {
        Ok(url) => Arc::new(WebhookSink::new(url)),
        Err(_) => Arc::new(LogSink),
    };

    let config = EngineConfig {
        checker: CheckerConfig {
            kind,
            advertise_host: advertise_host.clone(),
            listen_host: listen_host.to_string(),
            peer_port: *eager_env::PEER_PORT,
            batch: BatchConfig {
                label: "peer".to_string(),
                queue_size: *eager_env::BATCH_QUEUE_SIZE,
                wait_time: Duration::from_millis(*eager_env::BATCH_WAIT_MILLIS),
                max_batch_count: *eager_env::BATCH_MAX_COUNT,
                concurrency: *eager_env::BATCH_CONCURRENCY,
            },
            ..CheckerConfig::default()
        },
        scheduler: SchedulerConfig {
            min_check_interval_sec: *eager_env::MIN_CHECK_INTERVAL_SECONDS,
            max_check_interval_sec: *eager_env::MAX_CHECK_INTERVAL_SECONDS,
            ..SchedulerConfig::default()
        },
        dispatcher: DispatcherConfig {
            event_interval: Duration::from_millis(*eager_env::DISPATCH_EVENT_INTERVAL_MILLIS),
            ensure_interval: Duration::from_secs(*eager_env::DISPATCH_ENSURE_INTERVAL_SECONDS),
        },
        self_service: eager_env::SELF_SERVICE.clone(),
        ..EngineConfig::default()
    };

    let engine = Engine::new(config, leadership, sink).expect("invalid engine configuration");
    let engine = Arc::new(engine);
    engine.start().await.expect("failed to start the engine");

    info!("checker node {process_id} running as {} ({kind})", engine.local_id());

    for peer in &fleet {
        match fleet_member(peer, &eager_env::SELF_SERVICE) {
            Some(instance) => engine.apply(RegistryEvent::InstanceUpserted { instance }),
            None => warn!("ignoring malformed fleet entry '{peer}'"),
        }
    }

    let state = Arc::new(AppStateInner {
        engine: engine.clone(),
        internal_password: eager_env::BACKEND_INTERNAL_PASSWORD.clone(),
    });
    let listener =
        TcpListener::bind(format!("0.0.0.0:{}", *eager_env::PORT)).expect("Failed to bind PORT");

    println!(
        "Listening on {}",
        listener.local_addr().expect("Failed to get local address")
    );

    start_server(state, listener)
        .await
        .expect("error while running server");

    engine.close().await;
}
