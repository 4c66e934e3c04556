//! Heartbeat records travelling between checker nodes.
//!
//! Every node serves its local [`RecordStore`] with a [`PeerServer`]. Other
//! nodes keep one persistent length-delimited stream to it, and batch their
//! puts, deletes and gets on the client side so a burst of heartbeats costs
//! a handful of frames.

pub mod messages;
pub mod server;

use crate::batch::{BatchConfig, BatchController, BatchError, BatchResult, Task, handler};
use crate::store::{HeartbeatRecord, RecordStore};
use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use messages::{FetchedRecord, PeerRequest, PeerResponse, RecordEntry, decode, encode};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use server::PeerServer;

const MIN_RECONNECT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

type FrameSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type FrameStream = SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;

/// Persistent stream to one peer, reconnecting with backoff until closed.
///
/// Requests that expect an answer register a oneshot under their request id
/// and the reader routes the matching response to it. Acks of puts and
/// deletes have no waiter and are drained by the reader.
pub struct Connection {
    peer: String,
    sink: tokio::sync::Mutex<Option<FrameSink>>,
    pending: DashMap<u64, oneshot::Sender<PeerResponse>>,
    next_request_id: AtomicU64,
    connected: watch::Sender<bool>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl Connection {
    pub fn open(peer: impl Into<String>) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        let connection = Arc::new(Self {
            peer: peer.into(),
            sink: tokio::sync::Mutex::new(None),
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            connected,
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        connection.tracker.spawn(connection.clone().supervise());
        connection.tracker.close();

        connection
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Waits until the stream is up. Returns false on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut connected = self.connected.subscribe();

        matches!(
            time::timeout(timeout, connected.wait_for(|up| *up)).await,
            Ok(Ok(_))
        )
    }

    async fn supervise(self: Arc<Self>) {
        let mut backoff = MIN_RECONNECT_BACKOFF;

        loop {
            let connected = tokio::select! {
                _ = self.stop.cancelled() => break,
                connected = TcpStream::connect(self.peer.as_str()) => connected,
            };

            match connected {
                Ok(stream) => {
                    backoff = MIN_RECONNECT_BACKOFF;
                    let _ = stream.set_nodelay(true);
                    let (sink, stream) = Framed::new(stream, LengthDelimitedCodec::new()).split();

                    *self.sink.lock().await = Some(sink);
                    self.connected.send_replace(true);
                    info!("connected to peer {}", self.peer);

                    self.read_responses(stream).await;

                    self.connected.send_replace(false);
                    self.sink.lock().await.take();
                    // Waiters see their sender dropped and fail as transport errors
                    self.pending.clear();

                    if self.stop.is_cancelled() {
                        break;
                    }
                    warn!("lost connection to peer {}", self.peer);
                }
                Err(e) => debug!("failed to connect to peer {}: {e}", self.peer),
            }

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);
        }

        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        self.connected.send_replace(false);

        debug!("connection to peer {} closed", self.peer);
    }

    async fn read_responses(&self, mut stream: FrameStream) {
        loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => return,
                frame = stream.next() => frame,
            };

            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!("stream from peer {} failed: {e}", self.peer);
                    return;
                }
                None => return,
            };

            let response: PeerResponse = match decode(&frame) {
                Ok(response) => response,
                Err(e) => {
                    warn!("dropping frame from peer {}: {e:#}", self.peer);
                    continue;
                }
            };

            match self.pending.remove(&response.request_id()) {
                Some((_, waiter)) => {
                    let _ = waiter.send(response);
                }
                None => trace!("drained {response:?} from peer {}", self.peer),
            }
        }
    }

    /// Writes a frame without waiting for its answer.
    pub async fn send(&self, request: &PeerRequest) -> BatchResult<()> {
        let frame = encode(request).map_err(|e| BatchError::Transport(format!("{e:#}")))?;

        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(BatchError::Transport(format!(
                "not connected to peer {}",
                self.peer
            )));
        };

        sink.send(frame)
            .await
            .map_err(|e| BatchError::Transport(format!("failed to write to {}: {e}", self.peer)))
    }

    /// Writes a frame and waits for the response carrying its request id.
    pub async fn call(&self, request: PeerRequest, timeout: Duration) -> BatchResult<PeerResponse> {
        let request_id = request.request_id();
        let (waiter, response) = oneshot::channel();
        self.pending.insert(request_id, waiter);

        if let Err(e) = self.send(&request).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match time::timeout(timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BatchError::Transport(format!(
                "connection to {} closed before answering",
                self.peer
            ))),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(BatchError::DeadlineExceeded(timeout))
            }
        }
    }

    pub async fn close(&self) {
        self.stop.cancel();
        self.tracker.wait().await;
    }
}

/// The local node as a member of the peer set.
pub struct LocalPeer {
    pub id: String,
    pub store: Arc<RecordStore>,
}

/// Another checker node, reached through a [`Connection`] with one batch
/// controller per operation.
pub struct RemotePeer {
    id: String,
    connection: Arc<Connection>,
    request_timeout: Duration,
    puts: BatchController<(String, HeartbeatRecord), ()>,
    dels: BatchController<String, ()>,
    gets: BatchController<String, Option<HeartbeatRecord>>,
}

impl RemotePeer {
    /// Opens the stream to `id` (a `host:port` endpoint) and starts the
    /// batch controllers. Connecting happens in the background.
    pub fn connect(id: &str, batch: &BatchConfig, request_timeout: Duration) -> Result<Self> {
        batch
            .validate()
            .with_context(|| format!("invalid batch settings for peer {id}"))?;

        let connection = Connection::open(id);

        let puts = BatchController::start(batch.labelled(format!("put->{id}")), {
            let connection = connection.clone();
            handler(move |tasks| send_puts(connection.clone(), tasks))
        })?;
        let dels = BatchController::start(batch.labelled(format!("del->{id}")), {
            let connection = connection.clone();
            handler(move |tasks| send_dels(connection.clone(), tasks))
        })?;
        let gets = BatchController::start(batch.labelled(format!("get->{id}")), {
            let connection = connection.clone();
            handler(move |tasks| send_gets(connection.clone(), tasks, request_timeout))
        })?;

        Ok(Self {
            id: id.to_string(),
            connection,
            request_timeout,
            puts,
            dels,
            gets,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub async fn put(&self, key: String, record: HeartbeatRecord) -> Result<()> {
        self.puts
            .submit_with_timeout((key, record), self.request_timeout)
            .await
            .cancel_on(self.connection.stop.clone())
            .wait()
            .await?;

        Ok(())
    }

    pub async fn del(&self, key: String) -> Result<()> {
        self.dels
            .submit_with_timeout(key, self.request_timeout)
            .await
            .cancel_on(self.connection.stop.clone())
            .wait()
            .await?;

        Ok(())
    }

    pub async fn get(&self, key: String) -> Result<Option<HeartbeatRecord>> {
        let record = self
            .gets
            .submit_with_timeout(key, self.request_timeout)
            .await
            .cancel_on(self.connection.stop.clone())
            .wait()
            .await?;

        Ok(record)
    }

    pub async fn snapshot(&self) -> Result<Vec<(String, HeartbeatRecord)>> {
        let request = PeerRequest::Snapshot {
            request_id: self.connection.next_request_id(),
        };

        match self.connection.call(request, self.request_timeout).await? {
            PeerResponse::Records { records, .. } => Ok(parse_records(&self.id, records)
                .into_iter()
                .filter_map(|(key, record)| record.map(|record| (key, record)))
                .collect()),
            other => anyhow::bail!("unexpected answer to snapshot from {}: {other:?}", self.id),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        if !self.connection.is_connected() {
            anyhow::bail!("not connected to peer {}", self.id);
        }

        let request = PeerRequest::Ping {
            request_id: self.connection.next_request_id(),
        };

        match self.connection.call(request, self.request_timeout).await? {
            PeerResponse::Pong { .. } => Ok(()),
            other => anyhow::bail!("unexpected answer to ping from {}: {other:?}", self.id),
        }
    }

    /// Flushes queued operations, then closes the stream.
    pub async fn close(&self) {
        self.puts.stop().await;
        self.dels.stop().await;
        self.gets.stop().await;
        self.connection.close().await;

        info!("closed peer {}", self.id);
    }
}

impl Drop for RemotePeer {
    fn drop(&mut self) {
        self.connection.stop.cancel();
    }
}

async fn send_puts(connection: Arc<Connection>, tasks: Vec<Task<(String, HeartbeatRecord), ()>>) {
    let request = PeerRequest::Put {
        request_id: connection.next_request_id(),
        records: tasks
            .iter()
            .map(|task| RecordEntry {
                key: task.input.0.clone(),
                value: task.input.1.encode(),
            })
            .collect(),
    };

    complete_all(tasks, connection.send(&request).await);
}

async fn send_dels(connection: Arc<Connection>, tasks: Vec<Task<String, ()>>) {
    let request = PeerRequest::Del {
        request_id: connection.next_request_id(),
        keys: tasks.iter().map(|task| task.input.clone()).collect(),
    };

    complete_all(tasks, connection.send(&request).await);
}

fn complete_all<T>(tasks: Vec<Task<T, ()>>, result: BatchResult<()>) {
    if let Err(e) = &result {
        error!("peer batch of {} failed: {e}", tasks.len());
    }

    for task in tasks {
        task.complete(result.clone());
    }
}

async fn send_gets(
    connection: Arc<Connection>,
    tasks: Vec<Task<String, Option<HeartbeatRecord>>>,
    timeout: Duration,
) {
    let mut keys: Vec<String> = tasks.iter().map(|task| task.input.clone()).collect();
    keys.sort_unstable();
    keys.dedup();

    let request = PeerRequest::Get {
        request_id: connection.next_request_id(),
        keys,
    };

    let found = match connection.call(request, timeout).await {
        Ok(PeerResponse::Records { records, .. }) => parse_records(connection.peer(), records),
        Ok(other) => {
            let error = BatchError::Transport(format!("unexpected answer to get: {other:?}"));
            for task in tasks {
                task.complete(Err(error.clone()));
            }
            return;
        }
        Err(e) => {
            error!("get batch to {} failed: {e}", connection.peer());
            for task in tasks {
                task.complete(Err(e.clone()));
            }
            return;
        }
    };

    for task in tasks {
        let record = found.get(&task.input).cloned().flatten();
        task.complete(Ok(record));
    }
}

/// Decodes fetched values, keeping keys whose value does not parse as absent.
fn parse_records(
    peer: &str,
    records: Vec<FetchedRecord>,
) -> HashMap<String, Option<HeartbeatRecord>> {
    records
        .into_iter()
        .map(|FetchedRecord { key, value }| {
            let record = value.and_then(|value| match value.parse() {
                Ok(record) => Some(record),
                Err(e) => {
                    error!("dropping record {key} from {peer}: {e:#}");
                    None
                }
            });
            (key, record)
        })
        .collect()
}

/// A member of the checker peer set.
pub enum Peer {
    Local(LocalPeer),
    Remote(RemotePeer),
}

impl Peer {
    pub fn id(&self) -> &str {
        match self {
            Peer::Local(local) => &local.id,
            Peer::Remote(remote) => remote.id(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Peer::Local(_))
    }

    pub async fn put(&self, key: String, record: HeartbeatRecord) -> Result<()> {
        match self {
            Peer::Local(local) => {
                local.store.put([(key, record)]);
                Ok(())
            }
            Peer::Remote(remote) => remote.put(key, record).await,
        }
    }

    pub async fn get(&self, key: String) -> Result<Option<HeartbeatRecord>> {
        match self {
            Peer::Local(local) => Ok(local.store.get_one(&key)),
            Peer::Remote(remote) => remote.get(key).await,
        }
    }

    pub async fn del(&self, key: String) -> Result<()> {
        match self {
            Peer::Local(local) => {
                local.store.del(&[key]);
                Ok(())
            }
            Peer::Remote(remote) => remote.del(key).await,
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self {
            Peer::Local(_) => Ok(()),
            Peer::Remote(remote) => remote.ping().await,
        }
    }

    pub async fn close(&self) {
        if let Peer::Remote(remote) = self {
            remote.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::init_logging;
    use log::LevelFilter;

    fn batch() -> BatchConfig {
        BatchConfig {
            label: "peer-test".to_string(),
            queue_size: 64,
            wait_time: Duration::from_millis(5),
            max_batch_count: 16,
            concurrency: 1,
        }
    }

    async fn serve() -> Result<(PeerServer, Arc<RecordStore>)> {
        let store = Arc::new(RecordStore::with_shards(4));
        let server = PeerServer::bind("127.0.0.1:0".parse()?, store.clone()).await?;

        Ok((server, store))
    }

    #[tokio::test]
    async fn test_remote_round_trip() -> Result<()> {
        init_logging(LevelFilter::Warn);
        let (server, store) = serve().await?;

        let remote = RemotePeer::connect(
            &server.local_addr().to_string(),
            &batch(),
            Duration::from_secs(2),
        )?;
        assert!(remote.connection().wait_connected(Duration::from_secs(2)).await);
        remote.ping().await?;

        let peer = Peer::Remote(remote);
        peer.put("svc-1".to_string(), HeartbeatRecord::new("10.0.0.9", 1_000))
            .await?;

        // The put resolves once written, the get on the same stream follows it
        let record = peer.get("svc-1".to_string()).await?;
        assert_eq!(record.map(|r| r.last_time_sec), Some(1_000));
        assert_eq!(store.len(), 1);
        if let Peer::Remote(remote) = &peer {
            assert_eq!(remote.snapshot().await?.len(), 1);
        }

        peer.del("svc-1".to_string()).await?;
        assert_eq!(peer.get("svc-1".to_string()).await?, None);
        assert!(peer.get("never-seen".to_string()).await?.is_none());

        peer.close().await;
        server.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_batches() -> Result<()> {
        let (server, store) = serve().await?;
        for i in 0..50 {
            store.put([(format!("svc-{i}"), HeartbeatRecord::new("h", i))]);
        }

        let remote = Arc::new(RemotePeer::connect(
            &server.local_addr().to_string(),
            &batch(),
            Duration::from_secs(2),
        )?);
        assert!(remote.connection().wait_connected(Duration::from_secs(2)).await);

        let lookups = (0..50).map(|i| {
            let remote = remote.clone();
            async move { remote.get(format!("svc-{i}")).await }
        });
        let results = futures::future::join_all(lookups).await;

        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result?.map(|r| r.last_time_sec), Some(i as i64));
        }

        remote.close().await;
        server.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_fast() -> Result<()> {
        init_logging(LevelFilter::Off);

        // Bind and drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
        let remote = RemotePeer::connect(
            &format!("127.0.0.1:{port}"),
            &batch(),
            Duration::from_millis(500),
        )?;

        let result = remote.get("svc-1".to_string()).await;
        assert!(result.is_err());
        assert!(!remote.connection().is_connected());

        remote.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_local_peer_uses_store() -> Result<()> {
        let store = Arc::new(RecordStore::with_shards(4));
        let peer = Peer::Local(LocalPeer {
            id: "127.0.0.1:1".to_string(),
            store: store.clone(),
        });

        peer.put("a".to_string(), HeartbeatRecord::new("h", 5)).await?;
        assert_eq!(peer.get("a".to_string()).await?.map(|r| r.count), Some(1));
        peer.ping().await?;
        assert!(peer.is_local());

        peer.del("a".to_string()).await?;
        assert!(store.is_empty());

        Ok(())
    }
}
