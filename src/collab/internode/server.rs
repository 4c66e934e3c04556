use crate::collab::internode::messages::{
    FetchedRecord, PeerRequest, PeerResponse, RecordEntry, decode, encode,
};
use crate::store::{HeartbeatRecord, RecordStore};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Serves the local record store to other checker nodes.
pub struct PeerServer {
    local_addr: SocketAddr,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl PeerServer {
    pub async fn bind(addr: SocketAddr, store: Arc<RecordStore>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind peer listener on {addr}"))?;
        let local_addr = listener.local_addr()?;

        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();

        tracker.spawn(accept_loop(
            listener,
            store,
            stop.clone(),
            tracker.clone(),
        ));

        info!("PeerServer listening on {local_addr}");

        Ok(Self {
            local_addr,
            stop,
            tracker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes every open stream and waits for the
    /// connection tasks to end.
    pub async fn close(&self) {
        self.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        info!("PeerServer on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    store: Arc<RecordStore>,
    stop: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                debug!("accepted peer connection from {remote}");
                tracker.spawn(serve_connection(stream, store.clone(), stop.clone()));
            }
            Err(e) => error!("failed to accept peer connection: {e}"),
        }
    }
}

async fn serve_connection(stream: TcpStream, store: Arc<RecordStore>, stop: CancellationToken) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = framed.next() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("peer stream failed: {e}");
                break;
            }
            None => break,
        };

        let request: PeerRequest = match decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("dropping undecodable peer frame: {e:#}");
                continue;
            }
        };

        let response = handle_request(&store, request);

        let sent = match encode(&response) {
            Ok(frame) => framed.send(frame).await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("failed to answer peer: {e:#}");
            break;
        }
    }

    let _ = SinkExt::<Bytes>::close(&mut framed).await;
}

pub(crate) fn handle_request(store: &RecordStore, request: PeerRequest) -> PeerResponse {
    match request {
        PeerRequest::Put {
            request_id,
            records,
        } => {
            let parsed = records
                .into_iter()
                .filter_map(|RecordEntry { key, value }| match value.parse() {
                    Ok(record) => Some((key, record)),
                    Err(e) => {
                        error!("dropping heartbeat for {key}: {e:#}");
                        None
                    }
                });

            PeerResponse::Ack {
                request_id,
                count: store.put(parsed),
            }
        }
        PeerRequest::Del { request_id, keys } => PeerResponse::Ack {
            request_id,
            count: store.del(&keys),
        },
        PeerRequest::Get { request_id, keys } => {
            let found = store.get(&keys);
            let records = keys
                .into_iter()
                .map(|key| {
                    let value = found.get(&key).map(HeartbeatRecord::encode);
                    FetchedRecord { key, value }
                })
                .collect();

            PeerResponse::Records {
                request_id,
                records,
            }
        }
        PeerRequest::Snapshot { request_id } => PeerResponse::Records {
            request_id,
            records: store
                .snapshot()
                .into_iter()
                .map(|(key, record): (String, HeartbeatRecord)| FetchedRecord {
                    key,
                    value: Some(record.encode()),
                })
                .collect(),
        },
        PeerRequest::Ping { request_id } => PeerResponse::Pong { request_id },
    }
}
