use crate::cache::ItemKind;
use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use futures::future::BoxFuture;
use log::{error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use utoipa::ToSchema;

/// A healthy/unhealthy flip observed by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StatusTransition {
    pub id: String,
    pub kind: ItemKind,
    pub healthy: bool,
    pub last_heartbeat_sec: i64,
    pub checked_at_sec: i64,
}

/// Where verdict changes end up.
pub trait StatusSink: Send + Sync {
    fn record(&self, transition: StatusTransition) -> BoxFuture<'_, Result<()>>;
}

pub struct LogSink;

impl StatusSink for LogSink {
    fn record(&self, transition: StatusTransition) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            info!(
                "{} {} is now {} (last heartbeat {})",
                transition.kind,
                transition.id,
                if transition.healthy { "healthy" } else { "unhealthy" },
                transition.last_heartbeat_sec
            );
            Ok(())
        })
    }
}

/// Logs every transition and POSTs it as JSON to `url`.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl StatusSink for WebhookSink {
    fn record(&self, transition: StatusTransition) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            LogSink.record(transition.clone()).await?;

            self.client
                .post(&self.url)
                .json(&transition)
                .send()
                .await
                .with_context(|| format!("failed to post status of {}", transition.id))?
                .error_for_status()?;

            Ok(())
        })
    }
}

/// Hands transitions to the sink off the check path.
///
/// `save` only enqueues; one worker drains the queue with up to
/// `concurrency` sink calls in flight.
pub struct StatusSaveManager {
    sender: Mutex<Option<mpsc::UnboundedSender<StatusTransition>>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatusSaveManager {
    pub fn new(sink: Arc<dyn StatusSink>, concurrency: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        let worker_handle = tokio::spawn(Self::worker(sink, receiver, concurrency.max(1)));

        Self {
            sender: Mutex::new(Some(sender)),
            worker_handle: Mutex::new(Some(worker_handle)),
        }
    }

    async fn worker(
        sink: Arc<dyn StatusSink>,
        receiver: mpsc::UnboundedReceiver<StatusTransition>,
        concurrency: usize,
    ) {
        UnboundedReceiverStream::new(receiver)
            .for_each_concurrent(concurrency, |transition| {
                let sink = sink.clone();
                async move {
                    let id = transition.id.clone();
                    if let Err(e) = sink.record(transition).await {
                        error!("Failed to save status of {id}: {e:?}");
                    }
                }
            })
            .await
    }

    pub fn save(&self, transition: StatusTransition) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| anyhow!("status save manager is closed"))?;
        sender.send(transition)?;

        Ok(())
    }

    /// Stops intake and waits until every queued transition reached the sink.
    pub async fn close(&self) {
        // Dropping the sender ends the worker's stream
        self.sender.lock().take();

        let handle = self.worker_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Status worker join error: {:?}", e);
            }
        }
    }
}
