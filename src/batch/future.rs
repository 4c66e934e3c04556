use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("batch controller '{0}' is closed")]
    Closed(String),
    #[error("no result within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("waiter was cancelled")]
    Cancelled,
    #[error("task was dropped without a result")]
    Abandoned,
    #[error("transport failure: {0}")]
    Transport(String),
}

pub type BatchResult<R> = Result<R, BatchError>;

/// Write half of a [`BatchFuture`].
///
/// Consumed by [`Completer::complete`]. Dropping it unresolved resolves the
/// future with [`BatchError::Abandoned`].
pub struct Completer<R> {
    sender: Option<oneshot::Sender<BatchResult<R>>>,
}

impl<R> Completer<R> {
    pub fn complete(mut self, result: BatchResult<R>) {
        if let Some(sender) = self.sender.take() {
            // The waiter may have given up already
            let _ = sender.send(result);
        }
    }
}

impl<R> Drop for Completer<R> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(BatchError::Abandoned));
        }
    }
}

/// Read half of a submitted task.
pub struct BatchFuture<R> {
    receiver: oneshot::Receiver<BatchResult<R>>,
    deadline: Option<(Instant, Duration)>,
    cancel: Option<CancellationToken>,
}

impl<R> BatchFuture<R> {
    pub(super) fn pair(timeout: Option<Duration>) -> (Completer<R>, Self) {
        let (sender, receiver) = oneshot::channel();
        let completer = Completer {
            sender: Some(sender),
        };
        let future = Self {
            receiver,
            deadline: timeout.map(|timeout| (Instant::now() + timeout, timeout)),
            cancel: None,
        };

        (completer, future)
    }

    /// A future that is already resolved with `error`.
    pub fn failed(error: BatchError) -> Self {
        let (completer, future) = Self::pair(None);
        completer.complete(Err(error));

        future
    }

    /// Resolves with [`BatchError::Cancelled`] once `token` fires.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Waits for the result, the deadline or the cancellation, whichever is
    /// first. Giving up does not withdraw the task from its batch.
    pub async fn wait(self) -> BatchResult<R> {
        let Self {
            receiver,
            deadline,
            cancel,
        } = self;

        let result = async move {
            match deadline {
                Some((deadline, timeout)) => match timeout_at(deadline, receiver).await {
                    Ok(received) => received.unwrap_or(Err(BatchError::Abandoned)),
                    Err(_) => Err(BatchError::DeadlineExceeded(timeout)),
                },
                None => receiver.await.unwrap_or(Err(BatchError::Abandoned)),
            }
        };

        match cancel {
            Some(token) => tokio::select! {
                result = result => result,
                _ = token.cancelled() => Err(BatchError::Cancelled),
            },
            None => result.await,
        }
    }
}
