//! Groups individually submitted tasks into batches.
//!
//! Producers push into one bounded queue shared by `concurrency` coalescing
//! loops. A loop flushes its buffer to the handler when it holds
//! `max_batch_count` tasks, or on its `wait_time` tick when the buffer is not
//! empty. The handler owns the tasks of a batch and resolves each one through
//! its [`Completer`].

mod future;

pub use future::{BatchError, BatchFuture, BatchResult, Completer};

use crate::utils::guarded;
use anyhow::{Result, bail};
use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, info};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub label: String,
    pub queue_size: usize,
    pub wait_time: Duration,
    pub max_batch_count: usize,
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            label: "batch".to_string(),
            queue_size: 1024,
            wait_time: Duration::from_millis(20),
            max_batch_count: 64,
            concurrency: 1,
        }
    }
}

impl BatchConfig {
    pub fn labelled(&self, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 {
            bail!("{}: queue size must be positive", self.label);
        }
        if self.max_batch_count == 0 {
            bail!("{}: max batch count must be positive", self.label);
        }
        if self.concurrency == 0 {
            bail!("{}: concurrency must be positive", self.label);
        }
        if self.wait_time.is_zero() {
            bail!("{}: wait time must be positive", self.label);
        }

        Ok(())
    }
}

/// A submitted input together with the completer of its future.
pub struct Task<T, R> {
    pub input: T,
    pub completer: Completer<R>,
}

impl<T, R> Task<T, R> {
    pub fn complete(self, result: BatchResult<R>) {
        self.completer.complete(result);
    }
}

pub type BatchHandler<T, R> =
    Arc<dyn Fn(Vec<Task<T, R>>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Boxes an async closure into a [`BatchHandler`].
pub fn handler<T, R, F, Fut>(f: F) -> BatchHandler<T, R>
where
    F: Fn(Vec<Task<T, R>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |tasks| f(tasks).boxed())
}

type SharedReceiver<T, R> = Arc<tokio::sync::Mutex<mpsc::Receiver<Task<T, R>>>>;

pub struct BatchController<T, R> {
    label: String,
    sender: Mutex<Option<mpsc::Sender<Task<T, R>>>>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl<T, R> BatchController<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Validates `config` and spawns the coalescing loops.
    pub fn start(config: BatchConfig, handler: BatchHandler<T, R>) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel(config.queue_size);
        let receiver: SharedReceiver<T, R> = Arc::new(tokio::sync::Mutex::new(receiver));
        let stop = CancellationToken::new();
        let tracker = TaskTracker::new();

        for worker in 0..config.concurrency {
            tracker.spawn(coalesce(
                worker,
                config.clone(),
                receiver.clone(),
                handler.clone(),
                stop.clone(),
            ));
        }
        tracker.close();

        info!(
            "{}: batch controller started with {} loops",
            config.label, config.concurrency
        );

        Ok(Self {
            label: config.label,
            sender: Mutex::new(Some(sender)),
            stop,
            tracker,
        })
    }

    fn closed(&self) -> BatchError {
        BatchError::Closed(self.label.clone())
    }

    /// Queues `input`, waiting for room in the queue.
    pub async fn submit(&self, input: T) -> BatchFuture<R> {
        let (completer, future) = BatchFuture::pair(None);

        let Some(sender) = self.sender.lock().clone() else {
            return BatchFuture::failed(self.closed());
        };

        if let Err(rejected) = sender.send(Task { input, completer }).await {
            rejected.0.complete(Err(self.closed()));
        }

        future
    }

    /// Like [`submit`](Self::submit) but `timeout` bounds both the wait for
    /// queue room and the wait for the result.
    pub async fn submit_with_timeout(&self, input: T, timeout: Duration) -> BatchFuture<R> {
        let (completer, future) = BatchFuture::pair(Some(timeout));
        let deadline = Instant::now() + timeout;

        let Some(sender) = self.sender.lock().clone() else {
            return BatchFuture::failed(self.closed());
        };

        match timeout_at(deadline, sender.send(Task { input, completer })).await {
            Ok(Ok(())) => future,
            Ok(Err(rejected)) => {
                rejected.0.complete(Err(self.closed()));
                future
            }
            Err(_) => BatchFuture::failed(BatchError::DeadlineExceeded(timeout)),
        }
    }

    /// Stops intake, flushes what is queued and waits for the loops to end.
    pub async fn stop(&self) {
        let sender = self.sender.lock().take();

        if sender.is_some() {
            drop(sender);
            self.stop.cancel();
            info!("{}: batch controller stopping", self.label);
        }

        self.tracker.wait().await;
    }
}

async fn coalesce<T, R>(
    worker: usize,
    config: BatchConfig,
    receiver: SharedReceiver<T, R>,
    handler: BatchHandler<T, R>,
    stop: CancellationToken,
) where
    T: Send + 'static,
    R: Send + 'static,
{
    let label = format!("{}#{worker}", config.label);
    let mut buffer: Vec<Task<T, R>> = Vec::with_capacity(config.max_batch_count);

    let mut ticker = time::interval(config.wait_time);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            task = async { receiver.lock().await.recv().await } => match task {
                Some(task) => {
                    buffer.push(task);
                    if buffer.len() >= config.max_batch_count {
                        flush(&label, &handler, &mut buffer).await;
                        ticker.reset();
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&label, &handler, &mut buffer).await;
                }
            }
        }
    }

    // Drain what was queued before intake stopped
    loop {
        let task = receiver.lock().await.try_recv();
        let Ok(task) = task else {
            break;
        };

        buffer.push(task);
        if buffer.len() >= config.max_batch_count {
            flush(&label, &handler, &mut buffer).await;
        }
    }

    if !buffer.is_empty() {
        flush(&label, &handler, &mut buffer).await;
    }

    debug!("{label}: coalescing loop finished");
}

async fn flush<T, R>(label: &str, handler: &BatchHandler<T, R>, buffer: &mut Vec<Task<T, R>>) {
    let tasks = std::mem::take(buffer);
    debug!("{label}: flushing {} tasks", tasks.len());

    // Tasks dropped by a panicking handler resolve as abandoned
    guarded(label, handler(tasks)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::init_logging;
    use futures::future::join_all;
    use log::LevelFilter;
    use std::collections::HashMap;

    fn config(max_batch_count: usize, wait_time: Duration) -> BatchConfig {
        BatchConfig {
            label: "test".to_string(),
            queue_size: 128,
            wait_time,
            max_batch_count,
            concurrency: 1,
        }
    }

    /// Doubles every input and records the size of each batch.
    fn doubling(sizes: Arc<Mutex<Vec<usize>>>) -> BatchHandler<u32, u32> {
        handler(move |tasks: Vec<Task<u32, u32>>| {
            let sizes = sizes.clone();
            async move {
                sizes.lock().push(tasks.len());
                for task in tasks {
                    let doubled = task.input * 2;
                    task.complete(Ok(doubled));
                }
            }
        })
    }

    #[tokio::test]
    async fn test_every_task_resolves_with_partial_last_batch() -> Result<()> {
        init_logging(LevelFilter::Off);
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let controller = Arc::new(BatchController::start(
            config(10, Duration::from_millis(50)),
            doubling(sizes.clone()),
        )?);

        let mut futures = Vec::new();
        for i in 0..25 {
            futures.push(controller.submit(i).await);
        }

        let results = join_all(futures.into_iter().map(|f| f.wait())).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result, Ok(i as u32 * 2));
        }

        let sizes = sizes.lock().clone();
        assert_eq!(sizes.iter().sum::<usize>(), 25);
        assert!(sizes.iter().all(|size| *size <= 10));

        controller.stop().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_loops_handle_each_task_once() -> Result<()> {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(HashMap::<u32, usize>::new()));
        let recorder = seen.clone();
        let inner = doubling(sizes.clone());
        let controller = Arc::new(BatchController::start(
            BatchConfig {
                concurrency: 4,
                ..config(7, Duration::from_millis(10))
            },
            handler(move |tasks: Vec<Task<u32, u32>>| {
                {
                    let mut seen = recorder.lock();
                    for task in &tasks {
                        *seen.entry(task.input).or_default() += 1;
                    }
                }
                inner(tasks)
            }),
        )?);

        // Four producers racing on the shared queue
        let producers = (0..4u32).map(|producer| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let mut futures = Vec::new();
                for i in (0..101).filter(|i| i % 4 == producer) {
                    futures.push((i, controller.submit(i).await));
                }
                futures
            })
        });
        let mut pending = Vec::new();
        for producer in join_all(producers).await {
            pending.extend(producer?);
        }
        assert_eq!(pending.len(), 101);

        for (i, future) in pending {
            assert_eq!(future.wait().await, Ok(i * 2));
        }

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 101);
        assert!(seen.values().all(|count| *count == 1));

        let sizes = sizes.lock().clone();
        assert_eq!(sizes.iter().sum::<usize>(), 101);
        assert!(sizes.iter().all(|size| *size <= 7));
        // 101 is not a multiple of 7, one batch at least is partial
        assert!(sizes.len() >= 15);

        controller.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_time_flushes_small_batch() -> Result<()> {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let controller =
            BatchController::start(config(100, Duration::from_millis(20)), doubling(sizes))?;

        let result = time::timeout(Duration::from_secs(1), controller.submit(21).await.wait())
            .await?;
        assert_eq!(result, Ok(42));

        controller.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_releases_waiter_of_stuck_batch() -> Result<()> {
        let stuck = handler(|tasks: Vec<Task<u32, u32>>| async move {
            time::sleep(Duration::from_secs(5)).await;
            drop(tasks);
        });
        let controller = BatchController::start(config(1, Duration::from_millis(10)), stuck)?;

        let result = controller
            .submit_with_timeout(1, Duration::from_millis(50))
            .await
            .wait()
            .await;
        assert_eq!(
            result,
            Err(BatchError::DeadlineExceeded(Duration::from_millis(50)))
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_and_panicking_handlers_abandon() -> Result<()> {
        init_logging(LevelFilter::Off);

        let dropping = handler(|tasks: Vec<Task<u32, u32>>| async move { drop(tasks) });
        let controller = BatchController::start(config(1, Duration::from_millis(10)), dropping)?;
        assert_eq!(
            controller.submit(1).await.wait().await,
            Err(BatchError::Abandoned)
        );
        controller.stop().await;

        let panicking = handler(|tasks: Vec<Task<u32, u32>>| async move {
            if !tasks.is_empty() {
                panic!("handler failure");
            }
        });
        let controller = BatchController::start(config(1, Duration::from_millis(10)), panicking)?;
        assert_eq!(
            controller.submit(1).await.wait().await,
            Err(BatchError::Abandoned)
        );

        // The loop survives the panic
        assert_eq!(
            controller.submit(2).await.wait().await,
            Err(BatchError::Abandoned)
        );
        controller.stop().await;

        Ok(())
    }

    #[tokio::test]
    async fn test_stop_flushes_queue_and_rejects_new_tasks() -> Result<()> {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let controller = BatchController::start(
            config(1000, Duration::from_secs(60)),
            doubling(sizes.clone()),
        )?;

        let queued = controller.submit(5).await;
        controller.stop().await;
        controller.stop().await;

        assert_eq!(queued.wait().await, Ok(10));
        assert_eq!(
            controller.submit(6).await.wait().await,
            Err(BatchError::Closed("test".to_string()))
        );

        Ok(())
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let valid = config(10, Duration::from_millis(10));
        assert!(valid.validate().is_ok());

        assert!(BatchConfig { queue_size: 0, ..valid.clone() }.validate().is_err());
        assert!(BatchConfig { max_batch_count: 0, ..valid.clone() }.validate().is_err());
        assert!(BatchConfig { concurrency: 0, ..valid.clone() }.validate().is_err());
        assert!(BatchConfig { wait_time: Duration::ZERO, ..valid }.validate().is_err());
    }
}
