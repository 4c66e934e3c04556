use crate::utils::guarded;
use anyhow::{Result, bail};
use futures::future::BoxFuture;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub type TimerCallback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct Timer {
    rounds: usize,
    callback: TimerCallback,
}

struct Wheel {
    cursor: usize,
    slots: Vec<Vec<Timer>>,
}

/// Hashed timing wheel.
///
/// A timer due in `ticks` intervals lands in slot `(cursor + ticks) % slots`
/// with the number of full turns it still has to wait. One loop advances the
/// cursor every interval and fires the timers of the slot it reaches, each
/// in its own task.
pub struct TimeWheel {
    interval: Duration,
    wheel: Mutex<Wheel>,
    started: AtomicBool,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl TimeWheel {
    pub fn new(interval: Duration, slot_count: usize) -> Result<Self> {
        if interval.is_zero() {
            bail!("time wheel interval must be positive");
        }
        if slot_count == 0 {
            bail!("time wheel needs at least one slot");
        }

        Ok(Self {
            interval,
            wheel: Mutex::new(Wheel {
                cursor: 0,
                slots: (0..slot_count).map(|_| Vec::new()).collect(),
            }),
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let wheel = self.clone();
        self.tracker.spawn(async move { wheel.run().await });

        info!("TimeWheel started");
    }

    async fn run(&self) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => self.advance(),
            }
        }
    }

    fn advance(&self) {
        let due: Vec<Timer> = {
            let mut wheel = self.wheel.lock();
            let slot_count = wheel.slots.len();
            wheel.cursor = (wheel.cursor + 1) % slot_count;
            let cursor = wheel.cursor;

            let (due, waiting): (Vec<Timer>, Vec<Timer>) = wheel.slots[cursor]
                .drain(..)
                .partition(|timer| timer.rounds == 0);

            wheel.slots[cursor] = waiting
                .into_iter()
                .map(|timer| Timer {
                    rounds: timer.rounds - 1,
                    ..timer
                })
                .collect();

            due
        };

        for timer in due {
            self.tracker
                .spawn(guarded("timer callback", (timer.callback)()));
        }
    }

    /// Fires `callback` once `delay` has passed, rounded up to whole
    /// intervals. Ignored once the wheel is stopped.
    pub fn schedule(&self, delay: Duration, callback: TimerCallback) {
        if self.stop.is_cancelled() {
            debug!("TimeWheel stopped, dropping timer");
            return;
        }

        let ticks = delay.as_nanos().div_ceil(self.interval.as_nanos()).max(1) as usize;

        let mut wheel = self.wheel.lock();
        let slot_count = wheel.slots.len();
        let slot = (wheel.cursor + ticks) % slot_count;
        let rounds = (ticks - 1) / slot_count;

        wheel.slots[slot].push(Timer { rounds, callback });
    }

    pub fn pending(&self) -> usize {
        self.wheel.lock().slots.iter().map(Vec::len).sum()
    }

    /// Stops ticking, drops pending timers and waits for running callbacks.
    pub async fn stop(&self) {
        self.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        for slot in self.wheel.lock().slots.iter_mut() {
            slot.clear();
        }

        info!("TimeWheel stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn wheel(slot_count: usize) -> Result<Arc<TimeWheel>> {
        let wheel = Arc::new(TimeWheel::new(Duration::from_millis(10), slot_count)?);
        wheel.start();

        Ok(wheel)
    }

    fn send_on_fire(sender: &mpsc::UnboundedSender<u32>, value: u32) -> TimerCallback {
        let sender = sender.clone();
        Box::new(move || {
            async move {
                let _ = sender.send(value);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_timers_fire_in_delay_order() -> Result<()> {
        let wheel = wheel(64)?;
        let (sender, mut receiver) = mpsc::unbounded_channel();

        wheel.schedule(Duration::from_millis(120), send_on_fire(&sender, 3));
        wheel.schedule(Duration::from_millis(20), send_on_fire(&sender, 1));
        wheel.schedule(Duration::from_millis(60), send_on_fire(&sender, 2));

        let mut fired = Vec::new();
        for _ in 0..3 {
            fired.push(time::timeout(Duration::from_secs(1), receiver.recv()).await?);
        }
        assert_eq!(fired, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(wheel.pending(), 0);

        wheel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_delay_longer_than_a_turn_waits_for_rounds() -> Result<()> {
        // 8 slots of 10ms: a 200ms timer needs two extra turns
        let wheel = wheel(8)?;
        let (sender, mut receiver) = mpsc::unbounded_channel();

        let scheduled_at = Instant::now();
        wheel.schedule(Duration::from_millis(200), send_on_fire(&sender, 7));

        let fired = time::timeout(Duration::from_secs(2), receiver.recv()).await?;
        assert_eq!(fired, Some(7));
        assert!(scheduled_at.elapsed() >= Duration::from_millis(180));

        wheel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_panicking_callback_does_not_stop_the_wheel() -> Result<()> {
        crate::utils::init_logging(log::LevelFilter::Off);
        let wheel = wheel(16)?;
        let (sender, mut receiver) = mpsc::unbounded_channel();

        wheel.schedule(
            Duration::from_millis(10),
            Box::new(|| async { panic!("timer failure") }.boxed()),
        );
        wheel.schedule(Duration::from_millis(30), send_on_fire(&sender, 1));

        let fired = time::timeout(Duration::from_secs(1), receiver.recv()).await?;
        assert_eq!(fired, Some(1));

        wheel.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_discards_pending_timers() -> Result<()> {
        let wheel = wheel(16)?;
        let (sender, mut receiver) = mpsc::unbounded_channel();

        wheel.schedule(Duration::from_secs(10), send_on_fire(&sender, 1));
        assert_eq!(wheel.pending(), 1);

        wheel.stop().await;
        assert_eq!(wheel.pending(), 0);

        wheel.schedule(Duration::from_millis(10), send_on_fire(&sender, 2));
        assert_eq!(wheel.pending(), 0);

        drop(sender);
        assert_eq!(receiver.recv().await, None);
        Ok(())
    }

    #[test]
    fn test_invalid_wheel_is_rejected() {
        assert!(TimeWheel::new(Duration::ZERO, 8).is_err());
        assert!(TimeWheel::new(Duration::from_millis(10), 0).is_err());
    }
}
