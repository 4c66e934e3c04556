use chrono::Utc;
use futures::FutureExt;
use log::error;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Wall-clock time in whole seconds since the Unix epoch.
pub fn current_time_sec() -> i64 {
    Utc::now().timestamp()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

/// Runs `future`, logging instead of propagating a panic.
///
/// Background loops wrap each unit of work with this so one bad iteration
/// does not take the whole loop down.
pub async fn guarded<F: Future>(label: &str, future: F) -> Option<F::Output> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(output) => Some(output),
        Err(payload) => {
            error!("{label} panicked: {}", panic_message(payload.as_ref()));
            None
        }
    }
}

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
pub fn init_logging(level: LevelFilter) {
    let _ = env_logger::builder()
        .filter_level(level)
        .is_test(true)
        .try_init();
}
