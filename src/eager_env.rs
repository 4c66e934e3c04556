use std::env;
use std::sync::LazyLock;

macro_rules! define_env_vars {
    ($(($name:ident, $env_name:expr, $type:ty)),* $(,)?) => {
        $(
            pub static $name: LazyLock<$type> = LazyLock::new(|| {
                let val = env::var($env_name).unwrap_or_else(|_| {
                    panic!("Missing required environment variable: {}", $env_name)
                });
                val.parse::<$type>().unwrap_or_else(|_| {
                    panic!(
                        "Failed to parse environment variable {} with value '{}' as {}",
                        $env_name,
                        val,
                        stringify!($type)
                    )
                })
            });
        )*

        /// Force initialization of all environment variables at startup
        /// Call this early in main() to fail fast if any env vars are missing
        pub fn check_env() {
            $(
                let _ = *$name;
            )*
        }
    };
}

define_env_vars!(
    (PORT, "PORT", u16),
    (PEER_PORT, "PEER_PORT", u16),
    (CHECKER_KIND, "CHECKER_KIND", String),
    // Comma separated `host:port` peer endpoints, this node included
    (CHECKER_FLEET, "CHECKER_FLEET", String),
    (SELF_SERVICE, "SELF_SERVICE", String),
    (
        BACKEND_INTERNAL_PASSWORD,
        "BACKEND_INTERNAL_PASSWORD",
        String
    ),
    (
        MIN_CHECK_INTERVAL_SECONDS,
        "MIN_CHECK_INTERVAL_SECONDS",
        i64
    ),
    (
        MAX_CHECK_INTERVAL_SECONDS,
        "MAX_CHECK_INTERVAL_SECONDS",
        i64
    ),
    (
        DISPATCH_EVENT_INTERVAL_MILLIS,
        "DISPATCH_EVENT_INTERVAL_MILLIS",
        u64
    ),
    (
        DISPATCH_ENSURE_INTERVAL_SECONDS,
        "DISPATCH_ENSURE_INTERVAL_SECONDS",
        u64
    ),
    (BATCH_QUEUE_SIZE, "BATCH_QUEUE_SIZE", usize),
    (BATCH_WAIT_MILLIS, "BATCH_WAIT_MILLIS", u64),
    (BATCH_MAX_COUNT, "BATCH_MAX_COUNT", usize),
    (BATCH_CONCURRENCY, "BATCH_CONCURRENCY", usize),
);
