use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "DEPLOY_HARNESS_LOG";

/// Installs a fmt subscriber that writes through the test harness capture.
/// Returns false when a global subscriber was already set.
pub fn init_tracing(default_level: &str) -> bool {
    let env_filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_test_writer()
        .try_init()
        .is_ok()
}
