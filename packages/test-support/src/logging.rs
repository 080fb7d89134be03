//! Tracing output for test runs.
//!
//! Each test binary gets one subscriber writing through libtest's output
//! capture, so log lines only show up for failing tests or under `--nocapture`.

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

/// Used when neither `TEST_LOG` nor `RUST_LOG` is set.
const QUIET_DIRECTIVES: &str = "warn,sqlx=error";

static INSTALLED: Lazy<bool> = Lazy::new(|| {
    tracing_subscriber::fmt()
        .with_env_filter(filter_from_env())
        .with_test_writer()
        .without_time()
        .compact()
        .try_init()
        .is_ok()
});

fn filter_from_env() -> EnvFilter {
    ["TEST_LOG", "RUST_LOG"]
        .into_iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(QUIET_DIRECTIVES))
}

/// Install the test subscriber; later calls are no-ops.
///
/// Returns `false` when some other global subscriber was already in place.
pub fn init() -> bool {
    *INSTALLED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_stable_across_calls() {
        let first = init();
        assert_eq!(init(), first);
    }
}
