/// Process-wide counters for revision runs, logged as one snapshot per run.
pub mod migration_counters {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing::info;

    static ARTIFACTS_GENERATED: AtomicUsize = AtomicUsize::new(0);
    static ARTIFACTS_APPLIED: AtomicUsize = AtomicUsize::new(0);
    static APPLY_FAILED: AtomicUsize = AtomicUsize::new(0);
    static BUSY_EVENTS: AtomicUsize = AtomicUsize::new(0);
    static LOCK_ACQUIRED: AtomicUsize = AtomicUsize::new(0);
    static LOCK_ACQUIRE_ATTEMPTS: AtomicUsize = AtomicUsize::new(0);
    static LOCK_BACKOFF_EVENTS: AtomicUsize = AtomicUsize::new(0);
    static LOCK_ACQUIRE_TIMEOUTS: AtomicUsize = AtomicUsize::new(0);
    static POSTCHECK_MISMATCH: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Snapshot {
        pub artifacts_generated: usize,
        pub artifacts_applied: usize,
        pub apply_failed: usize,
        pub busy_events: usize,
        pub lock_acquired: usize,
        pub lock_acquire_attempts: usize,
        pub lock_backoff_events: usize,
        pub lock_acquire_timeouts: usize,
        pub postcheck_mismatch: usize,
    }

    pub fn artifact_generated() {
        ARTIFACTS_GENERATED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_artifacts_applied(n: usize) {
        ARTIFACTS_APPLIED.fetch_add(n, Ordering::Relaxed);
    }

    pub fn apply_failed() {
        APPLY_FAILED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn busy_event() {
        BUSY_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_acquired() {
        LOCK_ACQUIRED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_lock_acquire_attempts(n: usize) {
        LOCK_ACQUIRE_ATTEMPTS.fetch_add(n, Ordering::Relaxed);
    }

    pub fn lock_backoff_event() {
        LOCK_BACKOFF_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_acquire_timeout() {
        LOCK_ACQUIRE_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn postcheck_mismatch() {
        POSTCHECK_MISMATCH.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> Snapshot {
        Snapshot {
            artifacts_generated: ARTIFACTS_GENERATED.load(Ordering::Relaxed),
            artifacts_applied: ARTIFACTS_APPLIED.load(Ordering::Relaxed),
            apply_failed: APPLY_FAILED.load(Ordering::Relaxed),
            busy_events: BUSY_EVENTS.load(Ordering::Relaxed),
            lock_acquired: LOCK_ACQUIRED.load(Ordering::Relaxed),
            lock_acquire_attempts: LOCK_ACQUIRE_ATTEMPTS.load(Ordering::Relaxed),
            lock_backoff_events: LOCK_BACKOFF_EVENTS.load(Ordering::Relaxed),
            lock_acquire_timeouts: LOCK_ACQUIRE_TIMEOUTS.load(Ordering::Relaxed),
            postcheck_mismatch: POSTCHECK_MISMATCH.load(Ordering::Relaxed),
        }
    }

    pub fn log_snapshot(context: &str) {
        let s = snapshot();
        info!(
            context = context,
            artifacts_generated = s.artifacts_generated,
            artifacts_applied = s.artifacts_applied,
            apply_failed = s.apply_failed,
            busy_events = s.busy_events,
            lock_acquired = s.lock_acquired,
            lock_acquire_attempts = s.lock_acquire_attempts,
            lock_backoff_events = s.lock_backoff_events,
            lock_acquire_timeouts = s.lock_acquire_timeouts,
            postcheck_mismatch = s.postcheck_mismatch,
            "migration_counters"
        );
    }
}
