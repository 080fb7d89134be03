pub mod core;
pub mod diagnostics;
pub mod locking;

pub use core::{acquire_with_backoff, build_admin_pool, orchestrate_revision, RevisionOutcome};
pub use diagnostics::migration_counters;
pub use locking::{BootstrapLock, FileLock, Guard, InMemoryLock, PgAdvisoryLock};
