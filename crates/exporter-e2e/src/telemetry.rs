//! Tracing initialisation for harness runs.

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

static TELEMETRY_GUARD: OnceCell<()> = OnceCell::new();

/// Installs the global tracing subscriber when invoked for the first time.
///
/// Repeated calls are idempotent, so every test can call this without
/// worrying about ordering. The filter honours `RUST_LOG` and defaults to
/// `info`; output goes through the test writer so logs stay attached to the
/// owning test.
pub fn init() {
    TELEMETRY_GUARD.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        drop(
            fmt()
                .with_env_filter(filter)
                .with_test_writer()
                .try_init(),
        );
    });
}
