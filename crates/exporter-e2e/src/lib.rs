//! End-to-end validation harness for the rustic-exporter metrics pipeline.
//!
//! The harness proves that the exporter surfaces backup-repository state as
//! scrapeable metrics all the way through Prometheus. One scenario stands up
//! the full pipeline — a backup tool container populates a repository, the
//! exporter reads it as a host process, a Prometheus container scrapes the
//! exporter — and then polls Prometheus's query API until a fixed metric set
//! is present or a deadline elapses.
//!
//! # Modules
//!
//! - [`launcher`]: scoped containers and host processes with guaranteed
//!   teardown and HTTP readiness probes
//! - [`producer`]: rustic and restic adapters that populate a repository
//! - [`exporter`]: exporter configuration synthesis and process control
//! - [`collector`]: Prometheus scrape configuration and container control
//! - [`poller`]: convergence polling against the query API
//! - [`scenario`]: one isolated produce → export → collect → poll run
//! - [`matrix`]: version-matrix enumeration with collision-free ports
//!
//! # Graceful skipping
//!
//! The end-to-end suite skips when docker or the exporter binary under test
//! is unavailable, keeping unit runs and CI without a container runtime
//! green.

pub mod collector;
pub mod exporter;
pub mod launcher;
pub mod matrix;
pub mod poller;
pub mod producer;
pub mod scenario;
pub mod telemetry;

use camino::Utf8PathBuf;

/// Environment variable overriding the exporter binary under test.
pub const EXPORTER_BIN_VAR: &str = "RUSTIC_EXPORTER_BIN";

/// Checks whether a working docker client and daemon are available.
#[must_use]
pub fn docker_available() -> bool {
    std::process::Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Resolves the exporter binary under test.
///
/// Honours [`EXPORTER_BIN_VAR`] and falls back to the release build in the
/// exporter's own target directory.
#[must_use]
pub fn exporter_binary() -> Utf8PathBuf {
    std::env::var(EXPORTER_BIN_VAR).map_or_else(
        |_| Utf8PathBuf::from("./target/release/rustic-exporter"),
        Utf8PathBuf::from,
    )
}

/// Checks whether the exporter binary under test exists.
#[must_use]
pub fn exporter_available() -> bool {
    exporter_binary().is_file()
}
