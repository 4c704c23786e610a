//! End-to-end tests for the produce → export → scrape → query pipeline.
//!
//! These tests exercise real backup tool containers, the real exporter
//! binary, and real Prometheus releases. They skip gracefully when docker or
//! the exporter binary is unavailable, so unit-only environments stay green.
//!
//! The exporter binary is resolved from `RUSTIC_EXPORTER_BIN`, defaulting to
//! `./target/release/rustic-exporter`.

#![expect(
    clippy::expect_used,
    reason = "test code uses expect for clarity and assertions"
)]

use std::time::Duration;

use rstest::rstest;

use exporter_e2e::collector::{CollectorError, Prometheus, ScrapeConfig};
use exporter_e2e::launcher::LaunchError;
use exporter_e2e::matrix::{self, cell_for};
use exporter_e2e::producer::BackupTool;
use exporter_e2e::{docker_available, exporter_available, exporter_binary, telemetry};

/// Skips the test when the container runtime is missing.
macro_rules! require_docker {
    () => {
        if !docker_available() {
            eprintln!("Skipping test: docker is not available");
            return;
        }
    };
}

/// Skips the test when the full stack (docker plus the exporter binary
/// under test) is missing.
macro_rules! require_stack {
    () => {
        require_docker!();
        if !exporter_available() {
            eprintln!(
                "Skipping test: exporter binary not found (set RUSTIC_EXPORTER_BIN or \
                 build the exporter in release mode)"
            );
            return;
        }
    };
}

/// One populated rustic repository must converge through Prometheus well
/// inside the deadline.
#[rstest]
fn rustic_snapshot_metrics_converge_within_the_deadline() {
    telemetry::init();
    require_stack!();

    let cell = cell_for(BackupTool::Rustic, "v0.10.0", "v3.4.0")
        .expect("combination is in the matrix");
    cell.scenario()
        .run(&exporter_binary())
        .expect("scenario converges");
}

/// Full version matrix for one variant. Failures are collected per cell so a
/// broken combination never hides its siblings' verdicts.
#[rstest]
#[case::restic(BackupTool::Restic)]
#[case::rustic(BackupTool::Rustic)]
#[ignore = "runs the full 21-cell version matrix for the variant"]
fn version_matrix_converges(#[case] tool: BackupTool) {
    telemetry::init();
    require_stack!();

    let binary = exporter_binary();
    let mut failures = Vec::new();
    for cell in matrix::cells(tool) {
        if let Err(error) = cell.scenario().run(&binary) {
            failures.push(format!(
                "{} {} / prometheus {}: {error}",
                cell.tool().label(),
                cell.tool_tag(),
                cell.prometheus_tag()
            ));
        }
    }
    assert!(
        failures.is_empty(),
        "matrix cells failed:\n{}",
        failures.join("\n")
    );
}

/// A collector that cannot become healthy is a readiness failure, not a
/// convergence failure: the poller never gets a chance to run.
#[rstest]
fn collector_that_never_turns_healthy_reports_a_readiness_timeout() {
    telemetry::init();
    require_docker!();

    let config = ScrapeConfig::for_exporter(1500, Duration::from_secs(1));
    // A zero startup window cannot be met even by a healthy container.
    let error = Prometheus::start("v3.4.0", &config, 1501, Duration::ZERO)
        .expect_err("startup window cannot be met");
    assert!(
        matches!(
            error,
            CollectorError::Launch(LaunchError::NotReady { .. })
        ),
        "expected a readiness timeout, got: {error}"
    );
}
