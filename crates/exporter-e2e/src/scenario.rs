//! One isolated end-to-end run: produce, export, collect, poll.
//!
//! A scenario owns every resource it touches. Repository and data
//! directories are scoped temp dirs; the exporter process and the
//! Prometheus container are guards that drop in reverse acquisition order on
//! every exit path, so a failing stage still tears down whatever earlier
//! stages started. Cleanup failures are logged and never displace the
//! scenario's primary verdict.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use tempfile::TempDir;
use thiserror::Error;
use tracing::info;

use crate::collector::{CollectorError, Prometheus, ScrapeConfig};
use crate::exporter::{BackupSource, ExporterConfig, ExporterError, ExporterProcess};
use crate::poller::{
    ConvergencePoller, EXPECTED_METRICS, PollError, PrometheusQuery, QueryError,
};
use crate::producer::{BackupProducer, BackupTool, ProduceError};

const SCENARIO_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::scenario");

/// Logical name of the repository each scenario produces.
const REPO_NAME: &str = "test";

/// Password each scenario's repository is encrypted with.
const REPO_PASSWORD: &str = "test";

/// Stage budgets for one scenario.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Wait window for each producer invocation.
    pub producer_wait: Duration,
    /// Startup window for the Prometheus health check.
    pub prometheus_startup: Duration,
    /// Prometheus scrape interval.
    pub scrape_interval: Duration,
    /// Pause between convergence probe rounds.
    pub probe_interval: Duration,
    /// Per-probe HTTP timeout.
    pub probe_timeout: Duration,
    /// Overall convergence deadline.
    pub convergence_deadline: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            producer_wait: Duration::from_secs(10),
            prometheus_startup: Duration::from_secs(10),
            scrape_interval: Duration::from_secs(1),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            convergence_deadline: Duration::from_secs(10),
        }
    }
}

/// Errors terminating a scenario, tagged by the failing stage.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// Staging the scenario's scratch directories failed.
    #[error("failed to stage scenario directories: {source}")]
    Workspace {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// A scratch directory landed on a non-UTF-8 path.
    #[error("scenario directory path is not valid UTF-8")]
    WorkspacePath,

    /// The backup producer failed.
    #[error(transparent)]
    Produce(#[from] ProduceError),

    /// The exporter could not be configured or started.
    #[error(transparent)]
    Exporter(#[from] ExporterError),

    /// Prometheus could not be configured, started, or become healthy.
    #[error(transparent)]
    Collector(#[from] CollectorError),

    /// The query client could not be constructed.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Not every expected metric appeared before the deadline.
    #[error(transparent)]
    Converge(#[from] PollError),
}

impl From<io::Error> for ScenarioError {
    fn from(source: io::Error) -> Self {
        Self::Workspace {
            source: Arc::new(source),
        }
    }
}

/// One fully isolated end-to-end run for a specific version combination.
#[derive(Debug, Clone)]
pub struct Scenario {
    tool: BackupTool,
    tool_tag: String,
    prometheus_tag: String,
    exporter_port: u16,
    prometheus_port: u16,
    timeouts: Timeouts,
}

impl Scenario {
    /// Builds a scenario with the default stage budgets.
    #[must_use]
    pub fn new(
        tool: BackupTool,
        tool_tag: impl Into<String>,
        prometheus_tag: impl Into<String>,
        exporter_port: u16,
        prometheus_port: u16,
    ) -> Self {
        Self {
            tool,
            tool_tag: tool_tag.into(),
            prometheus_tag: prometheus_tag.into(),
            exporter_port,
            prometheus_port,
            timeouts: Timeouts::default(),
        }
    }

    /// Overrides the stage budgets.
    #[must_use]
    pub const fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Backup tool variant under test.
    #[must_use]
    pub const fn tool(&self) -> BackupTool {
        self.tool
    }

    /// Image tag of the backup tool under test.
    #[must_use]
    pub fn tool_tag(&self) -> &str {
        &self.tool_tag
    }

    /// Image tag of the Prometheus release under test.
    #[must_use]
    pub fn prometheus_tag(&self) -> &str {
        &self.prometheus_tag
    }

    /// Host port the exporter binds for this scenario.
    #[must_use]
    pub const fn exporter_port(&self) -> u16 {
        self.exporter_port
    }

    /// Host port Prometheus publishes for this scenario.
    #[must_use]
    pub const fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    /// Runs the scenario to its single terminal verdict.
    ///
    /// Stages run in strict order: produce the repository, start the
    /// exporter, start Prometheus, poll for convergence. The first failing
    /// stage aborts the rest; guards still tear down everything already
    /// started.
    ///
    /// # Errors
    /// Returns the failing stage's error; see [`ScenarioError`].
    pub fn run(&self, exporter_binary: &Utf8Path) -> Result<(), ScenarioError> {
        info!(
            target: SCENARIO_TARGET,
            tool = self.tool.label(),
            tool_tag = %self.tool_tag,
            prometheus_tag = %self.prometheus_tag,
            exporter_port = self.exporter_port,
            prometheus_port = self.prometheus_port,
            "starting scenario"
        );

        let repo_dir = TempDir::new()?;
        let data_dir = TempDir::new()?;
        seed_data_dir(data_dir.path())?;
        let repo_path = utf8_path(repo_dir.path())?;
        let data_path = utf8_path(data_dir.path())?;

        let producer = BackupProducer::new(self.tool, self.tool_tag.as_str(), REPO_PASSWORD);
        producer.populate(repo_path, data_path, self.timeouts.producer_wait)?;

        let config = exporter_config(&producer, repo_path);
        let exporter = ExporterProcess::start(exporter_binary, &config, self.exporter_port)?;

        let scrape = ScrapeConfig::for_exporter(exporter.port(), self.timeouts.scrape_interval);
        let prometheus = Prometheus::start(
            &self.prometheus_tag,
            &scrape,
            self.prometheus_port,
            self.timeouts.prometheus_startup,
        )?;

        let query = PrometheusQuery::new(prometheus.base_url(), self.timeouts.probe_timeout)?;
        let poller = ConvergencePoller::new(
            self.timeouts.probe_interval,
            self.timeouts.convergence_deadline,
        );
        poller.wait_for_metrics(&query, &EXPECTED_METRICS)?;

        info!(
            target: SCENARIO_TARGET,
            tool = self.tool.label(),
            tool_tag = %self.tool_tag,
            prometheus_tag = %self.prometheus_tag,
            "scenario converged"
        );
        Ok(())
        // prometheus, exporter, data_dir, repo_dir drop here in reverse
        // acquisition order on both the success and the error path.
    }
}

/// Synthesises the exporter configuration for the repository the producer
/// just populated, reusing the producer's own password.
fn exporter_config(producer: &BackupProducer, repo_path: &Utf8Path) -> ExporterConfig {
    ExporterConfig::single(BackupSource::new(
        REPO_NAME,
        repo_path,
        producer.password(),
    ))
}

/// Seeds the data directory with a small deterministic tree so the snapshot
/// carries real files.
fn seed_data_dir(root: &std::path::Path) -> Result<(), ScenarioError> {
    std::fs::write(root.join("notes.txt"), "backed up by the e2e harness\n")?;
    let nested = root.join("nested");
    std::fs::create_dir(&nested)?;
    std::fs::write(nested.join("blob.bin"), [0_u8, 1, 2, 3, 5, 8, 13, 21])?;
    Ok(())
}

fn utf8_path(path: &std::path::Path) -> Result<&Utf8Path, ScenarioError> {
    Utf8Path::from_path(path).ok_or(ScenarioError::WorkspacePath)
}
