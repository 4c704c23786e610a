//! Polling Prometheus for convergence of the exporter's metric set.
//!
//! Convergence is a presence check, not a correctness check: a metric counts
//! as ready when one query round returns a success status and a non-empty
//! result set for it. The poller repeats rounds at a fixed interval and
//! succeeds on the first round where every expected metric is present;
//! transient query errors are treated as "not ready yet" rather than
//! aborting the loop.

use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

const POLLER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::poller");

/// Metric names the exporter must surface for one populated repository.
pub const EXPECTED_METRICS: [&str; 8] = [
    "rustic_repository_info",
    "rustic_snapshot_info",
    "rustic_snapshot_files_total",
    "rustic_snapshot_timestamp",
    "rustic_snapshot_size_bytes",
    "rustic_snapshot_backup_start_timestamp",
    "rustic_snapshot_backup_end_timestamp",
    "rustic_snapshot_backup_duration_seconds",
];

/// Errors raised by a single metric query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The query transport failed before a verdict could be taken.
    #[error("metric query failed: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },
}

/// One probe against the collector's query API.
///
/// The seam exists so round and deadline semantics stay testable without a
/// running Prometheus.
pub trait MetricQuery {
    /// Returns whether `metric` currently has at least one series.
    ///
    /// # Errors
    /// Returns [`QueryError::Transport`] when the query cannot be issued or
    /// its response cannot be read.
    fn metric_present(&self, metric: &str) -> Result<bool, QueryError>;
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    result: Vec<serde_json::Value>,
}

/// Queries Prometheus's `/api/v1/query` endpoint.
#[derive(Debug)]
pub struct PrometheusQuery {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl PrometheusQuery {
    /// Builds a query client with a per-probe timeout.
    ///
    /// # Errors
    /// Returns [`QueryError::Transport`] when the HTTP client cannot be
    /// constructed.
    pub fn new(base_url: impl Into<String>, probe_timeout: Duration) -> Result<Self, QueryError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(probe_timeout)
            .build()
            .map_err(|error| QueryError::Transport {
                message: error.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl MetricQuery for PrometheusQuery {
    fn metric_present(&self, metric: &str) -> Result<bool, QueryError> {
        let response = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", metric)])
            .send()
            .map_err(|error| QueryError::Transport {
                message: error.to_string(),
            })?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let body: QueryResponse =
            response.json().map_err(|error| QueryError::Transport {
                message: error.to_string(),
            })?;
        Ok(!body.data.result.is_empty())
    }
}

/// Errors raised by the convergence wait.
#[derive(Debug, Error)]
pub enum PollError {
    /// The deadline elapsed before an all-ready round was observed.
    #[error("metrics not ready within {deadline_secs}s: {missing:?}")]
    Deadline {
        /// Configured deadline in seconds.
        deadline_secs: u64,
        /// Metrics still missing or unchecked in the final round.
        missing: Vec<String>,
    },
}

/// Repeatedly probes a metric set until it converges or a deadline elapses.
#[derive(Debug, Clone, Copy)]
pub struct ConvergencePoller {
    probe_interval: Duration,
    deadline: Duration,
}

impl ConvergencePoller {
    /// Builds a poller probing every `probe_interval` with an overall
    /// `deadline`.
    #[must_use]
    pub const fn new(probe_interval: Duration, deadline: Duration) -> Self {
        Self {
            probe_interval,
            deadline,
        }
    }

    /// Blocks until one round observes every metric, returning immediately
    /// on that round.
    ///
    /// # Errors
    /// Returns [`PollError::Deadline`] once the deadline is reached (the
    /// boundary counts as elapsed), naming the metrics the final round
    /// found missing or left unchecked.
    pub fn wait_for_metrics(
        &self,
        query: &dyn MetricQuery,
        metrics: &[&str],
    ) -> Result<(), PollError> {
        let started = Instant::now();
        loop {
            let missing = probe_round(query, metrics);
            if missing.is_empty() {
                debug!(
                    target: POLLER_TARGET,
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "all metrics present"
                );
                return Ok(());
            }
            if started.elapsed() >= self.deadline {
                return Err(PollError::Deadline {
                    deadline_secs: self.deadline.as_secs(),
                    missing,
                });
            }
            std::thread::sleep(self.probe_interval);
        }
    }
}

/// Probes `metrics` in order, stopping at the first absent one.
///
/// Returns the absent metric plus everything left unchecked behind it; an
/// empty result means the round was all-ready. A query error counts as
/// absence for the round.
fn probe_round(query: &dyn MetricQuery, metrics: &[&str]) -> Vec<String> {
    let absent_at = metrics.iter().position(|metric| {
        match query.metric_present(metric) {
            Ok(present) => !present,
            Err(error) => {
                debug!(
                    target: POLLER_TARGET,
                    metric,
                    error = %error,
                    "query error counts as not ready"
                );
                true
            }
        }
    });
    match absent_at {
        None => Vec::new(),
        Some(index) => metrics
            .get(index..)
            .unwrap_or_default()
            .iter()
            .map(|metric| (*metric).to_owned())
            .collect(),
    }
}
