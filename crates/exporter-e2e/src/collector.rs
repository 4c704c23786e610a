//! Prometheus scrape configuration synthesis and container control.
//!
//! Prometheus runs containerised while the exporter runs on the host, so the
//! scrape target uses the `host.docker.internal` gateway alias. The
//! synthesised configuration is bind-mounted read-only at Prometheus's
//! expected path, widened to be readable past the temp-file default mode,
//! and the container is held at startup until its own health endpoint
//! answers 200.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

use crate::launcher::{
    ContainerSpec, HttpReadiness, LaunchError, MountMode, ScopedContainer, make_world_readable,
};

const COLLECTOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::collector");

/// Container image Prometheus is published under.
pub const PROMETHEUS_IMAGE: &str = "docker.io/prom/prometheus";

/// Port Prometheus listens on inside the container.
const PROMETHEUS_PORT: u16 = 9090;

/// Path Prometheus reads its configuration from inside the container.
const CONFIG_MOUNT: &str = "/etc/prometheus/prometheus.yml";

/// The `nobody` group the Prometheus image expects to run under.
const NOBODY_GROUP: &str = "65534";

/// Errors raised while configuring or running Prometheus.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The scrape configuration could not be serialised.
    #[error("failed to serialise scrape configuration: {source}")]
    Serialize {
        /// Underlying YAML serialisation error.
        #[from]
        source: serde_yaml::Error,
    },

    /// Writing the configuration file failed.
    #[error("failed to write scrape configuration: {source}")]
    Io {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The temp file landed on a non-UTF-8 path.
    #[error("scrape configuration path is not valid UTF-8")]
    ConfigPath,

    /// The container could not be launched or did not become healthy.
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl From<io::Error> for CollectorError {
    fn from(source: io::Error) -> Self {
        Self::Io {
            source: Arc::new(source),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct GlobalSection {
    scrape_interval: String,
}

#[derive(Debug, Clone, Serialize)]
struct StaticTargets {
    targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ScrapeJob {
    job_name: String,
    static_configs: Vec<StaticTargets>,
}

/// Prometheus scrape configuration document.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeConfig {
    global: GlobalSection,
    scrape_configs: Vec<ScrapeJob>,
}

impl ScrapeConfig {
    /// Builds a configuration scraping a host-side exporter on
    /// `exporter_port` at `scrape_interval`.
    #[must_use]
    pub fn for_exporter(exporter_port: u16, scrape_interval: Duration) -> Self {
        Self {
            global: GlobalSection {
                scrape_interval: format!("{}s", scrape_interval.as_secs()),
            },
            scrape_configs: vec![ScrapeJob {
                job_name: "job-1".to_owned(),
                static_configs: vec![StaticTargets {
                    targets: vec![format!("host.docker.internal:{exporter_port}")],
                }],
            }],
        }
    }

    /// Renders the document as YAML.
    ///
    /// # Errors
    /// Returns [`CollectorError::Serialize`] when rendering fails.
    pub fn to_yaml(&self) -> Result<String, CollectorError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// A running Prometheus container published on a scenario port.
///
/// Field order tears the container down before its configuration file is
/// unlinked.
#[derive(Debug)]
pub struct Prometheus {
    container: ScopedContainer,
    _config_file: NamedTempFile,
    host_port: u16,
}

impl Prometheus {
    /// Stages the scrape configuration and launches Prometheus, blocking
    /// until `/-/healthy` answers 200 or the startup window closes.
    ///
    /// # Errors
    /// Returns [`CollectorError::Serialize`] or [`CollectorError::Io`] when
    /// the configuration cannot be staged, and [`CollectorError::Launch`]
    /// when the container fails to start or to become healthy in time.
    pub fn start(
        tag: &str,
        config: &ScrapeConfig,
        host_port: u16,
        startup_timeout: Duration,
    ) -> Result<Self, CollectorError> {
        let mut config_file = NamedTempFile::new()?;
        config_file.write_all(config.to_yaml()?.as_bytes())?;
        config_file.flush()?;
        let config_path = Utf8Path::from_path(config_file.path())
            .ok_or(CollectorError::ConfigPath)?
            .to_owned();
        // Temp files default to 0600; the containerised Prometheus must be
        // able to read the mount.
        make_world_readable(&config_path)?;

        let spec = ContainerSpec::new(PROMETHEUS_IMAGE, tag)
            .with_mount(&config_path, CONFIG_MOUNT, MountMode::ReadOnly)
            .with_port(host_port, PROMETHEUS_PORT)
            .as_host_user()
            .with_extra_group(NOBODY_GROUP)
            .with_host_gateway();
        let readiness = HttpReadiness::new(
            format!("http://localhost:{host_port}/-/healthy"),
            200,
        )
        .with_startup_timeout(startup_timeout);

        let container = ScopedContainer::start(&spec, Some(&readiness))?;
        info!(
            target: COLLECTOR_TARGET,
            tag,
            host_port,
            "prometheus healthy"
        );
        Ok(Self {
            container,
            _config_file: config_file,
            host_port,
        })
    }

    /// Base URL of the query API as seen from the host.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.host_port)
    }

    /// Removes the container, surfacing any cleanup failure.
    ///
    /// # Errors
    /// Returns [`CollectorError::Launch`] when removal fails.
    pub fn shutdown(self) -> Result<(), CollectorError> {
        Ok(self.container.shutdown()?)
    }
}

#[cfg(test)]
mod tests {
    #![expect(
        clippy::expect_used,
        reason = "test code uses expect for clarity and assertions"
    )]

    use super::*;

    #[test]
    fn scrape_config_targets_the_host_gateway_alias() {
        let config = ScrapeConfig::for_exporter(1304, Duration::from_secs(1));
        let rendered = config.to_yaml().expect("render YAML");
        assert!(rendered.contains("scrape_interval: 1s"), "rendered: {rendered}");
        assert!(rendered.contains("job_name: job-1"));
        assert!(rendered.contains("host.docker.internal:1304"));
    }

    #[test]
    fn scrape_config_parses_back_with_the_expected_shape() {
        let config = ScrapeConfig::for_exporter(1100, Duration::from_secs(1));
        let rendered = config.to_yaml().expect("render YAML");
        let value: serde_yaml::Value =
            serde_yaml::from_str(&rendered).expect("parse rendered YAML");

        let interval = value
            .get("global")
            .and_then(|global| global.get("scrape_interval"))
            .and_then(serde_yaml::Value::as_str)
            .expect("global.scrape_interval");
        assert_eq!(interval, "1s");

        let targets = value
            .get("scrape_configs")
            .and_then(serde_yaml::Value::as_sequence)
            .and_then(|jobs| jobs.first())
            .and_then(|job| job.get("static_configs"))
            .and_then(serde_yaml::Value::as_sequence)
            .and_then(|configs| configs.first())
            .and_then(|static_config| static_config.get("targets"))
            .and_then(serde_yaml::Value::as_sequence)
            .expect("static target list");
        assert_eq!(targets.len(), 1);
    }
}
