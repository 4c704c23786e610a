//! Exporter configuration synthesis and process control.
//!
//! The exporter runs as a long-lived host process reading a TOML
//! configuration with one `[[backup]]` table per repository. The harness
//! synthesises that document fresh for every scenario, writes it to a scoped
//! temp file, and keeps the file alive for as long as the process runs. No
//! readiness probe is taken at launch: the convergence poller verifies the
//! whole pipeline transitively.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

use crate::launcher::{LaunchError, ScopedProcess};

const EXPORTER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::exporter");

/// Errors raised while configuring or running the exporter.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// The configuration document could not be serialised.
    #[error("failed to serialise exporter configuration: {source}")]
    Serialize {
        /// Underlying TOML serialisation error.
        #[from]
        source: toml::ser::Error,
    },

    /// Writing the configuration file failed.
    #[error("failed to write exporter configuration: {source}")]
    Io {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The temp file landed on a non-UTF-8 path.
    #[error("exporter configuration path is not valid UTF-8")]
    ConfigPath,

    /// The exporter process could not be launched.
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl From<io::Error> for ExporterError {
    fn from(source: io::Error) -> Self {
        Self::Io {
            source: Arc::new(source),
        }
    }
}

/// One `[[backup]]` entry in the exporter configuration.
#[derive(Debug, Clone, Serialize)]
pub struct BackupSource {
    name: String,
    repository: Utf8PathBuf,
    password: String,
    options: BTreeMap<String, String>,
}

impl BackupSource {
    /// Builds an entry with an empty options table.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        repository: &Utf8Path,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            repository: repository.to_owned(),
            password: password.into(),
            options: BTreeMap::new(),
        }
    }

    /// Logical name of the backup source.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Password the source's repository is encrypted with.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

/// Exporter configuration document.
#[derive(Debug, Clone, Serialize)]
pub struct ExporterConfig {
    backup: Vec<BackupSource>,
}

impl ExporterConfig {
    /// Builds a configuration with a single backup source.
    #[must_use]
    pub fn single(source: BackupSource) -> Self {
        Self {
            backup: vec![source],
        }
    }

    /// Renders the document as TOML.
    ///
    /// # Errors
    /// Returns [`ExporterError::Serialize`] when rendering fails.
    pub fn to_toml(&self) -> Result<String, ExporterError> {
        Ok(toml::to_string(self)?)
    }
}

/// A running exporter process bound to a scenario port.
///
/// The configuration temp file is owned by the handle and outlives the
/// process: field order guarantees the process is torn down before the file
/// is unlinked.
#[derive(Debug)]
pub struct ExporterProcess {
    process: ScopedProcess,
    _config_file: NamedTempFile,
    port: u16,
}

impl ExporterProcess {
    /// Writes the configuration to a scoped temp file and spawns
    /// `binary --config <path> --port <port>`.
    ///
    /// # Errors
    /// Returns [`ExporterError::Serialize`] or [`ExporterError::Io`] when
    /// the configuration cannot be staged and [`ExporterError::Launch`] when
    /// the process cannot be spawned.
    pub fn start(
        binary: &Utf8Path,
        config: &ExporterConfig,
        port: u16,
    ) -> Result<Self, ExporterError> {
        let mut config_file = NamedTempFile::new()?;
        config_file.write_all(config.to_toml()?.as_bytes())?;
        config_file.flush()?;
        let config_path = Utf8Path::from_path(config_file.path())
            .ok_or(ExporterError::ConfigPath)?
            .to_owned();

        let port_arg = port.to_string();
        let process = ScopedProcess::spawn(
            binary,
            ["--config", config_path.as_str(), "--port", port_arg.as_str()],
        )?;
        info!(
            target: EXPORTER_TARGET,
            binary = %binary,
            port,
            pid = process.id(),
            "exporter started"
        );
        Ok(Self {
            process,
            _config_file: config_file,
            port,
        })
    }

    /// Scenario port the exporter serves metrics on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Terminates the exporter and waits for it to exit.
    ///
    /// # Errors
    /// Returns [`ExporterError::Launch`] when termination fails.
    pub fn shutdown(self) -> Result<(), ExporterError> {
        Ok(self.process.shutdown()?)
    }
}

#[cfg(test)]
mod tests {
    #![expect(
        clippy::expect_used,
        reason = "test code uses expect for clarity and assertions"
    )]

    use super::*;

    fn sample_config() -> ExporterConfig {
        ExporterConfig::single(BackupSource::new(
            "test",
            Utf8Path::new("/tmp/repo"),
            "test",
        ))
    }

    #[test]
    fn config_renders_a_backup_array_of_tables() {
        let rendered = sample_config().to_toml().expect("render TOML");
        assert!(rendered.contains("[[backup]]"), "rendered: {rendered}");
        assert!(rendered.contains("name = \"test\""));
        assert!(rendered.contains("repository = \"/tmp/repo\""));
        assert!(rendered.contains("password = \"test\""));
    }

    #[test]
    fn config_always_carries_an_options_table() {
        // The exporter's deserialiser requires the options key even when no
        // option is set.
        let rendered = sample_config().to_toml().expect("render TOML");
        let value: toml::Value = toml::from_str(&rendered).expect("parse rendered TOML");
        let backups = value
            .get("backup")
            .and_then(toml::Value::as_array)
            .expect("backup array");
        let options = backups
            .first()
            .and_then(|entry| entry.get("options"))
            .and_then(toml::Value::as_table)
            .expect("options table");
        assert!(options.is_empty());
    }

    #[test]
    fn source_accessors_echo_inputs() {
        let source = BackupSource::new("snapshots", Utf8Path::new("/repo"), "hunter2");
        assert_eq!(source.name(), "snapshots");
        assert_eq!(source.password(), "hunter2");
    }
}
