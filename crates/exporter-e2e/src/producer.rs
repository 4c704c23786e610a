//! Backup producers that populate a repository with one of the supported
//! tools.
//!
//! Both variants satisfy the same contract: given a read-only data directory
//! and a read-write repository directory, leave behind an initialised
//! repository containing one snapshot, then exit. The caller blocks on
//! completion; a failed or overdue backup is a hard failure of the enclosing
//! scenario and is never retried.

use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tracing::info;

use crate::launcher::{ContainerSpec, LaunchError, MountMode, ScopedContainer};

const PRODUCER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::producer");

/// Container path the source data directory is mounted at.
const DATA_MOUNT: &str = "/data";
/// Container path the repository directory is mounted at.
const REPO_MOUNT: &str = "/repo";

/// Backup tool used to populate a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupTool {
    /// `rustic`, which initialises and backs up in one invocation.
    Rustic,
    /// `restic`, which needs a separate `init` before `backup`.
    Restic,
}

impl BackupTool {
    /// Container image the tool is published under.
    #[must_use]
    pub const fn image(self) -> &'static str {
        match self {
            Self::Rustic => "ghcr.io/rustic-rs/rustic",
            Self::Restic => "docker.io/restic/restic",
        }
    }

    /// Short name used in logs and failure reports.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Rustic => "rustic",
            Self::Restic => "restic",
        }
    }
}

/// Errors raised while producing a repository.
#[derive(Debug, Error)]
pub enum ProduceError {
    /// The backup tool failed or did not finish within its wait window.
    #[error("{tool} {tag} failed to produce a repository: {source}")]
    Backup {
        /// Tool variant that failed.
        tool: &'static str,
        /// Image tag that failed.
        tag: String,
        /// Underlying launch failure.
        #[source]
        source: LaunchError,
    },
}

/// Populates a backup repository from a data directory.
#[derive(Debug, Clone)]
pub struct BackupProducer {
    tool: BackupTool,
    tag: String,
    password: String,
}

impl BackupProducer {
    /// Builds a producer for one tool variant at one image tag.
    #[must_use]
    pub fn new(tool: BackupTool, tag: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            tool,
            tag: tag.into(),
            password: password.into(),
        }
    }

    /// Tool variant this producer runs.
    #[must_use]
    pub const fn tool(&self) -> BackupTool {
        self.tool
    }

    /// Repository password the producer encrypts with.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Initialises `repo_dir` and snapshots `data_dir` into it, blocking
    /// until the tool exits.
    ///
    /// # Errors
    /// Returns [`ProduceError::Backup`] when any tool invocation exits
    /// non-zero or outlives `timeout`.
    pub fn populate(
        &self,
        repo_dir: &Utf8Path,
        data_dir: &Utf8Path,
        timeout: Duration,
    ) -> Result<(), ProduceError> {
        info!(
            target: PRODUCER_TARGET,
            tool = self.tool.label(),
            tag = %self.tag,
            repo = %repo_dir,
            "producing repository"
        );
        match self.tool {
            BackupTool::Rustic => self.rustic_backup(repo_dir, data_dir, timeout),
            BackupTool::Restic => self.restic_backup(repo_dir, data_dir, timeout),
        }
    }

    /// rustic initialises the repository as part of `backup --init`.
    fn rustic_backup(
        &self,
        repo_dir: &Utf8Path,
        data_dir: &Utf8Path,
        timeout: Duration,
    ) -> Result<(), ProduceError> {
        let spec = ContainerSpec::new(self.tool.image(), self.tag.as_str())
            .with_mount(data_dir, DATA_MOUNT, MountMode::ReadOnly)
            .with_mount(repo_dir, REPO_MOUNT, MountMode::ReadWrite)
            .as_host_user()
            .with_command([
                "backup",
                "--init",
                DATA_MOUNT,
                "--repository",
                REPO_MOUNT,
                "--password",
                self.password.as_str(),
            ]);
        ScopedContainer::run_to_completion(&spec, timeout).map_err(|source| self.failed(source))
    }

    /// restic needs an explicit `init` before the backup, sharing the
    /// repository mount and password between the two runs.
    fn restic_backup(
        &self,
        repo_dir: &Utf8Path,
        data_dir: &Utf8Path,
        timeout: Duration,
    ) -> Result<(), ProduceError> {
        let init = ContainerSpec::new(self.tool.image(), self.tag.as_str())
            .with_mount(repo_dir, REPO_MOUNT, MountMode::ReadWrite)
            .with_env("RESTIC_PASSWORD", &self.password)
            .as_host_user()
            .with_command(["init", "--repo", REPO_MOUNT]);
        ScopedContainer::run_to_completion(&init, timeout).map_err(|source| self.failed(source))?;

        let backup = ContainerSpec::new(self.tool.image(), self.tag.as_str())
            .with_mount(data_dir, DATA_MOUNT, MountMode::ReadOnly)
            .with_mount(repo_dir, REPO_MOUNT, MountMode::ReadWrite)
            .with_env("RESTIC_PASSWORD", &self.password)
            .as_host_user()
            .with_command(["backup", "--repo", REPO_MOUNT, DATA_MOUNT]);
        ScopedContainer::run_to_completion(&backup, timeout).map_err(|source| self.failed(source))
    }

    fn failed(&self, source: LaunchError) -> ProduceError {
        ProduceError::Backup {
            tool: self.tool.label(),
            tag: self.tag.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_match_published_registries() {
        assert_eq!(BackupTool::Rustic.image(), "ghcr.io/rustic-rs/rustic");
        assert_eq!(BackupTool::Restic.image(), "docker.io/restic/restic");
    }

    #[test]
    fn producer_reports_its_identity_on_failure() {
        let producer = BackupProducer::new(BackupTool::Restic, "0.18.0", "test");
        let error = producer.failed(LaunchError::WaitTimeout { timeout_secs: 10 });
        let message = error.to_string();
        assert!(message.contains("restic"));
        assert!(message.contains("0.18.0"));
    }
}
