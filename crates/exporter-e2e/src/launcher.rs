//! Scoped launching of containers and host processes.
//!
//! Every dependency the harness starts is owned by a guard: dropping the
//! guard terminates the unit, so teardown runs on every exit path, including
//! panics and early returns. Containers are driven through the `docker` CLI;
//! host processes through [`std::process::Command`]. Readiness is expressed
//! as an HTTP probe polled against a health endpoint within a bounded
//! startup window.

use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const LAUNCHER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::launcher");

/// Poll cadence for process-exit and readiness checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period between SIGTERM and SIGKILL when tearing down a process.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Errors surfaced while launching, waiting on, or tearing down a unit.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The program could not be spawned at all.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The container runtime rejected the invocation.
    #[error("container runtime error: {message}")]
    Runtime {
        /// Trimmed stderr of the runtime client.
        message: String,
    },

    /// A one-shot unit exited with a non-zero status.
    #[error("unit exited with status {status}: {stderr}")]
    NonZeroExit {
        /// Process exit status.
        status: i32,
        /// Trimmed stderr of the unit.
        stderr: String,
    },

    /// A one-shot unit did not exit within its wait window.
    #[error("unit still running after {timeout_secs}s wait window")]
    WaitTimeout {
        /// Configured wait window in seconds.
        timeout_secs: u64,
    },

    /// A launched unit did not pass its readiness probe in time.
    #[error("'{url}' not ready within {timeout_secs}s startup window")]
    NotReady {
        /// Probed URL.
        url: String,
        /// Configured startup window in seconds.
        timeout_secs: u64,
    },

    /// The readiness probe client could not be constructed.
    #[error("failed to build readiness probe client: {message}")]
    Probe {
        /// Description of the client construction failure.
        message: String,
    },

    /// Widening configuration file permissions for container handoff failed.
    #[error("failed to adjust permissions on '{path}': {source}")]
    Permissions {
        /// File whose permissions could not be changed.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// An I/O error occurred while supervising a unit.
    #[error("I/O error supervising unit: {source}")]
    Io {
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// Access mode for a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// The container may only read the bound path.
    ReadOnly,
    /// The container may read and write the bound path.
    ReadWrite,
}

impl MountMode {
    const fn flag(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

#[derive(Debug, Clone)]
struct Mount {
    host: Utf8PathBuf,
    container: String,
    mode: MountMode,
}

/// Declarative description of a `docker run` invocation.
///
/// The builder mirrors the runtime flags the harness relies on: bind mounts,
/// environment variables, published ports, host-user identity, supplementary
/// groups, and host-gateway aliasing for containers that must reach services
/// on the host.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    image: String,
    tag: String,
    command: Vec<String>,
    mounts: Vec<Mount>,
    env: Vec<(String, String)>,
    published_ports: Vec<(u16, u16)>,
    user: Option<String>,
    extra_groups: Vec<String>,
    extra_hosts: Vec<String>,
}

impl ContainerSpec {
    /// Builds a spec for `image:tag` with no command override.
    #[must_use]
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
            command: Vec::new(),
            mounts: Vec::new(),
            env: Vec::new(),
            published_ports: Vec::new(),
            user: None,
            extra_groups: Vec::new(),
            extra_hosts: Vec::new(),
        }
    }

    /// Overrides the container command.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Bind-mounts `host` at `container` with the given access mode.
    #[must_use]
    pub fn with_mount(mut self, host: &Utf8Path, container: &str, mode: MountMode) -> Self {
        self.mounts.push(Mount {
            host: host.to_owned(),
            container: container.to_owned(),
            mode,
        });
        self
    }

    /// Sets an environment variable inside the container.
    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_owned(), value.to_owned()));
        self
    }

    /// Publishes `container_port` on `host_port`.
    #[must_use]
    pub fn with_port(mut self, host_port: u16, container_port: u16) -> Self {
        self.published_ports.push((host_port, container_port));
        self
    }

    /// Runs the container as the invoking host user and group.
    ///
    /// Bind-mounted files written by the harness stay readable inside the
    /// container, and files the container writes back stay owned by the
    /// harness user.
    #[must_use]
    pub fn as_host_user(mut self) -> Self {
        self.user = Some(format!(
            "{}:{}",
            nix::unistd::getuid(),
            nix::unistd::getgid()
        ));
        self
    }

    /// Adds a supplementary group id inside the container.
    #[must_use]
    pub fn with_extra_group(mut self, gid: &str) -> Self {
        self.extra_groups.push(gid.to_owned());
        self
    }

    /// Maps `host.docker.internal` to the host gateway inside the container.
    #[must_use]
    pub fn with_host_gateway(mut self) -> Self {
        self.extra_hosts
            .push("host.docker.internal:host-gateway".to_owned());
        self
    }

    fn run_args(&self, detached: bool) -> Vec<String> {
        let mut args = vec!["run".to_owned(), "--rm".to_owned()];
        if detached {
            args.push("--detach".to_owned());
        }
        if let Some(user) = &self.user {
            args.push("--user".to_owned());
            args.push(user.clone());
        }
        for group in &self.extra_groups {
            args.push("--group-add".to_owned());
            args.push(group.clone());
        }
        for host in &self.extra_hosts {
            args.push("--add-host".to_owned());
            args.push(host.clone());
        }
        for (host_port, container_port) in &self.published_ports {
            args.push("--publish".to_owned());
            args.push(format!("{host_port}:{container_port}"));
        }
        for mount in &self.mounts {
            args.push("--volume".to_owned());
            args.push(format!(
                "{}:{}:{}",
                mount.host,
                mount.container,
                mount.mode.flag()
            ));
        }
        for (key, value) in &self.env {
            args.push("--env".to_owned());
            args.push(format!("{key}={value}"));
        }
        args.push(format!("{}:{}", self.image, self.tag));
        args.extend(self.command.iter().cloned());
        args
    }
}

/// HTTP readiness probe polled while a unit starts up.
#[derive(Debug, Clone)]
pub struct HttpReadiness {
    url: String,
    expected_status: u16,
    startup_timeout: Duration,
    poll_interval: Duration,
}

impl HttpReadiness {
    /// Builds a probe expecting `expected_status` from `url` within ten
    /// seconds, polled four times a second.
    #[must_use]
    pub fn new(url: impl Into<String>, expected_status: u16) -> Self {
        Self {
            url: url.into(),
            expected_status,
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Overrides the startup window.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn wait(&self) -> Result<(), LaunchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .map_err(|error| LaunchError::Probe {
                message: error.to_string(),
            })?;
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            match client.get(&self.url).send() {
                Ok(response) if response.status().as_u16() == self.expected_status => {
                    debug!(
                        target: LAUNCHER_TARGET,
                        url = %self.url,
                        "readiness probe passed"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    debug!(
                        target: LAUNCHER_TARGET,
                        url = %self.url,
                        status = response.status().as_u16(),
                        "readiness probe not yet passing"
                    );
                }
                Err(error) => {
                    debug!(
                        target: LAUNCHER_TARGET,
                        url = %self.url,
                        error = %error,
                        "readiness probe unreachable"
                    );
                }
            }
            if Instant::now() >= deadline {
                return Err(LaunchError::NotReady {
                    url: self.url.clone(),
                    timeout_secs: self.startup_timeout.as_secs(),
                });
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

/// A detached container guaranteed to be removed when the guard drops.
#[derive(Debug)]
pub struct ScopedContainer {
    id: String,
    removed: bool,
}

impl ScopedContainer {
    /// Starts the container detached and, when a probe is supplied, blocks
    /// until the probe passes.
    ///
    /// The guard exists before the probe runs, so a failed probe still tears
    /// the container down.
    ///
    /// # Errors
    /// Returns [`LaunchError::Runtime`] if the runtime rejects the
    /// invocation and [`LaunchError::NotReady`] if the probe does not pass
    /// within its startup window.
    pub fn start(
        spec: &ContainerSpec,
        readiness: Option<&HttpReadiness>,
    ) -> Result<Self, LaunchError> {
        let output = Command::new("docker")
            .args(spec.run_args(true))
            .output()
            .map_err(|source| LaunchError::Spawn {
                program: "docker".to_owned(),
                source: Arc::new(source),
            })?;
        if !output.status.success() {
            return Err(LaunchError::Runtime {
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        debug!(
            target: LAUNCHER_TARGET,
            container = %id,
            image = %spec.image,
            tag = %spec.tag,
            "container started"
        );
        let container = Self { id, removed: false };
        if let Some(probe) = readiness {
            probe.wait()?;
        }
        Ok(container)
    }

    /// Runs the container in the foreground and waits for it to exit.
    ///
    /// # Errors
    /// Returns [`LaunchError::NonZeroExit`] when the container fails,
    /// [`LaunchError::WaitTimeout`] when it outlives the wait window (the
    /// child is killed first), and [`LaunchError::Spawn`] or
    /// [`LaunchError::Io`] for supervision failures.
    pub fn run_to_completion(spec: &ContainerSpec, timeout: Duration) -> Result<(), LaunchError> {
        let mut child = Command::new("docker")
            .args(spec.run_args(false))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: "docker".to_owned(),
                source: Arc::new(source),
            })?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() > timeout {
                        warn!(
                            target: LAUNCHER_TARGET,
                            image = %spec.image,
                            tag = %spec.tag,
                            timeout_secs = timeout.as_secs(),
                            "one-shot container timed out, killing"
                        );
                        drop(child.kill());
                        drop(child.wait());
                        return Err(LaunchError::WaitTimeout {
                            timeout_secs: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(source) => {
                    return Err(LaunchError::Io {
                        source: Arc::new(source),
                    });
                }
            }
        };

        let stderr = drain_stderr(&mut child);
        if status.success() {
            debug!(
                target: LAUNCHER_TARGET,
                image = %spec.image,
                tag = %spec.tag,
                "one-shot container completed"
            );
            Ok(())
        } else {
            Err(LaunchError::NonZeroExit {
                status: status.code().unwrap_or(-1),
                stderr,
            })
        }
    }

    /// Removes the container, surfacing any cleanup failure.
    ///
    /// # Errors
    /// Returns [`LaunchError::Runtime`] when removal fails for a container
    /// that still exists.
    pub fn shutdown(mut self) -> Result<(), LaunchError> {
        self.remove()
    }

    fn remove(&mut self) -> Result<(), LaunchError> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        let output = Command::new("docker")
            .args(["rm", "--force", &self.id])
            .output()
            .map_err(|source| LaunchError::Spawn {
                program: "docker".to_owned(),
                source: Arc::new(source),
            })?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        // A container launched with --rm may already be gone.
        if output.status.success() || stderr.contains("No such container") {
            debug!(
                target: LAUNCHER_TARGET,
                container = %self.id,
                "container removed"
            );
            Ok(())
        } else {
            Err(LaunchError::Runtime {
                message: stderr.trim().to_owned(),
            })
        }
    }
}

impl Drop for ScopedContainer {
    fn drop(&mut self) {
        if let Err(error) = self.remove() {
            warn!(
                target: LAUNCHER_TARGET,
                container = %self.id,
                error = %error,
                "failed to remove container"
            );
        }
    }
}

/// A host child process killed and reaped when the guard drops.
#[derive(Debug)]
pub struct ScopedProcess {
    child: std::process::Child,
    program: String,
    terminated: bool,
}

impl ScopedProcess {
    /// Spawns `program` with `args`, inheriting the parent's stdio.
    ///
    /// # Errors
    /// Returns [`LaunchError::Spawn`] if the process cannot be started.
    pub fn spawn<I, S>(program: &Utf8Path, args: I) -> Result<Self, LaunchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let child = Command::new(program.as_std_path())
            .args(args)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.to_string(),
                source: Arc::new(source),
            })?;
        debug!(
            target: LAUNCHER_TARGET,
            program = %program,
            pid = child.id(),
            "process spawned"
        );
        Ok(Self {
            child,
            program: program.to_string(),
            terminated: false,
        })
    }

    /// Operating-system id of the child.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Terminates the child and waits for it to exit, surfacing failures.
    ///
    /// # Errors
    /// Returns [`LaunchError::Io`] when signalling or reaping fails.
    pub fn shutdown(mut self) -> Result<(), LaunchError> {
        self.terminate()
    }

    /// Sends SIGTERM, waits out a short grace period, then falls back to
    /// SIGKILL. Idempotent: later calls (including the one from `Drop`) are
    /// no-ops.
    fn terminate(&mut self) -> Result<(), LaunchError> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        let exited = self
            .child
            .try_wait()
            .map_err(|source| LaunchError::Io {
                source: Arc::new(source),
            })?
            .is_some();
        if exited {
            return Ok(());
        }

        if let Ok(raw) = i32::try_from(self.child.id()) {
            drop(nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(raw),
                nix::sys::signal::Signal::SIGTERM,
            ));
        }
        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            let status = self.child.try_wait().map_err(|source| LaunchError::Io {
                source: Arc::new(source),
            })?;
            if let Some(code) = status {
                debug!(
                    target: LAUNCHER_TARGET,
                    program = %self.program,
                    ?code,
                    "process exited after SIGTERM"
                );
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        warn!(
            target: LAUNCHER_TARGET,
            program = %self.program,
            "process ignored SIGTERM, killing"
        );
        self.child.kill().map_err(|source| LaunchError::Io {
            source: Arc::new(source),
        })?;
        self.child.wait().map_err(|source| LaunchError::Io {
            source: Arc::new(source),
        })?;
        Ok(())
    }
}

impl Drop for ScopedProcess {
    fn drop(&mut self) {
        if let Err(error) = self.terminate() {
            warn!(
                target: LAUNCHER_TARGET,
                program = %self.program,
                error = %error,
                "failed to terminate process"
            );
        }
    }
}

/// Widens `path` to 0644 so a launched unit can read it.
///
/// Temp files default to 0600, which a container running as another user
/// cannot read.
///
/// # Errors
/// Returns [`LaunchError::Permissions`] when the mode cannot be changed.
pub fn make_world_readable(path: &Utf8Path) -> Result<(), LaunchError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            path.as_std_path(),
            std::fs::Permissions::from_mode(0o644),
        )
        .map_err(|source| LaunchError::Permissions {
            path: path.to_owned(),
            source: Arc::new(source),
        })?;
    }
    Ok(())
}

fn drain_stderr(child: &mut std::process::Child) -> String {
    use std::io::Read;
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut buffer = String::new();
    drop(stderr.read_to_string(&mut buffer));
    buffer.trim().to_owned()
}

#[cfg(test)]
mod tests {
    #![expect(
        clippy::expect_used,
        reason = "test code uses expect for clarity and assertions"
    )]

    use super::*;

    fn pid_alive(pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_ok()
    }

    #[test]
    fn run_args_render_the_full_invocation() {
        let spec = ContainerSpec::new("docker.io/prom/prometheus", "v3.4.0")
            .with_mount(
                Utf8Path::new("/tmp/prometheus.yml"),
                "/etc/prometheus/prometheus.yml",
                MountMode::ReadOnly,
            )
            .with_env("EXAMPLE", "1")
            .with_port(1400, 9090)
            .with_extra_group("65534")
            .with_host_gateway()
            .with_command(["--help"]);
        let args = spec.run_args(true);

        assert_eq!(args.first().map(String::as_str), Some("run"));
        assert!(args.contains(&"--rm".to_owned()));
        assert!(args.contains(&"--detach".to_owned()));
        assert!(args.contains(&"--group-add".to_owned()));
        assert!(args.contains(&"65534".to_owned()));
        assert!(args.contains(&"host.docker.internal:host-gateway".to_owned()));
        assert!(args.contains(&"1400:9090".to_owned()));
        assert!(args.contains(&"/tmp/prometheus.yml:/etc/prometheus/prometheus.yml:ro".to_owned()));
        assert!(args.contains(&"EXAMPLE=1".to_owned()));
        assert!(args.contains(&"docker.io/prom/prometheus:v3.4.0".to_owned()));
        assert_eq!(args.last().map(String::as_str), Some("--help"));
    }

    #[test]
    fn run_args_omit_detach_for_foreground_runs() {
        let spec = ContainerSpec::new("docker.io/restic/restic", "0.18.0");
        assert!(!spec.run_args(false).contains(&"--detach".to_owned()));
    }

    #[test]
    fn host_user_spec_is_uid_colon_gid() {
        let spec = ContainerSpec::new("ghcr.io/rustic-rs/rustic", "v0.10.0").as_host_user();
        let args = spec.run_args(false);
        let position = args
            .iter()
            .position(|arg| arg == "--user")
            .expect("--user flag present");
        let value = args.get(position + 1).expect("--user has a value");
        assert!(value.contains(':'), "expected uid:gid, got {value}");
    }

    #[test]
    fn shutdown_kills_and_reaps_the_child() {
        let process =
            ScopedProcess::spawn(Utf8Path::new("sleep"), ["30"]).expect("spawn sleep");
        let pid = process.id();
        assert!(pid_alive(pid));
        process.shutdown().expect("shutdown succeeds");
        assert!(!pid_alive(pid), "child should be gone after shutdown");
    }

    #[test]
    fn dropping_the_guard_kills_the_child() {
        let process =
            ScopedProcess::spawn(Utf8Path::new("sleep"), ["30"]).expect("spawn sleep");
        let pid = process.id();
        drop(process);
        assert!(!pid_alive(pid), "child should be gone after drop");
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_widens_temp_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let file = tempfile::NamedTempFile::new().expect("create temp file");
        let path = Utf8Path::from_path(file.path()).expect("utf8 temp path");
        make_world_readable(path).expect("widen permissions");
        let mode = std::fs::metadata(path.as_std_path())
            .expect("stat temp file")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
