//! Container runtime abstraction and the Docker engine implementation.
//!
//! Everything above this module talks to [`ContainerRuntime`]; only the
//! Docker implementation knows about bollard. Tests substitute a scripted
//! fake.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;

use crate::error::{Result, SandboxError};

/// Cap on collected stdout + stderr.
pub const LOG_CAPTURE_CAP: usize = 2 * 1024 * 1024;

/// Marker appended to stderr when the cap truncates output.
pub const LOG_TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Budget for collecting a container's logs.
const LOG_COLLECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for draining an exec's output stream.
const EXEC_STREAM_TIMEOUT: Duration = Duration::from_millis(500);

/// Fallback budget for polling an exec's exit code.
const EXEC_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,

    /// Image reference.
    pub image: String,

    /// Command override.
    pub cmd: Option<Vec<String>>,

    /// Environment in `KEY=value` form.
    pub env: Vec<String>,

    /// Labels for sweep-based cleanup.
    pub labels: HashMap<String, String>,

    /// Bind mounts in `source:target[:mode]` form.
    pub binds: Vec<String>,

    /// Network mode; `none` isolates the container completely.
    pub network_mode: Option<String>,

    /// Mount the root filesystem read-only.
    pub read_only_rootfs: bool,

    /// tmpfs mounts, path → mount options.
    pub tmpfs: HashMap<String, String>,

    /// Drop every Linux capability.
    pub cap_drop_all: bool,

    /// Set `no-new-privileges`.
    pub no_new_privileges: bool,

    /// Bound on the process count.
    pub pids_limit: Option<i64>,

    /// Memory limit in bytes.
    pub memory_bytes: Option<i64>,

    /// Run as this user (e.g. `1000:1000`).
    pub user: Option<String>,

    /// Working directory inside the container.
    pub working_dir: Option<String>,
}

/// Result of an exec inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Exit code of the exec'd process.
    pub exit_code: i64,

    /// Captured stdout.
    pub stdout: String,
}

/// Captured container output.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    /// Demuxed stdout.
    pub stdout: String,

    /// Demuxed stderr, possibly ending in [`LOG_TRUNCATION_MARKER`].
    pub stderr: String,

    /// Whether the cap truncated output.
    pub truncated: bool,
}

/// The container engine seam.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Wait for a container to exit, returning its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Kill a running container.
    async fn kill_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Whether the container was OOM-killed.
    async fn was_oom_killed(&self, id: &str) -> Result<bool>;

    /// Collect demuxed stdout/stderr, capped at [`LOG_CAPTURE_CAP`].
    async fn collect_logs(&self, id: &str) -> Result<LogCapture>;

    /// Run a command inside the container.
    ///
    /// The output stream is drained (bounded) before the exit code is
    /// inspected; an undrained exec leaks pooled engine connections and
    /// later calls hang.
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutcome>;

    /// Create a named volume.
    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()>;

    /// Remove a named volume.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Ids of containers carrying the label, running or not.
    async fn list_containers_by_label(&self, key: &str, value: &str) -> Result<Vec<String>>;

    /// Names of volumes carrying the label.
    async fn list_volumes_by_label(&self, key: &str, value: &str) -> Result<Vec<String>>;
}

/// Docker engine implementation over the local unix socket.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine socket is unreachable.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Runtime(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn runtime_err(e: bollard::errors::Error) -> SandboxError {
    SandboxError::Runtime(e.to_string())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut security_opt = Vec::new();
        if spec.no_new_privileges {
            security_opt.push("no-new-privileges:true".to_string());
        }

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            network_mode: spec.network_mode.clone(),
            readonly_rootfs: Some(spec.read_only_rootfs),
            tmpfs: (!spec.tmpfs.is_empty()).then(|| spec.tmpfs.clone()),
            cap_drop: spec.cap_drop_all.then(|| vec!["ALL".to_string()]),
            security_opt: (!security_opt.is_empty()).then_some(security_opt),
            pids_limit: spec.pids_limit,
            memory: spec.memory_bytes,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(runtime_err)?;

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut wait = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);

        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // The engine reports non-zero exits through the error channel.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(runtime_err(e)),
            None => Err(SandboxError::Runtime(
                "wait stream ended without a status".into(),
            )),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(runtime_err)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(runtime_err)
    }

    async fn was_oom_killed(&self, id: &str) -> Result<bool> {
        let inspected = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(runtime_err)?;
        Ok(inspected
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false))
    }

    async fn collect_logs(&self, id: &str) -> Result<LogCapture> {
        let mut logs = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );

        let collect = async {
            let mut capture = LogCapture::default();
            let mut total = 0usize;

            while let Some(item) = logs.next().await {
                let output = match item {
                    Ok(output) => output,
                    Err(e) => {
                        tracing::warn!(error = %e, "Log stream error; keeping partial logs");
                        break;
                    }
                };

                let (target, message) = match output {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        (true, message)
                    }
                    LogOutput::StdErr { message } => (false, message),
                    LogOutput::StdIn { .. } => continue,
                };

                let remaining = LOG_CAPTURE_CAP.saturating_sub(total);
                if remaining == 0 {
                    capture.truncated = true;
                    break;
                }

                let take = message.len().min(remaining);
                if take < message.len() {
                    capture.truncated = true;
                }
                total += take;

                let text = String::from_utf8_lossy(&message[..take]);
                if target {
                    capture.stdout.push_str(&text);
                } else {
                    capture.stderr.push_str(&text);
                }
            }

            if capture.truncated {
                capture.stderr.push_str(LOG_TRUNCATION_MARKER);
            }
            capture
        };

        match tokio::time::timeout(LOG_COLLECT_TIMEOUT, collect).await {
            Ok(capture) => Ok(capture),
            Err(_) => {
                tracing::warn!(container = %id, "Log collection timed out");
                Ok(LogCapture {
                    stdout: String::new(),
                    stderr: LOG_TRUNCATION_MARKER.trim_start().to_string(),
                    truncated: true,
                })
            }
        }
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutcome> {
        let created = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(runtime_err)?;

        let mut stdout = String::new();
        match self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(runtime_err)?
        {
            StartExecResults::Attached { mut output, .. } => {
                // Drain to completion or the bound; leaving the stream open
                // strands an engine connection.
                let drain = async {
                    while let Some(Ok(item)) = output.next().await {
                        if let LogOutput::StdOut { message } | LogOutput::Console { message } =
                            item
                        {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                    }
                };
                if tokio::time::timeout(EXEC_STREAM_TIMEOUT, drain).await.is_err() {
                    tracing::debug!(container = %id, "Exec stream drain hit its bound");
                }
            }
            StartExecResults::Detached => {}
        }

        // Poll the exit code; the process may outlive the drain bound.
        let deadline = tokio::time::Instant::now() + EXEC_POLL_TIMEOUT;
        loop {
            let inspected = self
                .docker
                .inspect_exec(&created.id)
                .await
                .map_err(runtime_err)?;

            if inspected.running != Some(true) {
                return Ok(ExecOutcome {
                    exit_code: inspected.exit_code.unwrap_or(-1),
                    stdout,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(ExecOutcome {
                    exit_code: -1,
                    stdout,
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                labels: labels.clone(),
                ..Default::default()
            })
            .await
            .map_err(runtime_err)?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(runtime_err)
    }

    async fn list_containers_by_label(&self, key: &str, value: &str) -> Result<Vec<String>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{key}={value}")],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(runtime_err)?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| summary.id)
            .collect())
    }

    async fn list_volumes_by_label(&self, key: &str, value: &str) -> Result<Vec<String>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{key}={value}")],
        )]);

        let response = self
            .docker
            .list_volumes(Some(ListVolumesOptions::<String> { filters }))
            .await
            .map_err(runtime_err)?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| volume.name)
            .collect())
    }
}
