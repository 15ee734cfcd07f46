//! Per-run egress proxy lifecycle.
//!
//! Each sandbox run gets its own proxy container on an internal no-egress
//! network. The proxy injects the master key and billing headers (the
//! sandboxed agent is untrusted and never sees either) and appends every
//! outbound call to the audit log that later drives billing. A named
//! volume carries the proxy's unix socket to the sandbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cogni_core::{BillingAccountId, RunId};

use crate::error::{Result, SandboxError};
use crate::runtime::{ContainerRuntime, ContainerSpec};

/// Label key marking proxy containers and volumes for sweep cleanup.
pub const PROXY_ROLE_LABEL_KEY: &str = "cogni.role";

/// Label value for the proxy role.
pub const PROXY_ROLE_LABEL_VALUE: &str = "llm-proxy";

/// Label key carrying the owning run id.
pub const PROXY_RUN_LABEL_KEY: &str = "cogni.run-id";

/// Audit log path inside the proxy container.
///
/// Not `/var/log/nginx/access.log`: the base image symlinks that to stdout
/// and the log would vanish with the container.
pub const AUDIT_LOG_PATH: &str = "/var/log/llm-proxy/audit.log";

/// Directory the socket volume mounts at inside the proxy.
pub const PROXY_SOCKET_DIR: &str = "/sockets";

/// The proxy's listening unix socket.
pub const PROXY_SOCKET_PATH: &str = "/sockets/llm-proxy.sock";

/// Readiness backoff schedule in milliseconds.
const READINESS_BACKOFF_MS: [u64; 5] = [50, 100, 200, 400, 800];

/// Proxy container template.
#[derive(Debug, Clone)]
pub struct ProxyTemplate {
    /// Proxy image reference.
    pub image: String,

    /// Upstream LiteLLM base URL the proxy forwards to.
    pub upstream_base_url: String,

    /// Process-wide master key the proxy injects upstream.
    pub master_key: String,

    /// Internal network with no egress except the upstream.
    pub internal_network: String,
}

/// A live per-run proxy.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    /// The owning run.
    pub run_id: RunId,

    /// Proxy container id.
    pub container_id: String,

    /// Named volume carrying the proxy socket.
    pub socket_volume: String,
}

/// Process-wide manager of per-run proxies.
///
/// The run → proxy map is inserted before container start and cleared in
/// stop, so a crash window leaves a labeled orphan the startup sweep can
/// find.
pub struct ProxyManager {
    runtime: Arc<dyn ContainerRuntime>,
    template: ProxyTemplate,
    active: Mutex<HashMap<RunId, ProxyHandle>>,
}

impl ProxyManager {
    /// Create a manager from a template.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, template: ProxyTemplate) -> Self {
        Self {
            runtime,
            template,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live proxies.
    ///
    /// # Panics
    ///
    /// Panics if the map lock is poisoned.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().expect("proxy map").len()
    }

    /// Launch and ready-check the proxy for a run.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine fails or the socket never appears.
    pub async fn start_proxy(
        &self,
        run_id: RunId,
        billing_account_id: BillingAccountId,
        graph_id: &str,
    ) -> Result<ProxyHandle> {
        let socket_volume = format!("cogni-proxy-{run_id}");
        let labels = HashMap::from([
            (
                PROXY_ROLE_LABEL_KEY.to_string(),
                PROXY_ROLE_LABEL_VALUE.to_string(),
            ),
            (PROXY_RUN_LABEL_KEY.to_string(), run_id.to_string()),
        ]);

        self.runtime.create_volume(&socket_volume, &labels).await?;

        let metadata = serde_json::json!({
            "run_id": run_id,
            "attempt": 0,
            "graph_id": graph_id,
        });

        let spec = ContainerSpec {
            name: format!("cogni-proxy-{run_id}"),
            image: self.template.image.clone(),
            cmd: None,
            env: vec![
                format!("UPSTREAM_BASE_URL={}", self.template.upstream_base_url),
                format!("LITELLM_MASTER_KEY={}", self.template.master_key),
                // The proxy injects this header; it is never trusted from
                // inside the sandbox.
                format!("BILLING_ACCOUNT_HEADER=x-cogni-billing-account: {billing_account_id}"),
                format!("CALL_METADATA_JSON={metadata}"),
                format!("AUDIT_LOG_PATH={AUDIT_LOG_PATH}"),
                format!("LISTEN_SOCKET={PROXY_SOCKET_PATH}"),
            ],
            labels,
            binds: vec![format!("{socket_volume}:{PROXY_SOCKET_DIR}")],
            network_mode: Some(self.template.internal_network.clone()),
            ..Default::default()
        };

        let handle = ProxyHandle {
            run_id,
            container_id: String::new(),
            socket_volume: socket_volume.clone(),
        };
        // Registered before start: a crash between here and stop leaves a
        // findable record.
        self.active
            .lock()
            .expect("proxy map")
            .insert(run_id, handle);

        let started = async {
            let container_id = self.runtime.create_container(&spec).await?;
            self.active
                .lock()
                .expect("proxy map")
                .entry(run_id)
                .and_modify(|entry| entry.container_id = container_id.clone());
            self.runtime.start_container(&container_id).await?;
            self.wait_ready(&container_id).await?;
            Ok::<String, SandboxError>(container_id)
        }
        .await;

        match started {
            Ok(container_id) => {
                tracing::info!(run_id = %run_id, container = %container_id, "Proxy ready");
                Ok(ProxyHandle {
                    run_id,
                    container_id,
                    socket_volume,
                })
            }
            Err(e) => {
                // Unwind the partial start.
                if let Err(cleanup) = self.stop_proxy_internal(run_id, false).await {
                    tracing::warn!(run_id = %run_id, error = %cleanup, "Proxy unwind failed");
                }
                Err(e)
            }
        }
    }

    /// Prove the proxy socket is accepting connections.
    async fn wait_ready(&self, container_id: &str) -> Result<()> {
        for (attempt, delay_ms) in READINESS_BACKOFF_MS.iter().enumerate() {
            tokio::time::sleep(Duration::from_millis(*delay_ms)).await;

            let probe = self
                .runtime
                .exec(
                    container_id,
                    &[
                        "test".to_string(),
                        "-S".to_string(),
                        PROXY_SOCKET_PATH.to_string(),
                    ],
                )
                .await?;

            if probe.exit_code == 0 {
                return Ok(());
            }
            tracing::debug!(container = %container_id, attempt, "Proxy socket not ready yet");
        }

        Err(SandboxError::ProxyNotReady {
            attempts: READINESS_BACKOFF_MS.len(),
        })
    }

    /// Export the run's audit log, stop the proxy, and destroy its volume.
    ///
    /// The audit content comes back even when cleanup partially fails;
    /// billing needs it more than the engine needs tidiness.
    ///
    /// # Errors
    ///
    /// Returns an error when no proxy is registered for the run or the
    /// audit export fails.
    pub async fn stop_proxy(&self, run_id: RunId) -> Result<String> {
        let audit = self.stop_proxy_internal(run_id, true).await?;
        Ok(audit.unwrap_or_default())
    }

    async fn stop_proxy_internal(
        &self,
        run_id: RunId,
        export_audit: bool,
    ) -> Result<Option<String>> {
        let handle = self
            .active
            .lock()
            .expect("proxy map")
            .remove(&run_id)
            .ok_or_else(|| SandboxError::ProxyMissing {
                run_id: run_id.to_string(),
            })?;

        let mut audit = None;
        let mut export_err = None;

        if !handle.container_id.is_empty() {
            if export_audit {
                match self
                    .runtime
                    .exec(
                        &handle.container_id,
                        &["cat".to_string(), AUDIT_LOG_PATH.to_string()],
                    )
                    .await
                {
                    Ok(outcome) if outcome.exit_code == 0 => audit = Some(outcome.stdout),
                    Ok(outcome) => {
                        export_err = Some(SandboxError::Runtime(format!(
                            "audit export exited {}",
                            outcome.exit_code
                        )));
                    }
                    Err(e) => export_err = Some(e),
                }
            }

            if let Err(e) = self.runtime.remove_container(&handle.container_id).await {
                tracing::warn!(run_id = %run_id, error = %e, "Proxy container removal failed");
            }
        }

        if let Err(e) = self.runtime.remove_volume(&handle.socket_volume).await {
            tracing::warn!(run_id = %run_id, error = %e, "Proxy volume removal failed");
        }

        match export_err {
            Some(e) => Err(e),
            None => Ok(audit),
        }
    }

    /// Reap proxies and volumes orphaned by crashed processes.
    ///
    /// Run at startup; matches on the role label, not the process map.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine listing fails.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let mut reaped = 0;

        for container_id in self
            .runtime
            .list_containers_by_label(PROXY_ROLE_LABEL_KEY, PROXY_ROLE_LABEL_VALUE)
            .await?
        {
            match self.runtime.remove_container(&container_id).await {
                Ok(()) => reaped += 1,
                Err(e) => {
                    tracing::warn!(container = %container_id, error = %e, "Orphan container removal failed");
                }
            }
        }

        for volume in self
            .runtime
            .list_volumes_by_label(PROXY_ROLE_LABEL_KEY, PROXY_ROLE_LABEL_VALUE)
            .await?
        {
            match self.runtime.remove_volume(&volume).await {
                Ok(()) => reaped += 1,
                Err(e) => {
                    tracing::warn!(volume = %volume, error = %e, "Orphan volume removal failed");
                }
            }
        }

        if reaped > 0 {
            tracing::info!(reaped, "Swept orphaned proxy resources");
        }
        Ok(reaped)
    }
}
