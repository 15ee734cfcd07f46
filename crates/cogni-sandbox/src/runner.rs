//! The sandbox runner: one hardened container per run, billed by audit.
//!
//! The agent inside the container is untrusted. It gets no network, a
//! read-only rootfs, a dropped capability set, and a socket-bridged path
//! to the per-run egress proxy as its only way out. The proxy's audit log
//! is the billing authority; usage facts are derived from it after the
//! container stops, whatever the agent claimed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use cogni_core::{
    AiEvent, ExecutionError, ExecutorKind, FinishReason, GraphFinal, GraphRef, RunRequest,
    UsageFact, USAGE_SOURCE_LITELLM,
};
use cogni_graph::stream::RUN_EVENT_BUFFER;
use cogni_graph::{error_run, GraphCatalogEntry, GraphExecutor, GraphProvider, RunHandle};
use cogni_ledger::{LedgerError, LedgerStore};
use cogni_llm::deferred;

use crate::audit::parse_audit_log;
use crate::error::{Result, SandboxError};
use crate::proxy::{ProxyHandle, ProxyManager, PROXY_SOCKET_DIR};
use crate::runtime::{ContainerRuntime, ContainerSpec, LogCapture};

/// Sandbox hardening and resource knobs.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock limit per run.
    pub runtime_limit: Duration,

    /// Memory limit in bytes.
    pub memory_bytes: i64,

    /// Process count limit.
    pub pids_limit: i64,

    /// Host directory holding per-run workspaces.
    pub workspace_root: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_limit: Duration::from_secs(300),
            memory_bytes: 512 * 1024 * 1024,
            pids_limit: 128,
            workspace_root: PathBuf::from("/var/lib/cogni/workspaces"),
        }
    }
}

struct AgentEntry {
    description: String,
    image: String,
}

/// How the agent container ended.
enum AgentStatus {
    Exited(i64),
    TimedOut,
    Aborted,
}

/// What the agent run left behind.
struct AgentObservation {
    logs: LogCapture,
    oom_killed: bool,
    status: AgentStatus,
}

/// Sandboxed agent provider.
pub struct SandboxRunner {
    provider_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    proxies: Arc<ProxyManager>,
    ledger: Arc<dyn LedgerStore>,
    config: SandboxConfig,
    catalog: HashMap<String, AgentEntry>,
}

impl SandboxRunner {
    /// Create a runner owning the given namespace.
    #[must_use]
    pub fn new(
        provider_id: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        proxies: Arc<ProxyManager>,
        ledger: Arc<dyn LedgerStore>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            runtime,
            proxies,
            ledger,
            config,
            catalog: HashMap::new(),
        }
    }

    /// Add an agent image to the catalog.
    #[must_use]
    pub fn with_agent(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        self.catalog.insert(
            name.into(),
            AgentEntry {
                description: description.into(),
                image: image.into(),
            },
        );
        self
    }
}

/// Run the agent container and derive billing from the proxy audit.
async fn execute_run(
    runtime: Arc<dyn ContainerRuntime>,
    proxies: Arc<ProxyManager>,
    config: SandboxConfig,
    request: RunRequest,
    image: String,
    events: mpsc::Sender<AiEvent>,
) -> Result<String> {
    let run_id = request.run_id;

    let proxy = proxies
        .start_proxy(
            run_id,
            request.caller.billing_account_id,
            &request.graph_id,
        )
        .await?;

    let mut sandbox_id: Option<String> = None;
    let run_result =
        drive_agent(&runtime, &config, &request, &image, &proxy, &mut sandbox_id).await;

    // Cleanup and billing always run, whatever the agent did. The sandbox
    // container goes first, then the proxy (which exports the audit log on
    // the way down).
    if let Some(id) = sandbox_id {
        if let Err(e) = runtime.remove_container(&id).await {
            tracing::warn!(run_id = %run_id, error = %e, "Sandbox container removal failed");
        }
    }

    let audit = match proxies.stop_proxy(run_id).await {
        Ok(content) => Some(content),
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "Audit export failed");
            None
        }
    };

    // Billing first: the agent may have consumed calls before it timed
    // out, was killed, or crashed, and those calls are real money.
    let audit_empty = if let Some(audit) = &audit {
        let report = parse_audit_log(audit, Some(&run_id.to_string()));
        for entry in &report.entries {
            let fact = UsageFact {
                run_id,
                attempt: 0,
                source: USAGE_SOURCE_LITELLM.to_string(),
                executor: ExecutorKind::Sandbox,
                billing_account_id: request.caller.billing_account_id,
                virtual_key_id: request.caller.virtual_key_id,
                graph_id: request.graph_id.clone(),
                input_tokens: None,
                output_tokens: None,
                usage_unit_id: entry.provider_call_id.clone(),
                model: None,
                cost_usd: entry.cost_usd,
            };
            if events.send(AiEvent::UsageReport { fact }).await.is_err() {
                tracing::warn!(run_id = %run_id, "Sandbox usage report had no audience");
            }
        }
        (report.lines > 0 && report.entries.is_empty()).then_some(report.lines)
    } else {
        None
    };

    let observation = run_result?;

    if audit.is_none() {
        // The agent ran but billing evidence is gone; failing the run
        // beats silently under-billing.
        return Err(SandboxError::Runtime("audit export failed".into()));
    }

    if let Some(lines) = audit_empty {
        return Err(SandboxError::AuditEmpty { lines });
    }

    if observation.oom_killed {
        return Err(SandboxError::OomKilled);
    }

    match observation.status {
        AgentStatus::TimedOut => Err(SandboxError::RuntimeLimit),
        AgentStatus::Aborted => Err(SandboxError::Aborted),
        AgentStatus::Exited(0) => Ok(observation.logs.stdout),
        AgentStatus::Exited(exit_code) => {
            tracing::warn!(
                run_id = %run_id,
                exit_code,
                stderr = %observation.logs.stderr,
                "Agent exited non-zero"
            );
            Err(SandboxError::NonZeroExit { exit_code })
        }
    }
}

/// Create, start, and wait out the agent container.
async fn drive_agent(
    runtime: &Arc<dyn ContainerRuntime>,
    config: &SandboxConfig,
    request: &RunRequest,
    image: &str,
    proxy: &ProxyHandle,
    sandbox_id: &mut Option<String>,
) -> Result<AgentObservation> {
    let run_id = request.run_id;

    let workspace = config.workspace_root.join(run_id.to_string());
    tokio::fs::create_dir_all(&workspace).await?;
    tokio::fs::write(
        workspace.join("input.json"),
        serde_json::to_vec(&request.messages).unwrap_or_default(),
    )
    .await?;

    let spec = ContainerSpec {
        name: format!("cogni-sandbox-{run_id}"),
        image: image.to_string(),
        cmd: None,
        env: vec![
            // The agent speaks OpenAI wire over a local bridge that
            // tunnels into the proxy's unix socket.
            "OPENAI_BASE_URL=http://127.0.0.1:8790/v1".to_string(),
            format!("COGNI_PROXY_SOCKET={PROXY_SOCKET_DIR}/llm-proxy.sock"),
            format!("COGNI_RUN_ID={run_id}"),
            format!("COGNI_GRAPH_ID={}", request.graph_id),
        ],
        labels: HashMap::from([(
            "cogni.role".to_string(),
            "sandbox-agent".to_string(),
        )]),
        binds: vec![
            format!("{}:/workspace:rw", workspace.display()),
            format!("{}:{PROXY_SOCKET_DIR}:ro", proxy.socket_volume),
        ],
        network_mode: Some("none".to_string()),
        read_only_rootfs: true,
        tmpfs: HashMap::from([
            ("/tmp".to_string(), "rw,size=64m".to_string()),
            ("/run".to_string(), "rw,size=16m".to_string()),
        ]),
        cap_drop_all: true,
        no_new_privileges: true,
        pids_limit: Some(config.pids_limit),
        memory_bytes: Some(config.memory_bytes),
        user: Some("1000:1000".to_string()),
        working_dir: Some("/workspace".to_string()),
    };

    let container_id = runtime.create_container(&spec).await?;
    *sandbox_id = Some(container_id.clone());
    runtime.start_container(&container_id).await?;

    let status = tokio::select! {
        code = runtime.wait_container(&container_id) => AgentStatus::Exited(code?),
        () = tokio::time::sleep(config.runtime_limit) => {
            tracing::warn!(run_id = %run_id, "Sandbox hit its runtime limit; killing");
            if let Err(e) = runtime.kill_container(&container_id).await {
                tracing::warn!(error = %e, "Kill after timeout failed");
            }
            AgentStatus::TimedOut
        }
        () = request.cancel.cancelled() => {
            if let Err(e) = runtime.kill_container(&container_id).await {
                tracing::warn!(error = %e, "Kill after cancel failed");
            }
            AgentStatus::Aborted
        }
    };

    // Partial logs are still collected after a kill.
    let logs = runtime.collect_logs(&container_id).await?;
    let oom_killed = runtime.was_oom_killed(&container_id).await?;

    Ok(AgentObservation {
        logs,
        oom_killed,
        status,
    })
}

#[async_trait]
impl GraphExecutor for SandboxRunner {
    async fn run_graph(&self, request: RunRequest) -> RunHandle {
        let run_id = request.run_id;
        let request_id = request.ingress_request_id.clone();

        let graph_ref = match GraphRef::parse(&request.graph_id) {
            Ok(graph_ref) => graph_ref,
            Err(e) => {
                let code = e.code();
                return error_run(run_id, request_id, code, e.to_string());
            }
        };

        let Some(entry) = self.catalog.get(&graph_ref.graph) else {
            let e = ExecutionError::GraphNotFound {
                graph_id: request.graph_id.clone(),
            };
            let code = e.code();
            return error_run(run_id, request_id, code, e.to_string());
        };
        let image = entry.image.clone();

        // Pre-run gate: the audit path settles after the fact, so an
        // insolvent account is stopped before the container ever starts.
        let gate = self.ledger.debit_for_usage(
            &request.caller.billing_account_id,
            &request.caller.virtual_key_id,
            0,
            &request.ingress_request_id,
            serde_json::Value::Null,
        );
        if let Err(e) = gate {
            let error = match e {
                LedgerError::InsufficientCredits { balance, attempted } => {
                    ExecutionError::InsufficientCredits { balance, attempted }
                }
                other => ExecutionError::Internal(other.to_string()),
            };
            let (final_tx, final_rx) = deferred();
            final_tx.settle(GraphFinal::Failed {
                run_id,
                request_id,
                error: error.code(),
            });
            let (_tx, events) = mpsc::channel(1);
            return RunHandle { events, final_rx };
        }

        let (tx, rx) = mpsc::channel(RUN_EVENT_BUFFER);
        let (final_tx, final_rx) = deferred();

        let runtime = self.runtime.clone();
        let proxies = self.proxies.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let result =
                execute_run(runtime, proxies, config, request, image, tx.clone()).await;

            match result {
                Ok(content) => {
                    let _ = tx
                        .send(AiEvent::AssistantFinal {
                            content: content.clone(),
                        })
                        .await;
                    let _ = tx.send(AiEvent::Done).await;
                    final_tx.settle(GraphFinal::Completed {
                        run_id,
                        request_id,
                        usage: None,
                        finish_reason: FinishReason::Stop,
                        content: Some(content),
                    });
                }
                Err(e) => {
                    let error = e.to_execution();
                    let code = error.code();
                    let _ = tx
                        .send(AiEvent::Error {
                            code,
                            message: e.to_string(),
                        })
                        .await;
                    let _ = tx.send(AiEvent::Done).await;
                    final_tx.settle(GraphFinal::Failed {
                        run_id,
                        request_id,
                        error: code,
                    });
                }
            }
        });

        RunHandle { events: rx, final_rx }
    }

    fn list_graphs(&self) -> Vec<GraphCatalogEntry> {
        let mut graphs: Vec<_> = self
            .catalog
            .iter()
            .map(|(name, entry)| GraphCatalogEntry {
                graph_id: format!("{}:{name}", self.provider_id),
                description: entry.description.clone(),
            })
            .collect();
        graphs.sort_by(|a, b| a.graph_id.cmp(&b.graph_id));
        graphs
    }
}

#[async_trait]
impl GraphProvider for SandboxRunner {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn can_handle(&self, graph_id: &str) -> bool {
        graph_id
            .split_once(':')
            .is_some_and(|(provider, _)| provider == self.provider_id)
    }
}
