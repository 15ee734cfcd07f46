//! Sandbox lifecycle tests against a scripted container runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cogni_core::{
    AiEvent, ChatMessage, CreditPolicy, EntryReason, ExecutionErrorCode, GraphFinal, RunCaller,
    RunId, RunRequest,
};
use cogni_graph::{GraphExecutor, UsageRecorder};
use cogni_ledger::{LedgerStore, RocksLedger};
use cogni_sandbox::{
    ContainerRuntime, ContainerSpec, ExecOutcome, LogCapture, ProxyManager, ProxyTemplate,
    SandboxConfig, SandboxError, SandboxRunner,
};

// ============================================================================
// Scripted runtime
// ============================================================================

#[derive(Clone)]
struct Behavior {
    agent_exit_code: i64,
    agent_runs_forever: bool,
    oom: bool,
    socket_ready_after: usize,
    audit_log: String,
    stdout: String,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            agent_exit_code: 0,
            agent_runs_forever: false,
            oom: false,
            socket_ready_after: 1,
            audit_log: String::new(),
            stdout: "agent output".into(),
        }
    }
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, ContainerSpec>,
    removed_containers: Vec<String>,
    killed: Vec<String>,
    volumes: HashMap<String, HashMap<String, String>>,
    removed_volumes: Vec<String>,
    socket_probes: usize,
}

struct FakeRuntime {
    behavior: Behavior,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            state: Mutex::new(FakeState::default()),
        })
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.containers.insert(spec.name.clone(), spec.clone());
        Ok(spec.name.clone())
    }

    async fn start_container(&self, _id: &str) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, SandboxError> {
        assert!(id.contains("sandbox"), "only the agent container is awaited");
        if self.behavior.agent_runs_forever {
            futures::future::pending::<()>().await;
        }
        Ok(self.behavior.agent_exit_code)
    }

    async fn kill_container(&self, id: &str) -> Result<(), SandboxError> {
        self.state.lock().unwrap().killed.push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), SandboxError> {
        self.state
            .lock()
            .unwrap()
            .removed_containers
            .push(id.to_string());
        Ok(())
    }

    async fn was_oom_killed(&self, _id: &str) -> Result<bool, SandboxError> {
        Ok(self.behavior.oom)
    }

    async fn collect_logs(&self, _id: &str) -> Result<LogCapture, SandboxError> {
        Ok(LogCapture {
            stdout: self.behavior.stdout.clone(),
            stderr: String::new(),
            truncated: false,
        })
    }

    async fn exec(&self, _id: &str, cmd: &[String]) -> Result<ExecOutcome, SandboxError> {
        match cmd.first().map(String::as_str) {
            Some("test") => {
                let mut state = self.state.lock().unwrap();
                state.socket_probes += 1;
                let ready = state.socket_probes >= self.behavior.socket_ready_after;
                Ok(ExecOutcome {
                    exit_code: i64::from(!ready),
                    stdout: String::new(),
                })
            }
            Some("cat") => Ok(ExecOutcome {
                exit_code: 0,
                stdout: self.behavior.audit_log.clone(),
            }),
            other => panic!("unexpected exec: {other:?}"),
        }
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), SandboxError> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), SandboxError> {
        self.state
            .lock()
            .unwrap()
            .removed_volumes
            .push(name.to_string());
        Ok(())
    }

    async fn list_containers_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, SandboxError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|(id, spec)| {
                spec.labels.get(key).map(String::as_str) == Some(value)
                    && !state.removed_containers.contains(*id)
            })
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn list_volumes_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, SandboxError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .volumes
            .iter()
            .filter(|(name, labels)| {
                labels.get(key).map(String::as_str) == Some(value)
                    && !state.removed_volumes.contains(*name)
            })
            .map(|(name, _)| name.clone())
            .collect())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    runtime: Arc<FakeRuntime>,
    runner: SandboxRunner,
    ledger: Arc<RocksLedger>,
    recorder: UsageRecorder,
    _data_dir: tempfile::TempDir,
    _ws_dir: tempfile::TempDir,
}

fn harness(behavior: Behavior) -> Harness {
    let data_dir = tempfile::TempDir::new().unwrap();
    let ws_dir = tempfile::TempDir::new().unwrap();

    let ledger: Arc<RocksLedger> = Arc::new(RocksLedger::open(data_dir.path(), None).unwrap());
    let runtime = FakeRuntime::new(behavior);
    let proxies = Arc::new(ProxyManager::new(
        runtime.clone(),
        ProxyTemplate {
            image: "cogni/llm-proxy:latest".into(),
            upstream_base_url: "http://litellm:4000".into(),
            master_key: "sk-master".into(),
            internal_network: "cogni-internal".into(),
        },
    ));

    let config = SandboxConfig {
        runtime_limit: Duration::from_secs(5),
        workspace_root: ws_dir.path().to_path_buf(),
        ..SandboxConfig::default()
    };

    let runner = SandboxRunner::new(
        "sandbox",
        runtime.clone(),
        proxies,
        ledger.clone(),
        config,
    )
    .with_agent("coder", "Autonomous coding agent", "cogni/agent-coder:latest");

    let recorder = UsageRecorder::new(ledger.clone(), CreditPolicy::default());

    Harness {
        runtime,
        runner,
        ledger,
        recorder,
        _data_dir: data_dir,
        _ws_dir: ws_dir,
    }
}

fn request(harness: &Harness, balance: i64) -> RunRequest {
    let (account, key) = harness
        .ledger
        .get_or_create_account(uuid::Uuid::new_v4())
        .unwrap();
    if balance > 0 {
        harness
            .ledger
            .credit_account(&account.id, balance, EntryReason::Credit, None)
            .unwrap();
    }

    RunRequest {
        run_id: RunId::generate(),
        ingress_request_id: "req-sb".into(),
        graph_id: "sandbox:coder".into(),
        messages: vec![ChatMessage::user("build me a thing")],
        model: None,
        caller: RunCaller {
            billing_account_id: account.id,
            virtual_key_id: key.id,
            trace_id: None,
            session_id: None,
            user_id: None,
            mask_content: false,
        },
        tool_ids: None,
        cancel: CancellationToken::new(),
    }
}

async fn drain(harness: &Harness, mut handle: cogni_graph::RunHandle) -> (Vec<AiEvent>, GraphFinal) {
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        harness.recorder.observe_event(&event);
        events.push(event);
    }
    (events, handle.final_rx.wait().await.unwrap())
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn audit_entries_become_usage_reports_and_receipts() {
    let harness = harness(Behavior {
        audit_log: "litellm_call_id=gen-1 litellm_response_cost=0.002 status=200\n\
                    litellm_call_id=gen-2 litellm_response_cost=- status=200\n"
            .into(),
        ..Behavior::default()
    });

    let req = request(&harness, 100);
    let account_id = req.caller.billing_account_id;
    let handle = harness.runner.run_graph(req).await;
    let (events, final_value) = drain(&harness, handle).await;

    let facts: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            AiEvent::UsageReport { fact } => Some(fact),
            _ => None,
        })
        .collect();
    assert_eq!(facts.len(), 2);
    assert_eq!(facts[0].usage_unit_id, "gen-1");
    assert_eq!(facts[0].cost_usd, Some(0.002));
    assert_eq!(facts[1].usage_unit_id, "gen-2");
    assert_eq!(facts[1].cost_usd, None);

    assert!(final_value.is_ok());
    assert_eq!(final_value.content(), Some("agent output"));

    // Both settled as receipts; the costless one has a null cost column
    // and a zero-credit debit.
    let first = harness.ledger.find_receipt("gen-1").unwrap().unwrap();
    assert_eq!(first.charged_credits, 2);
    let second = harness.ledger.find_receipt("gen-2").unwrap().unwrap();
    assert_eq!(second.charged_credits, 0);
    assert_eq!(second.provider_cost_usd, None);

    assert_eq!(harness.ledger.get_balance(&account_id).unwrap(), 98);
}

#[tokio::test]
async fn zero_llm_calls_is_a_clean_run() {
    let harness = harness(Behavior::default());

    let handle = harness.runner.run_graph(request(&harness, 100)).await;
    let (events, final_value) = drain(&harness, handle).await;

    assert!(!events
        .iter()
        .any(|e| matches!(e, AiEvent::UsageReport { .. })));
    assert!(final_value.is_ok());
}

#[tokio::test]
async fn audit_traffic_without_billables_fails_the_run() {
    let harness = harness(Behavior {
        audit_log: "litellm_call_id=- status=502\nlitellm_call_id=- status=502\n".into(),
        ..Behavior::default()
    });

    let handle = harness.runner.run_graph(request(&harness, 100)).await;
    let (events, final_value) = drain(&harness, handle).await;

    assert!(events
        .iter()
        .any(|e| matches!(e, AiEvent::Error { code: ExecutionErrorCode::Internal, .. })));
    assert_eq!(final_value.error_code(), Some(ExecutionErrorCode::Internal));
}

#[tokio::test]
async fn runtime_limit_kills_and_cleans_up() {
    let mut behavior = Behavior {
        agent_runs_forever: true,
        ..Behavior::default()
    };
    behavior.stdout = "partial".into();
    let mut harness = harness(behavior);

    // Shrink the limit for the test.
    let config = SandboxConfig {
        runtime_limit: Duration::from_millis(50),
        workspace_root: harness._ws_dir.path().to_path_buf(),
        ..SandboxConfig::default()
    };
    harness.runner = SandboxRunner::new(
        "sandbox",
        harness.runtime.clone(),
        Arc::new(ProxyManager::new(
            harness.runtime.clone(),
            ProxyTemplate {
                image: "cogni/llm-proxy:latest".into(),
                upstream_base_url: "http://litellm:4000".into(),
                master_key: "sk-master".into(),
                internal_network: "cogni-internal".into(),
            },
        )),
        harness.ledger.clone(),
        config,
    )
    .with_agent("coder", "Autonomous coding agent", "cogni/agent-coder:latest");

    let req = request(&harness, 100);
    let run_id = req.run_id;
    let handle = harness.runner.run_graph(req).await;
    let (_events, final_value) = drain(&harness, handle).await;

    assert_eq!(final_value.error_code(), Some(ExecutionErrorCode::Timeout));

    let state = harness.runtime.state.lock().unwrap();
    let sandbox_name = format!("cogni-sandbox-{run_id}");
    let proxy_name = format!("cogni-proxy-{run_id}");
    assert!(state.killed.contains(&sandbox_name));
    assert!(state.removed_containers.contains(&sandbox_name));
    assert!(state.removed_containers.contains(&proxy_name));
    assert!(state.removed_volumes.contains(&proxy_name));
}

#[tokio::test]
async fn oom_kill_is_surfaced() {
    let harness = harness(Behavior {
        oom: true,
        agent_exit_code: 137,
        ..Behavior::default()
    });

    let handle = harness.runner.run_graph(request(&harness, 100)).await;
    let (_events, final_value) = drain(&harness, handle).await;

    assert_eq!(final_value.error_code(), Some(ExecutionErrorCode::Internal));
}

#[tokio::test]
async fn readiness_probe_retries_until_socket_appears() {
    let harness = harness(Behavior {
        socket_ready_after: 3,
        ..Behavior::default()
    });

    let handle = harness.runner.run_graph(request(&harness, 100)).await;
    let (_events, final_value) = drain(&harness, handle).await;

    assert!(final_value.is_ok());
    assert!(harness.runtime.state.lock().unwrap().socket_probes >= 3);
}

#[tokio::test]
async fn unready_proxy_fails_and_unwinds() {
    let harness = harness(Behavior {
        socket_ready_after: usize::MAX,
        ..Behavior::default()
    });

    let req = request(&harness, 100);
    let run_id = req.run_id;
    let handle = harness.runner.run_graph(req).await;
    let (_events, final_value) = drain(&harness, handle).await;

    assert_eq!(final_value.error_code(), Some(ExecutionErrorCode::Internal));

    let state = harness.runtime.state.lock().unwrap();
    assert!(state
        .removed_volumes
        .contains(&format!("cogni-proxy-{run_id}")));
}

#[tokio::test]
async fn insolvent_account_never_reaches_the_engine() {
    let harness = harness(Behavior::default());

    let handle = harness.runner.run_graph(request(&harness, 0)).await;
    let (events, final_value) = drain(&harness, handle).await;

    assert!(events.is_empty());
    assert_eq!(
        final_value.error_code(),
        Some(ExecutionErrorCode::InsufficientCredits)
    );
    assert!(harness.runtime.state.lock().unwrap().containers.is_empty());
}

#[tokio::test]
async fn sweep_reaps_labeled_orphans() {
    let harness = harness(Behavior::default());
    let proxies = Arc::new(ProxyManager::new(
        harness.runtime.clone(),
        ProxyTemplate {
            image: "cogni/llm-proxy:latest".into(),
            upstream_base_url: "http://litellm:4000".into(),
            master_key: "sk-master".into(),
            internal_network: "cogni-internal".into(),
        },
    ));

    // A crashed process left a labeled proxy container and volume behind.
    let orphan_labels = HashMap::from([("cogni.role".to_string(), "llm-proxy".to_string())]);
    harness
        .runtime
        .create_container(&ContainerSpec {
            name: "cogni-proxy-orphan".into(),
            image: "cogni/llm-proxy:latest".into(),
            labels: orphan_labels.clone(),
            ..ContainerSpec::default()
        })
        .await
        .unwrap();
    harness
        .runtime
        .create_volume("cogni-proxy-orphan", &orphan_labels)
        .await
        .unwrap();

    let reaped = proxies.sweep_orphans().await.unwrap();
    assert_eq!(reaped, 2);

    let state = harness.runtime.state.lock().unwrap();
    assert!(state
        .removed_containers
        .contains(&"cogni-proxy-orphan".to_string()));
    assert!(state
        .removed_volumes
        .contains(&"cogni-proxy-orphan".to_string()));
}
