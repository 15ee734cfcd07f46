//! Application state: the wired pipeline.

use std::sync::Arc;

use cogni_core::CreditPolicy;
use cogni_graph::{
    AggregatingExecutor, CompletionUnit, GraphExecutor, GraphProvider, HttpTraceSink,
    InProcessRunner, NoopTraceSink, ObservedExecutor, SingleStepGraph, ToolRegistry, TraceSink,
    UsageRecorder,
};
use cogni_ledger::RocksLedger;
use cogni_llm::LlmClient;
use cogni_sandbox::{
    DockerRuntime, ProxyManager, ProxyTemplate, SandboxConfig, SandboxRunner,
};

use crate::config::ServiceConfig;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The credit ledger.
    pub ledger: Arc<RocksLedger>,

    /// The decorated executor stack.
    pub executor: Arc<ObservedExecutor>,

    /// Settles usage facts from run streams.
    pub recorder: UsageRecorder,

    /// Per-run proxy manager, present when the sandbox provider is on.
    pub proxies: Option<Arc<ProxyManager>>,

    /// Service configuration.
    pub config: ServiceConfig,
}

impl AppState {
    /// Wire the pipeline from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the ledger cannot be opened.
    pub fn new(config: ServiceConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let policy = CreditPolicy {
            credits_per_usd: config.credits_per_usd,
        };

        let ledger: Arc<RocksLedger> = Arc::new(RocksLedger::open(
            &config.database_url,
            config.settlement_floor,
        )?);

        let master_key = config.litellm_master_key.clone().unwrap_or_default();
        if master_key.is_empty() {
            tracing::warn!("LITELLM_MASTER_KEY not set - upstream calls will be rejected");
        }
        let llm = Arc::new(LlmClient::new(config.litellm_base_url.clone(), master_key));

        let unit = CompletionUnit::new(llm, ledger.clone(), policy);
        let runner = InProcessRunner::new(
            "langgraph",
            unit,
            Arc::new(ToolRegistry::new()),
            config.default_model.clone(),
        )
        .with_graph("poet", "Writes poems", || Arc::new(SingleStepGraph))
        .with_graph("chat", "Single-turn chat completion", || {
            Arc::new(SingleStepGraph)
        });

        let mut providers: Vec<Arc<dyn GraphProvider>> = vec![Arc::new(runner)];

        // Sandbox provider is opt-in; a missing engine degrades to the
        // in-process catalog with a warning.
        let proxies = if config.sandbox_enabled {
            match DockerRuntime::connect() {
                Ok(runtime) => {
                    let runtime = Arc::new(runtime);
                    let proxies = Arc::new(ProxyManager::new(
                        runtime.clone(),
                        ProxyTemplate {
                            image: config.sandbox_proxy_image.clone(),
                            upstream_base_url: config.litellm_base_url.clone(),
                            master_key: config
                                .litellm_master_key
                                .clone()
                                .unwrap_or_default(),
                            internal_network: config.sandbox_internal_network.clone(),
                        },
                    ));

                    let sandbox = SandboxRunner::new(
                        "sandbox",
                        runtime,
                        proxies.clone(),
                        ledger.clone(),
                        SandboxConfig {
                            runtime_limit: config.sandbox_runtime_limit,
                            workspace_root: config.sandbox_workspace_root.clone().into(),
                            ..SandboxConfig::default()
                        },
                    )
                    .with_agent(
                        "coder",
                        "Autonomous coding agent",
                        config.sandbox_agent_image.clone(),
                    );

                    providers.push(Arc::new(sandbox));
                    tracing::info!("Sandbox provider enabled");
                    Some(proxies)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Docker engine unreachable - sandbox disabled");
                    None
                }
            }
        } else {
            None
        };

        let aggregator: Arc<dyn GraphExecutor> =
            Arc::new(AggregatingExecutor::new(providers));

        let sink: Arc<dyn TraceSink> = match (
            &config.langfuse_base_url,
            &config.langfuse_public_key,
            &config.langfuse_secret_key,
        ) {
            (Some(url), Some(public_key), Some(secret_key)) => {
                tracing::info!(langfuse_url = %url, "Langfuse trace sink enabled");
                Arc::new(HttpTraceSink::new(url, public_key, secret_key))
            }
            _ => {
                tracing::warn!("Langfuse not configured - traces will be dropped");
                Arc::new(NoopTraceSink)
            }
        };

        let executor = Arc::new(ObservedExecutor::new(aggregator, sink));
        let recorder = UsageRecorder::new(ledger.clone(), policy);

        Ok(Self {
            ledger,
            executor,
            recorder,
            proxies,
            config,
        })
    }

    /// Reap proxy resources orphaned by a previous crash.
    pub async fn sweep_orphans(&self) {
        if let Some(proxies) = &self.proxies {
            match proxies.sweep_orphans().await {
                Ok(reaped) => {
                    tracing::info!(reaped, "Startup proxy sweep complete");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Startup proxy sweep failed");
                }
            }
        }
    }
}
