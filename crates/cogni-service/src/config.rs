//! Service configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Ledger database location (default: "/data/cogni-ledger").
    pub database_url: String,

    /// LiteLLM proxy base URL (default: `http://localhost:4000`).
    pub litellm_base_url: String,

    /// Process-wide master key for the proxy.
    pub litellm_master_key: Option<String>,

    /// Service name reported in telemetry.
    pub otel_service_name: String,

    /// Langfuse host (optional trace sink).
    pub langfuse_base_url: Option<String>,

    /// Langfuse public key.
    pub langfuse_public_key: Option<String>,

    /// Langfuse secret key.
    pub langfuse_secret_key: Option<String>,

    /// Credits per USD.
    pub credits_per_usd: i64,

    /// Optional settlement floor; `None` preserves the never-fail-settled
    /// behavior.
    pub settlement_floor: Option<i64>,

    /// Default model for in-process graphs.
    pub default_model: String,

    /// Admin key for credit grants.
    pub admin_api_key: Option<String>,

    /// Whether the sandbox provider is enabled.
    pub sandbox_enabled: bool,

    /// Agent image for the sandbox catalog.
    pub sandbox_agent_image: String,

    /// Egress proxy image.
    pub sandbox_proxy_image: String,

    /// Internal no-egress network for proxies.
    pub sandbox_internal_network: String,

    /// Wall-clock limit per sandbox run.
    pub sandbox_runtime_limit: Duration,

    /// Host directory for per-run workspaces.
    pub sandbox_workspace_root: String,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout for non-streaming endpoints, in seconds.
    pub request_timeout_seconds: u64,
}

/// LiteLLM secrets file structure.
#[derive(Debug, Deserialize)]
struct LitellmSecrets {
    #[serde(default)]
    base_url: Option<String>,
    master_key: String,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let (secret_base_url, secret_master_key) = load_litellm_secrets();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "/data/cogni-ledger".into()),
            litellm_base_url: std::env::var("LITELLM_BASE_URL")
                .ok()
                .or(secret_base_url)
                .unwrap_or_else(|| "http://localhost:4000".into()),
            litellm_master_key: std::env::var("LITELLM_MASTER_KEY").ok().or(secret_master_key),
            otel_service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "cogni-core".into()),
            langfuse_base_url: std::env::var("LANGFUSE_BASE_URL").ok(),
            langfuse_public_key: std::env::var("LANGFUSE_PUBLIC_KEY").ok(),
            langfuse_secret_key: std::env::var("LANGFUSE_SECRET_KEY").ok(),
            credits_per_usd: std::env::var("CREDITS_PER_USD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            settlement_floor: std::env::var("SETTLEMENT_FLOOR_CREDITS")
                .ok()
                .and_then(|s| s.parse().ok()),
            default_model: std::env::var("DEFAULT_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".into()),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            sandbox_enabled: std::env::var("SANDBOX_ENABLED")
                .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            sandbox_agent_image: std::env::var("SANDBOX_AGENT_IMAGE")
                .unwrap_or_else(|_| "cogni/agent-coder:latest".into()),
            sandbox_proxy_image: std::env::var("SANDBOX_PROXY_IMAGE")
                .unwrap_or_else(|_| "cogni/llm-proxy:latest".into()),
            sandbox_internal_network: std::env::var("SANDBOX_INTERNAL_NETWORK")
                .unwrap_or_else(|_| "cogni-internal".into()),
            sandbox_runtime_limit: Duration::from_secs(
                std::env::var("SANDBOX_RUNTIME_LIMIT_SECONDS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            sandbox_workspace_root: std::env::var("SANDBOX_WORKSPACE_ROOT")
                .unwrap_or_else(|_| "/var/lib/cogni/workspaces".into()),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: std::env::var("MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1024 * 1024), // 1MB
            request_timeout_seconds: std::env::var("REQUEST_TIMEOUT_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Load LiteLLM secrets from file or environment.
fn load_litellm_secrets() -> (Option<String>, Option<String>) {
    let secret_paths = [
        ".secrets/litellm.json",
        "cogni/.secrets/litellm.json",
        "../.secrets/litellm.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<LitellmSecrets>(path) {
            tracing::info!(path = %path, "Loaded LiteLLM secrets from file");
            return (secrets.base_url, Some(secrets.master_key));
        }
    }

    tracing::debug!("LiteLLM secrets file not found, using environment variables");
    (None, None)
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: "/data/cogni-ledger".into(),
            litellm_base_url: "http://localhost:4000".into(),
            litellm_master_key: None,
            otel_service_name: "cogni-core".into(),
            langfuse_base_url: None,
            langfuse_public_key: None,
            langfuse_secret_key: None,
            credits_per_usd: 1000,
            settlement_floor: None,
            default_model: "gpt-4o-mini".into(),
            admin_api_key: None,
            sandbox_enabled: false,
            sandbox_agent_image: "cogni/agent-coder:latest".into(),
            sandbox_proxy_image: "cogni/llm-proxy:latest".into(),
            sandbox_internal_network: "cogni-internal".into(),
            sandbox_runtime_limit: Duration::from_secs(300),
            sandbox_workspace_root: "/var/lib/cogni/workspaces".into(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        }
    }
}
