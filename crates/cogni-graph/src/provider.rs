//! Graph executor and provider traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cogni_core::RunRequest;

use crate::stream::RunHandle;

/// A catalog entry describing one runnable graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphCatalogEntry {
    /// Namespaced graph id (`<provider>:<graph>`).
    pub graph_id: String,

    /// Human-readable description.
    pub description: String,
}

/// Anything that can execute a run: a provider, the aggregator, or a
/// decorator around either.
#[async_trait]
pub trait GraphExecutor: Send + Sync {
    /// Execute a run, producing its `(stream, final)` pair.
    async fn run_graph(&self, request: RunRequest) -> RunHandle;

    /// The graphs this executor can run.
    fn list_graphs(&self) -> Vec<GraphCatalogEntry>;
}

/// A pluggable unit owning one namespace of graph ids.
#[async_trait]
pub trait GraphProvider: GraphExecutor {
    /// The namespace this provider owns (the part before the colon).
    fn provider_id(&self) -> &str;

    /// Whether this provider claims the graph id.
    fn can_handle(&self, graph_id: &str) -> bool;
}
