//! The aggregating executor: namespace-prefixed routing over providers.

use std::sync::Arc;

use async_trait::async_trait;

use cogni_core::RunRequest;

use crate::provider::{GraphCatalogEntry, GraphExecutor, GraphProvider};
use crate::stream::{error_run, RunHandle};

/// Routes each run to the first provider claiming its graph id.
pub struct AggregatingExecutor {
    providers: Vec<Arc<dyn GraphProvider>>,
}

impl AggregatingExecutor {
    /// Build an executor over an ordered provider list. Registration order
    /// is dispatch precedence: the first match wins.
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn GraphProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl GraphExecutor for AggregatingExecutor {
    async fn run_graph(&self, request: RunRequest) -> RunHandle {
        for provider in &self.providers {
            if provider.can_handle(&request.graph_id) {
                return provider.run_graph(request).await;
            }
        }

        tracing::error!(
            graph_id = %request.graph_id,
            run_id = %request.run_id,
            "No provider for graph"
        );
        error_run(
            request.run_id,
            request.ingress_request_id,
            cogni_core::ExecutionErrorCode::Internal,
            format!("no provider for graph: {}", request.graph_id),
        )
    }

    fn list_graphs(&self) -> Vec<GraphCatalogEntry> {
        self.providers
            .iter()
            .flat_map(|provider| provider.list_graphs())
            .collect()
    }
}
