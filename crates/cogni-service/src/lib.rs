//! HTTP ingress for the cogni execution and billing pipeline.
//!
//! A deliberately thin crate: it authenticates nothing itself (the edge
//! injects the user header), wires the pipeline from configuration, and
//! projects runs as SSE streams of `AiEvent`s while driving the usage
//! recorder in-band.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::ServiceConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
