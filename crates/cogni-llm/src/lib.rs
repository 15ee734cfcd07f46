//! LLM transport against the internal LiteLLM proxy.
//!
//! This crate owns every byte exchanged with the upstream proxy:
//!
//! - [`LlmClient`]: single-shot and streaming chat completions,
//!   authenticated with the process-wide master key
//! - [`sse`]: incremental server-sent-event decoding
//! - [`deferred`]: the single-settle final used by streaming calls
//! - [`spend`]: bounded scans over the proxy's spend logs
//!
//! Every response is mined for the provider cost and call id; the call id
//! is the idempotency key settlement joins on, so a successful stream
//! without one rejects its final rather than under-bill silently.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod deferred;
pub mod error;
pub mod spend;
pub mod sse;
pub mod types;

pub use client::{CompletionRequest, LlmClient};
pub use deferred::{deferred, Deferred, Promise};
pub use error::{Result, TransportError};
pub use spend::{SpendLogEntry, SpendScan, SPEND_LOGS_MAX_LIMIT};
pub use types::{CompletionOutcome, CALL_ID_HEADER, COST_HEADER};
