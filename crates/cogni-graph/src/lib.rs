//! Graph execution pipeline.
//!
//! This crate composes the run-time spine of the platform:
//!
//! - [`unit`]: the completion unit, the only path to the LLM
//! - [`provider`] / [`runner`]: the provider trait and the in-process
//!   graph runner with its catalog and tool execution
//! - [`aggregate`]: namespace-prefixed routing over providers
//! - [`observe`]: the tracing decorator with its once-guard terminal
//! - [`record`]: settlement of usage facts into charge receipts
//!
//! A run flows: aggregator → provider → completion units, with the
//! decorator wrapped around the whole pair and the recorder consuming
//! `usage_report` events off the stream.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod aggregate;
pub mod observe;
pub mod provider;
pub mod record;
pub mod runner;
pub mod stream;
pub mod tools;
pub mod unit;

pub use aggregate::AggregatingExecutor;
pub use observe::{
    HttpTraceSink, NoopTraceSink, ObservedExecutor, Scrubber, TerminalOutcome, TraceSink,
};
pub use provider::{GraphCatalogEntry, GraphExecutor, GraphProvider};
pub use record::UsageRecorder;
pub use runner::{GraphContext, GraphFactory, GraphLogic, InProcessRunner, SingleStepGraph};
pub use stream::{empty_run, error_run, RunHandle};
pub use tools::{
    FieldType, Tool, ToolErrorCode, ToolExecutor, ToolOutcome, ToolPolicy, ToolRegistry,
    ToolSchema,
};
pub use unit::{CompletionUnit, UnitOutcome, UnitParams};
