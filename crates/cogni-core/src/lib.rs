//! Core types for the cogni execution and billing pipeline.
//!
//! This crate provides the foundational types shared by every stage of the
//! pipeline:
//!
//! - **Identifiers**: `BillingAccountId`, `VirtualKeyId`, `RunId`,
//!   `EntryId`, `TraceId`, `ToolCallId`
//! - **Accounts**: `BillingAccount`, `VirtualKey`
//! - **Ledger**: `LedgerEntry`, `EntryReason`, `ChargeReceipt`
//! - **Runs**: `RunRequest`, `GraphRef`, `GraphFinal`, `AiEvent`
//! - **Usage**: `UsageFact`, `CreditPolicy`
//! - **Errors**: `ExecutionErrorCode` and the shared classifier
//!
//! # Credits
//!
//! Credits are integer units of account; `CreditPolicy` fixes how many
//! credits one USD buys (default 1000). Balances and ledger amounts are
//! `i64` so arithmetic stays exact.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod error;
pub mod event;
pub mod ids;
pub mod ledger;
pub mod message;
pub mod run;
pub mod usage;

pub use account::{BillingAccount, VirtualKey};
pub use error::{ExecutionError, ExecutionErrorCode, Result};
pub use event::AiEvent;
pub use ids::{
    BillingAccountId, EntryId, IdError, RunId, ToolCallId, TraceId, VirtualKeyId,
};
pub use ledger::{ChargeParams, ChargeReceipt, EntryReason, LedgerEntry};
pub use message::{ChatMessage, Role};
pub use run::{FinishReason, GraphFinal, GraphRef, RunCaller, RunRequest, UsageTotals};
pub use usage::{CreditPolicy, ExecutorKind, UsageFact, USAGE_SOURCE_LITELLM};
