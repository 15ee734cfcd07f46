//! Credit and ledger read handlers, plus the admin grant.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use cogni_core::{ChargeReceipt, EntryReason, LedgerEntry};
use cogni_ledger::LedgerStore;

use crate::error::ApiError;
use crate::handlers::runs::authenticated_user;
use crate::state::AppState;

/// Admin key header for credit grants.
const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// The billing account id.
    pub account_id: String,

    /// Current balance in credits.
    pub balance_credits: i64,
}

/// `GET /v1/credits/balance`.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<BalanceResponse>, ApiError> {
    let user_id = authenticated_user(&headers)?;
    let (account, _key) = state.ledger.get_or_create_account(user_id)?;

    Ok(Json(BalanceResponse {
        account_id: account.id.to_string(),
        balance_credits: account.balance_credits,
    }))
}

/// Ledger listing query.
#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    /// Page size (default 50).
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Page offset.
    #[serde(default)]
    pub offset: usize,

    /// Optional reason filter (`ai_usage`, `charge_receipt`, `credit`,
    /// `adjustment`).
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_limit() -> usize {
    50
}

fn parse_reason(reason: &str) -> Result<EntryReason, ApiError> {
    match reason {
        "ai_usage" => Ok(EntryReason::AiUsage),
        "charge_receipt" => Ok(EntryReason::ChargeReceipt),
        "credit" => Ok(EntryReason::Credit),
        "adjustment" => Ok(EntryReason::Adjustment),
        other => Err(ApiError::BadRequest(format!("unknown reason: {other}"))),
    }
}

/// `GET /v1/credits/entries` - reverse-chronological ledger history.
pub async fn list_entries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EntriesQuery>,
) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    let user_id = authenticated_user(&headers)?;
    let (account, _key) = state.ledger.get_or_create_account(user_id)?;

    let reason = query.reason.as_deref().map(parse_reason).transpose()?;
    let entries = state
        .ledger
        .list_entries(&account.id, query.limit.min(500), query.offset, reason)?;

    Ok(Json(entries))
}

/// Receipt listing query.
#[derive(Debug, Deserialize)]
pub struct ReceiptsQuery {
    /// Range start (default: 7 days ago).
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,

    /// Range end (default: now).
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,

    /// Page size (≤ 1000).
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// `GET /v1/credits/receipts` - charge receipts in a time range.
pub async fn list_receipts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ReceiptsQuery>,
) -> Result<Json<Vec<ChargeReceipt>>, ApiError> {
    let user_id = authenticated_user(&headers)?;
    let (account, _key) = state.ledger.get_or_create_account(user_id)?;

    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or_else(|| to - Duration::days(7));

    let receipts = state
        .ledger
        .list_receipts(&account.id, from, to, query.limit)?;

    Ok(Json(receipts))
}

/// Admin credit grant body.
#[derive(Debug, Deserialize)]
pub struct AddCreditsBody {
    /// The user whose account is credited.
    pub user_id: uuid::Uuid,

    /// Credits to add. Must be positive.
    pub amount_credits: i64,

    /// Opaque reference for the ledger entry.
    #[serde(default)]
    pub reference: Option<String>,
}

/// Grant response.
#[derive(Debug, Serialize)]
pub struct AddCreditsResponse {
    /// The account credited.
    pub account_id: String,

    /// Balance after the grant.
    pub balance_credits: i64,
}

/// `POST /v1/credits/add` - admin-only credit grant.
pub async fn admin_add_credits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AddCreditsBody>,
) -> Result<Json<AddCreditsResponse>, ApiError> {
    let provided = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let expected = state.config.admin_api_key.as_deref().unwrap_or_default();
    if expected.is_empty() || provided != expected {
        return Err(ApiError::Unauthorized);
    }

    let (account, _key) = state.ledger.get_or_create_account(body.user_id)?;
    let balance = state.ledger.credit_account(
        &account.id,
        body.amount_credits,
        EntryReason::Credit,
        body.reference,
    )?;

    tracing::info!(
        account_id = %account.id,
        amount = body.amount_credits,
        "Admin credit grant"
    );

    Ok(Json(AddCreditsResponse {
        account_id: account.id.to_string(),
        balance_credits: balance,
    }))
}
