//! Bounded scan over the proxy's spend logs.
//!
//! `/spend/logs` must be queried without date parameters: passing
//! `start_date`/`end_date` switches the endpoint into aggregation mode.
//! Range filtering therefore happens in memory over a bounded fetch, and a
//! full page whose oldest row is still inside the range means the data
//! would be truncated, not complete.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::client::LlmClient;
use crate::error::{Result, TransportError};

/// Hard cap the proxy enforces on `limit`.
pub const SPEND_LOGS_MAX_LIMIT: usize = 100;

/// One spend log row.
#[derive(Debug, Clone, Deserialize)]
pub struct SpendLogEntry {
    /// Provider call id.
    pub request_id: String,

    /// When the call started.
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,

    /// Cost in USD.
    #[serde(default)]
    pub spend: f64,

    /// Model that served the call.
    #[serde(default)]
    pub model: Option<String>,
}

/// Result of a bounded spend scan.
#[derive(Debug)]
pub enum SpendScan {
    /// All rows within the range, newest first.
    Complete(Vec<SpendLogEntry>),

    /// The fetch filled the page before reaching the range start; a larger
    /// range would silently drop rows.
    RangeTooLarge,
}

impl LlmClient {
    /// Fetch spend logs for one end user, filtered to `[from, to]`.
    ///
    /// # Errors
    ///
    /// Returns a transport error on HTTP failure or a non-success status.
    pub async fn spend_logs(
        &self,
        end_user: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<SpendScan> {
        let limit = limit.clamp(1, SPEND_LOGS_MAX_LIMIT);
        let url = format!("{}/spend/logs", self.base_url());

        let limit_param = limit.to_string();
        let response = self
            .http()
            .get(&url)
            .bearer_auth(self.master_key())
            .query(&[("end_user", end_user), ("limit", limit_param.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let mut rows: Vec<SpendLogEntry> = response.json().await?;
        rows.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        let fetched = rows.len();
        let oldest = rows.last().map(|row| row.start_time);

        // A full page whose oldest row is still after the range start means
        // older in-range rows were cut off.
        if fetched == limit {
            if let Some(oldest) = oldest {
                if oldest > from {
                    return Ok(SpendScan::RangeTooLarge);
                }
            }
        }

        rows.retain(|row| row.start_time >= from && row.start_time <= to);
        Ok(SpendScan::Complete(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spend_log_entry_parses() {
        let row: SpendLogEntry = serde_json::from_str(
            r#"{"request_id":"gen-1","startTime":"2026-07-01T12:00:00Z","spend":0.002,"model":"gpt-test"}"#,
        )
        .unwrap();
        assert_eq!(row.request_id, "gen-1");
        assert!((row.spend - 0.002).abs() < f64::EPSILON);
    }
}
