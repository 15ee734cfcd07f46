//! Audit log parsing: the billing source for sandbox runs.
//!
//! The egress proxy appends one `key=value` line per outbound LLM call.
//! Billing consumes `litellm_call_id` and `litellm_response_cost`; a
//! `run_id` key filters lines when one proxy serves several runs.

use std::collections::HashSet;

/// One billable call derived from the audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    /// Provider call id, the settlement idempotency key.
    pub provider_call_id: String,

    /// Provider cost in USD when the proxy recorded one.
    pub cost_usd: Option<f64>,
}

/// Result of parsing one audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditReport {
    /// Billable entries in log order, duplicates collapsed.
    pub entries: Vec<AuditEntry>,

    /// Raw non-empty lines seen (after run filtering). Used to detect a
    /// proxy that saw traffic but produced nothing billable.
    pub lines: usize,
}

/// Parse a proxy audit log.
///
/// Lines with a missing or `-` call id are discarded; duplicate call ids
/// collapse to their first occurrence; order follows the log.
#[must_use]
pub fn parse_audit_log(content: &str, run_id: Option<&str>) -> AuditReport {
    let mut report = AuditReport::default();
    let mut seen: HashSet<String> = HashSet::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut call_id: Option<&str> = None;
        let mut cost: Option<&str> = None;
        let mut line_run_id: Option<&str> = None;

        for pair in line.split_whitespace() {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "litellm_call_id" => call_id = Some(value),
                "litellm_response_cost" => cost = Some(value),
                "run_id" => line_run_id = Some(value),
                _ => {}
            }
        }

        // When filtering, a line tagged with a different run is not ours;
        // untagged lines stay (single-run proxies don't tag).
        if let (Some(want), Some(have)) = (run_id, line_run_id) {
            if want != have {
                continue;
            }
        }

        report.lines += 1;

        let Some(call_id) = call_id.filter(|id| *id != "-" && !id.is_empty()) else {
            continue;
        };

        if !seen.insert(call_id.to_string()) {
            continue;
        }

        let cost_usd = cost.filter(|c| *c != "-").and_then(|c| c.parse().ok());

        report.entries.push(AuditEntry {
            provider_call_id: call_id.to_string(),
            cost_usd,
        });
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_ids_and_costs_in_order() {
        let log = "time=1 litellm_call_id=gen-1 litellm_response_cost=0.002 status=200\n\
                   time=2 litellm_call_id=gen-2 litellm_response_cost=- status=200\n";
        let report = parse_audit_log(log, None);

        assert_eq!(report.lines, 2);
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].provider_call_id, "gen-1");
        assert_eq!(report.entries[0].cost_usd, Some(0.002));
        assert_eq!(report.entries[1].provider_call_id, "gen-2");
        assert_eq!(report.entries[1].cost_usd, None);
    }

    #[test]
    fn discards_dash_and_missing_call_ids() {
        let log = "litellm_call_id=- litellm_response_cost=0.01\n\
                   status=502 upstream=litellm\n\
                   litellm_call_id=gen-3 litellm_response_cost=0.001\n";
        let report = parse_audit_log(log, None);

        assert_eq!(report.lines, 3);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].provider_call_id, "gen-3");
    }

    #[test]
    fn collapses_duplicate_call_ids() {
        let log = "litellm_call_id=gen-9 litellm_response_cost=0.002\n\
                   litellm_call_id=gen-9 litellm_response_cost=0.002\n";
        let report = parse_audit_log(log, None);

        assert_eq!(report.entries.len(), 1);
    }

    #[test]
    fn filters_by_run_id_keeping_untagged_lines() {
        let log = "run_id=r1 litellm_call_id=gen-a litellm_response_cost=0.001\n\
                   run_id=r2 litellm_call_id=gen-b litellm_response_cost=0.001\n\
                   litellm_call_id=gen-c litellm_response_cost=0.001\n";
        let report = parse_audit_log(log, Some("r1"));

        let ids: Vec<_> = report
            .entries
            .iter()
            .map(|entry| entry.provider_call_id.as_str())
            .collect();
        assert_eq!(ids, vec!["gen-a", "gen-c"]);
    }

    #[test]
    fn empty_log_is_empty_report() {
        let report = parse_audit_log("", None);
        assert_eq!(report.lines, 0);
        assert!(report.entries.is_empty());
    }
}
