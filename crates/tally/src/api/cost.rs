//! Cost aggregation over usage events
//!
//! Pure functions applied once over the concatenated event list of a
//! refresh window.

use std::collections::BTreeMap;

use super::wire::UsageEvent;
use crate::models::ModelUsage;

/// Aggregated cost for one refresh window
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CostBreakdown {
    /// Dollars, rounded to cents
    pub total_cost: f64,
    pub total_tokens: i64,
    /// Events seen, including uncharged ones
    pub event_count: usize,
    /// Events that actually billed
    pub charged_count: usize,
    pub by_model: BTreeMap<String, ModelUsage>,
    /// Dollars owed beyond the plan's included credit
    pub unpaid_amount: f64,
}

/// Included dollar credit per membership tier
///
/// Comparison is case-insensitive; unknown tiers get no credit.
pub fn plan_credit(membership_type: &str) -> f64 {
    match membership_type.to_ascii_lowercase().as_str() {
        "free" | "free_trial" => 10.0,
        "pro" | "pro_trial" => 20.0,
        "business" | "team" => 40.0,
        "enterprise" => 100.0,
        _ => 0.0,
    }
}

/// Aggregate a window's events into totals and a per-model breakdown
///
/// Events whose kind contains `NOT_CHARGED` or `ERRORED` are skipped.
/// Per-event cost is `totalCents / 100`; per-event tokens are the sum of
/// input, output, cache-write and cache-read counts.
pub fn aggregate_events(events: &[UsageEvent], membership_type: &str) -> CostBreakdown {
    let mut total_cost = 0.0;
    let mut total_tokens = 0;
    let mut charged_count = 0;
    let mut by_model: BTreeMap<String, ModelUsage> = BTreeMap::new();

    for event in events {
        if event.kind.contains("NOT_CHARGED") || event.kind.contains("ERRORED") {
            continue;
        }

        let usage = event.token_usage.clone().unwrap_or_default();
        let event_cost = usage.total_cents / 100.0;
        let event_tokens =
            usage.input_tokens + usage.output_tokens + usage.cache_write_tokens + usage.cache_read_tokens;

        total_cost += event_cost;
        total_tokens += event_tokens;
        charged_count += 1;

        let model = event.model.clone().unwrap_or_else(|| "unknown".to_string());
        let entry = by_model.entry(model).or_default();
        entry.cost += event_cost;
        entry.tokens += event_tokens;
        entry.count += 1;
    }

    let unpaid_amount = (total_cost - plan_credit(membership_type)).max(0.0);

    CostBreakdown {
        total_cost: round_cents(total_cost),
        total_tokens,
        event_count: events.len(),
        charged_count,
        by_model,
        unpaid_amount: round_cents(unpaid_amount),
    }
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
