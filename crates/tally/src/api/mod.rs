//! Dashboard API integration
//!
//! This module provides:
//! - Bearer/Cookie authentication dispatch by token kind
//! - Identity, plan and billing-profile fetches
//! - Paginated incremental usage-event retrieval
//! - Cost aggregation over the fetched events

mod client;
pub mod cost;

pub use client::{AccountSnapshot, ServerUnavailable, UsageApiClient};

/// Dashboard API request/response types
pub mod wire {
    use serde::{Deserialize, Serialize};

    /// Response from the identity endpoint
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct UserProfile {
        pub email: Option<String>,
        pub sub: Option<String>,
        pub email_verified: Option<bool>,
        pub name: Option<String>,
    }

    /// Response from the usage-summary endpoint
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct UsageSummary {
        pub membership_type: Option<String>,
        pub individual_usage: Option<IndividualUsage>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct IndividualUsage {
        pub plan: Option<PlanUsage>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PlanUsage {
        #[serde(default)]
        pub used: i64,
        #[serde(default)]
        pub limit: i64,
    }

    /// Response from the billing-profile endpoint
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct BillingProfile {
        pub days_remaining_on_trial: Option<i64>,
        pub subscription_status: Option<String>,
        pub membership_type: Option<String>,
    }

    /// Request body for the filtered usage-events endpoint
    ///
    /// Timestamps travel as millisecond strings.
    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct UsageEventsRequest {
        pub team_id: i64,
        pub start_date: String,
        pub end_date: String,
        pub page: u32,
        pub page_size: u32,
    }

    /// Response from the filtered usage-events endpoint
    #[derive(Debug, Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct UsageEventsResponse {
        #[serde(default)]
        pub total_usage_events_count: i64,
        #[serde(default)]
        pub usage_events_display: Vec<UsageEvent>,
    }

    /// One usage event, newest-first in server order
    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct UsageEvent {
        #[serde(default)]
        pub kind: String,
        pub model: Option<String>,
        /// Millisecond timestamp as a string
        pub timestamp: Option<String>,
        pub token_usage: Option<TokenUsage>,
    }

    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct TokenUsage {
        #[serde(default)]
        pub total_cents: f64,
        #[serde(default)]
        pub input_tokens: i64,
        #[serde(default)]
        pub output_tokens: i64,
        #[serde(default)]
        pub cache_write_tokens: i64,
        #[serde(default)]
        pub cache_read_tokens: i64,
    }

    impl UsageEvent {
        /// Event timestamp parsed from the millisecond string
        pub fn timestamp_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
            let millis: i64 = self.timestamp.as_deref()?.parse().ok()?;
            chrono::DateTime::from_timestamp_millis(millis)
        }
    }
}
