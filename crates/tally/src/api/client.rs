//! Dashboard API HTTP client
//!
//! Fetches identity, plan and usage data from the dashboard API.
//! Uses synchronous HTTP (ureq) to be executor-agnostic. The auth scheme
//! follows the resolved token kind: bare JWTs go out as a Bearer header,
//! composite `user_id::jwt` values as the session cookie.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveTime, Utc};
use std::time::Duration;
use ureq::Agent;

use super::cost::{self, CostBreakdown};
use super::wire;
use crate::models::{ResolvedToken, TokenKind, UsageSyncState};
use crate::sync::{CancelToken, SyncCancelled};

/// Error indicating the remote service itself is down (HTTP 5xx)
///
/// Callers treat this as fatal for the whole refresh batch: retrying
/// account after account against a down service is wasteful and reports
/// misleading per-account failures.
#[derive(Debug, thiserror::Error)]
#[error("usage service unavailable (HTTP {status})")]
pub struct ServerUnavailable {
    pub status: u16,
}

/// Everything one refresh learned about an account
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub email: String,
    pub user_id: String,
    pub membership_type: String,
    pub used: i64,
    pub limit_value: i64,
    pub usage_percent: f64,
    pub days_remaining: i64,
    pub subscription_status: Option<String>,
    /// Aggregated cost for this refresh window only
    pub cost: CostBreakdown,
    /// Events fetched in this window; zero means "no new activity"
    pub event_count: usize,
    /// Timestamp of the newest fetched event, the watermark candidate
    pub newest_event_at: Option<DateTime<Utc>>,
}

/// Dashboard API client
pub struct UsageApiClient {
    agent: Agent,
    base_url: String,
}

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

impl UsageApiClient {
    /// Dashboard API base URL
    const BASE_URL: &'static str = "https://cursor.com";

    /// Fixed usage-events page size
    const PAGE_SIZE: u32 = 100;

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a client with the default per-request timeout
    pub fn new() -> Self {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom per-request timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();

        Self {
            agent: config.into(),
            base_url: Self::BASE_URL.to_string(),
        }
    }

    /// Point the client at a different host (self-hosted proxies, tests)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Fetch identity for the account behind `token`
    ///
    /// `Ok(None)` means the server rejected the token or answered with
    /// something unusable (4xx, 204, malformed body, network fault) — the
    /// account has no data but siblings can continue. A 5xx is raised as
    /// [`ServerUnavailable`].
    pub fn fetch_identity(&self, token: &ResolvedToken) -> Result<Option<wire::UserProfile>> {
        let url = format!("{}/api/auth/me", self.base_url);
        let (auth_name, auth_value) = auth_header(token);

        let result = self
            .agent
            .get(&url)
            .header(auth_name, &auth_value)
            .header("Accept", "application/json")
            .header("Referer", &format!("{}/", self.base_url))
            .header("User-Agent", USER_AGENT)
            .call();

        match result {
            Ok(mut response) => {
                if response.status().as_u16() == 204 {
                    log::warn!("identity endpoint returned 204, token likely invalid");
                    return Ok(None);
                }
                match response.body_mut().read_json::<wire::UserProfile>() {
                    Ok(profile) => Ok(Some(profile)),
                    Err(e) => {
                        log::warn!("identity response unreadable: {e}");
                        Ok(None)
                    }
                }
            }
            Err(ureq::Error::StatusCode(code)) if code >= 500 => {
                Err(ServerUnavailable { status: code }.into())
            }
            Err(ureq::Error::StatusCode(code)) => {
                log::warn!("identity endpoint rejected token: HTTP {code}");
                Ok(None)
            }
            Err(e) => {
                log::warn!("identity request failed: {e}");
                Ok(None)
            }
        }
    }

    /// Best-effort plan usage summary; `None` on any failure
    pub fn fetch_usage_summary(&self, token: &ResolvedToken) -> Option<wire::UsageSummary> {
        let url = format!("{}/api/usage-summary", self.base_url);
        let (auth_name, auth_value) = auth_header(token);

        let result = self
            .agent
            .get(&url)
            .header(auth_name, &auth_value)
            .header("Accept", "application/json")
            .header("Referer", &format!("{}/", self.base_url))
            .header("User-Agent", USER_AGENT)
            .call();

        match result {
            Ok(mut response) => match response.body_mut().read_json() {
                Ok(summary) => Some(summary),
                Err(e) => {
                    log::debug!("usage summary unreadable: {e}");
                    None
                }
            },
            Err(e) => {
                log::debug!("usage summary unavailable: {e}");
                None
            }
        }
    }

    /// Best-effort billing profile (trial days, subscription status);
    /// `None` on any failure
    pub fn fetch_billing_profile(&self, token: &ResolvedToken) -> Option<wire::BillingProfile> {
        let url = format!("{}/api/auth/stripe", self.base_url);
        let (auth_name, auth_value) = auth_header(token);

        let result = self
            .agent
            .get(&url)
            .header(auth_name, &auth_value)
            .header("Accept", "application/json")
            .header("Referer", &format!("{}/", self.base_url))
            .header("User-Agent", USER_AGENT)
            .call();

        match result {
            Ok(mut response) => match response.body_mut().read_json() {
                Ok(profile) => Some(profile),
                Err(e) => {
                    log::debug!("billing profile unreadable: {e}");
                    None
                }
            },
            Err(e) => {
                log::debug!("billing profile unavailable: {e}");
                None
            }
        }
    }

    /// Fetch usage events between two millisecond timestamps
    ///
    /// Pages sequentially at the fixed page size until a short page
    /// arrives or the running total reaches the server-reported count.
    /// Events are concatenated in arrival order; the server returns them
    /// newest-first, so the first event of the first page is the
    /// watermark candidate. This assumes the server never duplicates
    /// events across adjacent windows — the wire format exposes no stable
    /// event id to dedupe on.
    ///
    /// `cancel` is checked between pages; cancellation raises
    /// [`SyncCancelled`] and the caller must not advance any watermark.
    ///
    /// Requires the composite session form; an access token with no
    /// derivable user id yields an empty window.
    pub fn fetch_usage_events(
        &self,
        token: &ResolvedToken,
        start_millis: i64,
        end_millis: i64,
        cancel: &CancelToken,
    ) -> Result<(Vec<wire::UsageEvent>, i64)> {
        let Some(cookie_token) = session_cookie_value(token) else {
            log::debug!("no session-form token available, skipping usage events");
            return Ok((Vec::new(), 0));
        };
        let cookie = format!("WorkosCursorSessionToken={cookie_token}");

        let url = format!("{}/api/dashboard/get-filtered-usage-events", self.base_url);
        let mut events: Vec<wire::UsageEvent> = Vec::new();
        let mut total_count = 0i64;
        let mut page = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(SyncCancelled.into());
            }

            let body = wire::UsageEventsRequest {
                team_id: 0,
                start_date: start_millis.to_string(),
                end_date: end_millis.to_string(),
                page,
                page_size: Self::PAGE_SIZE,
            };

            let mut response = self
                .agent
                .post(&url)
                .header("Cookie", &cookie)
                .header("Accept", "*/*")
                .header("Origin", &self.base_url)
                .header("Referer", &format!("{}/dashboard?tab=usage", self.base_url))
                .header("User-Agent", USER_AGENT)
                .send_json(&body)
                .with_context(|| format!("usage-events request failed (page {page})"))?;

            let page_response: wire::UsageEventsResponse = response
                .body_mut()
                .read_json()
                .with_context(|| format!("usage-events response unreadable (page {page})"))?;

            total_count = page_response.total_usage_events_count;
            let fetched = page_response.usage_events_display.len();
            events.extend(page_response.usage_events_display);

            log::debug!("usage events page {page}: {fetched} event(s)");

            if fetched < Self::PAGE_SIZE as usize || events.len() as i64 >= total_count {
                break;
            }
            page += 1;
        }

        log::debug!(
            "fetched {} of {} usage event(s)",
            events.len(),
            total_count
        );
        Ok((events, total_count))
    }

    /// Run one full refresh against the remote service
    ///
    /// Identity gates everything: `Ok(None)` means no data for this
    /// account. Plan summary and billing profile are best-effort
    /// enrichments. The usage-events window starts at the watermark (or
    /// the first moment of the current month on a first sync) and ends
    /// now; an event-fetch fault degrades to an empty window so the
    /// caller's merge keeps prior totals untouched.
    pub fn fetch_snapshot(
        &self,
        token: &ResolvedToken,
        watermark: &UsageSyncState,
        cancel: &CancelToken,
    ) -> Result<Option<AccountSnapshot>> {
        let Some(identity) = self.fetch_identity(token)? else {
            return Ok(None);
        };

        let summary = self.fetch_usage_summary(token);
        let billing = self.fetch_billing_profile(token);

        let mut membership_type = summary
            .as_ref()
            .and_then(|s| s.membership_type.clone())
            .unwrap_or_else(|| "free".to_string());
        if let Some(m) = billing.as_ref().and_then(|b| b.membership_type.clone()) {
            membership_type = m;
        }

        let (used, limit_value) = summary
            .as_ref()
            .and_then(|s| s.individual_usage.as_ref())
            .and_then(|u| u.plan.as_ref())
            .map(|p| (p.used, p.limit))
            .unwrap_or((0, 1000));
        let usage_percent = if limit_value > 0 {
            ((used as f64 / limit_value as f64) * 1000.0).round() / 10.0
        } else {
            0.0
        };

        let now = Utc::now();
        let start_millis = watermark
            .last_refresh_time
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(|| month_start_millis(now));
        let end_millis = now.timestamp_millis();

        if watermark.is_initial() {
            log::debug!("full refresh bounded to the current month");
        } else {
            log::debug!("incremental refresh from {:?}", watermark.last_refresh_time);
        }

        let (events, _server_total) =
            match self.fetch_usage_events(token, start_millis, end_millis, cancel) {
                Ok(window) => window,
                Err(e) if e.downcast_ref::<SyncCancelled>().is_some() => return Err(e),
                Err(e) => {
                    log::warn!("usage events unavailable, treating window as empty: {e:#}");
                    (Vec::new(), 0)
                }
            };

        let newest_event_at = events.first().and_then(|e| e.timestamp_utc());
        let cost = cost::aggregate_events(&events, &membership_type);

        Ok(Some(AccountSnapshot {
            email: identity
                .email
                .unwrap_or_else(|| "unknown@cursor.com".to_string()),
            user_id: identity
                .sub
                .map(|s| s.trim_start_matches("auth0|").to_string())
                .unwrap_or_default(),
            membership_type,
            used,
            limit_value,
            usage_percent,
            days_remaining: billing
                .as_ref()
                .and_then(|b| b.days_remaining_on_trial)
                .unwrap_or(0),
            subscription_status: billing.and_then(|b| b.subscription_status),
            cost,
            event_count: events.len(),
            newest_event_at,
        }))
    }
}

impl Default for UsageApiClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Header name/value pair for the token's auth scheme
fn auth_header(token: &ResolvedToken) -> (&'static str, String) {
    match token.kind {
        TokenKind::Access => ("Authorization", format!("Bearer {}", token.raw)),
        TokenKind::Session => (
            "Cookie",
            format!(
                "WorkosCursorSessionToken={}",
                encode_session_token(&token.raw)
            ),
        ),
    }
}

/// URL-encode a composite token unless it already is
fn encode_session_token(raw: &str) -> String {
    if raw.contains("::") && !raw.contains("%3A%3A") {
        urlencoding::encode(raw).into_owned()
    } else {
        raw.to_string()
    }
}

/// The cookie-ready session value for any token kind
///
/// An access token is rewritten into the composite form when its user id
/// is known; without one there is nothing to build a cookie from.
fn session_cookie_value(token: &ResolvedToken) -> Option<String> {
    match token.kind {
        TokenKind::Session => Some(encode_session_token(&token.raw)),
        TokenKind::Access => {
            let user_id = token.user_id.as_deref().filter(|id| id.starts_with("user_"))?;
            Some(encode_session_token(&format!("{user_id}::{}", token.raw)))
        }
    }
}

/// Millisecond timestamp of the first moment of `now`'s calendar month
fn month_start_millis(now: DateTime<Utc>) -> i64 {
    let first = now
        .date_naive()
        .with_day(1)
        .unwrap_or_else(|| now.date_naive());
    first.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}
