//! Telemetry counters and karma.
//!
//! Aggregated per-user counters live in an in-memory KV store under the
//! keys `stats:{user}:requests`, `stats:{user}:origins`, and
//! `stats:{user}:last_seen`. The verifier feeds them through
//! [`RegistryVerificationSink`], asynchronously - verification latency never
//! waits on telemetry writes. Karma is derived on read, never stored:
//! `⌊requests/100⌋ + 10·|origins|`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;

use super::model::VerificationRecord;
use super::store::RegistryStore;
use crate::verifier::{VerificationEvent, VerificationSink};

/// In-memory KV store for telemetry counters.
#[derive(Debug, Default)]
pub struct StatsStore {
    counters: DashMap<String, u64>,
    sets: DashMap<String, HashSet<String>>,
    scalars: DashMap<String, i64>,
}

/// Read-side snapshot for one user.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserStats {
    /// Total verified requests.
    pub requests: u64,
    /// Distinct target origins.
    pub origins: u64,
    /// Last verification, Unix milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_ms: Option<i64>,
    /// Derived reputation score.
    pub karma: u64,
}

impl StatsStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `stats:{user}:requests`.
    pub fn incr_requests(&self, username: &str) {
        *self
            .counters
            .entry(format!("stats:{username}:requests"))
            .or_insert(0) += 1;
    }

    /// Add an origin to `stats:{user}:origins`.
    pub fn add_origin(&self, username: &str, origin: &str) {
        self.sets
            .entry(format!("stats:{username}:origins"))
            .or_default()
            .insert(origin.to_string());
    }

    /// Set `stats:{user}:last_seen` (Unix milliseconds).
    pub fn set_last_seen(&self, username: &str, at_ms: i64) {
        self.scalars
            .insert(format!("stats:{username}:last_seen"), at_ms);
    }

    /// Snapshot one user's counters with derived karma.
    #[must_use]
    pub fn snapshot(&self, username: &str) -> UserStats {
        let requests = self
            .counters
            .get(&format!("stats:{username}:requests"))
            .map(|c| *c)
            .unwrap_or(0);
        let origins = self
            .sets
            .get(&format!("stats:{username}:origins"))
            .map(|s| s.len() as u64)
            .unwrap_or(0);
        let last_seen_ms = self
            .scalars
            .get(&format!("stats:{username}:last_seen"))
            .map(|v| *v);

        UserStats {
            requests,
            origins,
            last_seen_ms,
            karma: karma(requests, origins),
        }
    }
}

/// Karma score: `⌊requests/100⌋ + 10·|origins|`.
#[must_use]
pub fn karma(requests: u64, origins: u64) -> u64 {
    requests / 100 + 10 * origins
}

/// Bridges the verifier into the registry: updates counters on success and
/// appends every attributable attempt to the verification log.
pub struct RegistryVerificationSink {
    store: Arc<dyn RegistryStore>,
    stats: Arc<StatsStore>,
}

impl RegistryVerificationSink {
    /// Assemble the sink.
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>, stats: Arc<StatsStore>) -> Self {
        Self { store, stats }
    }
}

#[async_trait]
impl VerificationSink for RegistryVerificationSink {
    async fn record(&self, event: VerificationEvent) {
        let now = Utc::now();
        if event.verified {
            self.stats.incr_requests(&event.username);
            self.stats.add_origin(&event.username, &event.origin);
            self.stats
                .set_last_seen(&event.username, now.timestamp_millis());
        }
        self.store
            .append_verification(VerificationRecord {
                username: event.username,
                origin: event.origin,
                method: event.method,
                verified: event.verified,
                at: now,
            })
            .await;
    }
}

// ── HTTP surface ──────────────────────────────────────────────────────────────

use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Duration, Timelike};
use serde::Deserialize;
use serde_json::json;

use super::RegistryState;
use super::auth::{AuthPrincipal, MaybePrincipal};
use super::error::RegistryError;
use super::model::AgentActivity;

/// Query accepted by the aggregate telemetry routes.
#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    /// `today` (default) or `7d`.
    pub window: Option<String>,
}

fn window_start(query: &WindowQuery) -> Result<(DateTime<Utc>, &'static str), RegistryError> {
    let now = Utc::now();
    match query.window.as_deref().unwrap_or("today") {
        "today" => {
            let midnight = now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .unwrap_or_default()
                .and_utc();
            Ok((midnight, "today"))
        }
        "7d" => Ok((now - Duration::days(7), "7d")),
        other => Err(RegistryError::BadRequest(format!(
            "unknown window: {other}"
        ))),
    }
}

/// GET /telemetry/overview
pub async fn overview_handler(
    State(state): State<Arc<RegistryState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let (since, window) = window_start(&query)?;
    let records = state.store.verifications_since(since).await;

    let verified = records.iter().filter(|r| r.verified).count();
    let users: std::collections::HashSet<&str> =
        records.iter().map(|r| r.username.as_str()).collect();
    let origins: std::collections::HashSet<&str> =
        records.iter().map(|r| r.origin.as_str()).collect();

    Ok(Json(json!({
        "window": window,
        "total": records.len(),
        "verified": verified,
        "failed": records.len() - verified,
        "unique_agents": users.len(),
        "unique_origins": origins.len(),
    })))
}

/// GET /telemetry/timeseries - hourly buckets for `today`, daily for `7d`.
pub async fn timeseries_handler(
    State(state): State<Arc<RegistryState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let (since, window) = window_start(&query)?;
    let records = state.store.verifications_since(since).await;

    let mut buckets: HashMap<String, (u64, u64)> = HashMap::new();
    for record in &records {
        let bucket = if window == "today" {
            format!(
                "{}T{:02}:00Z",
                record.at.date_naive(),
                record.at.hour()
            )
        } else {
            record.at.date_naive().to_string()
        };
        let entry = buckets.entry(bucket).or_default();
        entry.0 += 1;
        if record.verified {
            entry.1 += 1;
        }
    }

    let mut series: Vec<_> = buckets
        .into_iter()
        .map(|(bucket, (total, verified))| json!({
            "bucket": bucket,
            "total": total,
            "verified": verified,
        }))
        .collect();
    series.sort_by(|a, b| a["bucket"].as_str().cmp(&b["bucket"].as_str()));

    Ok(Json(json!({"window": window, "series": series})))
}

/// GET /telemetry/top/agents
pub async fn top_agents_handler(
    State(state): State<Arc<RegistryState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    top_by(&state, &query, |r| r.username.clone()).await
}

/// GET /telemetry/top/origins
pub async fn top_origins_handler(
    State(state): State<Arc<RegistryState>>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    top_by(&state, &query, |r| r.origin.clone()).await
}

async fn top_by(
    state: &RegistryState,
    query: &WindowQuery,
    key: impl Fn(&VerificationRecord) -> String,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let (since, window) = window_start(query)?;
    let records = state.store.verifications_since(since).await;

    let mut counts: HashMap<String, u64> = HashMap::new();
    for record in records.iter().filter(|r| r.verified) {
        *counts.entry(key(record)).or_default() += 1;
    }
    let mut top: Vec<_> = counts.into_iter().collect();
    top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top.truncate(10);

    let entries: Vec<_> = top
        .into_iter()
        .map(|(name, count)| json!({"name": name, "count": count}))
        .collect();
    Ok(Json(json!({"window": window, "top": entries})))
}

/// GET /telemetry/{username} - per-user stats, visibility-gated.
pub async fn user_stats_handler(
    State(state): State<Arc<RegistryState>>,
    Path(username): Path<String>,
    MaybePrincipal(principal): MaybePrincipal,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let profile = state
        .store
        .profile_by_username(&username)
        .await
        .ok_or(RegistryError::NotFound)?;

    let is_owner = principal
        .as_ref()
        .is_some_and(|p| p.user.id == profile.user_id);
    if !profile.is_public && !is_owner {
        return Err(RegistryError::Forbidden("stats are private"));
    }

    let snapshot = state.stats.snapshot(&profile.username);
    let recent = state
        .store
        .verifications_for(&profile.username, 20)
        .await;

    Ok(Json(json!({
        "username": profile.username,
        "requests": snapshot.requests,
        "origins": snapshot.origins,
        "last_seen_ms": snapshot.last_seen_ms,
        "karma": snapshot.karma,
        "recent": recent,
    })))
}

/// Body of the visibility toggle.
#[derive(Debug, Deserialize)]
pub struct VisibilityBody {
    /// Whether non-owners may read these stats.
    pub is_public: bool,
}

/// PUT /telemetry/{username}/visibility - owner only.
pub async fn visibility_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(principal): Extension<AuthPrincipal>,
    Path(username): Path<String>,
    Json(body): Json<VisibilityBody>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    let mut profile = state
        .store
        .profile_by_username(&username)
        .await
        .ok_or(RegistryError::NotFound)?;
    if profile.user_id != principal.user.id {
        return Err(RegistryError::Forbidden("not the owner"));
    }

    profile.is_public = body.is_public;
    profile.updated_at = Utc::now();
    state.store.upsert_profile(profile).await?;
    Ok(Json(json!({"is_public": body.is_public})))
}

/// Body of `POST /agent-activity`.
#[derive(Debug, Deserialize)]
pub struct ActivityBody {
    /// Agent reference.
    pub agent_id: String,
    /// Action label.
    pub action: String,
    /// Free-form detail payload.
    pub detail: Option<serde_json::Value>,
}

/// POST /agent-activity - authenticated self-reporting.
pub async fn post_activity_handler(
    State(state): State<Arc<RegistryState>>,
    Extension(_principal): Extension<AuthPrincipal>,
    Json(body): Json<ActivityBody>,
) -> Result<Json<serde_json::Value>, RegistryError> {
    if body.action.trim().is_empty() {
        return Err(RegistryError::BadRequest("action required".to_string()));
    }
    state
        .store
        .append_activity(AgentActivity {
            agent_id: body.agent_id,
            action: body.action,
            detail: body.detail,
            at: Utc::now(),
        })
        .await;
    Ok(Json(json!({"recorded": true})))
}

/// GET /agent-activity/{agent_id}
pub async fn get_activity_handler(
    State(state): State<Arc<RegistryState>>,
    Path(agent_id): Path<String>,
) -> Json<Vec<AgentActivity>> {
    Json(state.store.activity_for(&agent_id, 100).await)
}
