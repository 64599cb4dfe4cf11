use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use pkg_compliance::ReportPeriod;
use pkg_state::Snapshot;
use pkg_types::violation::Violation;

use crate::AppState;
use crate::error::{ApiError, ApiResult};

/// Report length when neither `from` nor `hours` is given.
const DEFAULT_REPORT_HOURS: i64 = 24;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub scanned_at: DateTime<Utc>,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineResponse {
    pub revision: u64,
    pub hash: String,
    pub taken_at: DateTime<Utc>,
    pub objects: usize,
}

impl From<&Snapshot> for BaselineResponse {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            revision: snapshot.revision,
            hash: snapshot.hash.clone(),
            taken_at: snapshot.taken_at,
            objects: snapshot.objects.len(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportQuery {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    /// Period length ending at `to` (or now) when `from` is absent.
    #[serde(default)]
    pub hours: Option<i64>,
    /// `json` (default) or `text`.
    #[serde(default)]
    pub format: Option<String>,
}

impl ReportQuery {
    fn period(&self, now: DateTime<Utc>) -> ApiResult<ReportPeriod> {
        let to = self.to.unwrap_or(now);
        let from = match (self.from, self.hours) {
            (Some(from), _) => from,
            (None, Some(hours)) if hours > 0 => to - chrono::Duration::hours(hours),
            (None, Some(hours)) => {
                return Err(ApiError::malformed(format!("hours must be positive, got {}", hours)));
            }
            (None, None) => to - chrono::Duration::hours(DEFAULT_REPORT_HOURS),
        };
        if from > to {
            return Err(ApiError::malformed("report period starts after it ends"));
        }
        Ok(ReportPeriod::new(from, to))
    }
}

/// POST /api/v1/compliance/scan: run a scan now and record its findings.
pub async fn scan(State(state): State<AppState>) -> impl IntoResponse {
    let violations = state.detector.scan().await;
    state.violations.record(violations.clone()).await;
    info!("On-demand scan found {} violations", violations.len());
    (
        StatusCode::OK,
        Json(ScanResponse {
            scanned_at: state.clock.now(),
            violations,
        }),
    )
}

/// POST /api/v1/compliance/baseline. An empty body snapshots the current
/// store; a snapshot document in the body is installed as the baseline
/// after its hash is checked.
pub async fn set_baseline(State(state): State<AppState>, body: String) -> ApiResult<impl IntoResponse> {
    let snapshot = if body.trim().is_empty() {
        state.detector.take_baseline().await
    } else {
        let snapshot = Snapshot::from_json(&body).map_err(|e| ApiError::malformed(e.to_string()))?;
        state
            .detector
            .set_baseline(snapshot.clone())
            .await
            .map_err(|e| ApiError::malformed(e.to_string()))?;
        snapshot
    };
    info!(
        "Baseline set at revision {} ({})",
        snapshot.revision, snapshot.hash
    );
    Ok((StatusCode::OK, Json(BaselineResponse::from(&snapshot))))
}

/// GET /api/v1/compliance/baseline: the full baseline snapshot, suitable
/// for posting back later.
pub async fn get_baseline(State(state): State<AppState>) -> Response {
    match state.detector.baseline().await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => ApiError::new(StatusCode::NOT_FOUND, "ErrNotFound", "no baseline has been set")
            .into_response(),
    }
}

/// GET /api/v1/compliance/report?from=&to=&hours=&format=text|json
pub async fn report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> ApiResult<Response> {
    let period = query.period(state.clock.now())?;
    let report = state.reporter.generate(period).await;
    match query.format.as_deref() {
        Some("text") => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            report.to_text(),
        )
            .into_response()),
        None | Some("json") => Ok((StatusCode::OK, Json(report)).into_response()),
        Some(other) => Err(ApiError::malformed(format!(
            "unknown report format '{}', expected text or json",
            other
        ))),
    }
}
