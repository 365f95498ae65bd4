/**
 * COMMAND CENTRE HTTP API
 *
 * Read side of the latest cycle (aggregate, hospitals, rankings, history),
 * alert queries and operator actions, and the live `text/event-stream`
 * feed. Handlers only read shared state or call into the alert engine;
 * nothing here blocks a cycle.
 *
 * ERRORS: unknown resources are 404; an alert action that the alert's
 * current state does not allow, or that loses a write race, is 409 with a
 * JSON `{ "error": ... }` body.
 */

use crate::aggregator::AggregateSnapshot;
use crate::alerts::{Alert, AlertError, AlertFilter};
use crate::health::{CentreHealth, HealthTracker};
use crate::models::HospitalMetricSnapshot;
use crate::pipeline::CommandCentre;
use crate::publisher::{Delivery, Subscription};
use crate::scoring::PerformanceScore;
use crate::state::NetworkSummary;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub centre: Arc<CommandCentre>,
    pub health_tracker: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/metrics/current", get(get_current_metrics))
        .route("/metrics/history", get(get_metrics_history))
        .route("/hospitals", get(list_hospitals))
        .route("/hospitals/{id}", get(get_hospital))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}", get(get_alert))
        .route("/alerts/{id}/acknowledge", post(acknowledge_alert).put(acknowledge_alert))
        .route("/alerts/{id}/resolve", post(resolve_alert).put(resolve_alert))
        .route("/performance/rankings", get(get_rankings))
        .route("/dashboard/summary", get(get_summary))
        .route("/stream", get(stream_events))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<CentreHealth> {
    Json(app.health_tracker.get_health(&app.centre))
}

// GET /metrics/current
async fn get_current_metrics(State(app): State<AppState>) -> Result<Json<AggregateSnapshot>, StatusCode> {
    app.centre.view().aggregate.map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

// GET /metrics/history?from&to&limit
async fn get_metrics_history(
    State(app): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<AggregateSnapshot>> {
    Json(app.centre.history().range(params.from, params.to, params.limit))
}

// GET /hospitals
async fn list_hospitals(State(app): State<AppState>) -> Json<Vec<HospitalMetricSnapshot>> {
    Json(app.centre.view().hospitals)
}

// GET /hospitals/{id}
async fn get_hospital(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HospitalMetricSnapshot>, StatusCode> {
    let view = app.centre.view();
    let Some(h) = view.hospital(&id) else { return Err(StatusCode::NOT_FOUND); };
    Ok(Json(h.clone()))
}

// GET /alerts?category&severity&hospital_id&state
async fn list_alerts(State(app): State<AppState>, Query(filter): Query<AlertFilter>) -> Json<Vec<Alert>> {
    Json(app.centre.alerts().list(&filter))
}

// GET /alerts/{id}
async fn get_alert(State(app): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Alert>, StatusCode> {
    app.centre.alerts().get(id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Default, Deserialize)]
struct ActionBody {
    by: Option<String>,
    notes: Option<String>,
}

/// Empty bodies are allowed; anything else must be a JSON object.
fn parse_action(body: &Bytes) -> Result<ActionBody, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ActionBody::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": format!("invalid body: {e}") }))).into_response()
    })
}

fn alert_error(e: AlertError) -> Response {
    let code = match e {
        AlertError::NotFound(_) => StatusCode::NOT_FOUND,
        AlertError::InvalidTransition { .. } | AlertError::WriteConflict(_) => StatusCode::CONFLICT,
    };
    if code == StatusCode::CONFLICT {
        warn!("Alert action refused: {}", e);
    }
    (code, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

// POST|PUT /alerts/{id}/acknowledge
async fn acknowledge_alert(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<Alert>, Response> {
    let action = parse_action(&body)?;
    app.centre.alerts().acknowledge(id, action.by, action.notes).map(Json).map_err(alert_error)
}

// POST|PUT /alerts/{id}/resolve
async fn resolve_alert(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Json<Alert>, Response> {
    let action = parse_action(&body)?;
    app.centre.alerts().resolve(id, action.by, action.notes).map(Json).map_err(alert_error)
}

// GET /performance/rankings
async fn get_rankings(State(app): State<AppState>) -> Json<Vec<PerformanceScore>> {
    Json(app.centre.view().rankings)
}

// GET /dashboard/summary
async fn get_summary(State(app): State<AppState>) -> Json<NetworkSummary> {
    Json(app.centre.view().summary(&app.centre.alerts().open_alerts()))
}

fn to_sse(delivery: Delivery) -> Event {
    let built = match &delivery {
        Delivery::Gap(gap) => Event::default().event("gap").json_data(gap),
        Delivery::Event(cycle) => Event::default().event("cycle").id(cycle.sequence.to_string()).json_data(&**cycle),
    };
    built.unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

// GET /stream (Last-Event-ID aware)
async fn stream_events(
    State(app): State<AppState>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let subscription: Subscription = app.centre.publisher().subscribe(last_event_id);

    let events = stream::unfold(subscription, |mut sub| async move {
        let delivery = sub.next().await?;
        Some((Ok(to_sse(delivery)), sub))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertEngine, AlertSettings, ThresholdTable};
    use crate::collector::{Collector, CollectorSettings, HospitalEntry};
    use crate::history::AggregateHistory;
    use crate::pipeline::CycleSettings;
    use crate::publisher::{Publisher, PublisherSettings};
    use crate::sources::{PushInbox, PushSource};
    use axum::body::Body;
    use axum::http::Request;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app_with_cycle(occupancy: f64) -> (Router, Arc<CommandCentre>) {
        let inbox = Arc::new(PushInbox::new());
        inbox.push(
            "luth",
            json!({
                "hospital_id": "luth",
                "patients": {"total": 500, "new_today": 50},
                "occupancy": {"total_beds": 500, "occupied_beds": 400, "percentage": occupancy},
                "staffing": {"total_staff": 200, "on_duty": 180},
                "finance": {"daily_revenue": 5_000_000.0},
                "emergency": {"active_cases": 3, "avg_response_time": 12.0}
            }),
        );
        let source = Arc::new(PushSource::new(inbox, "luth", Duration::from_secs(60)));
        let centre = Arc::new(CommandCentre::new(
            Collector::new(
                vec![HospitalEntry::new("luth", "Lagos University Teaching Hospital", source)],
                CollectorSettings::default(),
            ),
            AlertEngine::new(ThresholdTable::defaults(), AlertSettings::default()),
            Publisher::new(PublisherSettings::default()),
            AggregateHistory::new(10),
            CycleSettings::default(),
        ));
        centre.run_cycle().await.unwrap();
        let router = build_router(AppState { centre: centre.clone(), health_tracker: HealthTracker::new() });
        (router, centre)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        send(app, "GET", uri, Body::empty()).await
    }

    #[tokio::test]
    async fn liveness_and_system_health() {
        let (app, _) = app_with_cycle(80.0).await;
        let response = app.clone().oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, health) = get_json(&app, "/system/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["cycles_completed"], 1);
        assert_eq!(health["hospitals_tracked"], 1);
        assert_eq!(health["mqtt_status"], "disabled");
    }

    #[tokio::test]
    async fn current_metrics_and_hospitals() {
        let (app, _) = app_with_cycle(80.0).await;
        let (status, current) = get_json(&app, "/metrics/current").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(current["totals"]["patients"], 500);
        assert_eq!(current["fresh_count"], 1);

        let (_, hospitals) = get_json(&app, "/hospitals").await;
        assert_eq!(hospitals.as_array().map(Vec::len), Some(1));

        let (status, luth) = get_json(&app, "/hospitals/luth").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(luth["occupancy"]["percentage"], 80.0);
        assert_eq!(get_json(&app, "/hospitals/kano").await.0, StatusCode::NOT_FOUND);

        let (_, history) = get_json(&app, "/metrics/history?limit=5").await;
        assert_eq!(history.as_array().map(Vec::len), Some(1));

        let (_, rankings) = get_json(&app, "/performance/rankings").await;
        assert_eq!(rankings[0]["rank"], 1);
        assert_eq!(rankings[0]["hospital_name"], "Lagos University Teaching Hospital");
    }

    #[tokio::test]
    async fn current_metrics_404_before_first_cycle() {
        let centre = Arc::new(CommandCentre::new(
            Collector::new(vec![], CollectorSettings::default()),
            AlertEngine::new(ThresholdTable::defaults(), AlertSettings::default()),
            Publisher::new(PublisherSettings::default()),
            AggregateHistory::new(10),
            CycleSettings::default(),
        ));
        let app = build_router(AppState { centre, health_tracker: HealthTracker::new() });
        assert_eq!(get_json(&app, "/metrics/current").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn alert_listing_and_operator_actions() {
        let (app, _) = app_with_cycle(97.0).await;

        let (status, alerts) = get_json(&app, "/alerts?state=active&category=occupancy").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(alerts.as_array().map(Vec::len), Some(1));
        assert_eq!(alerts[0]["severity"], "critical");
        assert_eq!(alerts[0]["state"], "ACTIVE");
        let id = alerts[0]["id"].as_str().unwrap().to_string();

        let body = Body::from(r#"{"by":"night-supervisor","notes":"overflow ward opened"}"#);
        let (status, acked) = send(&app, "POST", &format!("/alerts/{id}/acknowledge"), body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(acked["state"], "ACKNOWLEDGED");
        assert_eq!(acked["acknowledged_by"], "night-supervisor");

        let (status, err) = send(&app, "POST", &format!("/alerts/{id}/acknowledge"), Body::empty()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(err["error"].as_str().unwrap().contains("cannot be acknowledged"));

        let (status, resolved) = send(&app, "PUT", &format!("/alerts/{id}/resolve"), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resolved["resolution"], "operator");

        let (status, fetched) = get_json(&app, &format!("/alerts/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["state"], "RESOLVED");

        let unknown = Uuid::new_v4();
        let (status, _) = send(&app, "POST", &format!("/alerts/{unknown}/resolve"), Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "POST", &format!("/alerts/{id}/resolve"), Body::from("not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dashboard_summary_reflects_open_alerts() {
        let (app, _) = app_with_cycle(97.0).await;
        let (_, critical) = get_json(&app, "/alerts?state=active&severity=critical").await;
        let critical = critical.as_array().map(Vec::len).unwrap_or_default();
        assert!((1..=5).contains(&critical));

        let (status, summary) = get_json(&app, "/dashboard/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["total_hospitals"], 1);
        assert_eq!(summary["critical_alerts"], critical);
        assert_eq!(summary["system_health"], "warning");
        assert!(summary["avg_performance_score"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn stream_replays_from_last_event_id() {
        let (app, _) = app_with_cycle(80.0).await;
        let response = app
            .oneshot(Request::get("/stream").header("last-event-id", "0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let mut body = response.into_body().into_data_stream();
        let chunk = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.contains("event: cycle"));
        assert!(text.contains("id: 1"));
    }
}
