//! The admin HTTP surface.
//!
//! A thin axum adapter over the SessionManager: session lifecycle control,
//! pairing-code retrieval, and fleet stats. Every mutating route is
//! rate-limited per caller identifier.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

use hive_core::store::SessionStore;
use hive_core::{SessionManager, SessionSource, session_id_for};

use crate::rate_limit::ApiLimits;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The fleet.
    pub manager: Arc<SessionManager>,
    /// Session metadata rows, for status and reconnect lookups.
    pub store: Arc<dyn SessionStore>,
    /// Per-identifier limits.
    pub limits: Arc<ApiLimits>,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

/// Build the admin router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/session/create", post(session_create))
        .route("/session/pairing-code", get(session_pairing_code))
        .route("/session/disconnect", post(session_disconnect))
        .route("/session/reconnect", post(session_reconnect))
        .route("/session/stats", get(session_stats))
        .route("/session/status", get(session_status))
        .with_state(state)
}

fn ok(body: serde_json::Value) -> Response {
    (StatusCode::OK, axum::Json(body)).into_response()
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

fn too_many_requests() -> Response {
    error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
}

async fn health() -> Response {
    ok(json!({ "status": "ok" }))
}

async fn api_status(State(state): State<AppState>) -> Response {
    let stats = state.manager.get_stats();
    ok(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "sessions": stats,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    user_id: String,
    phone_number: String,
    #[serde(default)]
    source: Option<String>,
}

async fn session_create(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<CreateRequest>,
) -> Response {
    if !state.limits.allow_create(&request.user_id) {
        return too_many_requests();
    }

    let source = match request.source.as_deref() {
        None | Some("web") => SessionSource::Web,
        Some("telegram") => SessionSource::Telegram,
        Some(other) => {
            return error(StatusCode::BAD_REQUEST, format!("unknown source: {other}"));
        }
    };

    match state
        .manager
        .create_session(&request.user_id, &request.phone_number, source, false, true)
        .await
    {
        Ok(_) => ok(json!({
            "success": true,
            "session_id": session_id_for(&request.user_id),
        })),
        Err(e) => {
            tracing::warn!(user_id = request.user_id, error = %e, "session create failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

impl SessionQuery {
    fn resolve(&self) -> Option<String> {
        self.session_id
            .clone()
            .or_else(|| self.user_id.as_deref().map(session_id_for))
    }
}

async fn session_pairing_code(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(session_id) = query.resolve() else {
        return error(StatusCode::BAD_REQUEST, "session_id or user_id required");
    };
    if !state.limits.allow_default(&session_id) {
        return too_many_requests();
    }

    match state.manager.get_pairing_code(&session_id) {
        Some(code) => ok(json!({ "success": true, "pairing_code": code })),
        None => error(StatusCode::NOT_FOUND, "no pairing code available"),
    }
}

#[derive(Debug, Deserialize)]
struct DisconnectRequest {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    force_cleanup: bool,
}

async fn session_disconnect(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<DisconnectRequest>,
) -> Response {
    let query = SessionQuery {
        session_id: request.session_id,
        user_id: request.user_id,
    };
    let Some(session_id) = query.resolve() else {
        return error(StatusCode::BAD_REQUEST, "session_id or user_id required");
    };
    if !state.limits.allow_default(&session_id) {
        return too_many_requests();
    }

    match state
        .manager
        .disconnect_session(&session_id, request.force_cleanup)
        .await
    {
        Ok(()) => ok(json!({ "success": true })),
        Err(hive_core::ManagerError::NotFound(_)) => {
            error(StatusCode::NOT_FOUND, "session not found")
        }
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ReconnectRequest {
    user_id: String,
}

async fn session_reconnect(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<ReconnectRequest>,
) -> Response {
    if !state.limits.allow_create(&request.user_id) {
        return too_many_requests();
    }

    let session_id = session_id_for(&request.user_id);
    let row = match state.store.get_session(&session_id).await {
        Ok(Some(row)) => row,
        Ok(None) => return error(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    match state
        .manager
        .create_session(&row.user_id, &row.phone_number, row.source, true, false)
        .await
    {
        Ok(_) => ok(json!({ "success": true, "session_id": session_id })),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn session_stats(State(state): State<AppState>) -> Response {
    ok(json!({ "success": true, "stats": state.manager.get_stats() }))
}

async fn session_status(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(session_id) = query.resolve() else {
        return error(StatusCode::BAD_REQUEST, "session_id or user_id required");
    };
    if !state.limits.allow_default(&session_id) {
        return too_many_requests();
    }

    match state.store.get_session(&session_id).await {
        Ok(Some(row)) => ok(json!({
            "success": true,
            "session_id": row.session_id,
            "phone_number": row.phone_number,
            "source": row.source.as_str(),
            "connection_status": row.connection_status.as_str(),
            "reconnect_attempts": row.reconnect_attempts,
            "really_connected": state.manager.is_really_connected(&session_id),
            "last_message_at": row.last_message_at.map(|t| t.to_rfc3339()),
        })),
        Ok(None) => error(StatusCode::NOT_FOUND, "session not found"),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use hive_core::auth::AuthStore;
    use hive_core::config::StorageMode;
    use hive_core::connection::{ConnectSettings, ConnectionManager};
    use hive_core::dedup::DedupLedger;
    use hive_core::driver::DriverFactory;
    use hive_core::driver::mock::MockDriverFactory;
    use hive_core::group_cache::GroupCache;
    use hive_core::plugin::PluginHost;
    use hive_core::rate_bucket::RateBucket;
    use hive_core::store::SqliteSessionStore;
    use hive_core::{
        ControlNotifier, Dispatcher, ManagerSettings, NoopNotifier, Outbound,
    };
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    async fn test_state(limits: ApiLimits) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let auth = AuthStore::new(
            dir.path().join("auth"),
            StorageMode::File,
            None,
            cancel.child_token(),
        );
        let store: Arc<dyn SessionStore> = Arc::new(
            SqliteSessionStore::new(&format!("sqlite:{}", dir.path().join("db").display()))
                .await
                .unwrap(),
        );
        let factory = MockDriverFactory::new();
        let connections = ConnectionManager::new(
            Arc::clone(&auth),
            factory as Arc<dyn DriverFactory>,
            ConnectSettings {
                store_bind_delay: Duration::ZERO,
                pairing_poll_interval: Duration::from_millis(10),
                pairing_wait_timeout: Duration::from_millis(200),
                pairing_grace: Duration::from_millis(100),
                ..ConnectSettings::default()
            },
        );
        let outbound = Arc::new(Outbound::new(Arc::new(RateBucket::with_gap(
            Duration::from_millis(1),
        ))));
        let groups = Arc::new(GroupCache::new());
        let dispatcher = Dispatcher::new(
            PluginHost::new(),
            DedupLedger::new(),
            Arc::clone(&groups),
            Arc::clone(&store),
            Arc::clone(&outbound),
            ".",
        );

        let manager = SessionManager::new(
            Arc::clone(&store),
            auth,
            connections,
            dispatcher,
            groups,
            outbound,
            Arc::new(NoopNotifier) as Arc<dyn ControlNotifier>,
            None,
            ManagerSettings {
                open_flush_delay: Duration::from_millis(10),
                ..ManagerSettings::default()
            },
            cancel,
        );

        (
            AppState {
                manager,
                store,
                limits: Arc::new(limits),
                started_at: Instant::now(),
            },
            dir,
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _dir) = test_state(ApiLimits::new()).await;
        let app = router(state);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_response()).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_and_status_round_trip() {
        let (state, _dir) = test_state(ApiLimits::new()).await;
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::post("/session/create")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"user_id":"42","phone_number":"15551234567","source":"web"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_response()).await;
        assert_eq!(body["session_id"], "session_42");

        let response = app
            .oneshot(
                Request::get("/session/status?session_id=session_42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_response()).await;
        assert_eq!(body["source"], "web");
    }

    #[tokio::test]
    async fn test_status_unknown_session_is_404() {
        let (state, _dir) = test_state(ApiLimits::new()).await;
        let app = router(state);

        let response = app
            .oneshot(
                Request::get("/session/status?session_id=session_missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_rate_limited_per_identifier() {
        let (state, _dir) = test_state(ApiLimits::with_bursts(1, 100)).await;
        let app = router(state);

        let make_request = || {
            Request::post("/session/create")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"user_id":"42","phone_number":"15551234567"}"#,
                ))
                .unwrap()
        };

        let first = app.clone().oneshot(make_request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(make_request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different identifier still passes.
        let other = app
            .oneshot(
                Request::post("/session/create")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"user_id":"43","phone_number":"15551234568"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (state, _dir) = test_state(ApiLimits::new()).await;
        let app = router(state);

        let response = app
            .oneshot(Request::get("/session/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_response()).await;
        assert_eq!(body["stats"]["total"], 0);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_session() {
        let (state, _dir) = test_state(ApiLimits::new()).await;
        let app = router(state);

        let response = app
            .oneshot(
                Request::post("/session/disconnect")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"session_id":"session_nope"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
