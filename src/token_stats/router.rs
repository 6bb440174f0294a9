//! Token 统计 API 路由

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json},
    routing::{get, post},
};

use crate::common::auth;
use crate::recorder::LogRecorder;

use super::handlers::{
    get_active_sessions, get_cost_summary, get_health, get_logs, get_retention, get_session_stats,
    get_summary, get_trends, post_capture, post_checkpoint, post_cleanup, post_record,
    put_retention,
};
use super::manager::TokenStats;
use super::retention::RetentionConfigProvider;

/// Token 统计 API 状态
#[derive(Clone)]
pub struct TokenStatsState {
    /// 未配置时不做认证（仅监听本机时使用）
    pub admin_api_key: Option<String>,
    pub stats: Arc<TokenStats>,
    pub recorder: Arc<LogRecorder>,
    pub retention: Arc<dyn RetentionConfigProvider>,
}

async fn admin_auth_middleware(
    State(state): State<TokenStatsState>,
    request: Request<Body>,
    next: Next,
) -> axum::response::Response {
    let Some(expected) = state.admin_api_key.as_deref() else {
        return next.run(request).await;
    };

    match auth::extract_api_key(&request) {
        Some(key) if auth::constant_time_eq(&key, expected) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": {"type": "authentication_error", "message": "Invalid API key"}
            })),
        )
            .into_response(),
    }
}

/// 创建 Token 统计路由
///
/// 返回 Router<()>，由调用方 nest 到 `/api/token-stats`
pub fn create_token_stats_router(state: TokenStatsState) -> Router {
    Router::new()
        .route("/logs", get(get_logs))
        .route("/records", post(post_record))
        .route("/capture", post(post_capture))
        .route("/sessions/active", get(get_active_sessions))
        .route("/sessions/{tool_type}/{session_id}", get(get_session_stats))
        .route("/summary", get(get_summary))
        .route("/retention", get(get_retention).put(put_retention))
        .route("/cleanup", post(post_cleanup))
        .route("/trends", get(get_trends))
        .route("/cost-summary", get(get_cost_summary))
        .route("/checkpoint", post(post_checkpoint))
        .route("/health", get(get_health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::http::header;
    use http_body_util::BodyExt;
    use parking_lot::RwLock;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::recorder::{PricingTable, default_pricing};
    use crate::token_stats::retention::RetentionConfig;
    use crate::token_stats::writer::BatchOptions;

    struct TestApp {
        _dir: tempfile::TempDir,
        stats: Arc<TokenStats>,
        router: Router,
    }

    fn app(admin_api_key: Option<&str>) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(
            TokenStats::open(dir.path().join("token_stats.db"), BatchOptions::default()).unwrap(),
        );
        let state = TokenStatsState {
            admin_api_key: admin_api_key.map(|k| k.to_string()),
            stats: stats.clone(),
            recorder: Arc::new(LogRecorder::new(stats.clone(), PricingTable::new(default_pricing()))),
            retention: Arc::new(RwLock::new(RetentionConfig::default())),
        };
        TestApp {
            _dir: dir,
            stats,
            router: create_token_stats_router(state),
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn record_json(session: &str, timestamp: i64) -> Value {
        json!({
            "toolType": "claude-code",
            "timestamp": timestamp,
            "clientIp": "127.0.0.1",
            "sessionId": session,
            "configName": "default",
            "model": "claude-sonnet-4-5",
            "inputTokens": 100,
            "outputTokens": 20,
            "responseType": "sse",
            "requestStatus": "success",
            "responseTimeMs": 800,
            "totalCost": 0.01
        })
    }

    #[tokio::test]
    async fn test_record_then_query() {
        let app = app(None);
        let (status, _) = send(&app.router, json_req("POST", "/records", record_json("s1", 1_000))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        app.stats.flush().await.unwrap();

        let (status, body) = send(&app.router, get_req("/logs?toolType=claude-code&page=0&pageSize=10")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 1);
        assert_eq!(body["logs"][0]["sessionId"], "s1");
        assert_eq!(body["logs"][0]["requestStatus"], "success");

        let (status, body) = send(&app.router, get_req("/sessions/claude_code/s1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requestCount"], 1);
        assert_eq!(body["totalInputTokens"], 100);

        let (_, body) = send(&app.router, get_req("/sessions/active")).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        app.stats.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_record_rejected() {
        let app = app(None);
        let mut record = record_json("s1", 1);
        record["inputTokens"] = json!(-5);
        let (status, body) = send(&app.router, json_req("POST", "/records", record)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "invalid_request_error");

        let (status, _) = send(&app.router, get_req("/sessions/unknown-tool/s1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app.router, get_req("/logs?startTime=10&endTime=5")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        app.stats.shutdown().await;
    }

    #[tokio::test]
    async fn test_trends_and_cost_summary() {
        let app = app(None);
        for ts in [0, 30 * 60 * 1000, 90 * 60 * 1000] {
            send(&app.router, json_req("POST", "/records", record_json("s1", ts))).await;
        }
        app.stats.flush().await.unwrap();

        let end = 2 * 60 * 60 * 1000;
        let (status, body) = send(
            &app.router,
            get_req(&format!("/trends?startTime=0&endTime={end}&granularity=hour")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let buckets = body.as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["requestCount"], 2);
        assert_eq!(buckets[1]["requestCount"], 1);

        let (_, body) = send(&app.router, get_req("/trends?startTime=10&endTime=5")).await;
        assert_eq!(body.as_array().unwrap().len(), 0);

        let (status, _) = send(
            &app.router,
            get_req("/trends?startTime=0&endTime=100000000000&granularity=fifteen_minutes"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app.router, get_req(&format!("/cost-summary?startTime=0&endTime={end}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRequests"], 3);
        assert_eq!(body["groupBy"], "model");
        assert_eq!(body["groups"][0]["key"], "claude-sonnet-4-5");

        let (_, body) = send(
            &app.router,
            get_req(&format!("/cost-summary?startTime=0&endTime={end}&groupBy=session")),
        )
        .await;
        assert_eq!(body["groups"][0]["key"], "s1");
        assert_eq!(body["groups"][0]["requestCount"], 3);
        app.stats.shutdown().await;
    }

    #[tokio::test]
    async fn test_capture_produces_record() {
        let app = app(None);
        let capture = json!({
            "toolType": "codex",
            "requestBody": r#"{"model":"gpt-5","stream":false}"#,
            "responseStatus": 200,
            "responseBody": r#"{"id":"resp_1","model":"gpt-5","usage":{"input_tokens":10,"output_tokens":4}}"#,
            "responseTimeMs": 42
        });
        let (status, _) = send(&app.router, json_req("POST", "/capture", capture)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        app.stats.flush().await.unwrap();

        let (_, body) = send(&app.router, get_req("/logs?toolType=codex")).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["logs"][0]["responseTimeMs"], 42);
        assert_eq!(body["logs"][0]["messageId"], "resp_1");
        app.stats.shutdown().await;
    }

    #[tokio::test]
    async fn test_retention_update_and_cleanup() {
        let app = app(None);
        let (status, body) = send(
            &app.router,
            json_req("PUT", "/retention", json!({"retentionDays": 7, "autoCleanupEnabled": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retentionDays"], 7);

        let (_, body) = send(&app.router, get_req("/retention")).await;
        assert_eq!(body["retentionDays"], 7);
        assert_eq!(body["maxLogCount"], Value::Null);
        assert_eq!(body["autoCleanupEnabled"], false);

        let (status, body) = send(&app.router, json_req("POST", "/cleanup", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rowsDeleted"], 0);
        assert_eq!(body["noBoundsConfigured"], true);

        let (status, body) = send(&app.router, json_req("POST", "/checkpoint", json!({"mode": "truncate"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "truncate");
        app.stats.shutdown().await;
    }

    #[tokio::test]
    async fn test_admin_key_required_when_configured() {
        let app = app(Some("secret"));
        let (status, body) = send(&app.router, get_req("/summary")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["type"], "authentication_error");

        let request = Request::builder()
            .uri("/summary")
            .header("x-api-key", "secret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::OK);

        let request = Request::builder()
            .uri("/health")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
        app.stats.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_store_returns_unavailable() {
        let app = app(None);
        app.stats.shutdown().await;

        let (status, body) = send(&app.router, get_req("/summary")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["type"], "unavailable_error");

        let (status, _) = send(&app.router, json_req("POST", "/records", record_json("s1", 1))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
