//! HTTP接口
//!
//! `/healthz`、`/ready`、`/metrics` 无需鉴权；`/v1/*` 需要API密钥并受限流约束。

pub mod handlers;
pub mod middleware;

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::config::Config;
use crate::error::Error;
use crate::gateway::Gateway;
use middleware::{ApiKeys, RateLimiter};

pub use middleware::Caller;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub keys: Arc<ApiKeys>,
    pub limiter: Arc<RateLimiter>,
    /// 未安装Prometheus记录器时为空（例如测试）
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, config: &Config, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            gateway,
            keys: Arc::new(ApiKeys::new(&config.auth)),
            limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            metrics,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code = self.code(), "Request failed: {}", self);
        }
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": self.code(),
            }
        });
        let mut response = (status, Json(body)).into_response();
        if let Error::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn is_probe(path: &str) -> bool {
    matches!(path, "/healthz" | "/ready" | "/metrics")
}

/// 构建完整的路由
pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/providers/health", get(handlers::providers_health))
        .route("/v1/providers/failover", get(handlers::providers_failover))
        .route("/v1/providers/pool", get(handlers::providers_pool))
        .route("/v1/providers/pricing", get(handlers::providers_pricing))
        .route("/v1/providers/estimate", post(handlers::providers_estimate))
        .route(
            "/v1/routing/rules",
            get(handlers::list_rules).post(handlers::create_rule),
        )
        .route(
            "/v1/routing/rules/:id",
            get(handlers::get_rule)
                .put(handlers::update_rule)
                .delete(handlers::delete_rule),
        )
        .route("/v1/routing/evaluate", post(handlers::evaluate_route))
        .route("/v1/cache/stats", get(handlers::cache_stats))
        .route("/v1/cache", delete(handlers::flush_cache))
        .route("/v1/cache/:namespace", delete(handlers::flush_namespace))
        .route(
            "/v1/cache/:namespace/:entry_id",
            delete(handlers::invalidate_entry),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .merge(v1)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                // 探针请求只在trace级别记录
                if is_probe(request.uri().path()) {
                    tracing::trace_span!("probe", uri = %request.uri())
                } else {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        version = ?request.version(),
                    )
                }
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
