use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::convert::Infallible;
use tracing::{debug, warn};

use super::{AppState, Caller};
use crate::cache::{self, CacheDirective};
use crate::error::{Error, Result};
use crate::gateway::{CallContext, StreamOutcome};
use crate::models::{ChatRequest, EmbeddingRequest};
use crate::provider::ChatStream;
use crate::router::{RoutingContext, RuleDefinition};

const HEADER_PROVIDER: &str = "x-gateway-provider";
const HEADER_CACHE: &str = "x-gateway-cache";
const HEADER_COST: &str = "x-gateway-cost";
const HEADER_NAMESPACE: &str = "x-cache-namespace";

/// 解析请求体，失败时返回400而不是axum默认的422
fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Validation(format!("invalid JSON body: {}", e)))
}

/// 从请求头中解析缓存指示和命名空间
fn call_context(caller: &Caller, headers: &HeaderMap) -> CallContext {
    let cache_control = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();
    let bypass_header = headers
        .get(HEADER_CACHE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bypass"));
    let bypass = bypass_header
        || cache_control
            .split(',')
            .map(str::trim)
            .any(|d| d == "no-cache" || d == "no-store");

    let namespace = caller.scope(headers.get(HEADER_NAMESPACE).and_then(|v| v.to_str().ok()));

    CallContext {
        api_key: caller.name.clone(),
        namespace,
        cache: if bypass {
            CacheDirective::Bypass
        } else {
            CacheDirective::Default
        },
    }
}

fn set_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
}

/// 对话补全，`stream` 为真时返回SSE
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request: ChatRequest = parse_json(&body)?;
    let call = call_context(&caller, &headers);
    debug!(model = %request.model, stream = request.stream, "Chat completion request");

    if request.stream {
        let outcome = state.gateway.chat_stream(request, &call).await?;
        return Ok(sse_response(outcome));
    }

    let outcome = state.gateway.chat(request, &call).await?;
    let mut response = Json(outcome.response).into_response();
    if let Some(provider) = &outcome.provider {
        set_header(&mut response, HEADER_PROVIDER, provider);
    }
    set_header(&mut response, HEADER_CACHE, outcome.cache.as_str());
    set_header(&mut response, HEADER_COST, &outcome.cost.to_string());
    Ok(response)
}

fn sse_response(outcome: StreamOutcome) -> Response {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no") // 禁用 nginx 缓冲
        .body(sse_body(outcome.stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    if let Some(provider) = &outcome.provider {
        set_header(&mut response, HEADER_PROVIDER, provider);
    }
    set_header(&mut response, HEADER_CACHE, outcome.cache.as_str());
    response
}

/// 把增量流编码为SSE
///
/// 客户端断开时axum丢弃响应体，上游流和连接池名额随之释放
fn sse_body(mut stream: ChatStream) -> Body {
    let events = async_stream::stream! {
        let mut failed = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => match serde_json::to_string(&chunk) {
                    Ok(data) => yield Ok::<Bytes, Infallible>(Bytes::from(format!("data: {}\n\n", data))),
                    Err(e) => warn!("Failed to encode stream chunk: {}", e),
                },
                Err(e) => {
                    let payload = json!({
                        "error": {
                            "message": e.to_string(),
                            "type": e.kind(),
                            "code": e.code(),
                        }
                    });
                    yield Ok(Bytes::from(format!("data: {}\n\n", payload)));
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
        }
    };
    Body::from_stream(events)
}

pub async fn embeddings(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request: EmbeddingRequest = parse_json(&body)?;
    let call = call_context(&caller, &headers);
    let response = state.gateway.embeddings(request, &call).await?;
    Ok(Json(response).into_response())
}

pub async fn list_models(State(state): State<AppState>) -> Response {
    let models = state.gateway.list_models().await;
    Json(json!({ "object": "list", "data": models })).into_response()
}

pub async fn providers_health(State(state): State<AppState>) -> Response {
    Json(state.gateway.health_snapshot()).into_response()
}

pub async fn providers_failover(State(state): State<AppState>) -> Response {
    Json(state.gateway.failover_snapshot()).into_response()
}

pub async fn providers_pool(State(state): State<AppState>) -> Response {
    Json(state.gateway.pool_snapshot()).into_response()
}

pub async fn providers_pricing(State(state): State<AppState>) -> Response {
    Json(json!({ "object": "list", "data": state.gateway.pricing() })).into_response()
}

/// 按路由结果预估费用，不调用上游
pub async fn providers_estimate(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request: ChatRequest = parse_json(&body)?;
    let call = call_context(&caller, &headers);
    let estimate = state.gateway.estimate(&request, &call)?;
    Ok(Json(estimate).into_response())
}

pub async fn list_rules(State(state): State<AppState>) -> Response {
    Json(json!({ "object": "list", "data": state.gateway.router().list() })).into_response()
}

pub async fn create_rule(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let definition: RuleDefinition = parse_json(&body)?;
    let rule = state.gateway.router().create(definition)?;
    Ok((StatusCode::CREATED, Json(rule)).into_response())
}

pub async fn get_rule(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    let rule = state.gateway.router().get(&id)?;
    Ok(Json(rule).into_response())
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response> {
    let definition: RuleDefinition = parse_json(&body)?;
    let rule = state.gateway.router().update(&id, definition)?;
    Ok(Json(rule).into_response())
}

pub async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response> {
    state.gateway.router().delete(&id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// 对合成的请求属性试运行路由，不增加命中计数
pub async fn evaluate_route(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let ctx: RoutingContext = parse_json(&body)?;
    let decision = state.gateway.router().evaluate(&ctx, false)?;
    Ok(Json(decision).into_response())
}

/// 已配置命名空间的调用方只看到自己的命名空间
pub async fn cache_stats(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Response {
    let mut stats = state.gateway.cache().stats().await;
    if let Some(own) = &caller.namespace {
        stats.namespaces.retain(|name, _| cache::in_scope(name, own));
    }
    Json(stats).into_response()
}

pub async fn flush_cache(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Response {
    match &caller.namespace {
        Some(own) => {
            let flushed = state.gateway.cache().flush_scope(own);
            Json(json!({ "flushed": own, "namespaces": flushed })).into_response()
        }
        None => {
            state.gateway.cache().flush_all();
            Json(json!({ "flushed": "all" })).into_response()
        }
    }
}

pub async fn flush_namespace(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(namespace): Path<String>,
) -> Result<Response> {
    let namespace = caller.scope(Some(&namespace)).unwrap_or(namespace);
    if !state.gateway.cache().flush_namespace(&namespace) {
        return Err(Error::NotFound(format!("cache namespace '{}'", namespace)));
    }
    Ok(Json(json!({ "flushed": namespace })).into_response())
}

pub async fn invalidate_entry(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path((namespace, entry_id)): Path<(String, String)>,
) -> Result<Response> {
    let namespace = caller.scope(Some(&namespace)).unwrap_or(namespace);
    if !state.gateway.cache().invalidate(&namespace, &entry_id).await {
        return Err(Error::NotFound(format!(
            "cache entry '{}' in namespace '{}'",
            entry_id, namespace
        )));
    }
    Ok(Json(json!({ "invalidated": entry_id })).into_response())
}

pub async fn healthz() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

/// 至少一个供应商健康（或尚未注册供应商）时返回200
pub async fn ready(State(state): State<AppState>) -> Response {
    let ready = state.gateway.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if ready { "ready" } else { "not_ready" },
        "healthy_providers": state.gateway.health().healthy_providers(),
    });
    (status, Json(body)).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    state.gateway.pool().publish_gauges();
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatChunk;
    use futures::stream;

    #[test]
    fn cache_headers_map_to_directive() {
        let caller = Caller {
            name: Some("team-a".into()),
            namespace: Some("team-a".into()),
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, "max-age=0, No-Store".parse().unwrap());
        let call = call_context(&caller, &headers);
        assert_eq!(call.cache, CacheDirective::Bypass);
        assert_eq!(call.namespace.as_deref(), Some("team-a"));

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_CACHE, "BYPASS".parse().unwrap());
        headers.insert(HEADER_NAMESPACE, "shared".parse().unwrap());
        let call = call_context(&caller, &headers);
        assert_eq!(call.cache, CacheDirective::Bypass);
        assert_eq!(call.namespace.as_deref(), Some("team-a/shared"));

        let call = call_context(&caller, &HeaderMap::new());
        assert_eq!(call.cache, CacheDirective::Default);
    }

    #[test]
    fn namespace_header_cannot_escape_tenant() {
        let team_a = Caller {
            name: Some("team-a".into()),
            namespace: Some("team-a".into()),
        };
        for (requested, expected) in [
            ("team-b", "team-a/team-b"),
            ("team-a", "team-a"),
            ("team-a/drafts", "team-a/drafts"),
            ("../team-b", "team-a/../team-b"),
        ] {
            let mut headers = HeaderMap::new();
            headers.insert(HEADER_NAMESPACE, requested.parse().unwrap());
            assert_eq!(
                call_context(&team_a, &headers).namespace.as_deref(),
                Some(expected)
            );
        }

        let anonymous = Caller::default();
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_NAMESPACE, "scratch".parse().unwrap());
        assert_eq!(call_context(&anonymous, &headers).namespace.as_deref(), Some("scratch"));
        assert_eq!(call_context(&anonymous, &HeaderMap::new()).namespace, None);
    }

    #[tokio::test]
    async fn sse_body_ends_with_done_marker() {
        let chunks: Vec<Result<ChatChunk>> = vec![Ok(ChatChunk::new("c1", "m"))];
        let body = sse_body(Box::pin(stream::iter(chunks)));
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn sse_body_reports_errors_without_done() {
        let chunks: Vec<Result<ChatChunk>> = vec![Err(Error::Protocol("bad frame".into()))];
        let body = sse_body(Box::pin(stream::iter(chunks)));
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("\"code\":\"protocol_error\""));
        assert!(!text.contains("[DONE]"));
    }
}
