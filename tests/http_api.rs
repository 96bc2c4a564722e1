use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use inference_gateway::config::{ApiKeyConfig, Config, ProviderConfig};
use inference_gateway::gateway::Gateway;
use inference_gateway::provider::ProviderKind;
use inference_gateway::server::{self, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "sk-gateway-test";

fn config() -> Config {
    let mut config = Config::default();
    config.auth.enabled = true;
    config.auth.keys = vec![ApiKeyConfig {
        key: KEY.into(),
        name: "team-a".into(),
        cache_namespace: None,
    }];
    config
}

fn app(config: &Config) -> Router {
    let gateway = Arc::new(Gateway::from_config(config).unwrap());
    server::router(AppState::new(gateway, config, None))
}

fn authed(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", KEY));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn v1_requires_api_key() {
    let app = app(&config());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "unauthorized");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .header("x-api-key", "sk-wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.oneshot(authed("GET", "/v1/models", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["object"], "list");
}

#[tokio::test]
async fn probes_skip_authentication() {
    let app = app(&config());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // 没有注册供应商时视为就绪
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ready");

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rate_limit_returns_retry_after() {
    let mut config = config();
    config.rate_limit.enabled = true;
    config.rate_limit.requests_per_minute = 1;
    config.rate_limit.burst = 1;
    let app = app(&config);

    let first = app.clone().oneshot(authed("GET", "/v1/models", None)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(authed("GET", "/v1/models", None)).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    assert_eq!(json_body(second).await["error"]["code"], "rate_limited");
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let app = app(&config());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer {}", KEY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn routing_rules_crud() {
    let app = app(&config());
    let definition = json!({
        "name": "long prompts to mini",
        "priority": 10,
        "conditions": [{"field": "prompt_chars", "operator": "gt", "value": 2000}],
        "action": {"type": "route_to_model", "model": "gpt-4o-mini"}
    });

    let response = app
        .clone()
        .oneshot(authed("POST", "/v1/routing/rules", Some(definition)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["hit_count"], 0);

    let updated = json!({
        "name": "long prompts to mini",
        "priority": 5,
        "active": false,
        "action": {"type": "route_to_model", "model": "gpt-4o-mini"}
    });
    let response = app
        .clone()
        .oneshot(authed("PUT", &format!("/v1/routing/rules/{}", id), Some(updated)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["priority"], 5);
    assert_eq!(body["active"], false);

    let response = app
        .clone()
        .oneshot(authed("GET", "/v1/routing/rules", None))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["data"].as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(authed("DELETE", &format!("/v1/routing/rules/{}", id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(authed("GET", &format!("/v1/routing/rules/{}", id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_rule_is_rejected() {
    let app = app(&config());
    let definition = json!({
        "name": " ",
        "action": {"type": "route_to_model", "model": "gpt-4o-mini"}
    });
    let response = app
        .oneshot(authed("POST", "/v1/routing/rules", Some(definition)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_is_served_then_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-http",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "llama-3",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Paris"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 1, "total_tokens": 13}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = config();
    config.providers = vec![ProviderConfig::new("local", ProviderKind::OpenAiCompatible)
        .with_base_url(server.uri())
        .with_models(["llama-3"])];
    let app = app(&config);
    let body = json!({
        "model": "llama-3",
        "messages": [{"role": "user", "content": "What is the capital of France?"}]
    });

    let response = app
        .clone()
        .oneshot(authed("POST", "/v1/chat/completions", Some(body.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gateway-provider"], "local");
    assert_eq!(response.headers()["x-gateway-cache"], "miss");
    let first = json_body(response).await;
    assert_eq!(first["choices"][0]["message"]["content"], "Paris");

    let response = app
        .clone()
        .oneshot(authed("POST", "/v1/chat/completions", Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gateway-cache"], "hit");
    assert_eq!(json_body(response).await["choices"][0]["message"]["content"], "Paris");

    // 缓存命名空间默认取调用方名称
    let response = app
        .clone()
        .oneshot(authed("DELETE", "/v1/cache/team-a", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(authed("DELETE", "/v1/cache/team-a", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    server.verify().await;
}

#[tokio::test]
async fn estimate_does_not_call_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let mut config = config();
    config.providers = vec![ProviderConfig::new("openai", ProviderKind::OpenAi)
        .with_base_url(server.uri())
        .with_api_key("sk-test")
        .with_models(["gpt-4o-mini"])];
    let app = app(&config);
    let body = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "Summarise this paragraph."}],
        "max_tokens": 100
    });

    let response = app
        .oneshot(authed("POST", "/v1/providers/estimate", Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let estimate = json_body(response).await;
    assert_eq!(estimate["provider"], "openai");
    assert_eq!(estimate["completion_tokens"], 100);
    assert!(estimate["prompt_tokens"].as_u64().unwrap() > 0);
    server.verify().await;
}

#[tokio::test]
async fn tenants_cannot_reach_each_others_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-tenant",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "llama-3",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "secret plan"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
        })))
        .expect(2)
        .mount(&server)
        .await;

    let mut config = config();
    config.auth.keys.push(ApiKeyConfig {
        key: "sk-team-b".into(),
        name: "team-b".into(),
        cache_namespace: None,
    });
    config.providers = vec![ProviderConfig::new("local", ProviderKind::OpenAiCompatible)
        .with_base_url(server.uri())
        .with_models(["llama-3"])];
    let app = app(&config);
    let body = json!({
        "model": "llama-3",
        "messages": [{"role": "user", "content": "What is our launch plan?"}]
    });

    let response = app
        .clone()
        .oneshot(authed("POST", "/v1/chat/completions", Some(body.clone())))
        .await
        .unwrap();
    assert_eq!(response.headers()["x-gateway-cache"], "miss");

    let as_team_b = |method: &str, uri: &str, body: Option<Value>| {
        let mut request = authed(method, uri, body);
        request.headers_mut().insert(
            header::AUTHORIZATION,
            "Bearer sk-team-b".parse().unwrap(),
        );
        request
    };

    let mut request = as_team_b("POST", "/v1/chat/completions", Some(body));
    request
        .headers_mut()
        .insert("x-cache-namespace", "team-a".parse().unwrap());
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-gateway-cache"], "miss");

    let response = app
        .clone()
        .oneshot(as_team_b("DELETE", "/v1/cache/team-a", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(as_team_b("GET", "/v1/cache/stats", None))
        .await
        .unwrap();
    let stats = json_body(response).await;
    let visible: Vec<&String> = stats["namespaces"].as_object().unwrap().keys().collect();
    assert_eq!(visible, vec!["team-b/team-a"]);

    let response = app
        .oneshot(authed("DELETE", "/v1/cache/team-a", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    server.verify().await;
}
