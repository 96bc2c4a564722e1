use futures::StreamExt;
use inference_gateway::config::ProviderConfig;
use inference_gateway::models::{ChatMessage, ChatRequest, FinishReason, Role};
use inference_gateway::pool::PoolManager;
use inference_gateway::provider::{self, ProviderKind};
use inference_gateway::Error;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(model: &str) -> ChatRequest {
    ChatRequest::new(
        model,
        vec![
            ChatMessage::text(Role::System, "You are terse."),
            ChatMessage::text(Role::User, "Say hi"),
        ],
    )
}

fn openai_config(server: &MockServer) -> ProviderConfig {
    ProviderConfig::new("openai", ProviderKind::OpenAi)
        .with_base_url(server.uri())
        .with_api_key("sk-test")
        .with_models(["gpt-4o-mini"])
}

#[tokio::test]
async fn openai_chat_completion_translates_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 1, "total_tokens": 13}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let pool = Arc::new(PoolManager::default());
    let connector = provider::build(openai_config(&server), pool.clone()).unwrap();
    let response = connector.chat_completion(&request("gpt-4o-mini")).await.unwrap();

    assert_eq!(response.first_text(), "hi");
    assert_eq!(response.finish_reason(), Some(FinishReason::Stop));
    assert_eq!(response.usage.total_tokens, 13);
    assert_eq!(pool.stats("openai").unwrap().active, 0);
}

#[tokio::test]
async fn openai_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"error": {"message": "bad model"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let connector =
        provider::build(openai_config(&server), Arc::new(PoolManager::default())).unwrap();
    let err = connector
        .chat_completion(&request("gpt-4o-mini"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Upstream { status: 400, .. }));
    assert!(err.is_client_error());
}

#[tokio::test]
async fn openai_stream_yields_deltas_and_usage() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"id\":\"c1\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: {\"id\":\"c1\",\"model\":\"gpt-4o-mini\",\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true, "stream_options": {"include_usage": true}})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let pool = Arc::new(PoolManager::default());
    let connector = provider::build(openai_config(&server), pool.clone()).unwrap();
    let mut stream = connector
        .chat_completion_stream(&request("gpt-4o-mini"))
        .await
        .unwrap();

    let mut text = String::new();
    let mut usage = None;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.unwrap();
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                text.push_str(content);
            }
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
    }
    drop(stream);

    assert_eq!(text, "Hello");
    let usage = usage.unwrap();
    assert_eq!(usage.total_tokens, 7);
    assert_eq!(pool.stats("openai").unwrap().active, 0);
}

#[tokio::test]
async fn anthropic_messages_are_translated() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "model": "claude-3-5-haiku-20241022",
            "system": "You are terse.",
            "max_tokens": 1024
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-haiku-20241022",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 9, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = ProviderConfig::new("anthropic", ProviderKind::Anthropic)
        .with_base_url(server.uri())
        .with_api_key("sk-ant");
    let connector = provider::build(config, Arc::new(PoolManager::default())).unwrap();
    let response = connector
        .chat_completion(&request("claude-3-5-haiku-20241022"))
        .await
        .unwrap();

    assert_eq!(response.first_text(), "hi");
    assert_eq!(response.finish_reason(), Some(FinishReason::Stop));
    assert_eq!(response.usage.prompt_tokens, 9);
    assert_eq!(response.usage.total_tokens, 10);
}

#[tokio::test]
async fn anthropic_has_no_embeddings() {
    let config = ProviderConfig::new("anthropic", ProviderKind::Anthropic).with_api_key("sk-ant");
    let connector = provider::build(config, Arc::new(PoolManager::default())).unwrap();
    let err = connector
        .embeddings(&inference_gateway::models::EmbeddingRequest {
            model: "claude".into(),
            input: inference_gateway::models::EmbeddingInput::One("hello".into()),
            dimensions: None,
            user: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unsupported_operation");
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn health_check_reports_unhealthy_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let connector =
        provider::build(openai_config(&server), Arc::new(PoolManager::default())).unwrap();
    let status = connector.health_check(Duration::from_secs(2)).await;
    assert!(!status.healthy);
    assert!(status.error.is_some());
}
