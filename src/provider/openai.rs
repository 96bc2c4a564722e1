//! OpenAI 及 OpenAI 兼容服务（vLLM、Ollama、LM Studio 等）的连接器
//!
//! 规范化结构本身就是 OpenAI 的形状，这里主要处理上游返回中的可空字段、
//! 结束原因词表以及流式增量。Azure 连接器复用本模块的线上格式解析。

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, Delta, EmbeddingRequest,
    EmbeddingResponse, FinishReason, HealthStatus, MessageContent, ModelInfo, Role, ToolCall,
    ToolCallDelta, Usage,
};
use crate::pool::PoolManager;
use crate::provider::sse::{chunk_stream, SseEvent};
use crate::provider::{ChatStream, Provider, ProviderKind, Upstream};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    upstream: Upstream,
    kind: ProviderKind,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig, pool: Arc<PoolManager>) -> Result<Self> {
        let kind = config.kind;
        Ok(Self {
            upstream: Upstream::new(config, pool)?,
            kind,
        })
    }

    fn url(&self, path: &str) -> String {
        self.upstream.v1_url(OPENAI_BASE_URL, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.upstream.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        self.upstream.name()
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn declared_models(&self) -> &[String] {
        &self.upstream.config.models
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = chat_body(request, true, false, false)?;
        let url = self.url("/chat/completions");
        let wire: WireResponse = self
            .upstream
            .send_json(|http| Ok(self.authorize(http.post(&url)).json(&body)), false)
            .await?;
        wire.into_canonical(&request.model)
    }

    async fn chat_completion_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        // 官方接口需要显式开启才会在末尾返回usage
        let include_usage = self.kind == ProviderKind::OpenAi;
        let body = chat_body(request, true, true, include_usage)?;
        let url = self.url("/chat/completions");
        let (response, guard) = self
            .upstream
            .send(|http| Ok(self.authorize(http.post(&url)).json(&body)), false, true)
            .await?;
        let model = request.model.clone();
        Ok(chunk_stream(response, guard, move |event| {
            translate_chunk(&event, &model)
        }))
    }

    async fn embeddings(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let mut body = json!({
            "model": request.model,
            "input": request.input,
        });
        if let Some(dimensions) = request.dimensions {
            body["dimensions"] = json!(dimensions);
        }
        let url = self.url("/embeddings");
        self.upstream
            .send_json(|http| Ok(self.authorize(http.post(&url)).json(&body)), false)
            .await
    }

    async fn health_check(&self, timeout: Duration) -> HealthStatus {
        let url = self.url("/models");
        self.upstream
            .probe(timeout, |http| Ok(self.authorize(http.get(&url))))
            .await
    }

    async fn models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.url("/models");
        let list: WireModelList = self
            .upstream
            .send_json(|http| Ok(self.authorize(http.get(&url))), true)
            .await?;
        Ok(list.into_models(self.name()))
    }
}

/// 构造 OpenAI 形状的请求体
///
/// `include_model` 为假时（Azure按部署路由）不在请求体里放模型名。
pub(crate) fn chat_body(
    request: &ChatRequest,
    include_model: bool,
    stream: bool,
    include_usage: bool,
) -> Result<Value> {
    let mut body = serde_json::to_value(request)?;
    let map = body
        .as_object_mut()
        .ok_or_else(|| Error::Protocol("chat request did not serialize to an object".into()))?;
    if !include_model {
        map.remove("model");
    }
    map.insert("stream".into(), Value::Bool(stream));
    if stream && include_usage {
        map.insert("stream_options".into(), json!({ "include_usage": true }));
    }
    Ok(body)
}

/// OpenAI 结束原因到规范化枚举
pub(crate) fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        "stop" => FinishReason::Stop,
        other => {
            debug!("Unknown finish reason '{}', treating as stop", other);
            FinishReason::Stop
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: u32,
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: u32,
}

impl WireUsage {
    pub fn into_usage(self) -> Usage {
        Usage::new(self.prompt_tokens, self.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMessage {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: Option<MessageContent>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireChoice {
    #[serde(default)]
    index: u32,
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

impl WireResponse {
    pub fn into_canonical(self, requested_model: &str) -> Result<ChatResponse> {
        if self.choices.is_empty() {
            return Err(Error::Protocol("upstream response has no choices".into()));
        }
        let choices = self
            .choices
            .into_iter()
            .map(|c| {
                let tool_calls = c.message.tool_calls.unwrap_or_default();
                let finish_reason = c.finish_reason.as_deref().map(map_finish_reason);
                Choice {
                    index: c.index,
                    message: ChatMessage {
                        role: c.message.role.unwrap_or(Role::Assistant),
                        content: c.message.content,
                        name: None,
                        tool_calls,
                        tool_call_id: None,
                    },
                    finish_reason,
                }
            })
            .collect();
        Ok(ChatResponse {
            id: self.id.unwrap_or_else(|| super::response_id("chatcmpl")),
            object: "chat.completion".into(),
            created: self.created.unwrap_or_else(|| Utc::now().timestamp()),
            model: self.model.unwrap_or_else(|| requested_model.to_string()),
            choices,
            usage: self.usage.map(WireUsage::into_usage).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

/// 把一个 OpenAI SSE 事件转换为规范化增量
pub(crate) fn translate_chunk(event: &SseEvent, requested_model: &str) -> Result<Vec<ChatChunk>> {
    if event.data.trim().is_empty() {
        return Ok(Vec::new());
    }
    let wire: WireChunk = serde_json::from_str(&event.data)
        .map_err(|e| Error::Protocol(format!("invalid stream chunk: {}", e)))?;

    let mut chunk = ChatChunk::new(
        wire.id.unwrap_or_else(|| super::response_id("chatcmpl")),
        wire.model.unwrap_or_else(|| requested_model.to_string()),
    );
    if let Some(created) = wire.created {
        chunk.created = created;
    }
    for choice in wire.choices {
        let delta = choice.delta.map(|d| Delta {
            role: d.role,
            content: d.content,
            tool_calls: d.tool_calls.unwrap_or_default(),
        });
        chunk.choices.push(crate::models::ChunkChoice {
            index: choice.index,
            delta: delta.unwrap_or_default(),
            finish_reason: choice.finish_reason.as_deref().map(map_finish_reason),
        });
    }
    chunk.usage = wire.usage.map(WireUsage::into_usage);

    if chunk.choices.is_empty() && chunk.usage.is_none() {
        return Ok(Vec::new());
    }
    Ok(vec![chunk])
}

#[derive(Debug, Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    owned_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireModelList {
    #[serde(default)]
    data: Vec<WireModel>,
}

impl WireModelList {
    pub fn into_models(self, provider: &str) -> Vec<ModelInfo> {
        self.data
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                object: "model".into(),
                created: m.created.unwrap_or(0),
                owned_by: m.owned_by.unwrap_or_else(|| provider.to_string()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_body_requests_usage() {
        let request = ChatRequest::new("gpt-4o", vec![ChatMessage::text(Role::User, "hi")]);
        let body = chat_body(&request, true, true, true).unwrap();
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));

        let deployment_body = chat_body(&request, false, false, false).unwrap();
        assert!(deployment_body.get("model").is_none());
    }

    #[test]
    fn parses_response_with_null_fields() {
        let raw = json!({
            "id": "chatcmpl-1",
            "created": 10,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{}"}}
                ]},
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 99}
        });
        let wire: WireResponse = serde_json::from_value(raw).unwrap();
        let response = wire.into_canonical("gpt-4o").unwrap();
        assert_eq!(response.finish_reason(), Some(FinishReason::ToolCalls));
        assert_eq!(response.choices[0].message.tool_calls[0].id, "call_1");
        // total is recomputed from the parts
        assert_eq!(response.usage.total_tokens, 12);
    }

    #[test]
    fn translates_stream_chunks() {
        let event = SseEvent {
            event: None,
            data: r#"{"id":"c1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"He"},"finish_reason":null}]}"#.into(),
        };
        let chunks = translate_chunk(&event, "gpt-4o").unwrap();
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("He"));

        let usage = SseEvent {
            event: None,
            data: r#"{"id":"c1","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2}}"#.into(),
        };
        let chunks = translate_chunk(&usage, "gpt-4o").unwrap();
        assert_eq!(chunks[0].usage, Some(Usage::new(3, 2)));
    }
}
