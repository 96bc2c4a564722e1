//! AWS Bedrock 连接器（Converse API + Titan 嵌入）
//!
//! 默认使用 SigV4 签名；配置了 `api_key` 时改用 Bedrock API Key（Bearer）。
//! 流式响应是 AWS event-stream 二进制分帧，而不是 SSE。

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, ContentPart, Delta,
    EmbeddingRequest, EmbeddingResponse, FinishReason, FunctionCall, FunctionCallDelta,
    HealthStatus, MessageContent, ModelInfo, Role, ToolCall, ToolCallDelta, ToolChoice, Usage,
};
use crate::pool::{InFlight, PoolManager};
use crate::provider::eventstream::{EventMessage, EventStreamDecoder};
use crate::provider::sigv4::{self, AwsCredentials, SigningScope};
use crate::provider::{ChatStream, Provider, ProviderKind, Upstream};

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_EMBEDDING_MODEL: &str = "amazon.titan-embed-text-v2:0";
const SIGNING_SERVICE: &str = "bedrock";

pub struct BedrockProvider {
    upstream: Upstream,
    region: String,
    credentials: Option<AwsCredentials>,
}

impl BedrockProvider {
    pub fn new(config: ProviderConfig, pool: Arc<PoolManager>) -> Result<Self> {
        let region = config
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let credentials = match &config.aws {
            Some(aws) => Some(AwsCredentials {
                access_key_id: aws.access_key_id.clone(),
                secret_access_key: aws.secret_access_key.clone(),
                session_token: aws.session_token.clone(),
            }),
            None => AwsCredentials::from_env(),
        };
        if credentials.is_none() && config.api_key.is_none() {
            return Err(Error::Config(format!(
                "provider '{}': bedrock requires aws credentials or an api key",
                config.name
            )));
        }
        Ok(Self {
            upstream: Upstream::new(config, pool)?,
            region,
            credentials,
        })
    }

    fn base_url(&self) -> String {
        match &self.upstream.config.base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://bedrock-runtime.{}.amazonaws.com", self.region),
        }
    }

    /// 模型ID作为路径段编码（`:` → `%3A`）
    fn model_url(&self, model: &str, action: &str) -> String {
        format!(
            "{}/model/{}/{}",
            self.base_url(),
            sigv4::uri_encode(model, true),
            action
        )
    }

    /// 构造并签名请求；每次重试都会重新签名，时间戳保持新鲜
    fn signed(&self, http: &Client, method: &str, url: &str, body: &[u8]) -> Result<RequestBuilder> {
        let builder = match method {
            "GET" => http.get(url),
            _ => http
                .post(url)
                .header("content-type", "application/json")
                .body(body.to_vec()),
        };
        if let Some(key) = &self.upstream.config.api_key {
            return Ok(builder.bearer_auth(key));
        }
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| Error::Config("bedrock credentials missing".into()))?;
        let mut headers = BTreeMap::new();
        if method != "GET" {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        let signed = sigv4::sign(
            method,
            url,
            &headers,
            body,
            credentials,
            SigningScope {
                region: &self.region,
                service: SIGNING_SERVICE,
            },
            Utc::now(),
        )?;
        Ok(signed.apply(builder))
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        self.upstream.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Bedrock
    }

    fn declared_models(&self) -> &[String] {
        &self.upstream.config.models
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = serde_json::to_vec(&to_converse_request(request)?)?;
        let url = self.model_url(&request.model, "converse");
        let wire: ConverseResponse = self
            .upstream
            .send_json(|http| self.signed(http, "POST", &url, &body), false)
            .await?;
        from_converse_response(wire, &request.model)
    }

    async fn chat_completion_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let body = serde_json::to_vec(&to_converse_request(request)?)?;
        let url = self.model_url(&request.model, "converse-stream");
        let (response, guard) = self
            .upstream
            .send(|http| self.signed(http, "POST", &url, &body), false, true)
            .await?;
        Ok(event_stream(
            response,
            guard,
            StreamState::new(&request.model),
            self.name().to_string(),
        ))
    }

    /// Titan 嵌入：每条输入一次调用
    async fn embeddings(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let model = if request.model.is_empty() {
            self.upstream
                .config
                .embedding_model
                .clone()
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string())
        } else {
            request.model.clone()
        };
        let url = self.model_url(&model, "invoke");
        let mut vectors = Vec::new();
        let mut prompt_tokens = 0u32;
        for text in request.input.to_vec() {
            let mut payload = json!({ "inputText": text });
            if let Some(dimensions) = request.dimensions {
                payload["dimensions"] = json!(dimensions);
            }
            let body = serde_json::to_vec(&payload)?;
            let wire: TitanEmbedding = self
                .upstream
                .send_json(|http| self.signed(http, "POST", &url, &body), false)
                .await?;
            prompt_tokens = prompt_tokens.saturating_add(wire.input_text_token_count);
            vectors.push(wire.embedding);
        }
        Ok(EmbeddingResponse::from_vectors(model, vectors, prompt_tokens))
    }

    async fn health_check(&self, timeout: Duration) -> HealthStatus {
        let url = format!("{}/", self.base_url());
        self.upstream
            .probe(timeout, |http| self.signed(http, "GET", &url, b""))
            .await
    }

    /// 运行时端点没有模型目录，使用配置声明
    async fn models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self.upstream.declared_model_infos())
    }
}

/// 规范化请求 → Converse 请求体
pub fn to_converse_request(request: &ChatRequest) -> Result<Value> {
    let mut system: Vec<Value> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in &request.messages {
        let (role, blocks) = match message.role {
            Role::System => {
                let text = message.text_content();
                if !text.is_empty() {
                    system.push(json!({ "text": text }));
                }
                continue;
            }
            Role::User => ("user", content_blocks(message.content.as_ref())?),
            Role::Assistant => {
                let mut blocks: Vec<Value> = content_blocks(message.content.as_ref())?
                    .into_iter()
                    .filter(|b| b.get("text").and_then(Value::as_str) != Some(""))
                    .collect();
                for call in &message.tool_calls {
                    let input: Value = if call.function.arguments.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&call.function.arguments).map_err(|e| {
                            Error::Validation(format!("tool call arguments are not valid JSON: {}", e))
                        })?
                    };
                    blocks.push(json!({
                        "toolUse": {"toolUseId": call.id, "name": call.function.name, "input": input}
                    }));
                }
                ("assistant", blocks)
            }
            Role::Tool => {
                let id = message.tool_call_id.clone().unwrap_or_default();
                let text = message.text_content();
                let content = match serde_json::from_str::<Value>(&text) {
                    Ok(value @ Value::Object(_)) => json!([{ "json": value }]),
                    _ => json!([{ "text": text }]),
                };
                (
                    "user",
                    vec![json!({ "toolResult": {"toolUseId": id, "content": content} })],
                )
            }
        };
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(existing) = last["content"].as_array_mut() {
                    existing.extend(blocks);
                }
            }
            _ => messages.push(json!({ "role": role, "content": blocks })),
        }
    }

    let mut body = Map::new();
    body.insert("messages".into(), Value::Array(messages));
    if !system.is_empty() {
        body.insert("system".into(), Value::Array(system));
    }

    let mut inference = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        inference.insert("maxTokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        inference.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        inference.insert("topP".into(), json!(top_p));
    }
    let stop = request.stop_sequences();
    if !stop.is_empty() {
        inference.insert("stopSequences".into(), json!(stop));
    }
    if !inference.is_empty() {
        body.insert("inferenceConfig".into(), Value::Object(inference));
    }

    // Converse 不支持 "none"，此时不下发工具
    let tools_disabled = matches!(&request.tool_choice, Some(ToolChoice::Mode(m)) if m == "none");
    if !request.tools.is_empty() && !tools_disabled {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpec": {
                        "name": tool.function.name,
                        "description": tool.function.description.clone().unwrap_or_default(),
                        "inputSchema": {
                            "json": tool.function.parameters.clone().unwrap_or_else(|| json!({"type": "object"}))
                        }
                    }
                })
            })
            .collect();
        let mut tool_config = json!({ "tools": tools });
        match &request.tool_choice {
            Some(ToolChoice::Mode(mode)) if mode == "required" => {
                tool_config["toolChoice"] = json!({ "any": {} });
            }
            Some(ToolChoice::Function { function, .. }) => {
                tool_config["toolChoice"] = json!({ "tool": {"name": function.name} });
            }
            _ => {}
        }
        body.insert("toolConfig".into(), tool_config);
    }

    Ok(Value::Object(body))
}

fn content_blocks(content: Option<&MessageContent>) -> Result<Vec<Value>> {
    match content {
        None => Ok(Vec::new()),
        Some(MessageContent::Text(text)) => Ok(vec![json!({ "text": text })]),
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => Ok(json!({ "text": text })),
                ContentPart::ImageUrl { image_url } => {
                    let (media_type, data) = image_url.as_data_url().ok_or_else(|| {
                        Error::Validation("bedrock only accepts inline base64 images".into())
                    })?;
                    let format = media_type.strip_prefix("image/").unwrap_or(media_type);
                    Ok(json!({ "image": {"format": format, "source": {"bytes": data}} }))
                }
            })
            .collect(),
    }
}

pub(crate) fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "guardrail_intervened" | "content_filtered" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConverseResponse {
    output: ConverseOutput,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ConverseUsage>,
}

#[derive(Debug, Deserialize)]
struct ConverseOutput {
    message: ConverseMessage,
}

#[derive(Debug, Deserialize)]
struct ConverseMessage {
    #[serde(default)]
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TitanEmbedding {
    embedding: Vec<f32>,
    #[serde(default)]
    input_text_token_count: u32,
}

fn from_converse_response(wire: ConverseResponse, requested_model: &str) -> Result<ChatResponse> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in wire.output.message.content {
        if let Some(t) = block.get("text").and_then(Value::as_str) {
            text.push_str(t);
        } else if let Some(tool) = block.get("toolUse") {
            tool_calls.push(ToolCall {
                id: tool["toolUseId"].as_str().unwrap_or_default().to_string(),
                kind: "function".into(),
                function: FunctionCall {
                    name: tool["name"].as_str().unwrap_or_default().to_string(),
                    arguments: tool.get("input").cloned().unwrap_or_else(|| json!({})).to_string(),
                },
            });
        }
    }
    let usage = wire
        .usage
        .map(|u| Usage::new(u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    Ok(ChatResponse {
        id: super::response_id("chatcmpl"),
        object: "chat.completion".into(),
        created: Utc::now().timestamp(),
        model: requested_model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage {
                role: Role::Assistant,
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(MessageContent::Text(text))
                },
                name: None,
                tool_calls,
                tool_call_id: None,
            },
            finish_reason: wire.stop_reason.as_deref().map(map_stop_reason),
        }],
        usage,
    })
}

struct StreamState {
    id: String,
    model: String,
    /// 内容块索引 → 工具调用序号
    tool_blocks: BTreeMap<u64, u32>,
    next_tool: u32,
}

impl StreamState {
    fn new(model: &str) -> Self {
        Self {
            id: super::response_id("chatcmpl"),
            model: model.to_string(),
            tool_blocks: BTreeMap::new(),
            next_tool: 0,
        }
    }

    fn chunk(&self) -> ChatChunk {
        ChatChunk::new(self.id.clone(), self.model.clone())
    }

    fn on_message(&mut self, message: &EventMessage, provider: &str) -> Result<Vec<ChatChunk>> {
        let payload: Value = if message.payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&message.payload)
                .map_err(|e| Error::Protocol(format!("invalid bedrock event payload: {}", e)))?
        };

        if message.is_exception() {
            let kind = message.event_type().unwrap_or("exception");
            let status = match kind {
                "throttlingException" => 429,
                "validationException" => 400,
                "serviceUnavailableException" => 503,
                _ => 500,
            };
            return Err(Error::Upstream {
                provider: provider.to_string(),
                status,
                body: format!(
                    "{}: {}",
                    kind,
                    payload["message"].as_str().unwrap_or_default()
                ),
            });
        }

        match message.event_type() {
            Some("messageStart") => {
                let delta = Delta {
                    role: Some(Role::Assistant),
                    ..Delta::default()
                };
                Ok(vec![self.chunk().with_delta(delta, None)])
            }
            Some("contentBlockStart") => {
                let index = payload["contentBlockIndex"].as_u64().unwrap_or(0);
                let Some(tool) = payload["start"].get("toolUse") else {
                    return Ok(Vec::new());
                };
                let tool_index = self.next_tool;
                self.next_tool += 1;
                self.tool_blocks.insert(index, tool_index);
                let delta = Delta {
                    tool_calls: vec![ToolCallDelta {
                        index: tool_index,
                        id: tool["toolUseId"].as_str().map(str::to_string),
                        kind: Some("function".into()),
                        function: Some(FunctionCallDelta {
                            name: tool["name"].as_str().map(str::to_string),
                            arguments: Some(String::new()),
                        }),
                    }],
                    ..Delta::default()
                };
                Ok(vec![self.chunk().with_delta(delta, None)])
            }
            Some("contentBlockDelta") => {
                let index = payload["contentBlockIndex"].as_u64().unwrap_or(0);
                let delta = &payload["delta"];
                if let Some(text) = delta["text"].as_str() {
                    let delta = Delta {
                        content: Some(text.to_string()),
                        ..Delta::default()
                    };
                    return Ok(vec![self.chunk().with_delta(delta, None)]);
                }
                if let (Some(input), Some(tool_index)) = (
                    delta["toolUse"]["input"].as_str(),
                    self.tool_blocks.get(&index).copied(),
                ) {
                    let delta = Delta {
                        tool_calls: vec![ToolCallDelta {
                            index: tool_index,
                            id: None,
                            kind: None,
                            function: Some(FunctionCallDelta {
                                name: None,
                                arguments: Some(input.to_string()),
                            }),
                        }],
                        ..Delta::default()
                    };
                    return Ok(vec![self.chunk().with_delta(delta, None)]);
                }
                Ok(Vec::new())
            }
            Some("messageStop") => {
                let finish = payload["stopReason"]
                    .as_str()
                    .map(map_stop_reason)
                    .unwrap_or(FinishReason::Stop);
                Ok(vec![self.chunk().with_delta(Delta::default(), Some(finish))])
            }
            Some("metadata") => {
                let usage = &payload["usage"];
                let usage = Usage::new(
                    usage["inputTokens"].as_u64().unwrap_or(0) as u32,
                    usage["outputTokens"].as_u64().unwrap_or(0) as u32,
                );
                Ok(vec![self.chunk().with_usage(usage)])
            }
            other => {
                debug!("Ignoring bedrock stream event {:?}", other);
                Ok(Vec::new())
            }
        }
    }
}

/// 把 event-stream 响应包装为规范化增量流，连接池守卫随流释放
fn event_stream(
    response: reqwest::Response,
    guard: InFlight,
    mut state: StreamState,
    provider: String,
) -> ChatStream {
    let stream = async_stream::stream! {
        let mut guard = guard;
        let mut decoder = EventStreamDecoder::new();
        let mut bytes = response.bytes_stream();

        'outer: while let Some(next) = bytes.next().await {
            let chunk = match next {
                Ok(chunk) => chunk,
                Err(e) => {
                    guard.mark_failed();
                    yield Err(Error::Transport(e));
                    break;
                }
            };
            let messages = match decoder.push(&chunk) {
                Ok(messages) => messages,
                Err(e) => {
                    guard.mark_failed();
                    yield Err(e);
                    break;
                }
            };
            for message in messages {
                match state.on_message(&message, &provider) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            yield Ok(chunk);
                        }
                    }
                    Err(e) => {
                        guard.mark_failed();
                        yield Err(e);
                        break 'outer;
                    }
                }
            }
        }
    };
    Box::pin(stream)
}
