//! Anthropic Messages API 连接器
//!
//! 转换要点：
//! - system 消息抽出为顶层 `system` 字段
//! - 助手的工具调用变为 `tool_use` 内容块，工具结果变为用户消息里的 `tool_result` 块
//! - 相邻的同角色消息合并（Anthropic要求用户/助手交替）
//! - 流式事件是带类型的状态机，需要跟踪内容块索引到工具调用序号的映射

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, ContentPart, Delta, FinishReason,
    FunctionCall, FunctionCallDelta, FunctionDefinition, HealthStatus, ImageUrl, MessageContent,
    ModelInfo, NamedFunction, Role, StopSequences, Tool, ToolCall, ToolCallDelta, ToolChoice, Usage,
};
use crate::pool::PoolManager;
use crate::provider::openai::WireModelList;
use crate::provider::sse::{chunk_stream, SseEvent};
use crate::provider::{ChatStream, Provider, ProviderKind, Upstream};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// 请求未指定 max_tokens 时的默认值（Anthropic要求必填）
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Messages API 请求体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<WireTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: WireContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Blocks(Vec<Block>),
}

impl WireContent {
    fn into_blocks(self) -> Vec<Block> {
        match self {
            WireContent::Text(text) => vec![Block::Text { text }],
            WireContent::Blocks(blocks) => blocks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: WireContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    /// thinking 等不参与转换的块
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<Block>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

pub struct AnthropicProvider {
    upstream: Upstream,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig, pool: Arc<PoolManager>) -> Result<Self> {
        Ok(Self {
            upstream: Upstream::new(config, pool)?,
        })
    }

    fn url(&self, path: &str) -> String {
        self.upstream.v1_url(ANTHROPIC_BASE_URL, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("anthropic-version", ANTHROPIC_VERSION);
        match &self.upstream.config.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        self.upstream.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn declared_models(&self) -> &[String] {
        &self.upstream.config.models
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = to_messages_request(request, false)?;
        let url = self.url("/messages");
        let wire: MessagesResponse = self
            .upstream
            .send_json(|http| Ok(self.authorize(http.post(&url)).json(&body)), false)
            .await?;
        from_messages_response(wire, &request.model)
    }

    async fn chat_completion_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let body = to_messages_request(request, true)?;
        let url = self.url("/messages");
        let (response, guard) = self
            .upstream
            .send(|http| Ok(self.authorize(http.post(&url)).json(&body)), false, true)
            .await?;
        let mut state = StreamState::new(&request.model);
        let provider = self.name().to_string();
        Ok(chunk_stream(response, guard, move |event| {
            state.on_event(&event, &provider)
        }))
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

/// 规范化请求 → Messages API 请求
pub fn to_messages_request(request: &ChatRequest, stream: bool) -> Result<MessagesRequest> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<WireMessage> = Vec::new();

    for message in &request.messages {
        let (role, blocks) = match message.role {
            Role::System => {
                let text = message.text_content();
                if !text.is_empty() {
                    system_parts.push(text);
                }
                continue;
            }
            Role::User => ("user", content_blocks(message.content.as_ref())),
            Role::Assistant => {
                let mut blocks: Vec<Block> = content_blocks(message.content.as_ref())
                    .into_iter()
                    .filter(|b| !matches!(b, Block::Text { text } if text.is_empty()))
                    .collect();
                for call in &message.tool_calls {
                    blocks.push(Block::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: parse_arguments(&call.function.arguments)?,
                    });
                }
                ("assistant", blocks)
            }
            Role::Tool => {
                let tool_use_id = message.tool_call_id.clone().ok_or_else(|| {
                    Error::Validation("tool message requires tool_call_id".into())
                })?;
                (
                    "user",
                    vec![Block::ToolResult {
                        tool_use_id,
                        content: WireContent::Text(message.text_content()),
                        is_error: None,
                    }],
                )
            }
        };
        if blocks.is_empty() {
            continue;
        }

        // 相邻同角色消息合并
        match messages.last_mut() {
            Some(last) if last.role == role => {
                if let WireContent::Blocks(existing) = &mut last.content {
                    existing.extend(blocks);
                }
            }
            _ => messages.push(WireMessage {
                role: role.to_string(),
                content: WireContent::Blocks(blocks),
            }),
        }
    }

    let tools = request
        .tools
        .iter()
        .map(|tool| WireTool {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            input_schema: tool
                .function
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
        .collect();

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Mode(mode) => match mode.as_str() {
            "required" => json!({"type": "any"}),
            "none" => json!({"type": "none"}),
            _ => json!({"type": "auto"}),
        },
        ToolChoice::Function { function, .. } => json!({"type": "tool", "name": function.name}),
    });

    Ok(MessagesRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        },
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request.stop_sequences(),
        tools,
        tool_choice,
        stream,
    })
}

fn content_blocks(content: Option<&MessageContent>) -> Vec<Block> {
    match content {
        None => Vec::new(),
        Some(MessageContent::Text(text)) => vec![Block::Text { text: text.clone() }],
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => Block::Text { text: text.clone() },
                ContentPart::ImageUrl { image_url } => Block::Image {
                    source: match image_url.as_data_url() {
                        Some((media_type, data)) => ImageSource::Base64 {
                            media_type: media_type.to_string(),
                            data: data.to_string(),
                        },
                        None => ImageSource::Url {
                            url: image_url.url.clone(),
                        },
                    },
                },
            })
            .collect(),
    }
}

fn parse_arguments(arguments: &str) -> Result<Value> {
    if arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(arguments)
        .map_err(|e| Error::Validation(format!("tool call arguments are not valid JSON: {}", e)))
}

pub(crate) fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn from_messages_response(wire: MessagesResponse, requested_model: &str) -> Result<ChatResponse> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in wire.content {
        match block {
            Block::Text { text: t } => text.push_str(&t),
            Block::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                kind: "function".into(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }
    let usage = wire
        .usage
        .map(|u| Usage::new(u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    Ok(ChatResponse {
        id: wire.id,
        object: "chat.completion".into(),
        created: Utc::now().timestamp(),
        model: wire.model.unwrap_or_else(|| requested_model.to_string()),
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

/// Messages API 请求 → 规范化请求（反向转换）
pub fn to_canonical(request: &MessagesRequest) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(ChatMessage::text(Role::System, system.clone()));
    }

    for message in &request.messages {
        let blocks = message.content.clone().into_blocks();
        if message.role == "assistant" {
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            for block in blocks {
                match block {
                    Block::Text { text: t } => text.push_str(&t),
                    Block::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                        id,
                        kind: "function".into(),
                        function: FunctionCall {
                            name,
                            arguments: input.to_string(),
                        },
                    }),
                    _ => {}
                }
            }
            messages.push(ChatMessage {
                role: Role::Assistant,
                content: if text.is_empty() { None } else { Some(MessageContent::Text(text)) },
                name: None,
                tool_calls,
                tool_call_id: None,
            });
            continue;
        }

        // 用户消息：工具结果拆成独立的 tool 消息，其余内容按原顺序组成用户消息
        let mut parts: Vec<ContentPart> = Vec::new();
        let flush = |parts: &mut Vec<ContentPart>, out: &mut Vec<ChatMessage>| {
            if parts.is_empty() {
                return;
            }
            let content = match parts.as_slice() {
                [ContentPart::Text { text }] => MessageContent::Text(text.clone()),
                _ => MessageContent::Parts(parts.clone()),
            };
            out.push(ChatMessage {
                role: Role::User,
                content: Some(content),
                name: None,
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
            parts.clear();
        };
        for block in blocks {
            match block {
                Block::Text { text } => parts.push(ContentPart::Text { text }),
                Block::Image { source } => {
                    let url = match source {
                        ImageSource::Base64 { media_type, data } => {
                            format!("data:{};base64,{}", media_type, data)
                        }
                        ImageSource::Url { url } => url,
                    };
                    parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrl { url, detail: None },
                    });
                }
                Block::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    flush(&mut parts, &mut messages);
                    let text = content
                        .into_blocks()
                        .into_iter()
                        .filter_map(|b| match b {
                            Block::Text { text } => Some(text),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("");
                    messages.push(ChatMessage::tool_result(tool_use_id, text));
                }
                _ => {}
            }
        }
        flush(&mut parts, &mut messages);
    }

    let tools = request
        .tools
        .iter()
        .map(|t| Tool {
            kind: "function".into(),
            function: FunctionDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: Some(t.input_schema.clone()),
            },
        })
        .collect();

    let tool_choice = request.tool_choice.as_ref().and_then(|choice| {
        match choice.get("type").and_then(Value::as_str) {
            Some("any") => Some(ToolChoice::Mode("required".into())),
            Some("none") => Some(ToolChoice::Mode("none".into())),
            Some("auto") => Some(ToolChoice::Mode("auto".into())),
            Some("tool") => choice.get("name").and_then(Value::as_str).map(|name| {
                ToolChoice::Function {
                    kind: "function".into(),
                    function: NamedFunction { name: name.into() },
                }
            }),
            _ => None,
        }
    });

    ChatRequest {
        model: request.model.clone(),
        messages,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: if request.stop_sequences.is_empty() {
            None
        } else {
            Some(StopSequences::Many(request.stop_sequences.clone()))
        },
        tools,
        tool_choice,
        stream: request.stream,
        user: None,
    }
}

/// 流式事件状态机
struct StreamState {
    id: String,
    model: String,
    input_tokens: u32,
    /// 内容块索引 → 工具调用序号
    tool_blocks: HashMap<u64, u32>,
    next_tool: u32,
}

impl StreamState {
    fn new(model: &str) -> Self {
        Self {
            id: super::response_id("msg"),
            model: model.to_string(),
            input_tokens: 0,
            tool_blocks: HashMap::new(),
            next_tool: 0,
        }
    }

    fn chunk(&self) -> ChatChunk {
        ChatChunk::new(self.id.clone(), self.model.clone())
    }

    fn on_event(&mut self, event: &SseEvent, provider: &str) -> Result<Vec<ChatChunk>> {
        let data: Value = serde_json::from_str(&event.data)
            .map_err(|e| Error::Protocol(format!("invalid anthropic event: {}", e)))?;
        let event_type = data
            .get("type")
            .and_then(Value::as_str)
            .or(event.event.as_deref())
            .unwrap_or_default();

        match event_type {
            "message_start" => {
                let message = &data["message"];
                if let Some(id) = message["id"].as_str() {
                    self.id = id.to_string();
                }
                if let Some(model) = message["model"].as_str() {
                    self.model = model.to_string();
                }
                self.input_tokens = message["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
                let delta = Delta {
                    role: Some(Role::Assistant),
                    ..Delta::default()
                };
                Ok(vec![self.chunk().with_delta(delta, None)])
            }
            "content_block_start" => {
                let index = data["index"].as_u64().unwrap_or(0);
                let block = &data["content_block"];
                if block["type"].as_str() != Some("tool_use") {
                    return Ok(Vec::new());
                }
                let tool_index = self.next_tool;
                self.next_tool += 1;
                self.tool_blocks.insert(index, tool_index);
                let delta = Delta {
                    tool_calls: vec![ToolCallDelta {
                        index: tool_index,
                        id: block["id"].as_str().map(str::to_string),
                        kind: Some("function".into()),
                        function: Some(FunctionCallDelta {
                            name: block["name"].as_str().map(str::to_string),
                            arguments: Some(String::new()),
                        }),
                    }],
                    ..Delta::default()
                };
                Ok(vec![self.chunk().with_delta(delta, None)])
            }
            "content_block_delta" => {
                let index = data["index"].as_u64().unwrap_or(0);
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default().to_string();
                        let delta = Delta {
                            content: Some(text),
                            ..Delta::default()
                        };
                        Ok(vec![self.chunk().with_delta(delta, None)])
                    }
                    Some("input_json_delta") => {
                        let Some(tool_index) = self.tool_blocks.get(&index).copied() else {
                            return Ok(Vec::new());
                        };
                        let partial = delta["partial_json"].as_str().unwrap_or_default().to_string();
                        let delta = Delta {
                            tool_calls: vec![ToolCallDelta {
                                index: tool_index,
                                id: None,
                                kind: None,
                                function: Some(FunctionCallDelta {
                                    name: None,
                                    arguments: Some(partial),
                                }),
                            }],
                            ..Delta::default()
                        };
                        Ok(vec![self.chunk().with_delta(delta, None)])
                    }
                    other => {
                        debug!("Ignoring anthropic delta type {:?}", other);
                        Ok(Vec::new())
                    }
                }
            }
            "message_delta" => {
                let finish = data["delta"]["stop_reason"].as_str().map(map_stop_reason);
                let output_tokens = data["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;
                let input_tokens = data["usage"]["input_tokens"]
                    .as_u64()
                    .map(|v| v as u32)
                    .unwrap_or(self.input_tokens);
                Ok(vec![self
                    .chunk()
                    .with_delta(Delta::default(), finish)
                    .with_usage(Usage::new(input_tokens, output_tokens))])
            }
            "error" => {
                let message = data["error"]["message"]
                    .as_str()
                    .unwrap_or("stream error")
                    .to_string();
                let status = match data["error"]["type"].as_str() {
                    Some("overloaded_error") => 529,
                    Some("rate_limit_error") => 429,
                    Some("invalid_request_error") => 400,
                    _ => 500,
                };
                Err(Error::Upstream {
                    provider: provider.to_string(),
                    status,
                    body: message,
                })
            }
            // ping / content_block_stop / message_stop
            _ => Ok(Vec::new()),
        }
    }
}
