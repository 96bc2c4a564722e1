//! Google Gemini（generateContent）连接器
//!
//! 模型名放在URL路径里，`assistant` 角色改名为 `model`，
//! 工具调用/结果映射为 `functionCall` / `functionResponse` 部件。

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, ContentPart, Delta,
    EmbeddingRequest, EmbeddingResponse, FinishReason, FunctionCall, FunctionCallDelta,
    HealthStatus, MessageContent, ModelInfo, Role, ToolCall, ToolCallDelta, ToolChoice, Usage,
};
use crate::pool::PoolManager;
use crate::provider::sse::{chunk_stream, SseEvent};
use crate::provider::{ChatStream, Provider, ProviderKind, Upstream};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    upstream: Upstream,
}

impl GeminiProvider {
    pub fn new(config: ProviderConfig, pool: Arc<PoolManager>) -> Result<Self> {
        Ok(Self {
            upstream: Upstream::new(config, pool)?,
        })
    }

    fn api_root(&self) -> String {
        let base = self.upstream.base_url(GEMINI_BASE_URL);
        if base.ends_with("/v1beta") || base.ends_with("/v1") {
            base.to_string()
        } else {
            format!("{}/v1beta", base)
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/models/{}:{}", self.api_root(), model, method)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.upstream.config.api_key {
            Some(key) => request.header("x-goog-api-key", key),
            None => request,
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        self.upstream.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn declared_models(&self) -> &[String] {
        &self.upstream.config.models
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = to_generate_request(request)?;
        let url = self.model_url(&request.model, "generateContent");
        let wire: GenerateResponse = self
            .upstream
            .send_json(|http| Ok(self.authorize(http.post(&url)).json(&body)), false)
            .await?;
        from_generate_response(wire, &request.model)
    }

    async fn chat_completion_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let body = to_generate_request(request)?;
        let url = format!("{}?alt=sse", self.model_url(&request.model, "streamGenerateContent"));
        let (response, guard) = self
            .upstream
            .send(|http| Ok(self.authorize(http.post(&url)).json(&body)), false, true)
            .await?;
        let mut state = StreamState::new(&request.model);
        Ok(chunk_stream(response, guard, move |event| state.on_event(&event)))
    }

    async fn embeddings(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let model = request.model.strip_prefix("models/").unwrap_or(&request.model);
        let requests: Vec<Value> = request
            .input
            .to_vec()
            .into_iter()
            .map(|text| {
                let mut item = json!({
                    "model": format!("models/{}", model),
                    "content": {"parts": [{"text": text}]},
                });
                if let Some(dimensions) = request.dimensions {
                    item["outputDimensionality"] = json!(dimensions);
                }
                item
            })
            .collect();
        let body = json!({ "requests": requests });
        let url = self.model_url(model, "batchEmbedContents");
        let wire: BatchEmbedResponse = self
            .upstream
            .send_json(|http| Ok(self.authorize(http.post(&url)).json(&body)), false)
            .await?;
        let vectors = wire.embeddings.into_iter().map(|e| e.values).collect();
        Ok(EmbeddingResponse::from_vectors(model, vectors, 0))
    }

    async fn health_check(&self, timeout: Duration) -> HealthStatus {
        let url = format!("{}/models", self.api_root());
        self.upstream
            .probe(timeout, |http| Ok(self.authorize(http.get(&url))))
            .await
    }

    async fn models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/models", self.api_root());
        let list: ModelList = self
            .upstream
            .send_json(|http| Ok(self.authorize(http.get(&url))), true)
            .await?;
        Ok(list
            .models
            .into_iter()
            .map(|m| {
                let id = m.name.strip_prefix("models/").unwrap_or(&m.name).to_string();
                ModelInfo::new(id, self.name().to_string())
            })
            .collect())
    }
}

/// 规范化请求 → generateContent 请求体
pub fn to_generate_request(request: &ChatRequest) -> Result<Value> {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    // functionResponse 需要函数名，按调用ID反查
    let mut call_names: HashMap<&str, &str> = HashMap::new();

    for message in &request.messages {
        let (role, parts) = match message.role {
            Role::System => {
                let text = message.text_content();
                if !text.is_empty() {
                    system_parts.push(json!({ "text": text }));
                }
                continue;
            }
            Role::User => ("user", content_parts(message.content.as_ref())),
            Role::Assistant => {
                let mut parts: Vec<Value> = content_parts(message.content.as_ref())
                    .into_iter()
                    .filter(|p| p.get("text").and_then(Value::as_str) != Some(""))
                    .collect();
                for call in &message.tool_calls {
                    call_names.insert(call.id.as_str(), call.function.name.as_str());
                    let args: Value = if call.function.arguments.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&call.function.arguments).map_err(|e| {
                            Error::Validation(format!("tool call arguments are not valid JSON: {}", e))
                        })?
                    };
                    parts.push(json!({
                        "functionCall": {"id": call.id, "name": call.function.name, "args": args}
                    }));
                }
                ("model", parts)
            }
            Role::Tool => {
                let id = message.tool_call_id.as_deref().unwrap_or_default();
                let name = call_names.get(id).copied().unwrap_or(id);
                let text = message.text_content();
                // 结果是JSON对象时原样传递，否则包一层
                let response = match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Object(map)) => Value::Object(map),
                    _ => json!({ "content": text }),
                };
                (
                    "user",
                    vec![json!({
                        "functionResponse": {"id": id, "name": name, "response": response}
                    })],
                )
            }
        };
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(existing) = last["parts"].as_array_mut() {
                    existing.extend(parts);
                }
            }
            _ => contents.push(json!({ "role": role, "parts": parts })),
        }
    }

    let mut body = Map::new();
    body.insert("contents".into(), Value::Array(contents));
    if !system_parts.is_empty() {
        body.insert("systemInstruction".into(), json!({ "parts": system_parts }));
    }

    let mut generation = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        generation.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation.insert("topP".into(), json!(top_p));
    }
    let stop = request.stop_sequences();
    if !stop.is_empty() {
        generation.insert("stopSequences".into(), json!(stop));
    }
    if !generation.is_empty() {
        body.insert("generationConfig".into(), Value::Object(generation));
    }

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                let mut decl = json!({ "name": tool.function.name });
                if let Some(description) = &tool.function.description {
                    decl["description"] = json!(description);
                }
                if let Some(parameters) = &tool.function.parameters {
                    decl["parameters"] = parameters.clone();
                }
                decl
            })
            .collect();
        body.insert("tools".into(), json!([{ "functionDeclarations": declarations }]));
    }
    if let Some(choice) = &request.tool_choice {
        let config = match choice {
            ToolChoice::Mode(mode) => match mode.as_str() {
                "required" => json!({ "mode": "ANY" }),
                "none" => json!({ "mode": "NONE" }),
                _ => json!({ "mode": "AUTO" }),
            },
            ToolChoice::Function { function, .. } => {
                json!({ "mode": "ANY", "allowedFunctionNames": [function.name] })
            }
        };
        body.insert("toolConfig".into(), json!({ "functionCallingConfig": config }));
    }

    Ok(Value::Object(body))
}

fn content_parts(content: Option<&MessageContent>) -> Vec<Value> {
    match content {
        None => Vec::new(),
        Some(MessageContent::Text(text)) => vec![json!({ "text": text })],
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({ "text": text }),
                ContentPart::ImageUrl { image_url } => match image_url.as_data_url() {
                    Some((mime, data)) => json!({ "inlineData": {"mimeType": mime, "data": data} }),
                    None => json!({ "fileData": {"fileUri": image_url.url} }),
                },
            })
            .collect(),
    }
}

pub(crate) fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
        | "IMAGE_SAFETY" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFunctionCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<WireFunctionCall>,
    #[serde(default)]
    thought: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    index: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct WireModel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<WireModel>,
}

/// 取出候选中的文本和工具调用，`call_offset` 用于流式时的全局工具序号
fn split_parts(content: Option<WireContent>, call_offset: u32) -> (String, Vec<ToolCall>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    for part in content.unwrap_or_default().parts {
        if part.thought == Some(true) {
            continue;
        }
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(call) = part.function_call {
            let index = call_offset + calls.len() as u32;
            calls.push(ToolCall {
                id: call.id.unwrap_or_else(|| format!("call_{}", index)),
                kind: "function".into(),
                function: FunctionCall {
                    name: call.name,
                    arguments: call.args.to_string(),
                },
            });
        }
    }
    (text, calls)
}

fn from_generate_response(wire: GenerateResponse, requested_model: &str) -> Result<ChatResponse> {
    let usage = wire
        .usage_metadata
        .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count))
        .unwrap_or_default();
    let id = wire
        .response_id
        .unwrap_or_else(|| super::response_id("chatcmpl"));
    let model = wire
        .model_version
        .unwrap_or_else(|| requested_model.to_string());

    // 提示词被拦截时没有候选
    if wire.candidates.is_empty() {
        let blocked = wire.prompt_feedback.and_then(|f| f.block_reason);
        return match blocked {
            Some(_) => Ok(ChatResponse {
                id,
                object: "chat.completion".into(),
                created: Utc::now().timestamp(),
                model,
                choices: vec![Choice {
                    index: 0,
                    message: ChatMessage::text(Role::Assistant, ""),
                    finish_reason: Some(FinishReason::ContentFilter),
                }],
                usage,
            }),
            None => Err(Error::Protocol("gemini response has no candidates".into())),
        };
    }

    let choices = wire
        .candidates
        .into_iter()
        .enumerate()
        .map(|(i, candidate)| {
            let (text, tool_calls) = split_parts(candidate.content, 0);
            let finish_reason = if !tool_calls.is_empty() {
                Some(FinishReason::ToolCalls)
            } else {
                candidate.finish_reason.as_deref().map(map_finish_reason)
            };
            Choice {
                index: candidate.index.unwrap_or(i as u32),
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
                finish_reason,
            }
        })
        .collect();

    Ok(ChatResponse {
        id,
        object: "chat.completion".into(),
        created: Utc::now().timestamp(),
        model,
        choices,
        usage,
    })
}

struct StreamState {
    id: String,
    model: String,
    started: bool,
    tool_calls: u32,
}

impl StreamState {
    fn new(model: &str) -> Self {
        Self {
            id: super::response_id("chatcmpl"),
            model: model.to_string(),
            started: false,
            tool_calls: 0,
        }
    }

    fn on_event(&mut self, event: &SseEvent) -> Result<Vec<ChatChunk>> {
        let wire: GenerateResponse = serde_json::from_str(&event.data)
            .map_err(|e| Error::Protocol(format!("invalid gemini stream chunk: {}", e)))?;
        let usage = wire
            .usage_metadata
            .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count));

        let mut chunks = Vec::new();
        if wire.candidates.is_empty() {
            if wire.prompt_feedback.and_then(|f| f.block_reason).is_some() {
                let mut chunk = ChatChunk::new(self.id.clone(), self.model.clone())
                    .with_delta(Delta::default(), Some(FinishReason::ContentFilter));
                chunk.usage = usage;
                chunks.push(chunk);
            }
            return Ok(chunks);
        }

        for candidate in wire.candidates {
            let (text, calls) = split_parts(candidate.content, self.tool_calls);
            let has_calls = !calls.is_empty();
            let tool_calls: Vec<ToolCallDelta> = calls
                .into_iter()
                .map(|call| {
                    let index = self.tool_calls;
                    self.tool_calls += 1;
                    ToolCallDelta {
                        index,
                        id: Some(call.id),
                        kind: Some("function".into()),
                        function: Some(FunctionCallDelta {
                            name: Some(call.function.name),
                            arguments: Some(call.function.arguments),
                        }),
                    }
                })
                .collect();
            let finish = candidate.finish_reason.as_deref().map(|reason| {
                if has_calls || self.tool_calls > 0 {
                    FinishReason::ToolCalls
                } else {
                    map_finish_reason(reason)
                }
            });
            let delta = Delta {
                role: if self.started { None } else { Some(Role::Assistant) },
                content: if text.is_empty() { None } else { Some(text) },
                tool_calls,
            };
            self.started = true;
            let mut chunk = ChatChunk::new(self.id.clone(), self.model.clone())
                .with_delta(delta, finish);
            if finish.is_some() {
                chunk.usage = usage;
            }
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renames_roles_and_links_function_responses() {
        let request = ChatRequest::new(
            "gemini-1.5-pro",
            vec![
                ChatMessage::text(Role::System, "sys"),
                ChatMessage::text(Role::User, "hi"),
                ChatMessage {
                    role: Role::Assistant,
                    content: None,
                    name: None,
                    tool_calls: vec![ToolCall {
                        id: "call_a".into(),
                        kind: "function".into(),
                        function: FunctionCall {
                            name: "lookup".into(),
                            arguments: r#"{"q":"x"}"#.into(),
                        },
                    }],
                    tool_call_id: None,
                },
                ChatMessage::tool_result("call_a", "plain text"),
            ],
        );
        let body = to_generate_request(&request).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["id"], "call_a");
        let response = &contents[2]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "lookup");
        assert_eq!(response["id"], "call_a");
        assert_eq!(response["response"]["content"], "plain text");
    }

    #[test]
    fn safety_finish_maps_to_content_filter() {
        let raw = json!({
            "candidates": [{"content": {"parts": [{"text": ""}], "role": "model"}, "finishReason": "SAFETY"}],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 0, "totalTokenCount": 4}
        });
        let wire: GenerateResponse = serde_json::from_value(raw).unwrap();
        let response = from_generate_response(wire, "gemini-1.5-flash").unwrap();
        assert_eq!(response.finish_reason(), Some(FinishReason::ContentFilter));
        assert_eq!(response.usage, Usage::new(4, 0));
    }

    #[test]
    fn function_calls_without_ids_get_stable_ids() {
        let raw = json!({
            "candidates": [{"content": {"parts": [
                {"functionCall": {"name": "a", "args": {}}},
                {"functionCall": {"name": "b", "args": {"x": 1}}}
            ]}, "finishReason": "STOP"}]
        });
        let wire: GenerateResponse = serde_json::from_value(raw).unwrap();
        let response = from_generate_response(wire, "gemini").unwrap();
        let ids: Vec<&str> = response.choices[0]
            .message
            .tool_calls
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, vec!["call_0", "call_1"]);
        assert_eq!(response.finish_reason(), Some(FinishReason::ToolCalls));
    }

    #[test]
    fn stream_chunks_carry_usage_on_finish() {
        let mut state = StreamState::new("gemini");
        let first = SseEvent {
            event: None,
            data: r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#.into(),
        };
        let last = SseEvent {
            event: None,
            data: r#"{"candidates":[{"content":{"parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":2}}"#.into(),
        };
        let a = state.on_event(&first).unwrap();
        let b = state.on_event(&last).unwrap();
        assert_eq!(a[0].choices[0].delta.role, Some(Role::Assistant));
        assert_eq!(b[0].choices[0].delta.content.as_deref(), Some("lo"));
        assert_eq!(b[0].usage, Some(Usage::new(3, 2)));
    }
}
