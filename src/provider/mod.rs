//! 供应商连接器
//!
//! 每个上游供应商实现同一个 `Provider` 契约，输入输出都是规范化结构。
//! 连接器各自负责鉴权方式、请求结构转换和响应结构回转。

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod eventstream;
pub mod gemini;
pub mod openai;
pub mod registry;
pub mod sigv4;
pub mod sse;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::{
    ChatChunk, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, HealthStatus,
    ModelInfo,
};
use crate::pool::{InFlight, PoolManager, PooledClient};

pub use registry::ProviderRegistry;

/// 流式响应
///
/// 丢弃流即关闭：底层连接和连接池名额随之释放，调用方在任何退出路径上都不需要额外清理。
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// 供应商类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "azure")]
    Azure,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "bedrock")]
    Bedrock,
    /// 自建的OpenAI兼容服务（vLLM、Ollama、LM Studio等）
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Azure => "azure",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::OpenAiCompatible => "openai_compatible",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 供应商连接器契约
#[async_trait]
pub trait Provider: Send + Sync {
    /// 注册名
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// 配置中声明的模型
    fn declared_models(&self) -> &[String];

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse>;

    async fn chat_completion_stream(&self, request: &ChatRequest) -> Result<ChatStream>;

    /// 不支持嵌入的供应商返回 `UnsupportedOperation`
    async fn embeddings(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        Err(Error::UnsupportedOperation {
            provider: self.name().to_string(),
            operation: "embeddings",
        })
    }

    /// 健康检查，耗时不超过 `timeout`
    async fn health_check(&self, timeout: Duration) -> HealthStatus;

    async fn models(&self) -> Result<Vec<ModelInfo>>;
}

/// 根据配置构建连接器
pub fn build(config: ProviderConfig, pool: Arc<PoolManager>) -> Result<Arc<dyn Provider>> {
    config.validate()?;
    if let Some(overrides) = &config.pool {
        pool.configure(&config.name, overrides.clone());
    }
    let provider: Arc<dyn Provider> = match config.kind {
        ProviderKind::OpenAi | ProviderKind::OpenAiCompatible => {
            Arc::new(openai::OpenAiProvider::new(config, pool)?)
        }
        ProviderKind::Azure => Arc::new(azure::AzureProvider::new(config, pool)?),
        ProviderKind::Anthropic => Arc::new(anthropic::AnthropicProvider::new(config, pool)?),
        ProviderKind::Gemini => Arc::new(gemini::GeminiProvider::new(config, pool)?),
        ProviderKind::Bedrock => Arc::new(bedrock::BedrockProvider::new(config, pool)?),
    };
    Ok(provider)
}

/// 连接器共用的上游调用逻辑：连接池、超时、自定义请求头、重试
pub(crate) struct Upstream {
    pub config: ProviderConfig,
    pool: Arc<PoolManager>,
    headers: HeaderMap,
}

impl Upstream {
    pub fn new(config: ProviderConfig, pool: Arc<PoolManager>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                Error::Config(format!("provider '{}': invalid header name '{}'", config.name, name))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                Error::Config(format!("provider '{}': invalid header value", config.name))
            })?;
            headers.insert(name, value);
        }
        Ok(Self {
            config,
            pool,
            headers,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// 基础URL，去掉尾部斜杠
    pub fn base_url<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(fallback)
            .trim_end_matches('/')
    }

    /// 拼接 `/v1` 前缀：基础URL已经以 `/v1` 结尾时不再重复
    pub fn v1_url(&self, fallback: &str, path: &str) -> String {
        let base = self.base_url(fallback);
        if base.ends_with("/v1") {
            format!("{}{}", base, path)
        } else {
            format!("{}/v1{}", base, path)
        }
    }

    fn client(&self) -> Result<PooledClient> {
        self.pool.client(&self.config.name)
    }

    /// 发送请求
    ///
    /// 只有连接级失败会按重试预算重试（线性退避），非2xx直接转换为 `Upstream` 错误。
    /// `streaming` 为真时不设置整体超时，只限制等待响应头的时间。
    pub async fn send<F>(&self, build: F, idempotent: bool, streaming: bool) -> Result<(Response, InFlight)>
    where
        F: Fn(&Client) -> Result<RequestBuilder>,
    {
        let mut attempt: u32 = 0;
        loop {
            let client = self.client()?;
            let mut request = build(client.http())?.headers(self.headers.clone());
            if !streaming {
                request = request.timeout(self.config.timeout);
            }

            let outcome = if streaming {
                match tokio::time::timeout(self.config.timeout, client.execute(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(self.config.timeout)),
                }
            } else {
                client.execute(request).await
            };

            match outcome {
                Ok((response, guard)) => {
                    if response.status().is_success() {
                        return Ok((response, guard));
                    }
                    return Err(self.status_error(response).await);
                }
                Err(e) if e.is_retryable_transport(idempotent) && attempt < self.config.retry_attempts => {
                    attempt += 1;
                    warn!(
                        provider = %self.config.name,
                        attempt,
                        "Upstream connection failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(Error::Transport(e)) if e.is_timeout() => {
                    return Err(Error::Timeout(self.config.timeout));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 发送并把响应体解析为JSON
    pub async fn send_json<T, F>(&self, build: F, idempotent: bool) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> Result<RequestBuilder>,
    {
        let (response, mut guard) = self.send(build, idempotent, false).await?;
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                guard.mark_failed();
                if e.is_timeout() {
                    return Err(Error::Timeout(self.config.timeout));
                }
                return Err(Error::Transport(e));
            }
        };
        drop(guard);
        serde_json::from_slice(&body).map_err(|e| {
            Error::Protocol(format!(
                "{}: unexpected response body ({}): {}",
                self.config.name,
                e,
                String::from_utf8_lossy(&body[..body.len().min(512)])
            ))
        })
    }

    async fn status_error(&self, response: Response) -> Error {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        error!(
            provider = %self.config.name,
            "Upstream error response (status {}): {}",
            status,
            body
        );
        Error::Upstream {
            provider: self.config.name.clone(),
            status,
            body,
        }
    }

    /// 轻量探测：任何非5xx响应都视为可达
    pub async fn probe<F>(&self, timeout: Duration, build: F) -> HealthStatus
    where
        F: Fn(&Client) -> Result<RequestBuilder>,
    {
        let started = Instant::now();
        let attempt = async {
            let client = self.client()?;
            let request = build(client.http())?.headers(self.headers.clone()).timeout(timeout);
            let (response, _guard) = client.execute(request).await?;
            Ok::<_, Error>(response.status())
        };
        let outcome = tokio::time::timeout(timeout, attempt).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(status)) if !status.is_server_error() => HealthStatus::healthy(latency_ms),
            Ok(Ok(status)) => HealthStatus::unhealthy(latency_ms, format!("status {}", status.as_u16())),
            Ok(Err(e)) => HealthStatus::unhealthy(latency_ms, e.to_string()),
            Err(_) => HealthStatus::unhealthy(latency_ms, format!("health check timed out after {:?}", timeout)),
        }
    }

    /// 声明的模型列表，作为目录接口失败时的兜底
    pub fn declared_model_infos(&self) -> Vec<ModelInfo> {
        self.config
            .models
            .iter()
            .map(|m| ModelInfo::new(m.clone(), self.config.name.clone()))
            .collect()
    }
}

/// 生成响应ID
pub(crate) fn response_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_config_values() {
        let kind: ProviderKind = serde_json::from_str("\"openai_compatible\"").unwrap();
        assert_eq!(kind, ProviderKind::OpenAiCompatible);
        assert_eq!(ProviderKind::OpenAi.to_string(), "openai");
    }

    #[test]
    fn v1_prefix_is_not_duplicated() {
        let pool = Arc::new(PoolManager::default());
        let with_v1 = Upstream::new(
            ProviderConfig::new("a", ProviderKind::OpenAiCompatible).with_base_url("http://h/v1/"),
            pool.clone(),
        )
        .unwrap();
        assert_eq!(with_v1.v1_url("", "/models"), "http://h/v1/models");

        let bare = Upstream::new(
            ProviderConfig::new("b", ProviderKind::OpenAiCompatible).with_base_url("http://h"),
            pool,
        )
        .unwrap();
        assert_eq!(bare.v1_url("", "/models"), "http://h/v1/models");
    }
}
