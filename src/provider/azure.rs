//! Azure OpenAI 连接器：按部署路由，`api-key` 头鉴权，`api-version` 查询参数

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::Result;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, HealthStatus, ModelInfo};
use crate::pool::PoolManager;
use crate::provider::openai::{chat_body, translate_chunk, WireResponse};
use crate::provider::sse::chunk_stream;
use crate::provider::{ChatStream, Provider, ProviderKind, Upstream};

const DEFAULT_API_VERSION: &str = "2024-06-01";

pub struct AzureProvider {
    upstream: Upstream,
    api_version: String,
}

impl AzureProvider {
    pub fn new(config: ProviderConfig, pool: Arc<PoolManager>) -> Result<Self> {
        let api_version = config
            .api_version
            .clone()
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string());
        Ok(Self {
            upstream: Upstream::new(config, pool)?,
            api_version,
        })
    }

    /// 模型名映射到部署名，未配置映射时部署名与模型名相同
    fn deployment<'a>(&'a self, model: &'a str) -> &'a str {
        self.upstream
            .config
            .deployments
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }

    fn deployment_url(&self, model: &str, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.upstream.base_url(""),
            self.deployment(model),
            operation,
            self.api_version
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.upstream.config.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }
}

#[async_trait]
impl Provider for AzureProvider {
    fn name(&self) -> &str {
        self.upstream.name()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn declared_models(&self) -> &[String] {
        &self.upstream.config.models
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = chat_body(request, false, false, false)?;
        let url = self.deployment_url(&request.model, "chat/completions");
        let wire: WireResponse = self
            .upstream
            .send_json(|http| Ok(self.authorize(http.post(&url)).json(&body)), false)
            .await?;
        wire.into_canonical(&request.model)
    }

    async fn chat_completion_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let body = chat_body(request, false, true, true)?;
        let url = self.deployment_url(&request.model, "chat/completions");
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
        let mut body = json!({ "input": request.input });
        if let Some(dimensions) = request.dimensions {
            body["dimensions"] = json!(dimensions);
        }
        let url = self.deployment_url(&request.model, "embeddings");
        let mut response: EmbeddingResponse = self
            .upstream
            .send_json(|http| Ok(self.authorize(http.post(&url)).json(&body)), false)
            .await?;
        if response.model.is_empty() {
            response.model = request.model.clone();
        }
        Ok(response)
    }

    async fn health_check(&self, timeout: Duration) -> HealthStatus {
        let url = format!(
            "{}/openai/models?api-version={}",
            self.upstream.base_url(""),
            self.api_version
        );
        self.upstream
            .probe(timeout, |http| Ok(self.authorize(http.get(&url))))
            .await
    }

    /// Azure的模型目录不反映部署，直接使用配置
    async fn models(&self) -> Result<Vec<ModelInfo>> {
        let mut models = self.upstream.declared_model_infos();
        for name in self.upstream.config.deployments.keys() {
            if !models.iter().any(|m| &m.id == name) {
                models.push(ModelInfo::new(name.clone(), self.name().to_string()));
            }
        }
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_to_mapped_deployment() {
        let mut config = ProviderConfig::new("azure-east", ProviderKind::Azure)
            .with_base_url("https://acme.openai.azure.com/");
        config.deployments.insert("gpt-4o".into(), "prod-4o".into());
        let provider = AzureProvider::new(config, Arc::new(PoolManager::default())).unwrap();

        assert_eq!(
            provider.deployment_url("gpt-4o", "chat/completions"),
            "https://acme.openai.azure.com/openai/deployments/prod-4o/chat/completions?api-version=2024-06-01"
        );
        assert_eq!(provider.deployment("gpt-35-turbo"), "gpt-35-turbo");
    }
}
