//! 单元测试用的内存连接器

use async_trait::async_trait;
use futures::stream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{ChatStream, Provider, ProviderKind};
use crate::error::{Error, Result};
use crate::models::{
    ChatChunk, ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, HealthStatus,
    ModelInfo, Role, Usage,
};

pub(crate) struct StubProvider {
    name: String,
    kind: ProviderKind,
    models: Vec<String>,
    pub reply: String,
    pub healthy: AtomicBool,
    pub failing: AtomicBool,
    /// 为真时不返回用量，由网关估算
    pub omit_usage: AtomicBool,
    pub calls: AtomicUsize,
}

impl StubProvider {
    pub fn new(name: &str, kind: ProviderKind, models: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            models: models.iter().map(|m| m.to_string()).collect(),
            reply: format!("reply from {}", name),
            healthy: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            omit_usage: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Upstream {
                provider: self.name.clone(),
                status: 503,
                body: "unavailable".into(),
            });
        }
        let usage = if self.omit_usage.load(Ordering::SeqCst) {
            Usage::default()
        } else {
            Usage::new(10, 5)
        };
        Ok(ChatResponse {
            id: format!("chatcmpl-{}", self.name),
            object: "chat.completion".into(),
            created: 1_700_000_000,
            model: request.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::text(Role::Assistant, self.reply.clone()),
                finish_reason: Some(FinishReason::Stop),
            }],
            usage,
        })
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn declared_models(&self) -> &[String] {
        &self.models
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.respond(request)
    }

    async fn chat_completion_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let response = self.respond(request)?;
        let chunks: Vec<Result<ChatChunk>> = ChatChunk::from_response(&response)
            .into_iter()
            .map(Ok)
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn health_check(&self, _timeout: Duration) -> HealthStatus {
        if self.healthy.load(Ordering::SeqCst) {
            HealthStatus::healthy(1)
        } else {
            HealthStatus::unhealthy(1, "stub is down")
        }
    }

    async fn models(&self) -> Result<Vec<ModelInfo>> {
        Ok(self
            .models
            .iter()
            .map(|m| ModelInfo::new(m.clone(), self.name.clone()))
            .collect())
    }
}
