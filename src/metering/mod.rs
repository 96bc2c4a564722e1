//! Token估算与计费
//!
//! 各家的分词器不公开，这里按供应商族使用不同的 字符/token 比例和每条消息开销，
//! 结果始终标记为估算值。上游返回的用量总是优先于估算值。

pub mod pricing;

use serde::Serialize;
use std::sync::Arc;

use crate::models::{
    ChatRequest, ChatResponse, ContentPart, EmbeddingRequest, MessageContent, Usage,
};
use crate::provider::ProviderKind;

pub use pricing::{Cost, CostBreakdown, ModelPricing, PricingTable};

/// 单张图片按固定 token 数计
const IMAGE_TOKENS: u32 = 85;

/// 供应商族的估算参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heuristic {
    pub name: &'static str,
    pub chars_per_token: f64,
    /// 每条消息的格式开销
    pub per_message: u32,
    /// 回复起始的固定开销
    pub priming: u32,
}

impl Heuristic {
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::OpenAi | ProviderKind::Azure => Heuristic {
                name: "openai",
                chars_per_token: 4.0,
                per_message: 3,
                priming: 3,
            },
            ProviderKind::Anthropic => Heuristic {
                name: "anthropic",
                chars_per_token: 3.5,
                per_message: 4,
                priming: 1,
            },
            ProviderKind::Gemini => Heuristic {
                name: "gemini",
                chars_per_token: 4.0,
                per_message: 2,
                priming: 0,
            },
            ProviderKind::Bedrock => Heuristic {
                name: "bedrock",
                chars_per_token: 3.8,
                per_message: 4,
                priming: 1,
            },
            ProviderKind::OpenAiCompatible => Heuristic {
                name: "generic",
                chars_per_token: 3.6,
                per_message: 4,
                priming: 2,
            },
        }
    }

    pub fn text_tokens(&self, text: &str) -> u32 {
        let chars = text.chars().count();
        if chars == 0 {
            return 0;
        }
        let tokens = (chars as f64 / self.chars_per_token).ceil();
        if tokens >= u32::MAX as f64 {
            u32::MAX
        } else {
            tokens as u32
        }
    }

    fn content_tokens(&self, content: &MessageContent) -> u32 {
        match content {
            MessageContent::Text(text) => self.text_tokens(text),
            MessageContent::Parts(parts) => parts.iter().fold(0u32, |acc, part| {
                let tokens = match part {
                    ContentPart::Text { text } => self.text_tokens(text),
                    ContentPart::ImageUrl { .. } => IMAGE_TOKENS,
                };
                acc.saturating_add(tokens)
            }),
        }
    }
}

/// 估算结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenEstimate {
    pub tokens: u32,
    /// 恒为 true，用于提醒调用方这不是精确计数
    pub estimated: bool,
    pub strategy: &'static str,
}

/// 计量引擎：token估算 + 价格查询
#[derive(Debug, Clone)]
pub struct Meter {
    pricing: Arc<PricingTable>,
}

impl Meter {
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            pricing: Arc::new(pricing),
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// 估算请求的输入token数
    pub fn estimate_prompt(&self, kind: ProviderKind, request: &ChatRequest) -> TokenEstimate {
        let h = Heuristic::for_kind(kind);
        let mut tokens = h.priming;
        for message in &request.messages {
            tokens = tokens.saturating_add(h.per_message);
            if let Some(content) = &message.content {
                tokens = tokens.saturating_add(h.content_tokens(content));
            }
            if let Some(name) = &message.name {
                tokens = tokens.saturating_add(h.text_tokens(name)).saturating_add(1);
            }
            for call in &message.tool_calls {
                tokens = tokens
                    .saturating_add(h.text_tokens(&call.function.name))
                    .saturating_add(h.text_tokens(&call.function.arguments));
            }
        }
        if !request.tools.is_empty() {
            let serialized = serde_json::to_string(&request.tools).unwrap_or_default();
            tokens = tokens.saturating_add(h.text_tokens(&serialized));
        }
        TokenEstimate {
            tokens,
            estimated: true,
            strategy: h.name,
        }
    }

    /// 估算响应的输出token数
    pub fn estimate_completion(&self, kind: ProviderKind, response: &ChatResponse) -> TokenEstimate {
        let h = Heuristic::for_kind(kind);
        let tokens = response.choices.iter().fold(0u32, |acc, choice| {
            let message = &choice.message;
            let mut tokens = message
                .content
                .as_ref()
                .map(|c| h.content_tokens(c))
                .unwrap_or(0);
            for call in &message.tool_calls {
                tokens = tokens
                    .saturating_add(h.text_tokens(&call.function.name))
                    .saturating_add(h.text_tokens(&call.function.arguments));
            }
            acc.saturating_add(tokens)
        });
        TokenEstimate {
            tokens,
            estimated: true,
            strategy: h.name,
        }
    }

    pub fn estimate_text(&self, kind: ProviderKind, text: &str) -> TokenEstimate {
        let h = Heuristic::for_kind(kind);
        TokenEstimate {
            tokens: h.text_tokens(text),
            estimated: true,
            strategy: h.name,
        }
    }

    pub fn estimate_embedding(&self, kind: ProviderKind, request: &EmbeddingRequest) -> TokenEstimate {
        let h = Heuristic::for_kind(kind);
        let tokens = request
            .input
            .to_vec()
            .iter()
            .fold(0u32, |acc, s| acc.saturating_add(h.text_tokens(s)));
        TokenEstimate {
            tokens,
            estimated: true,
            strategy: h.name,
        }
    }

    /// 合并上游用量与估算值
    ///
    /// 上游给出的非零字段直接采用；缺失的字段才用估算补齐。
    /// 返回值的 total 恒等于 prompt + completion。
    pub fn reconcile(
        &self,
        kind: ProviderKind,
        request: &ChatRequest,
        response: &ChatResponse,
    ) -> (Usage, bool) {
        let reported = response.usage;
        if reported.prompt_tokens > 0 && reported.completion_tokens > 0 {
            return (Usage::new(reported.prompt_tokens, reported.completion_tokens), false);
        }
        let prompt = if reported.prompt_tokens > 0 {
            reported.prompt_tokens
        } else {
            self.estimate_prompt(kind, request).tokens
        };
        let completion = if reported.completion_tokens > 0 {
            reported.completion_tokens
        } else {
            self.estimate_completion(kind, response).tokens
        };
        (Usage::new(prompt, completion), true)
    }

    pub fn cost(&self, provider: &str, model: &str, usage: &Usage) -> CostBreakdown {
        self.pricing.calculate_cost(
            provider,
            model,
            u64::from(usage.prompt_tokens),
            u64::from(usage.completion_tokens),
        )
    }

    /// 预估费用：输入按估算，输出按 max_tokens（未设置时按输入的同等数量）
    pub fn estimate_cost(
        &self,
        provider: &str,
        kind: ProviderKind,
        request: &ChatRequest,
    ) -> (TokenEstimate, u32, CostBreakdown) {
        let prompt = self.estimate_prompt(kind, request);
        let completion = request.max_tokens.unwrap_or(prompt.tokens);
        let breakdown = self.pricing.calculate_cost(
            provider,
            &request.model,
            u64::from(prompt.tokens),
            u64::from(completion),
        );
        (prompt, completion, breakdown)
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new(PricingTable::builtin())
    }
}
