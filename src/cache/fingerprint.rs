use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::{ChatRequest, EmbeddingInput, EmbeddingRequest};
use crate::provider::Provider;

/// 文本向量化接口
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// 本地特征哈希向量化：词 + 相邻词二元组，带符号哈希到固定维度，L2归一化
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(16),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let hash = u64::from_le_bytes(raw);
        let index = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let words: Vec<&str> = text.split_whitespace().collect();
        for word in &words {
            self.add_feature(&mut vector, word, 1.0);
        }
        for pair in words.windows(2) {
            self.add_feature(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

/// 调用已注册供应商的嵌入接口
pub struct ProviderEmbedder {
    provider: Arc<dyn Provider>,
    model: String,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            input: EmbeddingInput::One(text.to_string()),
            dimensions: None,
            user: None,
        };
        let response = self
            .provider
            .embeddings(&request)
            .await
            .map_err(|e| Error::CacheUnavailable(format!("embedding failed: {}", e)))?;
        let mut vector = response
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| Error::CacheUnavailable("embedding response was empty".into()))?;
        l2_normalize(&mut vector);
        Ok(vector)
    }
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}

/// 余弦相似度，维度不同或存在零向量时为 0
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(-1.0, 1.0)
}

/// 规范化提示文本：按 "角色: 内容" 逐行拼接，小写并压缩空白
pub fn normalize_prompt(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .map(|m| {
            let mut line = format!("{}:", m.role.as_str());
            let text = m.text_content().to_lowercase();
            for word in text.split_whitespace() {
                line.push(' ');
                line.push_str(word);
            }
            for call in &m.tool_calls {
                line.push_str(&format!(" [call {} {}]", call.function.name, call.function.arguments));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "none", "nor", "neither", "nothing", "without", "cannot",
];

/// 否定词个数
///
/// 词袋哈希对单个否定词不敏感，长提示加一个 "not" 仍可能超过阈值，
/// 因此否定词个数不同的请求直接视为不可比较
pub fn negation_count(text: &str) -> usize {
    text.split_whitespace()
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric() && c != '\''))
        .filter(|word| {
            let word = word.to_lowercase();
            NEGATIONS.contains(&word.as_str()) || word.ends_with("n't")
        })
        .count()
}

/// 生成参数键：只有参数完全一致的请求之间才比较相似度
pub fn params_key(request: &ChatRequest) -> String {
    let negations: usize = request
        .messages
        .iter()
        .map(|m| negation_count(&m.text_content()))
        .sum();
    let params = json!({
        "negations": negations,
        "model": request.model,
        "temperature": request.temperature,
        "top_p": request.top_p,
        "max_tokens": request.max_tokens,
        "stop": request.stop_sequences(),
        "tools": request.tools,
        "tool_choice": request.tool_choice,
    });
    hex::encode(Sha256::digest(params.to_string().as_bytes()))
}

/// 条目ID：参数键 + 规范化提示的摘要
pub fn entry_id(params_key: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(prompt.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, Role};

    fn request(text: &str) -> ChatRequest {
        ChatRequest::new("gpt-4o-mini", vec![ChatMessage::text(Role::User, text)])
    }

    #[test]
    fn hash_embedding_is_deterministic_and_normalised() {
        let embedder = HashEmbedder::new(256);
        let a = embedder.embed_sync("what is the capital of france");
        let b = embedder.embed_sync("what is the capital of france");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!((cosine(&a, &b) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn similar_prompts_score_higher_than_unrelated() {
        let embedder = HashEmbedder::new(512);
        let base = embedder.embed_sync("user: what is the capital of france");
        let close = embedder.embed_sync("user: what is the capital of france please");
        let far = embedder.embed_sync("user: write a haiku about autumn leaves");
        assert!(cosine(&base, &close) > cosine(&base, &far));
        assert!(cosine(&base, &close) > 0.8);
    }

    #[test]
    fn normalisation_ignores_case_and_spacing() {
        assert_eq!(
            normalize_prompt(&request("Hello   World")),
            normalize_prompt(&request("hello world"))
        );
    }

    #[test]
    fn params_key_separates_generation_settings() {
        let a = request("hi");
        let mut b = request("hi");
        b.temperature = Some(0.9);
        assert_ne!(params_key(&a), params_key(&b));
        assert_eq!(params_key(&a), params_key(&request("something else")));
    }

    #[test]
    fn negated_prompt_is_not_comparable() {
        let long = "please list every reason why our quarterly planning meeting should be moved to \
                    the large conference room on the third floor next tuesday afternoon";
        let negated = long.replace("should be", "should not be");
        let embedder = HashEmbedder::new(512);
        // 词袋相似度本身无法区分
        assert!(cosine(&embedder.embed_sync(long), &embedder.embed_sync(&negated)) > 0.95);
        assert_ne!(params_key(&request(long)), params_key(&request(&negated)));

        assert_eq!(negation_count("I don't know, it's NOT clear."), 2);
        assert_eq!(negation_count("a notable nothing-burger"), 0);
    }
}
