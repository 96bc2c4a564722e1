//! 供应商注册表
//!
//! 名称 → 连接器的并发映射，以及模型名 → 供应商的确定性解析。

use dashmap::DashMap;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::models::{HealthStatus, ModelInfo};
use crate::pool::PoolManager;
use crate::provider::{self, Provider, ProviderKind};

/// 内置的模型名模式表：(模式, 供应商类型)
///
/// 按模式长度降序检查，同长度按字典序，保证与注册顺序和哈希顺序无关。
const BUILTIN_PATTERNS: &[(&str, ProviderKind)] = &[
    ("gpt-", ProviderKind::OpenAi),
    ("o1", ProviderKind::OpenAi),
    ("o3", ProviderKind::OpenAi),
    ("o4-", ProviderKind::OpenAi),
    ("chatgpt-", ProviderKind::OpenAi),
    ("text-embedding-", ProviderKind::OpenAi),
    ("davinci", ProviderKind::OpenAi),
    ("claude", ProviderKind::Anthropic),
    ("gemini", ProviderKind::Gemini),
    ("text-embedding-004", ProviderKind::Gemini),
    ("embedding-001", ProviderKind::Gemini),
    ("anthropic.", ProviderKind::Bedrock),
    ("amazon.", ProviderKind::Bedrock),
    ("meta.", ProviderKind::Bedrock),
    ("cohere.", ProviderKind::Bedrock),
    ("mistral.", ProviderKind::Bedrock),
    ("ai21.", ProviderKind::Bedrock),
    ("us.anthropic.", ProviderKind::Bedrock),
    ("eu.anthropic.", ProviderKind::Bedrock),
    ("llama", ProviderKind::OpenAiCompatible),
    ("meta-llama/", ProviderKind::OpenAiCompatible),
    ("mistral", ProviderKind::OpenAiCompatible),
    ("mixtral", ProviderKind::OpenAiCompatible),
    ("qwen", ProviderKind::OpenAiCompatible),
    ("deepseek", ProviderKind::OpenAiCompatible),
    ("phi", ProviderKind::OpenAiCompatible),
];

/// 内置模式表按检查顺序排好
fn ordered_patterns() -> Vec<(&'static str, ProviderKind)> {
    let mut patterns = BUILTIN_PATTERNS.to_vec();
    patterns.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
    patterns
}

pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn Provider>>,
    configs: DashMap<String, ProviderConfig>,
    pool: Arc<PoolManager>,
    patterns: Vec<(&'static str, ProviderKind)>,
}

impl ProviderRegistry {
    pub fn new(pool: Arc<PoolManager>) -> Self {
        Self {
            providers: DashMap::new(),
            configs: DashMap::new(),
            pool,
            patterns: ordered_patterns(),
        }
    }

    /// 按配置构建并注册全部供应商
    pub fn from_configs(configs: &[ProviderConfig], pool: Arc<PoolManager>) -> Result<Self> {
        let registry = Self::new(pool);
        for config in configs {
            registry.register_config(config.clone())?;
        }
        Ok(registry)
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn register_config(&self, config: ProviderConfig) -> Result<()> {
        let connector = provider::build(config.clone(), self.pool.clone())?;
        info!(provider = %config.name, kind = %config.kind, "Provider registered");
        self.configs.insert(config.name.clone(), config);
        self.providers
            .insert(connector.name().to_string(), connector);
        Ok(())
    }

    /// 直接注册一个连接器实例（测试和自定义连接器使用）
    pub fn register(&self, connector: Arc<dyn Provider>) {
        self.providers
            .insert(connector.name().to_string(), connector);
    }

    /// 显式重新配置：重建连接器并作废其连接池传输层
    pub fn reconfigure(&self, config: ProviderConfig) -> Result<()> {
        if !self.providers.contains_key(&config.name) {
            return Err(Error::ProviderNotRegistered(config.name));
        }
        self.pool.invalidate(&config.name);
        let connector = provider::build(config.clone(), self.pool.clone())?;
        info!(provider = %config.name, "Provider reconfigured");
        self.configs.insert(config.name.clone(), config);
        self.providers.insert(connector.name().to_string(), connector);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.configs.remove(name);
        self.pool.invalidate(name);
        self.providers.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::ProviderNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// 已注册的供应商名，按名称排序
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// 把模型名解析为供应商名
    ///
    /// 检查顺序：
    /// 1. 供应商声明的模型（精确匹配，多个供应商声明同一模型时取名称最小者）
    /// 2. `provider/model` 显式前缀
    /// 3. 配置中的 `model_prefixes`（最长前缀优先）
    /// 4. 内置模式表（最长模式优先），再取该类型下名称最小的已注册供应商
    pub fn detect_provider(&self, model: &str) -> Option<String> {
        let names = self.names();

        // 1. 精确声明
        for name in &names {
            if let Some(p) = self.providers.get(name) {
                if p.declared_models().iter().any(|m| m == model) {
                    return Some(name.clone());
                }
            }
        }

        // 2. 显式前缀
        if let Some((prefix, _)) = model.split_once('/') {
            if self.providers.contains_key(prefix) {
                return Some(prefix.to_string());
            }
        }

        // 3. 配置前缀
        let mut best: Option<(usize, &String)> = None;
        let configured: Vec<(String, Vec<String>)> = names
            .iter()
            .map(|n| {
                let prefixes = self
                    .configs
                    .get(n)
                    .map(|c| c.model_prefixes.clone())
                    .unwrap_or_default();
                (n.clone(), prefixes)
            })
            .collect();
        for (name, prefixes) in &configured {
            for prefix in prefixes {
                if model.starts_with(prefix.as_str()) && best.map_or(true, |(len, _)| prefix.len() > len) {
                    best = Some((prefix.len(), name));
                }
            }
        }
        if let Some((_, name)) = best {
            return Some(name.clone());
        }

        // 4. 内置模式：前缀匹配优先于子串匹配
        let lowered = model.to_ascii_lowercase();
        let prefix_hits = self
            .patterns
            .iter()
            .filter(|(pattern, _)| lowered.starts_with(pattern));
        let substring_hits = self
            .patterns
            .iter()
            .filter(|(pattern, _)| pattern.len() > 4 && lowered.contains(pattern));
        for (_, kind) in prefix_hits.chain(substring_hits) {
            if let Some(name) = self.first_of_kind(&names, *kind) {
                return Some(name);
            }
        }
        None
    }

    fn first_of_kind(&self, names: &[String], kind: ProviderKind) -> Option<String> {
        names
            .iter()
            .find(|n| self.providers.get(n.as_str()).map(|p| p.kind()) == Some(kind))
            .cloned()
    }

    /// 把 `provider/model` 形式的模型名还原为上游模型名
    pub fn upstream_model<'a>(&self, provider: &str, model: &'a str) -> &'a str {
        match model.split_once('/') {
            Some((prefix, rest)) if prefix == provider => rest,
            _ => model,
        }
    }

    /// 解析 + 查找
    pub fn get_for_model(&self, model: &str) -> Result<Arc<dyn Provider>> {
        let name = self
            .detect_provider(model)
            .ok_or_else(|| Error::NoProviderForModel(model.to_string()))?;
        self.get(&name)
    }

    /// 并发检查所有供应商，共享同一个截止时间
    pub async fn health_check_all(&self, deadline: Duration) -> BTreeMap<String, HealthStatus> {
        let providers: Vec<Arc<dyn Provider>> =
            self.providers.iter().map(|e| e.value().clone()).collect();
        let started = Instant::now();
        let checks = providers.into_iter().map(|p| async move {
            let name = p.name().to_string();
            let status = match tokio::time::timeout(deadline, p.health_check(deadline)).await {
                Ok(status) => status,
                Err(_) => HealthStatus::unhealthy(
                    deadline.as_millis() as u64,
                    format!("health check exceeded deadline of {:?}", deadline),
                ),
            };
            (name, status)
        });
        let results: BTreeMap<String, HealthStatus> = join_all(checks).await.into_iter().collect();
        tracing::debug!(
            providers = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Health check fan-out finished"
        );
        results
    }

    /// 聚合所有供应商的模型目录；单个供应商失败时退回声明列表
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let providers: Vec<Arc<dyn Provider>> =
            self.providers.iter().map(|e| e.value().clone()).collect();
        let lists = join_all(providers.into_iter().map(|p| async move {
            match p.models().await {
                Ok(models) => models,
                Err(e) => {
                    warn!(provider = %p.name(), "Model listing failed, using declared models: {}", e);
                    p.declared_models()
                        .iter()
                        .map(|m| ModelInfo::new(m.clone(), p.name().to_string()))
                        .collect()
                }
            }
        }))
        .await;

        let mut seen = std::collections::HashSet::new();
        let mut models: Vec<ModelInfo> = lists
            .into_iter()
            .flatten()
            .filter(|m| seen.insert((m.owned_by.clone(), m.id.clone())))
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.owned_by.cmp(&b.owned_by)));
        models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(configs: Vec<ProviderConfig>) -> ProviderRegistry {
        ProviderRegistry::from_configs(&configs, Arc::new(PoolManager::default())).unwrap()
    }

    fn openai() -> ProviderConfig {
        ProviderConfig::new("openai", ProviderKind::OpenAi).with_api_key("sk")
    }

    fn anthropic() -> ProviderConfig {
        ProviderConfig::new("anthropic", ProviderKind::Anthropic).with_api_key("k")
    }

    fn local() -> ProviderConfig {
        ProviderConfig::new("local", ProviderKind::OpenAiCompatible)
            .with_base_url("http://localhost:8000")
    }

    fn bedrock() -> ProviderConfig {
        let mut config = ProviderConfig::new("bedrock", ProviderKind::Bedrock);
        config.api_key = Some("key".into());
        config
    }

    #[test]
    fn detection_is_independent_of_registration_order() {
        let forward = registry_with(vec![openai(), anthropic(), local(), bedrock()]);
        let reverse = registry_with(vec![bedrock(), local(), anthropic(), openai()]);

        for model in [
            "gpt-4o-mini",
            "claude-3-5-sonnet-20241022",
            "meta.llama3-70b-instruct-v1:0",
            "llama-3.1-8b",
            "anthropic.claude-3-haiku-20240307-v1:0",
            "deepseek-chat",
        ] {
            assert_eq!(forward.detect_provider(model), reverse.detect_provider(model), "{}", model);
        }
        // a bedrock model id containing both "meta" and "llama" resolves to bedrock
        assert_eq!(
            forward.detect_provider("meta.llama3-70b-instruct-v1:0").as_deref(),
            Some("bedrock")
        );
        assert_eq!(
            forward.detect_provider("anthropic.claude-3-haiku-20240307-v1:0").as_deref(),
            Some("bedrock")
        );
        assert_eq!(forward.detect_provider("claude-3-opus").as_deref(), Some("anthropic"));
    }

    #[test]
    fn declared_models_and_prefixes_take_precedence() {
        let mut custom = local().with_models(["gpt-4o-mini"]);
        custom.model_prefixes = vec!["claude-3-haiku".into()];
        let registry = registry_with(vec![openai(), anthropic(), custom]);

        assert_eq!(registry.detect_provider("gpt-4o-mini").as_deref(), Some("local"));
        assert_eq!(registry.detect_provider("claude-3-haiku-x").as_deref(), Some("local"));
        assert_eq!(registry.detect_provider("anthropic/whatever").as_deref(), Some("anthropic"));
        assert_eq!(registry.upstream_model("anthropic", "anthropic/whatever"), "whatever");
    }

    #[test]
    fn distinct_errors_for_unknown_model_and_missing_provider() {
        let registry = registry_with(vec![openai()]);
        assert!(matches!(
            registry.get_for_model("totally-unknown"),
            Err(Error::NoProviderForModel(_))
        ));
        assert!(matches!(
            registry.get("anthropic"),
            Err(Error::ProviderNotRegistered(_))
        ));
    }

    #[test]
    fn reconfigure_invalidates_pool() {
        let registry = registry_with(vec![openai()]);
        let before = registry.pool().client("openai").unwrap().generation();
        registry
            .reconfigure(openai().with_base_url("http://proxy.internal"))
            .unwrap();
        let after = registry.pool().client("openai").unwrap().generation();
        assert_ne!(before, after);

        assert!(matches!(
            registry.reconfigure(anthropic()),
            Err(Error::ProviderNotRegistered(_))
        ));
    }
}
