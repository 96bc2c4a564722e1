pub mod fingerprint;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::models::{ChatRequest, ChatResponse};

pub use fingerprint::{cosine, Embedder, HashEmbedder, ProviderEmbedder};

/// 缓存条目结构
///
/// 写入后内容不可变，只有最后访问时间会被刷新
#[derive(Debug, Serialize)]
pub struct CacheEntry {
    pub id: String,
    pub namespace: String,
    /// 生成参数摘要，只有相同参数的请求才会互相命中
    pub params_key: String,
    /// 规范化后的提示文本
    pub prompt: String,
    #[serde(skip)]
    pub fingerprint: Vec<f32>,
    pub response: ChatResponse,
    /// 产生该响应的供应商
    pub provider: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    last_accessed_ms: AtomicI64,
}

impl CacheEntry {
    pub fn last_accessed(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_accessed_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    fn touch(&self) {
        self.last_accessed_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// 请求的缓存指纹
///
/// 查询和写入共用一次计算结果，避免重复调用嵌入接口
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub id: String,
    pub params_key: String,
    pub prompt: String,
    pub vector: Vec<f32>,
}

/// 命中结果
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: Arc<CacheEntry>,
    /// 与请求指纹的相似度
    pub similarity: f32,
}

/// 调用方对缓存的指示
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheDirective {
    #[default]
    Default,
    /// `Cache-Control: no-cache/no-store` 或 `x-gateway-cache: bypass`
    Bypass,
}

/// 单次请求的缓存结果，用于响应头和事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
    Disabled,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Bypass => "bypass",
            CacheStatus::Disabled => "disabled",
        }
    }
}

/// 命名空间是否属于 `root`：等于 `root` 或以 `root/` 开头
pub fn in_scope(namespace: &str, root: &str) -> bool {
    namespace == root
        || namespace
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStats {
    pub entries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub similarity_threshold: f32,
    pub embedder: String,
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub writes: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub namespaces: BTreeMap<String, NamespaceStats>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

/// 语义缓存
///
/// 每个命名空间一个独立的moka存储（容量上限 + TTL），
/// 查询时先按条目ID精确匹配，再在同一命名空间、同一生成参数的条目中找相似度最高者。
///
/// 并发语义：
/// - 同一指纹的写入与读取竞争时，读到旧条目或新条目都可能，但不会读到半写入的条目
/// - 嵌入失败视为 `CacheUnavailable`，由调用方按未命中处理
pub struct SemanticCache {
    /// Key: 命名空间，Value: 该命名空间的条目存储
    namespaces: DashMap<String, Cache<String, Arc<CacheEntry>>>,
    embedder: Arc<dyn Embedder>,
    enabled: bool,
    threshold: f32,
    ttl: Duration,
    max_entries: u64,
    counters: Counters,
}

impl SemanticCache {
    /// 创建语义缓存
    ///
    /// # 参数
    /// * `config` - 缓存配置（阈值、TTL、容量）
    /// * `embedder` - 指纹向量化实现
    pub fn new(config: &CacheConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            namespaces: DashMap::new(),
            embedder,
            enabled: config.enabled,
            threshold: config.similarity_threshold,
            ttl: config.ttl,
            max_entries: config.max_entries_per_namespace,
            counters: Counters::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 判断请求是否必须绕过缓存
    pub fn should_bypass(&self, directive: CacheDirective) -> bool {
        directive == CacheDirective::Bypass
    }

    /// 记录一次绕过
    pub fn record_bypass(&self) {
        self.counters.bypasses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_cache_lookups_total", "result" => "bypass").increment(1);
    }

    /// 记录一次后端故障（按未命中处理）
    pub fn record_error(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_cache_lookups_total", "result" => "error").increment(1);
    }

    /// 计算请求指纹
    pub async fn fingerprint(&self, request: &ChatRequest) -> Result<Fingerprint> {
        let prompt = fingerprint::normalize_prompt(request);
        let params_key = fingerprint::params_key(request);
        let vector = self.embedder.embed(&prompt).await?;
        Ok(Fingerprint {
            id: fingerprint::entry_id(&params_key, &prompt),
            params_key,
            prompt,
            vector,
        })
    }

    fn store_for(&self, namespace: &str) -> Cache<String, Arc<CacheEntry>> {
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| {
                Cache::builder()
                    .max_capacity(self.max_entries)
                    .time_to_live(self.ttl)
                    .build()
            })
            .clone()
    }

    /// 查询缓存
    ///
    /// # 返回
    /// * `Some(CacheHit)` - 相似度达到阈值的条目
    /// * `None` - 未命中
    pub async fn lookup(&self, namespace: &str, fp: &Fingerprint) -> Option<CacheHit> {
        let store = self.namespaces.get(namespace).map(|s| s.clone());
        let hit = match store {
            Some(store) => self.find(&store, fp).await,
            None => None,
        };

        match &hit {
            Some(hit) => {
                hit.entry.touch();
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_cache_lookups_total", "result" => "hit").increment(1);
                debug!(
                    namespace = %namespace,
                    entry = %hit.entry.id,
                    similarity = hit.similarity,
                    "Semantic cache hit"
                );
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_cache_lookups_total", "result" => "miss").increment(1);
            }
        }
        hit
    }

    async fn find(&self, store: &Cache<String, Arc<CacheEntry>>, fp: &Fingerprint) -> Option<CacheHit> {
        // 精确匹配
        if let Some(entry) = store.get(&fp.id).await {
            return Some(CacheHit {
                entry,
                similarity: 1.0,
            });
        }

        // 相似度匹配，相同分数时取ID较小者以保证确定性
        let mut best: Option<CacheHit> = None;
        for (_, entry) in store.iter() {
            if entry.params_key != fp.params_key {
                continue;
            }
            let similarity = cosine(&entry.fingerprint, &fp.vector);
            if similarity < self.threshold {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => {
                    similarity > current.similarity
                        || (similarity == current.similarity && entry.id < current.entry.id)
                }
            };
            if better {
                best = Some(CacheHit { entry, similarity });
            }
        }
        best
    }

    /// 写入缓存条目，返回条目ID
    pub async fn store(
        &self,
        namespace: &str,
        fp: Fingerprint,
        response: ChatResponse,
        provider: &str,
    ) -> String {
        let now = Utc::now();
        let entry = Arc::new(CacheEntry {
            id: fp.id.clone(),
            namespace: namespace.to_string(),
            params_key: fp.params_key,
            prompt: fp.prompt,
            fingerprint: fp.vector,
            response,
            provider: provider.to_string(),
            created_at: now,
            last_accessed_ms: AtomicI64::new(now.timestamp_millis()),
        });
        self.store_for(namespace).insert(fp.id.clone(), entry).await;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        debug!(namespace = %namespace, entry = %fp.id, "Semantic cache entry stored");
        fp.id
    }

    /// 读取单个条目
    pub async fn get_entry(&self, namespace: &str, id: &str) -> Option<Arc<CacheEntry>> {
        let store = self.namespaces.get(namespace).map(|s| s.clone())?;
        store.get(id).await
    }

    /// 统计信息
    pub async fn stats(&self) -> CacheStats {
        let stores: Vec<(String, Cache<String, Arc<CacheEntry>>)> = self
            .namespaces
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut namespaces = BTreeMap::new();
        for (name, store) in stores {
            store.run_pending_tasks().await;
            namespaces.insert(
                name,
                NamespaceStats {
                    entries: store.entry_count(),
                },
            );
        }

        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            enabled: self.enabled,
            similarity_threshold: self.threshold,
            embedder: self.embedder.name().to_string(),
            hits,
            misses,
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            namespaces,
        }
    }

    /// 清空所有命名空间
    pub fn flush_all(&self) {
        for entry in self.namespaces.iter() {
            entry.value().invalidate_all();
        }
        self.namespaces.clear();
        info!("Semantic cache flushed");
    }

    /// 清空单个命名空间，返回该命名空间是否存在
    pub fn flush_namespace(&self, namespace: &str) -> bool {
        match self.namespaces.remove(namespace) {
            Some((_, store)) => {
                store.invalidate_all();
                info!(namespace = %namespace, "Semantic cache namespace flushed");
                true
            }
            None => false,
        }
    }

    /// 清空 `root` 及其下所有子命名空间（`root/...`），返回清空的命名空间数
    pub fn flush_scope(&self, root: &str) -> usize {
        let names: Vec<String> = self
            .namespaces
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| in_scope(name, root))
            .collect();
        names
            .iter()
            .filter(|name| self.flush_namespace(name))
            .count()
    }

    /// 删除单个条目，返回条目是否存在
    pub async fn invalidate(&self, namespace: &str, id: &str) -> bool {
        let Some(store) = self.namespaces.get(namespace).map(|s| s.clone()) else {
            return false;
        };
        store.remove(id).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, Choice, FinishReason, Role, Usage};

    fn cache(threshold: f32) -> SemanticCache {
        let config = CacheConfig {
            similarity_threshold: threshold,
            ..CacheConfig::default()
        };
        SemanticCache::new(&config, Arc::new(HashEmbedder::new(512)))
    }

    fn request(text: &str) -> ChatRequest {
        ChatRequest::new("gpt-4o-mini", vec![ChatMessage::text(Role::User, text)])
    }

    fn response(text: &str) -> ChatResponse {
        ChatResponse {
            id: "chatcmpl-cached".into(),
            object: "chat.completion".into(),
            created: 1,
            model: "gpt-4o-mini".into(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::text(Role::Assistant, text),
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Usage::new(5, 3),
        }
    }

    #[tokio::test]
    async fn round_trip_returns_stored_response() {
        let cache = cache(0.95);
        let req = request("What is the capital of France?");
        let fp = cache.fingerprint(&req).await.unwrap();
        cache.store("default", fp, response("Paris"), "openai").await;

        let again = cache.fingerprint(&request("what is the capital of   france?")).await.unwrap();
        let hit = cache.lookup("default", &again).await.unwrap();
        assert_eq!(hit.entry.response.first_text(), "Paris");
        assert!(hit.similarity >= 0.95);
    }

    #[tokio::test]
    async fn similar_prompt_hits_above_threshold() {
        let cache = cache(0.8);
        let fp = cache
            .fingerprint(&request("what is the capital of france"))
            .await
            .unwrap();
        cache.store("default", fp, response("Paris"), "openai").await;

        let close = cache
            .fingerprint(&request("what is the capital of france please"))
            .await
            .unwrap();
        assert!(cache.lookup("default", &close).await.is_some());

        let far = cache
            .fingerprint(&request("compose a limerick about rust"))
            .await
            .unwrap();
        assert!(cache.lookup("default", &far).await.is_none());
    }

    #[tokio::test]
    async fn namespaces_and_params_are_isolated() {
        let cache = cache(0.9);
        let req = request("hello there");
        let fp = cache.fingerprint(&req).await.unwrap();
        cache.store("team-a", fp, response("hi"), "openai").await;

        let fp = cache.fingerprint(&req).await.unwrap();
        assert!(cache.lookup("team-b", &fp).await.is_none());

        let mut hot = req.clone();
        hot.temperature = Some(1.5);
        let fp = cache.fingerprint(&hot).await.unwrap();
        assert!(cache.lookup("team-a", &fp).await.is_none());
    }

    #[tokio::test]
    async fn flush_and_invalidate() {
        let cache = cache(0.95);
        let fp = cache.fingerprint(&request("one")).await.unwrap();
        let id = cache.store("a", fp, response("1"), "openai").await;
        let fp = cache.fingerprint(&request("two")).await.unwrap();
        cache.store("b", fp, response("2"), "openai").await;

        assert!(cache.invalidate("a", &id).await);
        assert!(!cache.invalidate("a", &id).await);
        assert!(cache.flush_namespace("b"));
        assert!(!cache.flush_namespace("b"));

        let stats = cache.stats().await;
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.namespaces.get("a").map(|n| n.entries), Some(0));
        cache.flush_all();
        assert!(cache.stats().await.namespaces.is_empty());
    }

    #[tokio::test]
    async fn negated_prompt_misses_cached_answer() {
        let cache = cache(0.95);
        let original = request(
            "please list every reason why our quarterly planning meeting should be moved to \
             the large conference room on the third floor next tuesday afternoon",
        );
        let fp = cache.fingerprint(&original).await.unwrap();
        cache.store("team-a", fp, response("reasons"), "openai").await;

        let mut negated = original.clone();
        negated.messages[0] = ChatMessage::text(
            Role::User,
            "please list every reason why our quarterly planning meeting should not be moved to \
             the large conference room on the third floor next tuesday afternoon",
        );
        let fp = cache.fingerprint(&negated).await.unwrap();
        assert!(cache.lookup("team-a", &fp).await.is_none());

        let fp = cache.fingerprint(&original).await.unwrap();
        assert!(cache.lookup("team-a", &fp).await.is_some());
    }

    #[tokio::test]
    async fn flush_scope_leaves_other_tenants() {
        let cache = cache(0.95);
        for namespace in ["team-a", "team-a/drafts", "team-ab", "team-b"] {
            let fp = cache.fingerprint(&request(namespace)).await.unwrap();
            cache.store(namespace, fp, response("x"), "openai").await;
        }

        assert_eq!(cache.flush_scope("team-a"), 2);
        let names: Vec<String> = cache.stats().await.namespaces.into_keys().collect();
        assert_eq!(names, vec!["team-ab".to_string(), "team-b".to_string()]);
        assert!(in_scope("team-a/x", "team-a"));
        assert!(!in_scope("team-ab", "team-a"));
    }

    #[tokio::test]
    async fn stats_track_hit_rate() {
        let cache = cache(0.95);
        let fp = cache.fingerprint(&request("ping")).await.unwrap();
        assert!(cache.lookup("default", &fp).await.is_none());
        cache.store("default", fp.clone(), response("pong"), "openai").await;
        assert!(cache.lookup("default", &fp).await.is_some());
        cache.record_bypass();

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bypasses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
