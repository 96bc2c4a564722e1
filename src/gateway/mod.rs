//! 请求编排：校验 → 缓存 → 路由 → 预授权 → 调用（带故障转移）→ 计量
//!
//! 所有共享组件在启动时显式构建并注入，HTTP层只持有一个 `Arc<Gateway>`。

use futures::stream;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheDirective, CacheStatus, Embedder, Fingerprint, HashEmbedder, ProviderEmbedder,
    SemanticCache,
};
use crate::config::{Config, EmbedderConfig, ProviderConfig};
use crate::error::{Error, Result};
use crate::health::HealthPoller;
use crate::ledger::{self, PreauthorizeRequest};
use crate::metering::{Cost, Meter, ModelPricing, PricingTable};
use crate::models::{
    ChatChunk, ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, HealthStatus,
    ModelInfo, Usage,
};
use crate::pool::{PoolManager, PoolSettings, PoolStats};
use crate::provider::{ChatStream, Provider, ProviderRegistry};
use crate::router::{
    FailoverSnapshot, FailoverTracker, RouteTarget, RoutingContext, RoutingDecision,
    RoutingEngine,
};
use crate::telemetry::{GatewayEvent, TelemetryModule};
use crate::usage_collector::{Accounting, RequestRecord, StreamUsageCollector};

/// 调用方身份和缓存指示，由HTTP层从请求头中解析
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// 调用方名称（API密钥配置中的 `name`），匿名请求为空
    pub api_key: Option<String>,
    /// 缓存命名空间，缺省使用配置中的默认命名空间
    pub namespace: Option<String>,
    pub cache: CacheDirective,
}

/// 非流式调用结果
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub response: ChatResponse,
    pub provider: Option<String>,
    pub cache: CacheStatus,
    pub cost: Cost,
    pub usage_estimated: bool,
}

/// 流式调用结果，费用要等流结束后才知道
pub struct StreamOutcome {
    pub stream: ChatStream,
    pub provider: Option<String>,
    pub cache: CacheStatus,
}

/// 预估结果
#[derive(Debug, Clone, Serialize)]
pub struct Estimate {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    /// 按 max_tokens 计，未设置时与输入相同
    pub completion_tokens: u32,
    pub strategy: &'static str,
    pub estimated_cost: String,
    pub cost_scaled: u64,
    pub pricing_key: Option<String>,
    pub free: bool,
}

/// 推理网关
pub struct Gateway {
    pool: Arc<PoolManager>,
    registry: Arc<ProviderRegistry>,
    failover: Arc<FailoverTracker>,
    router: Arc<RoutingEngine>,
    cache: Arc<SemanticCache>,
    accounting: Arc<Accounting>,
    health: Arc<HealthPoller>,
    request_timeout: Duration,
    max_attempts: usize,
    default_namespace: String,
}

fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

impl Gateway {
    /// 按配置构建全部组件
    ///
    /// 配置了事件接收地址时需要在tokio运行时中调用
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(PoolManager::new(
            PoolSettings::default().with_overrides(&config.pool),
        ));
        let registry = Arc::new(ProviderRegistry::from_configs(&config.providers, pool.clone())?);
        let failover = Arc::new(FailoverTracker::new(
            config.failover.failure_threshold,
            config.failover.cooldown,
        ));
        let router = Arc::new(
            RoutingEngine::new(
                registry.clone(),
                failover.clone(),
                config.routing.default_model.clone(),
            )
            .with_rules(config.routing.rules.clone())?,
        );

        let embedder: Arc<dyn Embedder> = match &config.cache.embedder {
            EmbedderConfig::Hash { dimensions } => Arc::new(HashEmbedder::new(*dimensions)),
            EmbedderConfig::Provider { provider, model } => {
                Arc::new(ProviderEmbedder::new(registry.get(provider)?, model.clone()))
            }
        };
        let cache = Arc::new(SemanticCache::new(&config.cache, embedder));

        let pricing = PricingTable::with_overrides(config.pricing_overrides()?);
        let meter = Arc::new(Meter::new(pricing));
        let ledger = ledger::build(&config.ledger)?;
        let telemetry = Arc::new(TelemetryModule::new(&config.telemetry)?);
        let accounting = Arc::new(Accounting::new(
            meter,
            ledger,
            telemetry.clone(),
            failover.clone(),
        ));

        let health = Arc::new(HealthPoller::new(
            registry.clone(),
            failover.clone(),
            &config.health,
        ));
        health.on_transition(Arc::new(move |provider: &str, status: &HealthStatus| {
            telemetry.emit(GatewayEvent::HealthTransition {
                provider: provider.to_string(),
                healthy: status.healthy,
                latency_ms: status.latency_ms,
                error: status.error.clone(),
            });
        }));

        info!(
            providers = registry.names().len(),
            rules = router.list().len(),
            cache = config.cache.enabled,
            "Gateway initialized"
        );

        Ok(Self {
            pool,
            registry,
            failover,
            router,
            cache,
            accounting,
            health,
            request_timeout: config.server.request_timeout,
            max_attempts: config.failover.max_attempts.max(1),
            default_namespace: config.cache.default_namespace.clone(),
        })
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<RoutingEngine> {
        &self.router
    }

    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.cache
    }

    pub fn health(&self) -> &Arc<HealthPoller> {
        &self.health
    }

    pub fn failover(&self) -> &Arc<FailoverTracker> {
        &self.failover
    }

    pub fn meter(&self) -> &Arc<Meter> {
        self.accounting.meter()
    }

    fn namespace(&self, call: &CallContext) -> String {
        call.namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone())
    }

    fn record(&self, endpoint: &'static str, model: &str, stream: bool, call: &CallContext) -> RequestRecord {
        let mut record = RequestRecord::new(new_request_id(), endpoint, model, stream);
        record.api_key = call.api_key.clone();
        record
    }

    /// 非流式对话
    pub async fn chat(&self, mut request: ChatRequest, call: &CallContext) -> Result<ChatOutcome> {
        request.stream = false;
        request.validate()?;
        let mut record = self.record("chat", &request.model, false, call);
        record.user = request.user.clone();

        let result = self.chat_inner(&request, call, &mut record).await;
        if let Err(e) = &result {
            self.accounting.fail(&record, e);
        }
        result
    }

    async fn chat_inner(
        &self,
        request: &ChatRequest,
        call: &CallContext,
        record: &mut RequestRecord,
    ) -> Result<ChatOutcome> {
        let namespace = self.namespace(call);
        let fingerprint = match self.cache_lookup(request, call, &namespace, record).await {
            CacheProbe::Hit(response) => {
                let settlement =
                    self.accounting
                        .settle(record, response.usage, false, response.finish_reason());
                return Ok(ChatOutcome {
                    response,
                    provider: record.provider.clone(),
                    cache: CacheStatus::Hit,
                    cost: settlement.cost.cost,
                    usage_estimated: false,
                });
            }
            CacheProbe::Miss(fingerprint) => fingerprint,
        };

        let decision = self.route(request, call)?;
        self.preauthorize(request, &decision.target, record).await?;

        let deadline = Instant::now() + self.request_timeout;
        let mut last_error = None;
        for target in decision.candidates().take(self.max_attempts) {
            let Some((provider, upstream)) = self.prepare_attempt(request, target, deadline, record)?
            else {
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = tokio::time::timeout(remaining, provider.chat_completion(&upstream)).await;
            match outcome {
                Ok(Ok(mut response)) => {
                    self.failover.record_success(&target.provider);
                    let (usage, estimated) =
                        self.accounting
                            .meter()
                            .reconcile(provider.kind(), &upstream, &response);
                    response.usage = usage;

                    if let Some(fp) = fingerprint {
                        self.cache
                            .store(&namespace, fp, response.clone(), &target.provider)
                            .await;
                    }
                    let settlement =
                        self.accounting
                            .settle(record, usage, estimated, response.finish_reason());
                    return Ok(ChatOutcome {
                        response,
                        provider: Some(target.provider.clone()),
                        cache: record.cache,
                        cost: settlement.cost.cost,
                        usage_estimated: estimated,
                    });
                }
                Ok(Err(e)) => {
                    if e.is_client_error() {
                        return Err(e);
                    }
                    self.attempt_failed(target, &e);
                    last_error = Some(e);
                }
                Err(_) => {
                    let e = Error::Timeout(self.request_timeout);
                    self.attempt_failed(target, &e);
                    last_error = Some(e);
                    break;
                }
            }
        }

        Err(self.exhausted(&request.model, record.attempts, last_error))
    }

    /// 流式对话
    ///
    /// 故障转移只发生在建立流之前；流开始后的错误作为流中的错误项返回。
    pub async fn chat_stream(&self, mut request: ChatRequest, call: &CallContext) -> Result<StreamOutcome> {
        request.stream = true;
        request.validate()?;
        let mut record = self.record("chat", &request.model, true, call);
        record.user = request.user.clone();

        let result = self.chat_stream_inner(request, call, &mut record).await;
        if let Err(e) = &result {
            self.accounting.fail(&record, e);
        }
        result
    }

    async fn chat_stream_inner(
        &self,
        request: ChatRequest,
        call: &CallContext,
        record: &mut RequestRecord,
    ) -> Result<StreamOutcome> {
        let namespace = self.namespace(call);
        // 流式响应不写缓存，但允许用缓存回放
        if let CacheProbe::Hit(response) = self.cache_lookup(&request, call, &namespace, record).await {
            self.accounting
                .settle(record, response.usage, false, response.finish_reason());
            let chunks: Vec<Result<ChatChunk>> = ChatChunk::from_response(&response)
                .into_iter()
                .map(Ok)
                .collect();
            return Ok(StreamOutcome {
                stream: Box::pin(stream::iter(chunks)),
                provider: record.provider.clone(),
                cache: CacheStatus::Hit,
            });
        }

        let decision = self.route(&request, call)?;
        self.preauthorize(&request, &decision.target, record).await?;

        let deadline = Instant::now() + self.request_timeout;
        let mut last_error = None;
        for target in decision.candidates().take(self.max_attempts) {
            let Some((provider, upstream)) = self.prepare_attempt(&request, target, deadline, record)?
            else {
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome =
                tokio::time::timeout(remaining, provider.chat_completion_stream(&upstream)).await;
            match outcome {
                Ok(Ok(inner)) => {
                    self.failover.record_success(&target.provider);
                    let collector =
                        StreamUsageCollector::new(self.accounting.clone(), record.clone(), upstream);
                    return Ok(StreamOutcome {
                        stream: collector.wrap(inner),
                        provider: Some(target.provider.clone()),
                        cache: record.cache,
                    });
                }
                Ok(Err(e)) => {
                    if e.is_client_error() {
                        return Err(e);
                    }
                    self.attempt_failed(target, &e);
                    last_error = Some(e);
                }
                Err(_) => {
                    let e = Error::Timeout(self.request_timeout);
                    self.attempt_failed(target, &e);
                    last_error = Some(e);
                    break;
                }
            }
        }

        Err(self.exhausted(&request.model, record.attempts, last_error))
    }

    /// 查询缓存；出错时按未命中处理
    async fn cache_lookup(
        &self,
        request: &ChatRequest,
        call: &CallContext,
        namespace: &str,
        record: &mut RequestRecord,
    ) -> CacheProbe {
        if !self.cache.is_enabled() {
            record.cache = CacheStatus::Disabled;
            return CacheProbe::Miss(None);
        }
        if self.cache.should_bypass(call.cache) {
            self.cache.record_bypass();
            record.cache = CacheStatus::Bypass;
            return CacheProbe::Miss(None);
        }

        record.cache = CacheStatus::Miss;
        let fp = match self.cache.fingerprint(request).await {
            Ok(fp) => fp,
            Err(e) => {
                warn!(request_id = %record.request_id, "Cache fingerprint failed, treating as miss: {}", e);
                self.cache.record_error();
                return CacheProbe::Miss(None);
            }
        };

        let hit = self.cache.lookup(namespace, &fp).await;
        self.accounting.telemetry().emit(GatewayEvent::CacheLookup {
            request_id: record.request_id.clone(),
            namespace: namespace.to_string(),
            result: if hit.is_some() {
                CacheStatus::Hit
            } else {
                CacheStatus::Miss
            },
            similarity: hit.as_ref().map(|h| h.similarity),
        });

        match hit {
            Some(hit) => {
                record.cache = CacheStatus::Hit;
                record.provider = Some(hit.entry.provider.clone());
                record.upstream_model = Some(hit.entry.response.model.clone());
                CacheProbe::Hit(hit.entry.response.clone())
            }
            None => CacheProbe::Miss(Some(fp)),
        }
    }

    fn route(&self, request: &ChatRequest, call: &CallContext) -> Result<RoutingDecision> {
        let ctx = RoutingContext::from_request(request, call.api_key.as_deref());
        let decision = self.router.evaluate(&ctx, true)?;
        debug!(
            model = %request.model,
            provider = %decision.target.provider,
            upstream_model = %decision.target.model,
            rule = ?decision.matched_rule,
            alternatives = decision.alternatives.len(),
            "Request routed"
        );
        Ok(decision)
    }

    /// 按首选目标预估费用并向账本申请额度
    async fn preauthorize(
        &self,
        request: &ChatRequest,
        target: &RouteTarget,
        record: &mut RequestRecord,
    ) -> Result<()> {
        let provider = self.registry.get(&target.provider)?;
        let mut priced = request.clone();
        priced.model = target.model.clone();
        let (prompt, completion, breakdown) =
            self.accounting
                .meter()
                .estimate_cost(&target.provider, provider.kind(), &priced);
        let authorization = self
            .accounting
            .ledger()
            .preauthorize(&PreauthorizeRequest {
                request_id: record.request_id.clone(),
                api_key: record.api_key.clone(),
                user: record.user.clone(),
                model: target.model.clone(),
                provider: target.provider.clone(),
                estimated_tokens: prompt.tokens.saturating_add(completion),
                estimated_cost: breakdown.cost.to_string(),
            })
            .await?;
        record.hold_id = authorization.hold_id;
        Ok(())
    }

    /// 准备一次尝试：查找连接器并改写模型名
    ///
    /// 目标在路由之后进入冷却时返回 `None`，调用方跳过该目标
    fn prepare_attempt(
        &self,
        request: &ChatRequest,
        target: &RouteTarget,
        deadline: Instant,
        record: &mut RequestRecord,
    ) -> Result<Option<(Arc<dyn Provider>, ChatRequest)>> {
        if Instant::now() >= deadline {
            return Err(Error::Timeout(self.request_timeout));
        }
        if record.attempts > 0 && !self.failover.is_available(&target.provider) {
            debug!(provider = %target.provider, "Skipping candidate in cooldown");
            return Ok(None);
        }
        let provider = match self.registry.get(&target.provider) {
            Ok(provider) => provider,
            Err(_) => return Ok(None),
        };
        record.attempts += 1;
        record.provider = Some(target.provider.clone());
        record.upstream_model = Some(target.model.clone());
        record.kind = Some(provider.kind());

        let mut upstream = request.clone();
        upstream.model = target.model.clone();
        Ok(Some((provider, upstream)))
    }

    fn attempt_failed(&self, target: &RouteTarget, error: &Error) {
        warn!(
            provider = %target.provider,
            model = %target.model,
            "Upstream attempt failed: {}",
            error
        );
        if self.failover.record_failure(&target.provider, &error.to_string()) {
            warn!(provider = %target.provider, "Provider entered cooldown");
        }
    }

    fn exhausted(&self, model: &str, attempts: u32, last_error: Option<Error>) -> Error {
        match last_error {
            Some(e) if attempts <= 1 => e,
            Some(e) => Error::RoutingExhausted {
                model: model.to_string(),
                reason: format!("{} attempts failed, last error: {}", attempts, e),
            },
            None => Error::RoutingExhausted {
                model: model.to_string(),
                reason: "every candidate provider became unavailable".into(),
            },
        }
    }

    /// 嵌入
    pub async fn embeddings(
        &self,
        request: EmbeddingRequest,
        call: &CallContext,
    ) -> Result<EmbeddingResponse> {
        request.validate()?;
        let mut record = self.record("embeddings", &request.model, false, call);
        record.user = request.user.clone();

        let result = self.embeddings_inner(&request, &mut record).await;
        if let Err(e) = &result {
            self.accounting.fail(&record, e);
        }
        result
    }

    async fn embeddings_inner(
        &self,
        request: &EmbeddingRequest,
        record: &mut RequestRecord,
    ) -> Result<EmbeddingResponse> {
        let name = self
            .registry
            .detect_provider(&request.model)
            .ok_or_else(|| Error::NoProviderForModel(request.model.clone()))?;
        if !self.failover.is_available(&name) {
            return Err(Error::RoutingExhausted {
                model: request.model.clone(),
                reason: format!("provider '{}' is cooling down", name),
            });
        }
        let provider = self.registry.get(&name)?;
        let mut upstream = request.clone();
        upstream.model = self.registry.upstream_model(&name, &request.model).to_string();

        record.attempts = 1;
        record.provider = Some(name.clone());
        record.upstream_model = Some(upstream.model.clone());
        record.kind = Some(provider.kind());

        let mut response = match tokio::time::timeout(self.request_timeout, provider.embeddings(&upstream)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                if !e.is_client_error() {
                    self.failover.record_failure(&name, &e.to_string());
                }
                return Err(e);
            }
            Err(_) => {
                let e = Error::Timeout(self.request_timeout);
                self.failover.record_failure(&name, &e.to_string());
                return Err(e);
            }
        };
        self.failover.record_success(&name);

        let estimated = response.usage.prompt_tokens == 0;
        if estimated {
            let estimate = self
                .accounting
                .meter()
                .estimate_embedding(provider.kind(), &upstream);
            response.usage.prompt_tokens = estimate.tokens;
            response.usage.total_tokens = estimate.tokens;
        }
        self.accounting.settle(
            record,
            Usage::new(response.usage.prompt_tokens, 0),
            estimated,
            None,
        );
        Ok(response)
    }

    pub async fn list_models(&self) -> Vec<ModelInfo> {
        self.registry.list_models().await
    }

    /// 试运行路由和计价，不调用上游也不增加命中计数
    pub fn estimate(&self, request: &ChatRequest, call: &CallContext) -> Result<Estimate> {
        request.validate()?;
        let ctx = RoutingContext::from_request(request, call.api_key.as_deref());
        let decision = self.router.evaluate(&ctx, false)?;
        let target = decision.target;
        let provider = self.registry.get(&target.provider)?;
        let mut priced = request.clone();
        priced.model = target.model.clone();
        let (prompt, completion, breakdown) =
            self.accounting
                .meter()
                .estimate_cost(&target.provider, provider.kind(), &priced);
        Ok(Estimate {
            provider: target.provider,
            model: target.model,
            prompt_tokens: prompt.tokens,
            completion_tokens: completion,
            strategy: prompt.strategy,
            estimated_cost: breakdown.cost.to_string(),
            cost_scaled: breakdown.cost.scaled,
            pricing_key: breakdown.pricing_key,
            free: breakdown.free,
        })
    }

    /// 当前价格表
    pub fn pricing(&self) -> &BTreeMap<String, ModelPricing> {
        self.accounting.meter().pricing().entries()
    }

    /// 替换一个已注册供应商的配置，同时清除其故障转移状态
    pub fn reconfigure_provider(&self, config: ProviderConfig) -> Result<()> {
        let name = config.name.clone();
        self.registry.reconfigure(config)?;
        self.failover.reset(&name);
        Ok(())
    }

    pub fn health_snapshot(&self) -> BTreeMap<String, HealthStatus> {
        self.health.snapshot()
    }

    pub fn failover_snapshot(&self) -> BTreeMap<String, FailoverSnapshot> {
        self.failover.snapshot()
    }

    pub fn pool_snapshot(&self) -> BTreeMap<String, PoolStats> {
        self.pool.snapshot()
    }

    /// 是否可以接收流量：至少一个供应商健康，或尚未注册任何供应商
    pub fn is_ready(&self) -> bool {
        if self.registry.is_empty() {
            return true;
        }
        let snapshot = self.health.snapshot();
        if snapshot.is_empty() {
            // 首轮健康检查之前以故障转移状态为准
            return self
                .registry
                .names()
                .iter()
                .any(|name| self.failover.is_available(name));
        }
        snapshot.values().any(|s| s.healthy)
    }

    /// 关闭连接池，之后的上游调用直接失败
    pub fn shutdown(&self) {
        self.pool.close();
        info!("Gateway shut down");
    }
}

enum CacheProbe {
    Hit(ChatResponse),
    /// 未命中时带上指纹，调用成功后写回
    Miss(Option<Fingerprint>),
}
