//! 连接池管理器
//!
//! 每个供应商一个共享的HTTP传输层（懒加载、可热更新），
//! 所有经过传输层的请求都会更新活跃数、总数、错误数和复用数计数器。
//! 计数器只用于观测，不参与任何控制流决策。

use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// 传输层调优参数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSettings {
    /// 每个主机保留的最大空闲连接数
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub tcp_keepalive: Option<Duration>,
    /// 建连超时（包含TLS握手）
    pub connect_timeout: Duration,
    /// 强制使用HTTP/2
    pub http2_prior_knowledge: bool,
    /// 同时在途请求上限
    pub max_connections: usize,
    /// 等待空闲名额的最长时间，超时即返回背压错误
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            http2_prior_knowledge: false,
            max_connections: 256,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// 可选的覆盖项，配置文件中的 `pool` 段和每个供应商的 `pool` 段都用这个结构
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolOverrides {
    pub max_idle_per_host: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    pub http2_prior_knowledge: Option<bool>,
    pub max_connections: Option<usize>,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
}

impl PoolSettings {
    pub fn with_overrides(&self, overrides: &PoolOverrides) -> PoolSettings {
        PoolSettings {
            max_idle_per_host: overrides.max_idle_per_host.unwrap_or(self.max_idle_per_host),
            idle_timeout: overrides.idle_timeout.unwrap_or(self.idle_timeout),
            tcp_keepalive: overrides.tcp_keepalive.or(self.tcp_keepalive),
            connect_timeout: overrides.connect_timeout.unwrap_or(self.connect_timeout),
            http2_prior_knowledge: overrides
                .http2_prior_knowledge
                .unwrap_or(self.http2_prior_knowledge),
            max_connections: overrides.max_connections.unwrap_or(self.max_connections).max(1),
            acquire_timeout: overrides.acquire_timeout.unwrap_or(self.acquire_timeout),
        }
    }
}

/// 连接池统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub reuses: u64,
    /// 估算的空闲连接数
    pub idle: usize,
}

/// 无锁计数器，跨传输层重建保留
#[derive(Debug, Default)]
struct PoolMetrics {
    active: AtomicUsize,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    reuses: AtomicU64,
}

/// 单个供应商的传输层
struct Transport {
    client: Client,
    limiter: Arc<Semaphore>,
    settings: PoolSettings,
    /// reqwest不暴露连接复用信号，这里按"归还的连接进入空闲池"来估算
    idle: AtomicUsize,
    generation: u64,
}

impl Transport {
    fn build(settings: PoolSettings, generation: u64) -> Result<Self> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .pool_idle_timeout(settings.idle_timeout)
            .tcp_keepalive(settings.tcp_keepalive)
            .connect_timeout(settings.connect_timeout)
            .user_agent(concat!("inference-gateway/", env!("CARGO_PKG_VERSION")));
        if settings.http2_prior_knowledge {
            builder = builder.http2_prior_knowledge();
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            limiter: Arc::new(Semaphore::new(settings.max_connections)),
            settings,
            idle: AtomicUsize::new(0),
            generation,
        })
    }

    /// 取出一个空闲连接（如果估算还有的话）
    fn take_idle(&self) -> bool {
        self.idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn return_idle(&self) {
        let cap = self.settings.max_idle_per_host;
        let _ = self
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < cap {
                    Some(n + 1)
                } else {
                    None
                }
            });
    }
}

/// 连接池管理器
pub struct PoolManager {
    defaults: RwLock<PoolSettings>,
    overrides: DashMap<String, PoolOverrides>,
    transports: DashMap<String, Arc<Transport>>,
    metrics: DashMap<String, Arc<PoolMetrics>>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl PoolManager {
    pub fn new(defaults: PoolSettings) -> Self {
        Self {
            defaults: RwLock::new(defaults),
            overrides: DashMap::new(),
            transports: DashMap::new(),
            metrics: DashMap::new(),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// 当前生效的参数（默认值叠加该供应商的覆盖项）
    pub fn settings_for(&self, provider: &str) -> PoolSettings {
        let defaults = self.defaults.read().clone();
        match self.overrides.get(provider) {
            Some(o) => defaults.with_overrides(o.value()),
            None => defaults,
        }
    }

    /// 更新某个供应商的调优参数，缓存的传输层随之作废，下次访问时重建
    pub fn configure(&self, provider: &str, overrides: PoolOverrides) {
        self.overrides.insert(provider.to_string(), overrides);
        self.invalidate(provider);
    }

    /// 更新全局默认参数，所有传输层作废
    pub fn configure_defaults(&self, defaults: PoolSettings) {
        *self.defaults.write() = defaults;
        // 关闭旧信号量，排队中的请求立即失败而不是等到超时
        self.transports.retain(|_, old| {
            old.limiter.close();
            false
        });
        info!("Pool defaults updated, all transports invalidated");
    }

    pub fn invalidate(&self, provider: &str) {
        if let Some((_, old)) = self.transports.remove(provider) {
            old.limiter.close();
            info!(provider = %provider, "Pool transport invalidated");
        }
    }

    /// 获取供应商的客户端句柄，传输层首次访问时创建
    pub fn client(&self, provider: &str) -> Result<PooledClient> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted(provider.to_string()));
        }

        let transport = match self.transports.get(provider) {
            Some(t) => t.value().clone(),
            None => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let built = Arc::new(Transport::build(self.settings_for(provider), generation)?);
                debug!(provider = %provider, generation, "Pool transport created");
                // 并发创建时以先插入者为准
                self.transports
                    .entry(provider.to_string())
                    .or_insert(built)
                    .value()
                    .clone()
            }
        };

        let metrics = self
            .metrics
            .entry(provider.to_string())
            .or_default()
            .value()
            .clone();

        Ok(PooledClient {
            provider: provider.to_string(),
            transport,
            metrics,
        })
    }

    pub fn stats(&self, provider: &str) -> Option<PoolStats> {
        let metrics = self.metrics.get(provider)?;
        let idle = self
            .transports
            .get(provider)
            .map(|t| t.idle.load(Ordering::Relaxed))
            .unwrap_or(0);
        Some(snapshot(&metrics, idle))
    }

    pub fn snapshot(&self) -> BTreeMap<String, PoolStats> {
        self.metrics
            .iter()
            .map(|entry| {
                let idle = self
                    .transports
                    .get(entry.key())
                    .map(|t| t.idle.load(Ordering::Relaxed))
                    .unwrap_or(0);
                (entry.key().clone(), snapshot(entry.value(), idle))
            })
            .collect()
    }

    /// 刷新Prometheus中的连接池指标（抓取时调用）
    pub fn publish_gauges(&self) {
        for (provider, stats) in self.snapshot() {
            metrics::gauge!("gateway_pool_active_connections", "provider" => provider.clone())
                .set(stats.active as f64);
            metrics::gauge!("gateway_pool_requests_total", "provider" => provider.clone())
                .set(stats.total_requests as f64);
            metrics::gauge!("gateway_pool_errors_total", "provider" => provider.clone())
                .set(stats.total_errors as f64);
            metrics::gauge!("gateway_pool_reuses_total", "provider" => provider)
                .set(stats.reuses as f64);
        }
    }

    /// 关闭所有传输层，排空空闲连接；等待中的请求立即失败
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for entry in self.transports.iter() {
            entry.value().limiter.close();
        }
        self.transports.clear();
        info!("Connection pools closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

fn snapshot(metrics: &PoolMetrics, idle: usize) -> PoolStats {
    PoolStats {
        active: metrics.active.load(Ordering::Relaxed),
        total_requests: metrics.total_requests.load(Ordering::Relaxed),
        total_errors: metrics.total_errors.load(Ordering::Relaxed),
        reuses: metrics.reuses.load(Ordering::Relaxed),
        idle,
    }
}

/// 交给连接器使用的客户端句柄
#[derive(Clone)]
pub struct PooledClient {
    provider: String,
    transport: Arc<Transport>,
    metrics: Arc<PoolMetrics>,
}

impl PooledClient {
    /// 用于构造请求的底层客户端
    pub fn http(&self) -> &Client {
        &self.transport.client
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// 传输层代号，每次重建递增
    pub fn generation(&self) -> u64 {
        self.transport.generation
    }

    /// 占用一个在途名额，超过 `acquire_timeout` 返回 `PoolExhausted`
    pub async fn acquire(&self) -> Result<InFlight> {
        let wait = self.transport.settings.acquire_timeout;
        let permit = match tokio::time::timeout(wait, self.transport.limiter.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(provider = %self.provider, "Connection pool exhausted");
                self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
                return Err(Error::PoolExhausted(self.provider.clone()));
            }
        };

        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        self.metrics.active.fetch_add(1, Ordering::AcqRel);
        if self.transport.take_idle() {
            self.metrics.reuses.fetch_add(1, Ordering::Relaxed);
        }

        Ok(InFlight {
            _permit: permit,
            transport: self.transport.clone(),
            metrics: self.metrics.clone(),
            failed: false,
        })
    }

    /// 发送请求并计数；返回的 `InFlight` 必须与响应体一起持有，直到读取完毕或放弃
    pub async fn execute(&self, request: RequestBuilder) -> Result<(Response, InFlight)> {
        let mut guard = self.acquire().await?;
        match request.send().await {
            Ok(response) => {
                if response.status().is_server_error() {
                    guard.mark_failed();
                }
                Ok((response, guard))
            }
            Err(e) => {
                guard.mark_failed();
                Err(Error::Transport(e))
            }
        }
    }
}

/// 在途请求守卫，Drop时归还名额并减少活跃计数
pub struct InFlight {
    _permit: OwnedSemaphorePermit,
    transport: Arc<Transport>,
    metrics: Arc<PoolMetrics>,
    failed: bool,
}

impl InFlight {
    /// 标记本次请求失败：计入错误数，连接不回到空闲池
    pub fn mark_failed(&mut self) {
        if !self.failed {
            self.failed = true;
            self.metrics.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::AcqRel);
        if !self.failed {
            self.transport.return_idle();
        }
    }
}
