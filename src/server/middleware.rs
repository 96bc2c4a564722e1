//! API密钥鉴权与限流中间件

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tracing::debug;

use super::AppState;
use crate::config::{AuthConfig, RateLimitConfig};
use crate::error::Error;

/// 通过鉴权的调用方，中间件写入请求扩展供处理器读取
#[derive(Debug, Clone, Default)]
pub struct Caller {
    /// 匿名访问（鉴权关闭）时为空
    pub name: Option<String>,
    pub namespace: Option<String>,
}

impl Caller {
    /// 把调用方请求的缓存命名空间限定在自己的命名空间之下
    ///
    /// 已配置命名空间的调用方只能访问 `ns` 或 `ns/<子空间>`；匿名调用方原样使用。
    pub fn scope(&self, requested: Option<&str>) -> Option<String> {
        let requested = requested.map(str::trim).filter(|v| !v.is_empty());
        match (&self.namespace, requested) {
            (Some(own), None) => Some(own.clone()),
            (Some(own), Some(sub)) if sub == own => Some(own.clone()),
            (Some(own), Some(sub)) => {
                let sub = sub
                    .strip_prefix(own.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                    .unwrap_or(sub);
                Some(format!("{}/{}", own, sub))
            }
            (None, requested) => requested.map(str::to_string),
        }
    }
}

#[derive(Clone)]
struct KeyEntry {
    key: Vec<u8>,
    name: String,
    namespace: Option<String>,
}

/// 配置中的API密钥
pub struct ApiKeys {
    enabled: bool,
    keys: Vec<KeyEntry>,
}

impl ApiKeys {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            enabled: config.enabled,
            keys: config
                .keys
                .iter()
                .map(|k| KeyEntry {
                    key: k.key.as_bytes().to_vec(),
                    name: k.name.clone(),
                    namespace: k.cache_namespace.clone().or_else(|| Some(k.name.clone())),
                })
                .collect(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 校验密钥，逐个做常量时间比较且不提前退出
    pub fn authenticate(&self, presented: Option<&str>) -> Result<Caller, Error> {
        if !self.enabled {
            return Ok(Caller::default());
        }
        let presented =
            presented.ok_or_else(|| Error::Unauthorized("missing API key".into()))?;
        let mut matched: Option<&KeyEntry> = None;
        for entry in &self.keys {
            let equal: bool = entry.key.as_slice().ct_eq(presented.as_bytes()).into();
            if equal && matched.is_none() {
                matched = Some(entry);
            }
        }
        matched
            .map(|entry| Caller {
                name: Some(entry.name.clone()),
                namespace: entry.namespace.clone(),
            })
            .ok_or_else(|| Error::Unauthorized("invalid API key".into()))
    }
}

/// 从 `Authorization: Bearer` 或 `x-api-key` 中取出密钥
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

struct Bucket {
    tokens: f64,
    updated: Instant,
}

/// 令牌桶限流器，每个键一个桶
///
/// 闲置超过一次完整回填时间的桶与新桶等价，定期清理以限制内存
pub struct RateLimiter {
    enabled: bool,
    per_second: f64,
    capacity: f64,
    idle: Duration,
    trusted_proxies: Vec<IpAddr>,
    buckets: DashMap<String, Mutex<Bucket>>,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let enabled = config.enabled && config.requests_per_minute > 0;
        let per_second = f64::from(config.requests_per_minute) / 60.0;
        let capacity = f64::from(config.burst.max(1));
        let idle = if enabled {
            Duration::from_secs_f64((capacity / per_second).max(1.0))
        } else {
            Duration::from_secs(60)
        };
        Self {
            enabled,
            per_second,
            capacity,
            idle,
            trusted_proxies: config.trusted_proxies.clone(),
            buckets: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// 取一个令牌
    ///
    /// # 返回
    /// * `Ok(())` - 放行
    /// * `Err(RateLimited)` - 携带下一个令牌可用前需要等待的秒数
    pub fn check(&self, key: &str) -> Result<(), Error> {
        if !self.enabled {
            return Ok(());
        }
        let now = Instant::now();
        self.sweep(now);

        let slot = self.buckets.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: self.capacity,
                updated: now,
            })
        });
        let mut bucket = slot.lock();
        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.capacity);
        bucket.updated = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - bucket.tokens) / self.per_second;
            Err(Error::RateLimited {
                retry_after_secs: wait.ceil().max(1.0) as u64,
            })
        }
    }

    /// 当前保留的桶数量
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// 每个闲置窗口最多清理一次，调用时不能持有任何桶的引用
    fn sweep(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock();
            if now.saturating_duration_since(*last) < self.idle {
                return;
            }
            *last = now;
        }
        let idle = self.idle;
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.lock().updated) < idle);
    }

    /// 限流键：已鉴权的调用方按名称，匿名请求按客户端IP
    fn key_for(&self, caller: &Caller, request: &Request<Body>) -> String {
        if let Some(name) = &caller.name {
            return format!("key:{}", name);
        }
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok());
        match client_ip(peer, forwarded, &self.trusted_proxies) {
            Some(ip) => format!("ip:{}", ip),
            None => "ip:unknown".to_string(),
        }
    }
}

/// 解析客户端IP
///
/// 只有直连地址是可信代理时才读取 `x-forwarded-for`，并从右向左取第一个非代理地址
fn client_ip(peer: Option<IpAddr>, forwarded: Option<&str>, trusted: &[IpAddr]) -> Option<IpAddr> {
    let peer_trusted = peer.is_some_and(|ip| trusted.contains(&ip));
    if !peer_trusted {
        return peer;
    }
    let hops: Vec<IpAddr> = forwarded
        .unwrap_or_default()
        .split(',')
        .filter_map(|hop| hop.trim().parse().ok())
        .collect();
    hops.iter()
        .rev()
        .find(|ip| !trusted.contains(ip))
        .or_else(|| hops.first())
        .copied()
        .or(peer)
}

/// `/v1/*` 的鉴权 + 限流中间件
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let caller = match state.keys.authenticate(extract_api_key(request.headers())) {
        Ok(caller) => caller,
        Err(e) => {
            debug!(path = %request.uri().path(), "Rejected request: {}", e);
            return e.into_response();
        }
    };

    let key = state.limiter.key_for(&caller, &request);
    if let Err(e) = state.limiter.check(&key) {
        metrics::counter!("gateway_rate_limited_total").increment(1);
        debug!(limiter_key = %key, "Rate limited");
        return e.into_response();
    }

    request.extensions_mut().insert(caller);
    next.run(request).await
}
