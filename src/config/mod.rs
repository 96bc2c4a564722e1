use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::metering::pricing::ModelPricing;
use crate::pool::PoolOverrides;
use crate::provider::ProviderKind;
use crate::router::rules::RuleDefinition;

/// 默认的配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// 推理网关的主配置结构
/// 每个部分都有默认值，空文件也能启动一个不挂载任何供应商的网关
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    /// 上游供应商列表，注册顺序不影响模型解析结果
    pub providers: Vec<ProviderConfig>,
    /// 连接池默认调优参数
    pub pool: PoolOverrides,
    pub health: HealthConfig,
    pub failover: FailoverConfig,
    pub routing: RoutingConfig,
    pub cache: CacheConfig,
    pub pricing: PricingConfig,
    pub ledger: LedgerConfig,
    pub telemetry: TelemetryConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0"
    pub host: String,
    pub port: u16,
    /// 单个请求的整体截止时间（包含所有故障转移尝试）
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// API密钥鉴权配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// 关闭时所有请求以匿名身份通过
    pub enabled: bool,
    pub keys: Vec<ApiKeyConfig>,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ApiKeyConfig {
    pub key: String,
    /// 调用方名称，出现在日志和账本请求中
    pub name: String,
    /// 该密钥的语义缓存命名空间，缺省为调用方名称
    #[serde(default)]
    pub cache_namespace: Option<String>,
}

impl fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyConfig")
            .field("key", &"<redacted>")
            .field("name", &self.name)
            .field("cache_namespace", &self.cache_namespace)
            .finish()
    }
}

/// 令牌桶限流配置（按API密钥，匿名请求按客户端IP）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    /// 桶容量，允许的瞬时突发
    pub burst: u32,
    /// 可信反向代理地址；只有来自这些地址的连接才采信 `x-forwarded-for`
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 600,
            burst: 60,
            trusted_proxies: Vec::new(),
        }
    }
}

/// AWS凭证，缺省时从环境变量读取
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AwsCredentialsConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for AwsCredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentialsConfig")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// 单个上游供应商的配置
///
/// 注册后不可变，只能通过显式的重新配置替换（同时会作废该供应商的连接池传输层）。
#[derive(Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// 供应商名称，注册表中的唯一键
    pub name: String,
    pub kind: ProviderKind,
    /// 上游基础URL，缺省时使用各类型的官方地址
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// 声明支持的模型，解析时优先精确匹配
    #[serde(default)]
    pub models: Vec<String>,
    /// 额外的模型名前缀匹配规则
    #[serde(default)]
    pub model_prefixes: Vec<String>,
    /// 附加到每个上游请求的自定义请求头
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(with = "humantime_serde", default = "default_provider_timeout")]
    pub timeout: Duration,
    /// 连接级失败的重试次数
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Azure: api-version 查询参数
    #[serde(default)]
    pub api_version: Option<String>,
    /// Azure: 模型名到部署名的映射
    #[serde(default)]
    pub deployments: BTreeMap<String, String>,
    /// Bedrock: AWS区域
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub aws: Option<AwsCredentialsConfig>,
    /// 嵌入接口使用的默认模型（Bedrock为Titan模型ID）
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// 覆盖默认连接池参数
    #[serde(default)]
    pub pool: Option<PoolOverrides>,
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_attempts() -> u32 {
    2
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            base_url: None,
            api_key: None,
            models: Vec::new(),
            model_prefixes: Vec::new(),
            headers: HashMap::new(),
            timeout: default_provider_timeout(),
            retry_attempts: default_retry_attempts(),
            api_version: None,
            deployments: BTreeMap::new(),
            region: None,
            aws: None,
            embedding_model: None,
            pool: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("provider name must not be empty".into()));
        }
        if self.name.contains('/') {
            return Err(Error::Config(format!(
                "provider name '{}' must not contain '/'",
                self.name
            )));
        }
        match self.kind {
            ProviderKind::Azure if self.base_url.is_none() => Err(Error::Config(format!(
                "provider '{}': azure requires base_url",
                self.name
            ))),
            ProviderKind::OpenAiCompatible if self.base_url.is_none() => Err(Error::Config(
                format!("provider '{}': openai_compatible requires base_url", self.name),
            )),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("models", &self.models)
            .field("model_prefixes", &self.model_prefixes)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("retry_attempts", &self.retry_attempts)
            .field("api_version", &self.api_version)
            .field("deployments", &self.deployments)
            .field("region", &self.region)
            .field("aws", &self.aws)
            .field("embedding_model", &self.embedding_model)
            .field("pool", &self.pool)
            .finish()
    }
}

/// 健康轮询配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    /// 轮询间隔，下限5秒
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// 单轮检查的整体超时，与请求超时相互独立
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// 故障转移配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// 连续失败多少次进入冷却
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// 单个请求最多尝试多少个候选供应商
    pub max_attempts: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

/// 路由配置：启动时加载的规则和兜底模型
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub default_model: Option<String>,
    pub rules: Vec<RuleDefinition>,
}

/// 语义缓存使用的向量化方式
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmbedderConfig {
    /// 本地特征哈希（词袋 + 二元组）
    Hash { dimensions: usize },
    /// 调用已注册供应商的嵌入接口
    Provider { provider: String, model: String },
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        EmbedderConfig::Hash { dimensions: 512 }
    }
}

/// 语义缓存配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// 余弦相似度阈值，达到即命中
    ///
    /// 哈希向量化只看词和二元组，阈值过低时措辞相近但含义不同的长提示可能互相命中；
    /// 否定词个数不同的提示始终不互相比较
    pub similarity_threshold: f32,
    /// 缓存条目过期时间（TTL）
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// 每个命名空间的最大条目数
    pub max_entries_per_namespace: u64,
    pub default_namespace: String,
    pub embedder: EmbedderConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.95,
            ttl: Duration::from_secs(3600),
            max_entries_per_namespace: 10_000,
            default_namespace: "default".to_string(),
            embedder: EmbedderConfig::default(),
        }
    }
}

/// 定价配置：内置价格表之上的覆盖项
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PricingConfig {
    /// 独立的YAML价格文件，键为 "provider/model"
    pub file: Option<String>,
    pub models: BTreeMap<String, ModelPricing>,
}

/// 外部账本服务配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub enabled: bool,
    /// 账本服务基础URL，例如 "http://localhost:3000"
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retry_attempts: u32,
    /// 预授权时账本不可达是否放行
    pub fail_open: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:3000".to_string(),
            timeout: Duration::from_secs(5),
            retry_attempts: 3,
            fail_open: false,
        }
    }
}

/// 日志与事件投递配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// "text" 或 "json"
    pub log_format: String,
    /// 结构化事件的接收地址，缺省时只写日志
    pub sink_url: Option<String>,
    /// 事件缓冲区大小，满了直接丢弃
    pub buffer_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            sink_url: None,
            buffer_size: 1024,
        }
    }
}

impl Config {
    /// 从配置文件加载配置
    ///
    /// # 参数
    /// * `path` - 配置文件路径（支持YAML、TOML、JSON等格式），文件不存在时使用默认值
    ///
    /// # 说明
    /// 环境变量会覆盖文件中的值（前缀为GATEWAY，分隔符为__），
    /// 例如：GATEWAY__SERVER__PORT=8081 会覆盖 server.port
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 按 `GATEWAY_CONFIG` 环境变量或默认路径加载
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(&path)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !seen.insert(provider.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate provider name '{}'",
                    provider.name
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold) {
            return Err(Error::Config(format!(
                "cache.similarity_threshold must be within [0, 1], got {}",
                self.cache.similarity_threshold
            )));
        }
        if self.auth.enabled && self.auth.keys.is_empty() {
            return Err(Error::Config(
                "auth is enabled but no api keys are configured".into(),
            ));
        }
        for rule in &self.routing.rules {
            rule.validate()?;
        }
        if self.ledger.enabled && self.ledger.base_url.trim().is_empty() {
            return Err(Error::Config("ledger.base_url must be set".into()));
        }
        Ok(())
    }

    /// 合并内置价格、价格文件和内联覆盖项
    pub fn pricing_overrides(&self) -> Result<BTreeMap<String, ModelPricing>> {
        let mut merged = BTreeMap::new();
        if let Some(file) = &self.pricing.file {
            let raw = std::fs::read_to_string(Path::new(file))?;
            let from_file: BTreeMap<String, ModelPricing> = serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("pricing file {}: {}", file, e)))?;
            merged.extend(from_file);
        }
        merged.extend(self.pricing.models.clone());
        Ok(merged)
    }
}
