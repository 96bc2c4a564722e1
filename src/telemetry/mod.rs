use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::CacheStatus;
use crate::config::TelemetryConfig;
use crate::error::{Error, Result};

/// 一次请求结束后的汇总
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub request_id: String,
    pub api_key: Option<String>,
    pub endpoint: &'static str,
    pub model: String,
    pub provider: Option<String>,
    pub stream: bool,
    pub success: bool,
    pub error_code: Option<&'static str>,
    pub cache: CacheStatus,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub usage_estimated: bool,
    /// 8位小数的美元金额
    pub cost: String,
    pub latency_ms: u64,
    pub attempts: u32,
}

/// 投递给观测系统的结构化事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    RequestCompleted(RequestEvent),
    CacheLookup {
        request_id: String,
        namespace: String,
        result: CacheStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        similarity: Option<f32>,
    },
    HealthTransition {
        provider: String,
        healthy: bool,
        latency_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 上游因内容过滤中止了生成
    SafetyViolation {
        request_id: String,
        provider: String,
        model: String,
        api_key: Option<String>,
    },
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::RequestCompleted(_) => "request_completed",
            GatewayEvent::CacheLookup { .. } => "cache_lookup",
            GatewayEvent::HealthTransition { .. } => "health_transition",
            GatewayEvent::SafetyViolation { .. } => "safety_violation",
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope {
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: GatewayEvent,
}

// 检测模块
pub struct TelemetryModule {
    sender: Option<mpsc::Sender<Envelope>>,
    dropped: AtomicU64,
}

impl TelemetryModule {
    /// 配置了 `sink_url` 时启动后台投递任务
    ///
    /// 需要在tokio运行时中调用
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        let Some(url) = config.sink_url.clone() else {
            return Ok(Self::disabled());
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(Error::Transport)?;
        let (sender, receiver) = mpsc::channel(config.buffer_size.max(1));
        tokio::spawn(forward(client, url.clone(), receiver));
        info!(sink = %url, "Telemetry forwarder started");
        Ok(Self {
            sender: Some(sender),
            dropped: AtomicU64::new(0),
        })
    }

    /// 只写日志和指标，不投递
    pub fn disabled() -> Self {
        Self {
            sender: None,
            dropped: AtomicU64::new(0),
        }
    }

    /// 异步上报事件，不等待结果
    ///
    /// 缓冲区满时直接丢弃，请求路径永远不会因此阻塞
    pub fn emit(&self, event: GatewayEvent) {
        metrics::counter!("gateway_events_total", "type" => event.name()).increment(1);
        debug!(event = event.name(), "Gateway event: {:?}", event);

        let Some(sender) = &self.sender else {
            return;
        };
        let envelope = Envelope {
            id: uuid::Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
            event,
        };
        if sender.try_send(envelope).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!("gateway_events_dropped_total").increment(1);
            if dropped.is_power_of_two() {
                warn!(dropped, "Telemetry buffer full or closed, dropping events");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn forward(client: Client, url: String, mut receiver: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = receiver.recv().await {
        // 忽略上报结果，避免影响主流程
        if let Err(e) = client.post(&url).json(&envelope).send().await {
            debug!("Telemetry delivery failed: {}", e);
        }
    }
    debug!("Telemetry forwarder stopped");
}
