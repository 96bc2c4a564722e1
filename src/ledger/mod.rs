//! 外部账本服务边界
//!
//! 网关只做两件事：调用前预授权额度，调用后上报用量和费用。账本状态由账本服务自己维护。

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

use crate::config::LedgerConfig;
use crate::error::{Error, Result};

/// 预授权请求
#[derive(Debug, Clone, Serialize)]
pub struct PreauthorizeRequest {
    pub request_id: String,
    pub api_key: Option<String>,
    pub user: Option<String>,
    pub model: String,
    pub provider: String,
    pub estimated_tokens: u32,
    /// 8位小数的美元金额
    pub estimated_cost: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PreauthorizeResponse {
    approved: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    hold_id: Option<String>,
}

/// 预授权结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorization {
    /// 账本侧的冻结凭证，上报用量时带回
    pub hold_id: Option<String>,
}

/// 最终用量
#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub request_id: String,
    pub api_key: Option<String>,
    pub user: Option<String>,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub usage_estimated: bool,
    pub cached: bool,
    pub cost: String,
    pub cost_scaled: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_id: Option<String>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// 余额不足时返回 `InsufficientBalance`
    async fn preauthorize(&self, request: &PreauthorizeRequest) -> Result<Authorization>;

    async fn report_usage(&self, report: &UsageReport) -> Result<()>;
}

/// 未启用账本时使用
pub struct NoopLedger;

#[async_trait]
impl Ledger for NoopLedger {
    async fn preauthorize(&self, _request: &PreauthorizeRequest) -> Result<Authorization> {
        Ok(Authorization::default())
    }

    async fn report_usage(&self, _report: &UsageReport) -> Result<()> {
        Ok(())
    }
}

pub struct HttpLedger {
    client: Client,
    base_url: String,
    retry_attempts: u32,
    fail_open: bool,
}

impl HttpLedger {
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::Transport)?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry_attempts: config.retry_attempts,
            fail_open: config.fail_open,
        })
    }

    /// POST并在5xx或连接失败时按 100ms * 次数 退避重试
    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut retry_count = 0;
        let max_retries = self.retry_attempts;

        loop {
            let response = self.client.post(&url).json(body).send().await;

            match response {
                Ok(resp) => {
                    if resp.status().is_server_error() && retry_count < max_retries {
                        retry_count += 1;
                        tokio::time::sleep(tokio::time::Duration::from_millis(
                            100 * retry_count as u64,
                        ))
                        .await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) if retry_count < max_retries => {
                    retry_count += 1;
                    error!(
                        "Error calling ledger at {}: {}. Retrying {}/{}",
                        path, e, retry_count, max_retries
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(
                        100 * retry_count as u64,
                    ))
                    .await;
                    continue;
                }
                Err(e) => return Err(Error::Ledger(e.to_string())),
            }
        }
    }

    async fn try_preauthorize(&self, request: &PreauthorizeRequest) -> Result<Authorization> {
        let resp = self.post("/v1/ledger/preauthorize", request).await?;
        let status = resp.status();
        if status == StatusCode::PAYMENT_REQUIRED {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::InsufficientBalance(denial_message(&body)));
        }
        if !status.is_success() {
            return Err(Error::Ledger(format!("ledger returned status: {}", status)));
        }
        let decision: PreauthorizeResponse = resp
            .json()
            .await
            .map_err(|e| Error::Ledger(format!("invalid preauthorize response: {}", e)))?;
        if decision.approved {
            Ok(Authorization {
                hold_id: decision.hold_id,
            })
        } else {
            Err(Error::InsufficientBalance(
                decision
                    .message
                    .unwrap_or_else(|| "spend was not authorized".to_string()),
            ))
        }
    }
}

fn denial_message(body: &str) -> String {
    serde_json::from_str::<PreauthorizeResponse>(body)
        .ok()
        .and_then(|r| r.message)
        .unwrap_or_else(|| "spend was not authorized".to_string())
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn preauthorize(&self, request: &PreauthorizeRequest) -> Result<Authorization> {
        match self.try_preauthorize(request).await {
            Err(Error::Ledger(reason)) if self.fail_open => {
                warn!(
                    request_id = %request.request_id,
                    "Ledger unavailable, allowing request (fail_open): {}",
                    reason
                );
                Ok(Authorization::default())
            }
            other => other,
        }
    }

    async fn report_usage(&self, report: &UsageReport) -> Result<()> {
        let resp = self.post("/v1/ledger/usage", report).await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Ledger(format!(
                "usage report rejected with status: {}",
                resp.status()
            )))
        }
    }
}

/// 根据配置选择账本实现
pub fn build(config: &LedgerConfig) -> Result<Arc<dyn Ledger>> {
    if config.enabled {
        Ok(Arc::new(HttpLedger::new(config)?))
    } else {
        Ok(Arc::new(NoopLedger))
    }
}

/// 异步上报用量，不等待结果
pub fn report_in_background(ledger: Arc<dyn Ledger>, report: UsageReport) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(request_id = %report.request_id, "No runtime available, usage report skipped");
        return;
    };
    runtime.spawn(async move {
        if let Err(e) = ledger.report_usage(&report).await {
            warn!(request_id = %report.request_id, "Usage report failed: {}", e);
        }
    });
}
