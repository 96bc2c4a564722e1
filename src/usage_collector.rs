use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::cache::CacheStatus;
use crate::error::Error;
use crate::ledger::{self, Ledger, UsageReport};
use crate::metering::{CostBreakdown, Meter};
use crate::models::{ChatChunk, ChatRequest, FinishReason, Usage};
use crate::provider::{ChatStream, ProviderKind};
use crate::router::FailoverTracker;
use crate::telemetry::{GatewayEvent, RequestEvent, TelemetryModule};

/// 单个请求的记账上下文
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request_id: String,
    pub api_key: Option<String>,
    pub user: Option<String>,
    pub endpoint: &'static str,
    pub requested_model: String,
    /// 实际服务该请求的供应商，路由失败时为空
    pub provider: Option<String>,
    pub upstream_model: Option<String>,
    pub kind: Option<ProviderKind>,
    pub stream: bool,
    pub cache: CacheStatus,
    pub started: Instant,
    pub attempts: u32,
    pub hold_id: Option<String>,
}

impl RequestRecord {
    pub fn new(request_id: String, endpoint: &'static str, model: &str, stream: bool) -> Self {
        Self {
            request_id,
            api_key: None,
            user: None,
            endpoint,
            requested_model: model.to_string(),
            provider: None,
            upstream_model: None,
            kind: None,
            stream,
            cache: CacheStatus::Disabled,
            started: Instant::now(),
            attempts: 0,
            hold_id: None,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// 最终用量与费用
#[derive(Debug, Clone)]
pub struct Settlement {
    pub usage: Usage,
    pub estimated: bool,
    pub cost: CostBreakdown,
}

/// 请求结束后的记账：计费、账本上报、指标和事件
pub struct Accounting {
    meter: Arc<Meter>,
    ledger: Arc<dyn Ledger>,
    telemetry: Arc<TelemetryModule>,
    failover: Arc<FailoverTracker>,
}

impl Accounting {
    pub fn new(
        meter: Arc<Meter>,
        ledger: Arc<dyn Ledger>,
        telemetry: Arc<TelemetryModule>,
        failover: Arc<FailoverTracker>,
    ) -> Self {
        Self {
            meter,
            ledger,
            telemetry,
            failover,
        }
    }

    pub fn meter(&self) -> &Arc<Meter> {
        &self.meter
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn telemetry(&self) -> &Arc<TelemetryModule> {
        &self.telemetry
    }

    /// 成功结束的请求
    ///
    /// 缓存命中不产生上游费用，但用量照常上报
    pub fn settle(
        &self,
        record: &RequestRecord,
        usage: Usage,
        estimated: bool,
        finish: Option<FinishReason>,
    ) -> Settlement {
        let provider = record.provider.as_deref().unwrap_or("unknown");
        let model = record
            .upstream_model
            .as_deref()
            .unwrap_or(&record.requested_model);
        let cost = if record.cache == CacheStatus::Hit {
            CostBreakdown {
                cost: Default::default(),
                pricing_key: None,
                free: true,
            }
        } else {
            self.meter.cost(provider, model, &usage)
        };

        metrics::counter!(
            "gateway_requests_total",
            "provider" => provider.to_string(),
            "outcome" => "success"
        )
        .increment(1);
        metrics::counter!("gateway_tokens_total", "provider" => provider.to_string(), "direction" => "prompt")
            .increment(u64::from(usage.prompt_tokens));
        metrics::counter!("gateway_tokens_total", "provider" => provider.to_string(), "direction" => "completion")
            .increment(u64::from(usage.completion_tokens));
        metrics::counter!("gateway_cost_scaled_total", "provider" => provider.to_string())
            .increment(cost.cost.scaled);
        metrics::histogram!("gateway_request_duration_seconds", "provider" => provider.to_string())
            .record(record.started.elapsed().as_secs_f64());

        if record.provider.is_some() {
            ledger::report_in_background(
                self.ledger.clone(),
                UsageReport {
                    request_id: record.request_id.clone(),
                    api_key: record.api_key.clone(),
                    user: record.user.clone(),
                    model: model.to_string(),
                    provider: provider.to_string(),
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                    usage_estimated: estimated,
                    cached: record.cache == CacheStatus::Hit,
                    cost: cost.cost.to_string(),
                    cost_scaled: cost.cost.scaled,
                    hold_id: record.hold_id.clone(),
                },
            );
        }

        if finish == Some(FinishReason::ContentFilter) {
            self.telemetry.emit(GatewayEvent::SafetyViolation {
                request_id: record.request_id.clone(),
                provider: provider.to_string(),
                model: model.to_string(),
                api_key: record.api_key.clone(),
            });
        }

        self.telemetry.emit(GatewayEvent::RequestCompleted(RequestEvent {
            request_id: record.request_id.clone(),
            api_key: record.api_key.clone(),
            endpoint: record.endpoint,
            model: record.requested_model.clone(),
            provider: record.provider.clone(),
            stream: record.stream,
            success: true,
            error_code: None,
            cache: record.cache,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            usage_estimated: estimated,
            cost: cost.cost.to_string(),
            latency_ms: record.elapsed_ms(),
            attempts: record.attempts,
        }));

        Settlement {
            usage,
            estimated,
            cost,
        }
    }

    /// 失败结束的请求
    pub fn fail(&self, record: &RequestRecord, error: &Error) {
        let provider = record.provider.as_deref().unwrap_or("none");
        metrics::counter!(
            "gateway_requests_total",
            "provider" => provider.to_string(),
            "outcome" => error.code()
        )
        .increment(1);
        self.telemetry.emit(GatewayEvent::RequestCompleted(RequestEvent {
            request_id: record.request_id.clone(),
            api_key: record.api_key.clone(),
            endpoint: record.endpoint,
            model: record.requested_model.clone(),
            provider: record.provider.clone(),
            stream: record.stream,
            success: false,
            error_code: Some(error.code()),
            cache: record.cache,
            prompt_tokens: 0,
            completion_tokens: 0,
            usage_estimated: false,
            cost: Default::default(),
            latency_ms: record.elapsed_ms(),
            attempts: record.attempts,
        }));
    }
}

/// 流式响应的Usage收集器
///
/// 流正常结束、出错或被客户端提前丢弃时都会结算一次，且只结算一次
pub struct StreamUsageCollector {
    accounting: Arc<Accounting>,
    record: RequestRecord,
    request: ChatRequest,
    reported: Option<Usage>,
    completion_text: String,
    finish: Option<FinishReason>,
    settled: bool,
}

impl StreamUsageCollector {
    pub fn new(accounting: Arc<Accounting>, record: RequestRecord, request: ChatRequest) -> Self {
        Self {
            accounting,
            record,
            request,
            reported: None,
            completion_text: String::new(),
            finish: None,
            settled: false,
        }
    }

    /// 处理一个增量，收集文本、结束原因和上游用量
    fn observe(&mut self, chunk: &ChatChunk) {
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.completion_text.push_str(content);
            }
            for call in &choice.delta.tool_calls {
                if let Some(function) = &call.function {
                    if let Some(name) = &function.name {
                        self.completion_text.push_str(name);
                    }
                    if let Some(arguments) = &function.arguments {
                        self.completion_text.push_str(arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.finish = choice.finish_reason;
            }
        }
        if let Some(usage) = chunk.usage {
            if !usage.is_empty() {
                self.reported = Some(usage);
            }
        }
    }

    /// 合并上游用量与估算值，上游给出的字段优先
    fn resolve_usage(&self) -> (Usage, bool) {
        let kind = self.record.kind.unwrap_or(ProviderKind::OpenAiCompatible);
        let meter = self.accounting.meter();
        let reported = self.reported.unwrap_or_default();
        let mut estimated = false;
        let prompt = if reported.prompt_tokens > 0 {
            reported.prompt_tokens
        } else {
            estimated = true;
            meter.estimate_prompt(kind, &self.request).tokens
        };
        let completion = if reported.completion_tokens > 0 {
            reported.completion_tokens
        } else {
            estimated = true;
            meter.estimate_text(kind, &self.completion_text).tokens
        };
        (Usage::new(prompt, completion), estimated)
    }

    fn settle(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        let (usage, estimated) = self.resolve_usage();
        debug!(
            request_id = %self.record.request_id,
            prompt = usage.prompt_tokens,
            completion = usage.completion_tokens,
            estimated,
            "Stream finished, settling usage"
        );
        self.accounting
            .settle(&self.record, usage, estimated, self.finish);
    }

    fn on_error(&mut self, error: &Error) {
        if let Some(provider) = &self.record.provider {
            if !error.is_client_error() && self.record.cache != CacheStatus::Hit {
                self.accounting
                    .failover
                    .record_failure(provider, &error.to_string());
            }
        }
        self.settled = true;
        self.accounting.fail(&self.record, error);
    }

    /// 包装流，在每个chunk上收集usage信息
    pub fn wrap(self, mut inner: ChatStream) -> ChatStream {
        Box::pin(async_stream::stream! {
            let mut collector = self;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(chunk) => {
                        collector.observe(&chunk);
                        yield Ok(chunk);
                    }
                    Err(e) => {
                        collector.on_error(&e);
                        yield Err(e);
                        break;
                    }
                }
            }

            // 流结束，确保结算（如果还没结算的话）
            collector.settle();
        })
    }
}

impl Drop for StreamUsageCollector {
    fn drop(&mut self) {
        if !self.settled {
            debug!(request_id = %self.record.request_id, "Stream dropped before completion");
            self.settle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::NoopLedger;
    use crate::models::{ChatMessage, Delta, Role};
    use futures::stream;
    use std::time::Duration;

    fn accounting() -> Arc<Accounting> {
        Arc::new(Accounting::new(
            Arc::new(Meter::default()),
            Arc::new(NoopLedger),
            Arc::new(TelemetryModule::disabled()),
            Arc::new(FailoverTracker::new(1, Duration::from_secs(30))),
        ))
    }

    fn record() -> RequestRecord {
        let mut record = RequestRecord::new("req-1".into(), "chat", "gpt-4o-mini", true);
        record.provider = Some("openai".into());
        record.upstream_model = Some("gpt-4o-mini".into());
        record.kind = Some(ProviderKind::OpenAi);
        record.cache = CacheStatus::Miss;
        record
    }

    fn request() -> ChatRequest {
        ChatRequest::new("gpt-4o-mini", vec![ChatMessage::text(Role::User, "hello there")])
    }

    fn text_chunk(text: &str) -> ChatChunk {
        ChatChunk::new("c1", "gpt-4o-mini").with_delta(
            Delta {
                content: Some(text.into()),
                ..Default::default()
            },
            None,
        )
    }

    /// 记录收到的用量上报
    #[derive(Default)]
    struct RecordingLedger {
        reports: parking_lot::Mutex<Vec<UsageReport>>,
    }

    #[async_trait::async_trait]
    impl Ledger for RecordingLedger {
        async fn preauthorize(
            &self,
            _request: &crate::ledger::PreauthorizeRequest,
        ) -> crate::Result<crate::ledger::Authorization> {
            Ok(Default::default())
        }

        async fn report_usage(&self, report: &UsageReport) -> crate::Result<()> {
            self.reports.lock().push(report.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn reported_usage_wins_over_estimate() {
        let ledger = Arc::new(RecordingLedger::default());
        let accounting = Arc::new(Accounting::new(
            Arc::new(Meter::default()),
            ledger.clone(),
            Arc::new(TelemetryModule::disabled()),
            Arc::new(FailoverTracker::new(1, Duration::from_secs(30))),
        ));
        let collector = StreamUsageCollector::new(accounting, record(), request());
        let chunks: Vec<crate::Result<ChatChunk>> = vec![
            Ok(text_chunk("a much longer reply than three tokens would cover")),
            Ok(ChatChunk::new("c1", "gpt-4o-mini").with_usage(Usage::new(7, 3))),
        ];
        let mut wrapped = collector.wrap(Box::pin(stream::iter(chunks)));
        while wrapped.next().await.is_some() {}
        drop(wrapped);

        // 上报在后台任务中完成
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let reports = ledger.reports.lock();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.prompt_tokens, 7);
        assert_eq!(report.completion_tokens, 3);
        assert_eq!(report.total_tokens, 10);
        assert!(!report.usage_estimated);
        assert!(!report.cached);
    }

    #[tokio::test]
    async fn dropped_stream_settles_once_with_estimate() {
        let ledger = Arc::new(RecordingLedger::default());
        let accounting = Arc::new(Accounting::new(
            Arc::new(Meter::default()),
            ledger.clone(),
            Arc::new(TelemetryModule::disabled()),
            Arc::new(FailoverTracker::new(1, Duration::from_secs(30))),
        ));
        let collector = StreamUsageCollector::new(accounting, record(), request());
        let chunks: Vec<crate::Result<ChatChunk>> =
            vec![Ok(text_chunk("12345678")), Ok(text_chunk("never read"))];
        let mut wrapped = collector.wrap(Box::pin(stream::iter(chunks)));
        assert!(wrapped.next().await.is_some());
        drop(wrapped);

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let reports = ledger.reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].usage_estimated);
        assert_eq!(reports[0].completion_tokens, 2);
    }

    #[test]
    fn usage_falls_back_to_estimate() {
        let mut collector = StreamUsageCollector::new(accounting(), record(), request());
        collector.observe(&text_chunk("12345678"));
        let (usage, estimated) = collector.resolve_usage();
        assert!(estimated);
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);

        collector.observe(&ChatChunk::new("c1", "m").with_usage(Usage::new(9, 4)));
        assert_eq!(collector.resolve_usage(), (Usage::new(9, 4), false));
        collector.settled = true;
    }

    #[tokio::test]
    async fn mid_stream_error_records_failure() {
        let accounting = accounting();
        let collector = StreamUsageCollector::new(accounting.clone(), record(), request());
        let chunks: Vec<crate::Result<ChatChunk>> = vec![
            Ok(text_chunk("partial")),
            Err(Error::Upstream {
                provider: "openai".into(),
                status: 500,
                body: "boom".into(),
            }),
        ];
        let mut wrapped = collector.wrap(Box::pin(stream::iter(chunks)));
        let mut errors = 0;
        while let Some(item) = wrapped.next().await {
            if item.is_err() {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
        assert!(!accounting.failover.is_available("openai"));
    }
}
