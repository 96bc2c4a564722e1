//! 后台健康轮询
//!
//! 固定间隔（默认30秒，下限5秒）检查所有已注册供应商，启动后立即执行第一轮。
//! 每个结果都喂给故障转移状态；只有健康状态发生翻转时才调用回调。

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::models::HealthStatus;
use crate::provider::ProviderRegistry;
use crate::router::FailoverTracker;

pub const MIN_INTERVAL: Duration = Duration::from_secs(5);

/// 状态翻转回调：(供应商名, 新状态)
pub type TransitionCallback = Arc<dyn Fn(&str, &HealthStatus) + Send + Sync>;

pub struct HealthPoller {
    registry: Arc<ProviderRegistry>,
    failover: Arc<FailoverTracker>,
    interval: Duration,
    timeout: Duration,
    statuses: DashMap<String, HealthStatus>,
    callbacks: RwLock<Vec<TransitionCallback>>,
    cycles: AtomicU64,
}

impl HealthPoller {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        failover: Arc<FailoverTracker>,
        config: &HealthConfig,
    ) -> Self {
        Self {
            registry,
            failover,
            interval: config.interval.max(MIN_INTERVAL),
            timeout: config.timeout,
            statuses: DashMap::new(),
            callbacks: RwLock::new(Vec::new()),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 注册状态翻转回调
    pub fn on_transition(&self, callback: TransitionCallback) {
        self.callbacks.write().push(callback);
    }

    /// 已完成的轮询次数
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// 执行一轮检查
    ///
    /// 未见过的供应商视为健康，因此首轮检查失败也算一次翻转
    pub async fn run_cycle(&self) -> BTreeMap<String, HealthStatus> {
        let results = self.registry.health_check_all(self.timeout).await;

        let mut transitions = Vec::new();
        for (name, status) in &results {
            let previous = self.statuses.insert(name.clone(), status.clone());
            let was_healthy = previous.map_or(true, |p| p.healthy);

            if status.healthy {
                self.failover.record_success(name);
            } else {
                let reason = status.error.as_deref().unwrap_or("health check failed");
                self.failover.record_failure(name, reason);
            }

            if was_healthy != status.healthy {
                transitions.push((name.clone(), status.clone()));
            }
        }

        // 已移除的供应商不再保留状态
        self.statuses.retain(|name, _| results.contains_key(name));

        if !transitions.is_empty() {
            let callbacks = self.callbacks.read().clone();
            for (name, status) in &transitions {
                if status.healthy {
                    info!(provider = %name, latency_ms = status.latency_ms, "Provider became healthy");
                } else {
                    warn!(
                        provider = %name,
                        error = status.error.as_deref().unwrap_or(""),
                        "Provider became unhealthy"
                    );
                }
                let healthy = if status.healthy { "true" } else { "false" };
                metrics::counter!(
                    "gateway_health_transitions_total",
                    "provider" => name.clone(),
                    "healthy" => healthy
                )
                .increment(1);
                for callback in &callbacks {
                    callback(name, status);
                }
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        debug!(providers = results.len(), "Health poll cycle finished");
        results
    }

    pub fn is_healthy(&self, provider: &str) -> bool {
        self.statuses.get(provider).is_some_and(|s| s.healthy)
    }

    pub fn healthy_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .statuses
            .iter()
            .filter(|e| e.value().healthy)
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> BTreeMap<String, HealthStatus> {
        self.statuses
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// 启动后台轮询，返回停止句柄
    pub fn start(self: Arc<Self>) -> PollerHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let poller = self;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?poller.interval, "Health poller started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        poller.run_cycle().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Health poller stopped");
        });
        PollerHandle { shutdown, task }
    }
}

/// 后台轮询任务句柄
pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// 通知停止并等待任务退出
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Health poller task ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolManager;
    use crate::provider::testing::StubProvider;
    use crate::provider::ProviderKind;
    use crate::router::FailoverPhase;
    use std::sync::atomic::AtomicUsize;

    fn setup(threshold: u32) -> (Arc<HealthPoller>, Arc<StubProvider>, Arc<FailoverTracker>) {
        let registry = Arc::new(ProviderRegistry::new(Arc::new(PoolManager::default())));
        let stub = Arc::new(StubProvider::new("openai", ProviderKind::OpenAi, &["gpt-4o"]));
        registry.register(stub.clone());
        let failover = Arc::new(FailoverTracker::new(threshold, Duration::from_secs(60)));
        let poller = Arc::new(HealthPoller::new(
            registry,
            failover.clone(),
            &HealthConfig {
                enabled: true,
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(2),
            },
        ));
        (poller, stub, failover)
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_fire_only_on_transitions() {
        let (poller, stub, _) = setup(3);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        poller.on_transition(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        poller.run_cycle().await;
        poller.run_cycle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(poller.is_healthy("openai"));

        stub.healthy.store(false, Ordering::SeqCst);
        poller.run_cycle().await;
        poller.run_cycle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(poller.healthy_providers().is_empty());

        stub.healthy.store(true, Ordering::SeqCst);
        poller.run_cycle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_drive_cooldown() {
        let (poller, stub, failover) = setup(3);
        stub.healthy.store(false, Ordering::SeqCst);
        poller.run_cycle().await;
        poller.run_cycle().await;
        assert!(failover.is_available("openai"));
        poller.run_cycle().await;
        assert!(!failover.is_available("openai"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(failover.is_available("openai"));
    }

    #[tokio::test(start_paused = true)]
    async fn passing_health_check_does_not_end_cooldown_early() {
        let (poller, _, failover) = setup(1);
        failover.record_failure("openai", "upstream 503");
        assert!(!failover.is_available("openai"));

        poller.run_cycle().await;
        assert!(poller.is_healthy("openai"));
        assert!(!failover.is_available("openai"));

        tokio::time::advance(Duration::from_secs(61)).await;
        poller.run_cycle().await;
        assert_eq!(failover.phase("openai"), FailoverPhase::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_runs_immediately_and_stops_cleanly() {
        let (poller, _, _) = setup(3);
        let handle = poller.clone().start();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(poller.cycles(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(poller.cycles(), 2);

        handle.stop().await;
    }

    #[test]
    fn interval_has_a_floor() {
        let registry = Arc::new(ProviderRegistry::new(Arc::new(PoolManager::default())));
        let poller = HealthPoller::new(
            registry,
            Arc::new(FailoverTracker::new(3, Duration::from_secs(30))),
            &HealthConfig {
                enabled: true,
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(1),
            },
        );
        assert_eq!(poller.interval(), MIN_INTERVAL);
    }
}
