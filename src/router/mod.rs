pub mod failover;
pub mod rules;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::provider::ProviderRegistry;

pub use failover::{FailoverPhase, FailoverSnapshot, FailoverTracker};
pub use rules::{RoutingContext, RoutingRule, RuleAction, RuleDefinition};

/// 一个可调用的目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteTarget {
    pub provider: String,
    /// 发给上游的模型名（已去掉 `provider/` 前缀）
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

/// 被跳过的候选及原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedTarget {
    pub provider: String,
    pub model: String,
    pub reason: String,
}

/// 路由结果：首选目标 + 按顺序排列的备选
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub target: RouteTarget,
    pub matched_rule: Option<String>,
    pub alternatives: Vec<RouteTarget>,
    pub skipped: Vec<SkippedTarget>,
}

impl RoutingDecision {
    /// 首选 + 备选，按尝试顺序
    pub fn candidates(&self) -> impl Iterator<Item = &RouteTarget> {
        std::iter::once(&self.target).chain(self.alternatives.iter())
    }
}

/// 规则槽位：规则内容不可变，命中计数单独用原子量维护
#[derive(Debug)]
struct RuleSlot {
    rule: RoutingRule,
    hits: Arc<AtomicU64>,
}

impl RuleSlot {
    fn view(&self) -> RoutingRule {
        let mut rule = self.rule.clone();
        rule.hit_count = self.hits.load(Ordering::Relaxed);
        rule
    }
}

type RuleSet = Arc<Vec<Arc<RuleSlot>>>;

enum Candidate {
    Resolved(RouteTarget),
    Unresolved { model: String, rule_id: Option<String> },
}

/// 路由引擎
///
/// 规则集整体以 `Arc` 快照形式替换（写时复制），评估期间持有的快照不会被修改，
/// 因此读者不会看到条件已更新而动作未更新的规则。
pub struct RoutingEngine {
    rules: RwLock<RuleSet>,
    registry: Arc<ProviderRegistry>,
    failover: Arc<FailoverTracker>,
    default_model: RwLock<Option<String>>,
}

impl RoutingEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        failover: Arc<FailoverTracker>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            registry,
            failover,
            default_model: RwLock::new(default_model),
        }
    }

    /// 使用配置中的规则初始化
    pub fn with_rules(self, definitions: Vec<RuleDefinition>) -> Result<Self> {
        for definition in definitions {
            self.create(definition)?;
        }
        Ok(self)
    }

    pub fn failover(&self) -> &Arc<FailoverTracker> {
        &self.failover
    }

    pub fn set_default_model(&self, model: Option<String>) {
        *self.default_model.write() = model;
    }

    /// 为请求选择目标
    ///
    /// # 参数
    /// * `ctx` - 请求属性
    /// * `record_hits` - 是否增加命中计数，试运行时传 `false`
    pub fn evaluate(&self, ctx: &RoutingContext, record_hits: bool) -> Result<RoutingDecision> {
        let snapshot = self.rules.read().clone();

        let mut hits: Vec<(String, Arc<AtomicU64>)> = Vec::new();
        let mut candidates: Vec<Candidate> = Vec::new();
        for slot in snapshot.iter() {
            let definition = &slot.rule.definition;
            if !definition.active || !definition.matches(ctx) {
                continue;
            }
            hits.push((slot.rule.id.clone(), slot.hits.clone()));
            candidates.push(self.resolve_action(&definition.action, ctx, &slot.rule.id));
        }

        candidates.push(self.resolve_model(&ctx.model, ctx.provider.as_deref(), None));
        let default_model = self.default_model.read().clone();
        if let Some(default_model) = default_model {
            if default_model != ctx.model {
                candidates.push(self.resolve_model(&default_model, None, None));
            }
        }

        let mut seen = HashSet::new();
        let mut available = Vec::new();
        let mut skipped = Vec::new();
        for candidate in candidates {
            let target = match candidate {
                Candidate::Resolved(target) => target,
                Candidate::Unresolved { model, rule_id } => {
                    debug!(model = %model, rule = ?rule_id, "No provider resolves routing target");
                    continue;
                }
            };
            if !seen.insert((target.provider.clone(), target.model.clone())) {
                continue;
            }
            if !self.registry.contains(&target.provider) {
                skipped.push(SkippedTarget {
                    provider: target.provider,
                    model: target.model,
                    reason: "not_registered".into(),
                });
            } else if !self.failover.is_available(&target.provider) {
                skipped.push(SkippedTarget {
                    provider: target.provider,
                    model: target.model,
                    reason: "cooldown".into(),
                });
            } else {
                available.push(target);
            }
        }

        if available.is_empty() {
            return Err(exhausted(&ctx.model, &skipped));
        }

        let target = available.remove(0);
        if record_hits {
            if let Some(rule_id) = &target.rule_id {
                if let Some((_, counter)) = hits.iter().find(|(id, _)| id == rule_id) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        for entry in &skipped {
            debug!(provider = %entry.provider, reason = %entry.reason, "Routing candidate skipped");
        }

        Ok(RoutingDecision {
            matched_rule: target.rule_id.clone(),
            target,
            alternatives: available,
            skipped,
        })
    }

    fn resolve_action(&self, action: &RuleAction, ctx: &RoutingContext, rule_id: &str) -> Candidate {
        match action {
            RuleAction::RouteToModel { model, provider } => {
                self.resolve_model(model, provider.as_deref(), Some(rule_id))
            }
            RuleAction::FallbackToProvider { provider, model } => {
                let model = model.as_deref().unwrap_or(&ctx.model);
                Candidate::Resolved(RouteTarget {
                    provider: provider.clone(),
                    model: self.registry.upstream_model(provider, model).to_string(),
                    rule_id: Some(rule_id.to_string()),
                })
            }
        }
    }

    fn resolve_model(&self, model: &str, provider: Option<&str>, rule_id: Option<&str>) -> Candidate {
        let provider = match provider {
            Some(p) => Some(p.to_string()),
            None => self.registry.detect_provider(model),
        };
        match provider {
            Some(provider) => Candidate::Resolved(RouteTarget {
                model: self.registry.upstream_model(&provider, model).to_string(),
                provider,
                rule_id: rule_id.map(str::to_string),
            }),
            None => Candidate::Unresolved {
                model: model.to_string(),
                rule_id: rule_id.map(str::to_string),
            },
        }
    }

    pub fn list(&self) -> Vec<RoutingRule> {
        self.rules.read().iter().map(|slot| slot.view()).collect()
    }

    pub fn get(&self, id: &str) -> Result<RoutingRule> {
        self.rules
            .read()
            .iter()
            .find(|slot| slot.rule.id == id)
            .map(|slot| slot.view())
            .ok_or_else(|| Error::NotFound(format!("routing rule '{}'", id)))
    }

    pub fn create(&self, definition: RuleDefinition) -> Result<RoutingRule> {
        definition.validate()?;
        let now = Utc::now();
        let rule = RoutingRule {
            id: uuid::Uuid::now_v7().to_string(),
            definition,
            hit_count: 0,
            created_at: now,
            updated_at: now,
        };
        let slot = Arc::new(RuleSlot {
            rule: rule.clone(),
            hits: Arc::new(AtomicU64::new(0)),
        });
        self.mutate(|rules| rules.push(slot));
        info!(rule = %rule.id, name = %rule.definition.name, "Routing rule created");
        Ok(rule)
    }

    /// 整体替换规则内容，命中计数和创建时间保留
    pub fn update(&self, id: &str, definition: RuleDefinition) -> Result<RoutingRule> {
        definition.validate()?;
        let mut updated = None;
        self.mutate(|rules| {
            if let Some(index) = rules.iter().position(|slot| slot.rule.id == id) {
                let old = &rules[index];
                let mut rule = old.rule.clone();
                rule.definition = definition;
                rule.updated_at = Utc::now();
                let slot = Arc::new(RuleSlot {
                    rule,
                    hits: old.hits.clone(),
                });
                updated = Some(slot.view());
                rules[index] = slot;
            }
        });
        let rule = updated.ok_or_else(|| Error::NotFound(format!("routing rule '{}'", id)))?;
        info!(rule = %id, "Routing rule updated");
        Ok(rule)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut removed = false;
        self.mutate(|rules| {
            let before = rules.len();
            rules.retain(|slot| slot.rule.id != id);
            removed = rules.len() != before;
        });
        if removed {
            info!(rule = %id, "Routing rule deleted");
            Ok(())
        } else {
            Err(Error::NotFound(format!("routing rule '{}'", id)))
        }
    }

    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut Vec<Arc<RuleSlot>>),
    {
        let mut guard = self.rules.write();
        let mut next: Vec<Arc<RuleSlot>> = (**guard).clone();
        f(&mut next);
        next.sort_by(|a, b| {
            a.rule
                .definition
                .priority
                .cmp(&b.rule.definition.priority)
                .then_with(|| a.rule.created_at.cmp(&b.rule.created_at))
                .then_with(|| a.rule.id.cmp(&b.rule.id))
        });
        *guard = Arc::new(next);
    }
}

fn exhausted(model: &str, skipped: &[SkippedTarget]) -> Error {
    let cooling: Vec<&str> = skipped
        .iter()
        .filter(|s| s.reason == "cooldown")
        .map(|s| s.provider.as_str())
        .collect();
    if !cooling.is_empty() {
        return Error::RoutingExhausted {
            model: model.to_string(),
            reason: format!("all candidate providers are in cooldown: {}", cooling.join(", ")),
        };
    }
    match skipped.first() {
        Some(entry) => Error::ProviderNotRegistered(entry.provider.clone()),
        None => Error::NoProviderForModel(model.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::rules::{Combinator, Condition, Field, Operator};
    use super::*;
    use crate::config::ProviderConfig;
    use crate::pool::PoolManager;
    use crate::provider::ProviderKind;
    use serde_json::json;
    use std::time::Duration;

    fn engine() -> RoutingEngine {
        let pool = Arc::new(PoolManager::default());
        let configs = vec![
            ProviderConfig::new("openai", ProviderKind::OpenAi)
                .with_api_key("sk")
                .with_models(["gpt-4o", "gpt-4o-mini"]),
            ProviderConfig::new("anthropic", ProviderKind::Anthropic)
                .with_api_key("sk")
                .with_models(["claude-3-5-sonnet-20241022"]),
        ];
        let registry = Arc::new(ProviderRegistry::from_configs(&configs, pool).unwrap());
        let failover = Arc::new(FailoverTracker::new(2, Duration::from_secs(30)));
        RoutingEngine::new(registry, failover, None)
    }

    fn long_prompt_rule(priority: i32) -> RuleDefinition {
        RuleDefinition {
            name: "long prompts".into(),
            priority,
            active: true,
            combinator: Combinator::And,
            conditions: vec![Condition {
                field: Field::PromptChars,
                operator: Operator::Gte,
                value: json!(100),
            }],
            action: RuleAction::RouteToModel {
                model: "claude-3-5-sonnet-20241022".into(),
                provider: None,
            },
        }
    }

    fn ctx(model: &str, prompt_chars: usize) -> RoutingContext {
        RoutingContext {
            model: model.into(),
            prompt_chars,
            message_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn direct_detection_without_rules() {
        let engine = engine();
        let decision = engine.evaluate(&ctx("gpt-4o", 10), true).unwrap();
        assert_eq!(decision.target.provider, "openai");
        assert_eq!(decision.target.model, "gpt-4o");
        assert!(decision.matched_rule.is_none());
    }

    #[test]
    fn evaluation_is_idempotent_and_counts_hits() {
        let engine = engine();
        let rule = engine.create(long_prompt_rule(1)).unwrap();

        let first = engine.evaluate(&ctx("gpt-4o", 500), true).unwrap();
        let second = engine.evaluate(&ctx("gpt-4o", 500), true).unwrap();
        assert_eq!(first.target, second.target);
        assert_eq!(first.target.provider, "anthropic");
        assert_eq!(first.alternatives[0].provider, "openai");
        assert_eq!(engine.get(&rule.id).unwrap().hit_count, 2);

        engine.evaluate(&ctx("gpt-4o", 500), false).unwrap();
        assert_eq!(engine.get(&rule.id).unwrap().hit_count, 2);
    }

    #[test]
    fn cooldown_provider_is_skipped() {
        let engine = engine();
        engine.create(long_prompt_rule(1)).unwrap();
        engine.failover().record_failure("anthropic", "down");
        engine.failover().record_failure("anthropic", "down");

        let decision = engine.evaluate(&ctx("gpt-4o", 500), true).unwrap();
        assert_eq!(decision.target.provider, "openai");
        assert_eq!(decision.skipped[0].reason, "cooldown");
    }

    #[test]
    fn all_candidates_cooling_is_exhausted() {
        let engine = engine();
        engine.failover().record_failure("openai", "down");
        engine.failover().record_failure("openai", "down");
        let err = engine.evaluate(&ctx("gpt-4o", 5), true).unwrap_err();
        assert_eq!(err.code(), "routing_exhausted");
    }

    #[test]
    fn unknown_model_has_no_provider() {
        let engine = engine();
        let err = engine.evaluate(&ctx("mystery-model", 5), true).unwrap_err();
        assert_eq!(err.code(), "no_provider_for_model");
    }

    #[test]
    fn default_model_is_last_resort() {
        let engine = engine();
        engine.set_default_model(Some("gpt-4o-mini".into()));
        let decision = engine.evaluate(&ctx("mystery-model", 5), true).unwrap();
        assert_eq!(decision.target.model, "gpt-4o-mini");
    }

    #[test]
    fn crud_keeps_priority_order() {
        let engine = engine();
        let low = engine.create(long_prompt_rule(10)).unwrap();
        let high = engine.create(long_prompt_rule(1)).unwrap();
        let ids: Vec<String> = engine.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![high.id.clone(), low.id.clone()]);

        let mut changed = long_prompt_rule(20);
        changed.name = "moved".into();
        let updated = engine.update(&high.id, changed).unwrap();
        assert_eq!(updated.created_at, high.created_at);
        assert_eq!(engine.list()[1].definition.name, "moved");

        engine.delete(&low.id).unwrap();
        assert_eq!(engine.list().len(), 1);
        assert!(matches!(engine.delete(&low.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn fallback_to_unregistered_provider_is_skipped() {
        let engine = engine();
        engine
            .create(RuleDefinition {
                name: "to gemini".into(),
                priority: 0,
                active: true,
                combinator: Combinator::And,
                conditions: vec![],
                action: RuleAction::FallbackToProvider {
                    provider: "gemini".into(),
                    model: None,
                },
            })
            .unwrap();
        let decision = engine.evaluate(&ctx("gpt-4o", 5), true).unwrap();
        assert_eq!(decision.target.provider, "openai");
        assert_eq!(decision.skipped[0].reason, "not_registered");
    }
}
