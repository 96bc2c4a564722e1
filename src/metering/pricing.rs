use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::Add;

/// 1 美元对应的最小计价单位数（8 位小数）
pub const COST_SCALE: u64 = 100_000_000;

/// 模型价格（美元 / 百万 token）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default)]
    pub free: bool,
}

impl ModelPricing {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
            free: false,
        }
    }

    pub const fn free() -> Self {
        Self {
            input_per_million: 0.0,
            output_per_million: 0.0,
            free: true,
        }
    }
}

/// 以 1e-8 美元为单位的整数费用，累加时不会产生浮点漂移
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Cost {
    pub scaled: u64,
}

impl Cost {
    pub const ZERO: Cost = Cost { scaled: 0 };

    pub fn from_scaled(scaled: u64) -> Self {
        Self { scaled }
    }

    /// 美元金额
    pub fn total(&self) -> f64 {
        self.scaled as f64 / COST_SCALE as f64
    }

    pub fn is_zero(&self) -> bool {
        self.scaled == 0
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost {
            scaled: self.scaled.saturating_add(rhs.scaled),
        }
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Add::add)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:08}",
            self.scaled / COST_SCALE,
            self.scaled % COST_SCALE
        )
    }
}

/// 单次计价结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub cost: Cost,
    /// 命中的价格键，未找到价格时为 None
    pub pricing_key: Option<String>,
    pub free: bool,
}

const BUILTIN_PRICING: &[(&str, f64, f64)] = &[
    ("openai/gpt-4o", 2.50, 10.00),
    ("openai/gpt-4o-mini", 0.15, 0.60),
    ("openai/gpt-4-turbo", 10.00, 30.00),
    ("openai/gpt-3.5-turbo", 0.50, 1.50),
    ("openai/o1", 15.00, 60.00),
    ("openai/o1-mini", 3.00, 12.00),
    ("openai/text-embedding-3-small", 0.02, 0.0),
    ("openai/text-embedding-3-large", 0.13, 0.0),
    ("anthropic/claude-3-5-sonnet-20241022", 3.00, 15.00),
    ("anthropic/claude-3-5-haiku-20241022", 0.80, 4.00),
    ("anthropic/claude-3-opus-20240229", 15.00, 75.00),
    ("anthropic/claude-3-haiku-20240307", 0.25, 1.25),
    ("gemini/gemini-1.5-pro", 1.25, 5.00),
    ("gemini/gemini-1.5-flash", 0.075, 0.30),
    ("gemini/gemini-2.0-flash", 0.10, 0.40),
    ("gemini/text-embedding-004", 0.0, 0.0),
    ("bedrock/anthropic.claude-3-5-sonnet-20241022-v2:0", 3.00, 15.00),
    ("bedrock/anthropic.claude-3-haiku-20240307-v1:0", 0.25, 1.25),
    ("bedrock/meta.llama3-1-70b-instruct-v1:0", 0.72, 0.72),
    ("bedrock/amazon.titan-embed-text-v2:0", 0.02, 0.0),
    ("mistral/mistral-large-latest", 2.00, 6.00),
    ("deepseek/deepseek-chat", 0.27, 1.10),
    ("groq/llama-3.1-70b-versatile", 0.59, 0.79),
];

/// 价格表，键为 "provider/model"
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    entries: BTreeMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new(entries: BTreeMap<String, ModelPricing>) -> Self {
        Self { entries }
    }

    /// 内置价格
    pub fn builtin() -> Self {
        let entries = BUILTIN_PRICING
            .iter()
            .map(|(key, input, output)| (key.to_string(), ModelPricing::new(*input, *output)))
            .collect();
        Self { entries }
    }

    /// 内置价格加上覆盖项
    pub fn with_overrides(overrides: BTreeMap<String, ModelPricing>) -> Self {
        let mut table = Self::builtin();
        table.entries.extend(overrides);
        table
    }

    pub fn insert(&mut self, key: impl Into<String>, pricing: ModelPricing) {
        self.entries.insert(key.into(), pricing);
    }

    pub fn entries(&self) -> &BTreeMap<String, ModelPricing> {
        &self.entries
    }

    /// 查找价格
    ///
    /// 顺序：精确的 `provider/model` → 任意供应商下同名模型（按键排序取第一个）
    /// → 最长的模型名前缀（处理带日期后缀的模型版本）
    pub fn lookup(&self, provider: &str, model: &str) -> Option<(&str, &ModelPricing)> {
        let exact = format!("{}/{}", provider, model);
        if let Some((key, pricing)) = self.entries.get_key_value(&exact) {
            return Some((key.as_str(), pricing));
        }

        let bare = |key: &str| key.rsplit_once('/').map_or(key, |(_, m)| m).to_string();
        if let Some((key, pricing)) = self.entries.iter().find(|(key, _)| bare(key) == model) {
            return Some((key.as_str(), pricing));
        }

        self.entries
            .iter()
            .filter(|(key, _)| {
                let candidate = bare(key);
                model.starts_with(&candidate)
                    && model[candidate.len()..].starts_with(|c: char| c == '-' || c == '@' || c == ':')
            })
            .max_by_key(|(key, _)| bare(key).len())
            .map(|(key, pricing)| (key.as_str(), pricing))
    }

    /// 计算费用：`(input/1e6)*input_rate + (output/1e6)*output_rate`，保留8位小数
    pub fn calculate_cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> CostBreakdown {
        let Some((key, pricing)) = self.lookup(provider, model) else {
            return CostBreakdown {
                cost: Cost::ZERO,
                pricing_key: None,
                free: false,
            };
        };
        if pricing.free {
            return CostBreakdown {
                cost: Cost::ZERO,
                pricing_key: Some(key.to_string()),
                free: true,
            };
        }

        let input_rate = scaled_rate(pricing.input_per_million);
        let output_rate = scaled_rate(pricing.output_per_million);
        // 分子单位为 1e-8 美元 * 1e6
        let numerator = u128::from(input_tokens) * input_rate + u128::from(output_tokens) * output_rate;
        let scaled = (numerator + 500_000) / 1_000_000;

        CostBreakdown {
            cost: Cost::from_scaled(u64::try_from(scaled).unwrap_or(u64::MAX)),
            pricing_key: Some(key.to_string()),
            free: false,
        }
    }
}

fn scaled_rate(per_million: f64) -> u128 {
    if !per_million.is_finite() || per_million <= 0.0 {
        return 0;
    }
    (per_million * COST_SCALE as f64).round() as u128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_million_input_tokens_costs_exactly_the_input_rate() {
        let table = PricingTable::builtin();
        let breakdown = table.calculate_cost("openai", "gpt-4o-mini", 1_000_000, 0);
        assert_eq!(breakdown.cost.scaled, 15_000_000);
        assert_eq!(breakdown.cost.total(), 0.15);
        assert_eq!(breakdown.cost.to_string(), "0.15000000");
    }

    #[test]
    fn large_token_counts_keep_precision() {
        let table = PricingTable::builtin();
        let breakdown = table.calculate_cost("openai", "gpt-4o-mini", 10_000_000_000, 3);
        // 1e10 * 0.15 / 1e6 = 1500 USD，3 个输出 token = 0.0000018 USD
        assert_eq!(breakdown.cost.scaled, 1500 * COST_SCALE + 180);
    }

    #[test]
    fn bare_model_fallback_across_providers() {
        let table = PricingTable::builtin();
        let breakdown = table.calculate_cost("my-azure", "gpt-4o", 1_000, 1_000);
        assert_eq!(breakdown.pricing_key.as_deref(), Some("openai/gpt-4o"));
        // 0.0025 + 0.01
        assert_eq!(breakdown.cost.scaled, 1_250_000);
    }

    #[test]
    fn dated_model_versions_use_prefix_pricing() {
        let table = PricingTable::builtin();
        let (key, _) = table.lookup("openai", "gpt-4o-mini-2024-07-18").unwrap();
        assert_eq!(key, "openai/gpt-4o-mini");
    }

    #[test]
    fn free_and_unknown_models_cost_nothing() {
        let mut table = PricingTable::builtin();
        table.insert("local/llama3", ModelPricing::free());
        let free = table.calculate_cost("local", "llama3", 5_000, 5_000);
        assert!(free.free);
        assert!(free.cost.is_zero());

        let unknown = table.calculate_cost("local", "mystery", 5_000, 5_000);
        assert!(unknown.pricing_key.is_none());
        assert!(unknown.cost.is_zero());
    }

    #[test]
    fn costs_sum_without_drift() {
        let table = PricingTable::builtin();
        let single = table.calculate_cost("openai", "gpt-4o-mini", 1, 0).cost;
        let total: Cost = std::iter::repeat(single).take(1_000_000).sum();
        assert_eq!(total.to_string(), "0.15000000");
    }
}
