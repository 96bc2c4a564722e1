use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::ChatRequest;

/// 条件可以引用的请求字段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Model,
    Provider,
    User,
    /// 调用方API密钥的名称（不是密钥本身）
    ApiKey,
    Stream,
    HasTools,
    MessageCount,
    PromptChars,
    MaxTokens,
    Temperature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    fn is_numeric(self) -> bool {
        matches!(self, Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte)
    }

    fn is_textual(self) -> bool {
        matches!(
            self,
            Operator::Contains | Operator::StartsWith | Operator::EndsWith
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: Field,
    pub operator: Operator,
    pub value: Value,
}

/// 规则命中后的动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// 改写目标模型，供应商缺省时按模型名识别
    RouteToModel {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
    /// 指定供应商，模型缺省时沿用请求中的模型
    FallbackToProvider {
        provider: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
}

fn default_active() -> bool {
    true
}

/// 规则的可编辑部分（配置文件和CRUD接口共用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    /// 数值越小越先匹配
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub combinator: Combinator,
    /// 为空时匹配所有请求
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub action: RuleAction,
}

impl RuleDefinition {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("rule name must not be empty".into()));
        }
        for condition in &self.conditions {
            condition.validate()?;
        }
        match &self.action {
            RuleAction::RouteToModel { model, .. } if model.trim().is_empty() => Err(
                Error::Validation(format!("rule '{}': target model is empty", self.name)),
            ),
            RuleAction::FallbackToProvider { provider, .. } if provider.trim().is_empty() => Err(
                Error::Validation(format!("rule '{}': target provider is empty", self.name)),
            ),
            _ => Ok(()),
        }
    }

    pub fn matches(&self, ctx: &RoutingContext) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match self.combinator {
            Combinator::And => self.conditions.iter().all(|c| c.matches(ctx)),
            Combinator::Or => self.conditions.iter().any(|c| c.matches(ctx)),
        }
    }
}

/// 已保存的规则
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingRule {
    pub id: String,
    #[serde(flatten)]
    pub definition: RuleDefinition,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 规则匹配时可见的请求属性
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingContext {
    pub model: String,
    pub provider: Option<String>,
    pub user: Option<String>,
    pub api_key: Option<String>,
    pub stream: bool,
    pub has_tools: bool,
    pub message_count: usize,
    pub prompt_chars: usize,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl RoutingContext {
    pub fn from_request(request: &ChatRequest, api_key: Option<&str>) -> Self {
        Self {
            model: request.model.clone(),
            provider: None,
            user: request.user.clone(),
            api_key: api_key.map(str::to_string),
            stream: request.stream,
            has_tools: !request.tools.is_empty(),
            message_count: request.messages.len(),
            prompt_chars: request.prompt_chars(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        }
    }

    fn value_of(&self, field: Field) -> Operand<'_> {
        match field {
            Field::Model => Operand::Text(&self.model),
            Field::Provider => self.provider.as_deref().map_or(Operand::Missing, Operand::Text),
            Field::User => self.user.as_deref().map_or(Operand::Missing, Operand::Text),
            Field::ApiKey => self.api_key.as_deref().map_or(Operand::Missing, Operand::Text),
            Field::Stream => Operand::Bool(self.stream),
            Field::HasTools => Operand::Bool(self.has_tools),
            Field::MessageCount => Operand::Number(self.message_count as f64),
            Field::PromptChars => Operand::Number(self.prompt_chars as f64),
            Field::MaxTokens => self
                .max_tokens
                .map_or(Operand::Missing, |v| Operand::Number(f64::from(v))),
            Field::Temperature => self
                .temperature
                .map_or(Operand::Missing, |v| Operand::Number(f64::from(v))),
        }
    }
}

enum Operand<'a> {
    Text(&'a str),
    Number(f64),
    Bool(bool),
    Missing,
}

impl Operand<'_> {
    fn equals(&self, expected: &Value) -> bool {
        match (self, expected) {
            (Operand::Text(actual), Value::String(s)) => *actual == s.as_str(),
            (Operand::Number(actual), Value::Number(n)) => n
                .as_f64()
                .is_some_and(|n| (actual - n).abs() < 1e-6),
            (Operand::Bool(actual), Value::Bool(b)) => actual == b,
            _ => false,
        }
    }

    fn compare(&self, expected: &Value) -> Option<std::cmp::Ordering> {
        match (self, expected.as_f64()) {
            (Operand::Number(actual), Some(expected)) => actual.partial_cmp(&expected),
            _ => None,
        }
    }
}

impl Condition {
    fn validate(&self) -> Result<()> {
        let ok = match self.operator {
            Operator::In | Operator::NotIn => self.value.is_array(),
            op if op.is_numeric() => self.value.is_number(),
            op if op.is_textual() => self.value.is_string(),
            _ => !self.value.is_null(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "condition on {:?}: value {} is not valid for operator {:?}",
                self.field, self.value, self.operator
            )))
        }
    }

    pub fn matches(&self, ctx: &RoutingContext) -> bool {
        let actual = ctx.value_of(self.field);
        if let Operand::Missing = actual {
            return matches!(self.operator, Operator::Ne | Operator::NotIn);
        }

        match self.operator {
            Operator::Eq => actual.equals(&self.value),
            Operator::Ne => !actual.equals(&self.value),
            Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
                let (Operand::Text(text), Some(needle)) = (&actual, self.value.as_str()) else {
                    return false;
                };
                match self.operator {
                    Operator::Contains => text.contains(needle),
                    Operator::StartsWith => text.starts_with(needle),
                    _ => text.ends_with(needle),
                }
            }
            Operator::In | Operator::NotIn => {
                let found = self
                    .value
                    .as_array()
                    .is_some_and(|items| items.iter().any(|item| actual.equals(item)));
                found == (self.operator == Operator::In)
            }
            Operator::Gt => actual.compare(&self.value).is_some_and(|o| o.is_gt()),
            Operator::Gte => actual.compare(&self.value).is_some_and(|o| o.is_ge()),
            Operator::Lt => actual.compare(&self.value).is_some_and(|o| o.is_lt()),
            Operator::Lte => actual.compare(&self.value).is_some_and(|o| o.is_le()),
        }
    }
}
