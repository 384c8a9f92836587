//! 匹配规则与匹配结果

use crate::constraint::Constraint;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_weight() -> f64 {
    1.0
}

/// 加权匹配规则
///
/// 协议、检查、系列、实例四个级别共用同一结构，区别只在于规则所针对的属性集合。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub attribute: String,
    pub constraint: Constraint,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// 仅检查级规则使用
    #[serde(default)]
    pub applies_to_prior: bool,
}

/// 协议匹配规则
pub type ProtocolMatchingRule = Rule;
/// 检查匹配规则
pub type StudyMatchingRule = Rule;
/// 系列匹配规则
pub type SeriesMatchingRule = Rule;
/// 图像匹配规则
pub type ImageMatchingRule = Rule;

impl Rule {
    pub fn new(attribute: &str, constraint: Constraint) -> Self {
        Self {
            id: Uuid::new_v4(),
            attribute: attribute.to_string(),
            constraint,
            required: false,
            weight: default_weight(),
            applies_to_prior: false,
        }
    }

    /// 标记为必需规则
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn for_prior(mut self) -> Self {
        self.applies_to_prior = true;
        self
    }
}

/// 失败的规则及诊断信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedRule {
    pub rule: Rule,
    pub error_messages: Vec<String>,
}

/// 匹配明细
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchDetails {
    pub passed: Vec<Rule>,
    pub failed: Vec<FailedRule>,
}

impl MatchDetails {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加另一组明细
    pub fn merge(&mut self, other: &MatchDetails) {
        self.passed.extend(other.passed.iter().cloned());
        self.failed.extend(other.failed.iter().cloned());
    }

    pub fn evaluated_count(&self) -> usize {
        self.passed.len() + self.failed.len()
    }

    /// 是否有必需规则失败
    pub fn required_failed(&self) -> bool {
        self.failed.iter().any(|failed| failed.rule.required)
    }
}

/// 匹配结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub score: f64,
    pub details: MatchDetails,
}

impl MatchResult {
    pub fn is_positive(&self) -> bool {
        self.score > 0.0
    }
}
