//! # 规则匹配模块
//!
//! 提供挂片协议的规则匹配能力，包括：
//! - 约束定义与求值：每种校验器对应一个约束分支
//! - 加权规则与匹配结果：必需规则失败时得分归零
//! - 自定义属性注册表：属性缺失时按需计算
//! - 属性目录：各匹配级别可用的属性列表

pub mod catalog;
pub mod constraint;
pub mod custom_attributes;
pub mod matcher;
pub mod rule;

// 重新导出主要类型
pub use catalog::{builtin_attributes, catalog_with_custom, AttributeEntry, MatchLevel};
pub use constraint::{Constraint, ConstraintEvaluator, NumericConstraint, StandardEvaluator};
pub use custom_attributes::{AttributeResolver, CustomAttribute, CustomAttributeRegistry};
pub use matcher::RuleMatcher;
pub use rule::{
    FailedRule, ImageMatchingRule, MatchDetails, MatchResult, ProtocolMatchingRule, Rule,
    SeriesMatchingRule, StudyMatchingRule,
};
