//! 约束定义与约束求值器
//!
//! 每种校验器对应 [`Constraint`] 的一个分支，JSON形状与协议文档一致：
//! `{"contains": {"value": "CT"}}`、`{"numericality": {"greaterThanOrEqualTo": 2}}`。

use hp_core::AttributeValue;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::warn;

/// 单值操作数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueOperand {
    pub value: AttributeValue,
}

/// 数值比较约束，未设置的比较项不参与校验
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NumericConstraint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greater_than: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greater_than_or_equal_to: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equal_to: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub less_than_or_equal_to: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub less_than: Option<f64>,
    pub only_integer: bool,
}

/// 集合操作数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetOperand {
    pub within: Vec<AttributeValue>,
}

/// 正则操作数
///
/// 正则在首次求值时编译，之后复用。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternOperand {
    pattern: String,
    #[serde(skip)]
    compiled: OnceLock<Option<Regex>>,
}

impl PatternOperand {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            compiled: OnceLock::new(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// 编译后的正则，模式无效时返回 `None`
    pub fn regex(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| match Regex::new(&self.pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid format pattern {:?}: {}", self.pattern, e);
                    None
                }
            })
            .as_ref()
    }
}

impl PartialEq for PatternOperand {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

/// 存在性选项
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceOptions {
    pub allow_empty: bool,
}

/// 属性约束
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Constraint {
    Equals(ValueOperand),
    DoesNotEqual(ValueOperand),
    Contains(ValueOperand),
    DoesNotContain(ValueOperand),
    StartsWith(ValueOperand),
    EndsWith(ValueOperand),
    Numericality(NumericConstraint),
    Inclusion(SetOperand),
    Exclusion(SetOperand),
    Format(PatternOperand),
    Presence(PresenceOptions),
}

impl Constraint {
    pub fn equals(value: impl Into<AttributeValue>) -> Self {
        Constraint::Equals(ValueOperand { value: value.into() })
    }

    pub fn does_not_equal(value: impl Into<AttributeValue>) -> Self {
        Constraint::DoesNotEqual(ValueOperand { value: value.into() })
    }

    pub fn contains(value: impl Into<AttributeValue>) -> Self {
        Constraint::Contains(ValueOperand { value: value.into() })
    }

    pub fn does_not_contain(value: impl Into<AttributeValue>) -> Self {
        Constraint::DoesNotContain(ValueOperand { value: value.into() })
    }

    pub fn starts_with(value: &str) -> Self {
        Constraint::StartsWith(ValueOperand { value: value.into() })
    }

    pub fn ends_with(value: &str) -> Self {
        Constraint::EndsWith(ValueOperand { value: value.into() })
    }

    pub fn greater_than_or_equal_to(bound: f64) -> Self {
        Constraint::Numericality(NumericConstraint {
            greater_than_or_equal_to: Some(bound),
            ..Default::default()
        })
    }

    pub fn numeric_equal_to(value: f64) -> Self {
        Constraint::Numericality(NumericConstraint {
            equal_to: Some(value),
            ..Default::default()
        })
    }

    pub fn inclusion(within: Vec<AttributeValue>) -> Self {
        Constraint::Inclusion(SetOperand { within })
    }

    pub fn exclusion(within: Vec<AttributeValue>) -> Self {
        Constraint::Exclusion(SetOperand { within })
    }

    pub fn format(pattern: &str) -> Self {
        Constraint::Format(PatternOperand::new(pattern))
    }

    pub fn presence() -> Self {
        Constraint::Presence(PresenceOptions::default())
    }

    /// 校验器名称
    pub fn validator_name(&self) -> &'static str {
        match self {
            Constraint::Equals(_) => "equals",
            Constraint::DoesNotEqual(_) => "doesNotEqual",
            Constraint::Contains(_) => "contains",
            Constraint::DoesNotContain(_) => "doesNotContain",
            Constraint::StartsWith(_) => "startsWith",
            Constraint::EndsWith(_) => "endsWith",
            Constraint::Numericality(_) => "numericality",
            Constraint::Inclusion(_) => "inclusion",
            Constraint::Exclusion(_) => "exclusion",
            Constraint::Format(_) => "format",
            Constraint::Presence(_) => "presence",
        }
    }

    /// 约束中编码的整数操作数
    ///
    /// 用于 `abstractPriorValue` 这类以约束值表达目标的规则。
    pub fn integer_operand(&self) -> Option<i64> {
        match self {
            Constraint::Equals(op)
            | Constraint::DoesNotEqual(op)
            | Constraint::Contains(op)
            | Constraint::DoesNotContain(op)
            | Constraint::StartsWith(op)
            | Constraint::EndsWith(op) => op.value.as_i64(),
            Constraint::Numericality(n) => [
                n.equal_to,
                n.greater_than_or_equal_to,
                n.greater_than,
                n.less_than_or_equal_to,
                n.less_than,
            ]
            .into_iter()
            .flatten()
            .next()
            .filter(|v| v.fract() == 0.0)
            .map(|v| v as i64),
            Constraint::Inclusion(set) | Constraint::Exclusion(set) => {
                set.within.first().and_then(AttributeValue::as_i64)
            }
            Constraint::Format(_) | Constraint::Presence(_) => None,
        }
    }
}

/// 约束求值器
///
/// 通过返回 `None`，失败时返回非空的诊断信息。
pub trait ConstraintEvaluator: Send + Sync {
    fn evaluate(
        &self,
        attribute: &str,
        value: Option<&AttributeValue>,
        constraint: &Constraint,
    ) -> Option<Vec<String>>;
}

/// 内置约束求值器
#[derive(Debug, Clone, Default)]
pub struct StandardEvaluator;

impl StandardEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn evaluate_present(
        &self,
        label: &str,
        value: &AttributeValue,
        constraint: &Constraint,
    ) -> Vec<String> {
        let mut errors = Vec::new();

        match constraint {
            Constraint::Equals(op) => {
                if !values_equal(value, &op.value) {
                    errors.push(format!("{} must equal {}", label, op.value));
                }
            }
            Constraint::DoesNotEqual(op) => {
                if values_equal(value, &op.value) {
                    errors.push(format!("{} must not equal {}", label, op.value));
                }
            }
            Constraint::Contains(op) => {
                if !value_contains(value, &op.value) {
                    errors.push(format!("{} must contain {}", label, op.value));
                }
            }
            Constraint::DoesNotContain(op) => {
                if value_contains(value, &op.value) {
                    errors.push(format!("{} must not contain {}", label, op.value));
                }
            }
            Constraint::StartsWith(op) => {
                let passed = match (value.as_str(), op.value.as_str()) {
                    (Some(actual), Some(prefix)) => actual.starts_with(prefix),
                    _ => false,
                };
                if !passed {
                    errors.push(format!("{} must start with {}", label, op.value));
                }
            }
            Constraint::EndsWith(op) => {
                let passed = match (value.as_str(), op.value.as_str()) {
                    (Some(actual), Some(suffix)) => actual.ends_with(suffix),
                    _ => false,
                };
                if !passed {
                    errors.push(format!("{} must end with {}", label, op.value));
                }
            }
            Constraint::Numericality(numeric) => {
                check_numericality(label, value, numeric, &mut errors);
            }
            Constraint::Inclusion(set) => {
                if !set.within.iter().any(|candidate| values_equal(value, candidate)) {
                    errors.push(format!("{} {} is not included in the list", label, value));
                }
            }
            Constraint::Exclusion(set) => {
                if set.within.iter().any(|candidate| values_equal(value, candidate)) {
                    errors.push(format!("{} {} is restricted", label, value));
                }
            }
            Constraint::Format(op) => match op.regex() {
                Some(regex) => {
                    let text = value.to_string();
                    let matched = regex
                        .find(&text)
                        .map(|m| m.start() == 0 && m.end() == text.len())
                        .unwrap_or(false);
                    if !matched {
                        errors.push(format!("{} is invalid", label));
                    }
                }
                None => errors.push(format!("{} has an invalid format pattern", label)),
            },
            Constraint::Presence(options) => {
                if !options.allow_empty && value.is_empty() {
                    errors.push(format!("{} can't be blank", label));
                }
            }
        }

        errors
    }
}

impl ConstraintEvaluator for StandardEvaluator {
    fn evaluate(
        &self,
        attribute: &str,
        value: Option<&AttributeValue>,
        constraint: &Constraint,
    ) -> Option<Vec<String>> {
        let label = prettify(attribute);

        let errors = match value.filter(|v| !v.is_null()) {
            Some(value) => self.evaluate_present(&label, value, constraint),
            // 缺失值仅满足否定型约束
            None => match constraint {
                Constraint::DoesNotEqual(_)
                | Constraint::DoesNotContain(_)
                | Constraint::Exclusion(_) => Vec::new(),
                Constraint::Presence(_) => vec![format!("{} can't be blank", label)],
                _ => vec![format!("{} is missing", label)],
            },
        };

        if errors.is_empty() {
            None
        } else {
            Some(errors)
        }
    }
}

/// 比较两个属性值，文本与数值之间按数值比较
fn values_equal(actual: &AttributeValue, expected: &AttributeValue) -> bool {
    if actual.loosely_equals(expected) {
        return true;
    }
    let either_text = matches!(actual, AttributeValue::Text(_)) || matches!(expected, AttributeValue::Text(_));
    let both_text = matches!(actual, AttributeValue::Text(_)) && matches!(expected, AttributeValue::Text(_));
    if either_text && !both_text {
        if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
            return a == b;
        }
    }
    false
}

fn value_contains(actual: &AttributeValue, needle: &AttributeValue) -> bool {
    match actual {
        AttributeValue::Text(text) => match needle {
            AttributeValue::Text(n) => text.contains(n.as_str()),
            other => text.contains(&other.to_string()),
        },
        AttributeValue::List(items) => items.iter().any(|item| values_equal(item, needle)),
        _ => false,
    }
}

fn check_numericality(
    label: &str,
    value: &AttributeValue,
    numeric: &NumericConstraint,
    errors: &mut Vec<String>,
) {
    let number = match value.as_f64() {
        Some(number) => number,
        None => {
            errors.push(format!("{} is not a number", label));
            return;
        }
    };

    if numeric.only_integer && number.fract() != 0.0 {
        errors.push(format!("{} must be an integer", label));
    }

    let checks = [
        (numeric.greater_than, "greater than", number > numeric.greater_than.unwrap_or(f64::NAN)),
        (
            numeric.greater_than_or_equal_to,
            "greater than or equal to",
            number >= numeric.greater_than_or_equal_to.unwrap_or(f64::NAN),
        ),
        (numeric.equal_to, "equal to", number == numeric.equal_to.unwrap_or(f64::NAN)),
        (
            numeric.less_than_or_equal_to,
            "less than or equal to",
            number <= numeric.less_than_or_equal_to.unwrap_or(f64::NAN),
        ),
        (numeric.less_than, "less than", number < numeric.less_than.unwrap_or(f64::NAN)),
    ];

    for (bound, description, passed) in checks {
        if let Some(bound) = bound {
            if !passed {
                errors.push(format!("{} must be {} {}", label, description, bound));
            }
        }
    }
}

/// 将驼峰属性名转换为可读标签: `studyDescription` -> `Study description`
pub fn prettify(attribute: &str) -> String {
    let mut words = String::with_capacity(attribute.len() + 4);
    for (i, c) in attribute.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            words.push(' ');
            words.extend(c.to_lowercase());
        } else if c == '_' {
            words.push(' ');
        } else {
            words.push(c);
        }
    }

    let mut chars = words.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(value: Option<AttributeValue>, constraint: Constraint) -> Option<Vec<String>> {
        StandardEvaluator::new().evaluate("studyDescription", value.as_ref(), &constraint)
    }

    #[test]
    fn test_contains() {
        assert!(eval(Some("CT ABDOMEN".into()), Constraint::contains("CT")).is_none());

        let errors = eval(Some("MR BRAIN".into()), Constraint::contains("CT")).unwrap();
        assert_eq!(errors, vec!["Study description must contain CT".to_string()]);
    }

    #[test]
    fn test_contains_on_list() {
        let modalities = AttributeValue::from(vec!["CT", "PT"]);
        assert!(eval(Some(modalities.clone()), Constraint::contains("PT")).is_none());
        assert!(eval(Some(modalities), Constraint::contains("MR")).is_some());
    }

    #[test]
    fn test_equals_is_case_sensitive_and_numeric_aware() {
        assert!(eval(Some("baseline".into()), Constraint::equals("baseline")).is_none());
        assert!(eval(Some("Baseline".into()), Constraint::equals("baseline")).is_some());
        assert!(eval(Some(AttributeValue::Integer(-1)), Constraint::equals("-1")).is_none());
        assert!(eval(Some(AttributeValue::Number(2.0)), Constraint::equals(2)).is_none());
    }

    #[test]
    fn test_missing_value() {
        let errors = eval(None, Constraint::equals("baseline")).unwrap();
        assert_eq!(errors, vec!["Study description is missing".to_string()]);

        assert!(eval(None, Constraint::does_not_equal("baseline")).is_none());
        assert!(eval(Some(AttributeValue::Null), Constraint::presence()).is_some());
    }

    #[test]
    fn test_numericality() {
        let constraint = Constraint::greater_than_or_equal_to(2.0);
        assert!(eval(Some(AttributeValue::Integer(2)), constraint.clone()).is_none());
        assert!(eval(Some("3".into()), constraint.clone()).is_none());

        let errors = eval(Some(AttributeValue::Integer(1)), constraint.clone()).unwrap();
        assert_eq!(
            errors,
            vec!["Study description must be greater than or equal to 2".to_string()]
        );

        let errors = eval(Some("abc".into()), constraint).unwrap();
        assert_eq!(errors, vec!["Study description is not a number".to_string()]);

        let integer_only = Constraint::Numericality(NumericConstraint {
            only_integer: true,
            ..Default::default()
        });
        assert!(eval(Some(AttributeValue::Number(1.5)), integer_only).is_some());
    }

    #[test]
    fn test_inclusion_format_and_affixes() {
        let within = vec![AttributeValue::from("AP"), AttributeValue::from("PA")];
        assert!(eval(Some("PA".into()), Constraint::inclusion(within.clone())).is_none());
        assert!(eval(Some("LAT".into()), Constraint::inclusion(within.clone())).is_some());
        assert!(eval(Some("LAT".into()), Constraint::exclusion(within)).is_none());

        assert!(eval(Some("20240101".into()), Constraint::format(r"\d{8}")).is_none());
        assert!(eval(Some("2024-01-01".into()), Constraint::format(r"\d{8}")).is_some());
        assert!(eval(Some("x".into()), Constraint::format("(")).is_some());

        assert!(eval(Some("CT CHEST".into()), Constraint::starts_with("CT")).is_none());
        assert!(eval(Some("CT CHEST".into()), Constraint::ends_with("CT")).is_some());
    }

    #[test]
    fn test_format_pattern_compiled_once() {
        let constraint: Constraint = serde_json::from_str(r#"{"format": {"pattern": "\\d{8}"}}"#).unwrap();
        let Constraint::Format(op) = &constraint else {
            panic!("expected format constraint");
        };
        assert_eq!(op.pattern(), r"\d{8}");

        let evaluator = StandardEvaluator::new();
        let value = AttributeValue::from("20240101");
        assert!(evaluator.evaluate("studyDate", Some(&value), &constraint).is_none());
        let first = op.regex().unwrap() as *const Regex;
        assert!(evaluator.evaluate("studyDate", Some(&value), &constraint).is_none());
        assert_eq!(op.regex().unwrap() as *const Regex, first);

        assert_eq!(constraint, Constraint::format(r"\d{8}"));
        assert!(PatternOperand::new("(").regex().is_none());
    }

    #[test]
    fn test_constraint_json_shape() {
        let constraint: Constraint =
            serde_json::from_str(r#"{"contains": {"value": "CT"}}"#).unwrap();
        assert_eq!(constraint, Constraint::contains("CT"));

        let constraint: Constraint =
            serde_json::from_str(r#"{"numericality": {"greaterThanOrEqualTo": 1}}"#).unwrap();
        assert_eq!(constraint, Constraint::greater_than_or_equal_to(1.0));
        assert_eq!(constraint.validator_name(), "numericality");

        let constraint: Constraint = serde_json::from_str(r#"{"presence": {}}"#).unwrap();
        assert_eq!(constraint, Constraint::presence());
    }

    #[test]
    fn test_integer_operand() {
        assert_eq!(Constraint::equals(-1).integer_operand(), Some(-1));
        assert_eq!(Constraint::equals("2").integer_operand(), Some(2));
        assert_eq!(Constraint::numeric_equal_to(3.0).integer_operand(), Some(3));
        assert_eq!(Constraint::contains("CT").integer_operand(), None);
        assert_eq!(Constraint::presence().integer_operand(), None);
    }

    #[test]
    fn test_prettify() {
        assert_eq!(prettify("studyDescription"), "Study description");
        assert_eq!(prettify("numberOfPriorsReferenced"), "Number of priors referenced");
        assert_eq!(prettify("modality"), "Modality");
    }
}
