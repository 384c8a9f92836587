//! 规则匹配器
//!
//! 对属性集合逐条评估加权规则，累计得分并记录通过/失败明细。
//! 任一必需规则失败时得分强制为0，但其余规则仍会被评估以保留完整诊断信息。

use crate::constraint::{ConstraintEvaluator, StandardEvaluator};
use crate::custom_attributes::CustomAttributeRegistry;
use crate::rule::{FailedRule, MatchDetails, MatchResult, Rule};
use hp_core::AttributeBag;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// 规则匹配器
#[derive(Clone)]
pub struct RuleMatcher {
    custom_attributes: Arc<CustomAttributeRegistry>,
    evaluator: Arc<dyn ConstraintEvaluator>,
}

impl RuleMatcher {
    pub fn new(
        custom_attributes: Arc<CustomAttributeRegistry>,
        evaluator: Arc<dyn ConstraintEvaluator>,
    ) -> Self {
        Self {
            custom_attributes,
            evaluator,
        }
    }

    /// 使用内置求值器创建匹配器
    pub fn with_registry(custom_attributes: Arc<CustomAttributeRegistry>) -> Self {
        Self::new(custom_attributes, Arc::new(StandardEvaluator::new()))
    }

    pub fn custom_attributes(&self) -> &CustomAttributeRegistry {
        &self.custom_attributes
    }

    /// 对属性集合评估规则
    ///
    /// 自定义属性在每次调用中最多计算一次，结果只写入本次调用的工作副本。
    pub fn match_attributes(&self, attributes: &AttributeBag, rules: &[Rule]) -> MatchResult {
        let mut working: Cow<'_, AttributeBag> = Cow::Borrowed(attributes);
        let mut attempted: HashSet<&str> = HashSet::new();

        let mut score = 0.0;
        let mut details = MatchDetails::new();
        let mut required_failed = false;

        for rule in rules {
            let attribute = rule.attribute.as_str();

            if !working.contains(attribute) && attempted.insert(attribute) {
                if let Some(custom) = self.custom_attributes.get(attribute) {
                    if let Some(value) = custom.resolve(&working) {
                        debug!("Resolved custom attribute {} = {}", attribute, value);
                        working.to_mut().insert(attribute, value);
                    }
                }
            }

            match self
                .evaluator
                .evaluate(attribute, working.get(attribute), &rule.constraint)
            {
                None => {
                    score += rule.weight;
                    details.passed.push(rule.clone());
                }
                Some(error_messages) => {
                    if rule.required {
                        required_failed = true;
                    }
                    debug!(
                        "Rule on {} failed{}: {:?}",
                        attribute,
                        if rule.required { " (required)" } else { "" },
                        error_messages
                    );
                    details.failed.push(FailedRule {
                        rule: rule.clone(),
                        error_messages,
                    });
                }
            }
        }

        if required_failed {
            score = 0.0;
        }

        MatchResult { score, details }
    }
}

impl std::fmt::Debug for RuleMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleMatcher")
            .field("custom_attributes", &self.custom_attributes)
            .finish_non_exhaustive()
    }
}

impl Default for RuleMatcher {
    fn default() -> Self {
        Self::with_registry(Arc::new(CustomAttributeRegistry::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::Constraint;
    use hp_core::AttributeValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ct_rule() -> Rule {
        Rule::new("studyDescription", Constraint::contains("CT")).required()
    }

    #[test]
    fn test_required_rule_passes() {
        let matcher = RuleMatcher::default();
        let bag = AttributeBag::new().with("studyDescription", "CT ABDOMEN");
        let rule = ct_rule();

        let result = matcher.match_attributes(&bag, std::slice::from_ref(&rule));
        assert_eq!(result.score, 1.0);
        assert_eq!(result.details.passed, vec![rule]);
        assert!(result.details.failed.is_empty());
    }

    #[test]
    fn test_required_rule_fails() {
        let matcher = RuleMatcher::default();
        let bag = AttributeBag::new().with("studyDescription", "MR BRAIN");

        let result = matcher.match_attributes(&bag, &[ct_rule()]);
        assert_eq!(result.score, 0.0);
        assert!(result.details.passed.is_empty());
        assert_eq!(result.details.failed.len(), 1);
        assert!(!result.details.failed[0].error_messages.is_empty());
    }

    #[test]
    fn test_required_failure_vetoes_other_weights() {
        let matcher = RuleMatcher::default();
        let bag = AttributeBag::new()
            .with("studyDescription", "MR BRAIN")
            .with("modality", "MR");
        let rules = vec![
            Rule::new("modality", Constraint::equals("MR")).with_weight(10.0),
            ct_rule(),
            Rule::new("studyDescription", Constraint::contains("BRAIN")).with_weight(3.0),
        ];

        let result = matcher.match_attributes(&bag, &rules);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.details.passed.len(), 2);
        assert_eq!(result.details.failed.len(), 1);
    }

    #[test]
    fn test_weights_accumulate_and_order_is_preserved() {
        let matcher = RuleMatcher::default();
        let bag = AttributeBag::new().with("seriesDescription", "Body Abdomen 5mm");
        let body = Rule::new("seriesDescription", Constraint::contains("Body")).with_weight(5.0);
        let abdomen = Rule::new("seriesDescription", Constraint::contains("Abdomen"));
        let chest = Rule::new("seriesDescription", Constraint::contains("Chest"));

        let result = matcher.match_attributes(&bag, &[body.clone(), chest.clone(), abdomen.clone()]);
        assert_eq!(result.score, 6.0);
        assert_eq!(result.details.passed, vec![body, abdomen]);
        assert_eq!(result.details.failed[0].rule, chest);
    }

    #[test]
    fn test_empty_rule_set_scores_zero() {
        let matcher = RuleMatcher::default();
        let result = matcher.match_attributes(&AttributeBag::new(), &[]);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.details.evaluated_count(), 0);
    }

    #[test]
    fn test_custom_attribute_resolved_once_per_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut registry = CustomAttributeRegistry::new();
        registry.register("timepointType", "Timepoint Type", move |bag| {
            counter.fetch_add(1, Ordering::SeqCst);
            bag.get("studyInstanceUid")
                .filter(|uid| **uid == AttributeValue::from("1.2.3"))
                .map(|_| AttributeValue::from("baseline"))
        });
        let matcher = RuleMatcher::with_registry(Arc::new(registry));

        let bag = AttributeBag::new().with("studyInstanceUid", "1.2.3");
        let rules = vec![
            Rule::new("timepointType", Constraint::equals("baseline")).required(),
            Rule::new("timepointType", Constraint::does_not_equal("followup")),
        ];

        let result = matcher.match_attributes(&bag, &rules);
        assert_eq!(result.score, 2.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // 不跨调用缓存，也不修改调用方的集合
        matcher.match_attributes(&bag, &rules);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!bag.contains("timepointType"));
    }

    #[test]
    fn test_present_attribute_skips_custom_resolver() {
        let mut registry = CustomAttributeRegistry::new();
        registry.register("timepointType", "Timepoint Type", |_| Some("followup".into()));
        let matcher = RuleMatcher::with_registry(Arc::new(registry));

        let bag = AttributeBag::new().with("timepointType", "baseline");
        let rule = Rule::new("timepointType", Constraint::equals("baseline"));
        assert_eq!(matcher.match_attributes(&bag, &[rule]).score, 1.0);
    }
}
