use hp_core::{AttributeBag, AttributeValue};
use hp_matching::{Constraint, Rule, RuleMatcher};
use proptest::prelude::*;

// --- 固定属性模式 ---
// studyDescription : 文本
// modality         : 文本
// numImages        : 整数 (0..=500)
// 任意规则也可能引用缺失的属性 laterality

const DESCRIPTIONS: &[&str] = &["CT ABDOMEN", "CT CHEST", "MR BRAIN", "PET CT"];
const MODALITIES: &[&str] = &["CT", "MR", "PT", "SR"];
const ATTRIBUTES: &[&str] = &["studyDescription", "modality", "numImages", "laterality"];

fn arb_bag() -> impl Strategy<Value = AttributeBag> {
    (
        prop::sample::select(DESCRIPTIONS),
        prop::sample::select(MODALITIES),
        0_i64..=500,
    )
        .prop_map(|(description, modality, num_images)| {
            AttributeBag::new()
                .with("studyDescription", description)
                .with("modality", modality)
                .with("numImages", num_images)
        })
}

fn arb_constraint() -> impl Strategy<Value = Constraint> {
    prop_oneof![
        prop::sample::select(&["CT", "MR", "BRAIN", "X"][..]).prop_map(Constraint::contains),
        prop::sample::select(MODALITIES).prop_map(Constraint::equals),
        (0_i64..=500).prop_map(|bound| Constraint::greater_than_or_equal_to(bound as f64)),
        prop::sample::select(MODALITIES).prop_map(Constraint::does_not_equal),
        Just(Constraint::presence()),
    ]
}

fn arb_rule() -> impl Strategy<Value = Rule> {
    (
        prop::sample::select(ATTRIBUTES),
        arb_constraint(),
        any::<bool>(),
        1_u8..=10,
    )
        .prop_map(|(attribute, constraint, required, weight)| {
            let rule = Rule::new(attribute, constraint).with_weight(weight as f64);
            if required {
                rule.required()
            } else {
                rule
            }
        })
}

fn arb_rules() -> impl Strategy<Value = Vec<Rule>> {
    prop::collection::vec(arb_rule(), 0..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn every_rule_evaluated_once(bag in arb_bag(), rules in arb_rules()) {
        let result = RuleMatcher::default().match_attributes(&bag, &rules);
        prop_assert_eq!(
            result.details.passed.len() + result.details.failed.len(),
            rules.len()
        );
    }

    #[test]
    fn required_failure_zeroes_score(bag in arb_bag(), rules in arb_rules()) {
        let result = RuleMatcher::default().match_attributes(&bag, &rules);
        if result.details.failed.iter().any(|failed| failed.rule.required) {
            prop_assert_eq!(result.score, 0.0);
        } else {
            let expected: f64 = result.details.passed.iter().map(|rule| rule.weight).sum();
            prop_assert_eq!(result.score, expected);
        }
    }

    #[test]
    fn matching_is_idempotent(bag in arb_bag(), rules in arb_rules()) {
        let matcher = RuleMatcher::default();
        let first = matcher.match_attributes(&bag, &rules);
        let second = matcher.match_attributes(&bag, &rules);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn rule_order_does_not_change_score(bag in arb_bag(), rules in arb_rules()) {
        let matcher = RuleMatcher::default();
        let forward = matcher.match_attributes(&bag, &rules);

        let mut reversed = rules.clone();
        reversed.reverse();
        let backward = matcher.match_attributes(&bag, &reversed);

        prop_assert_eq!(forward.score, backward.score);
    }
}

#[test]
fn missing_attribute_fails_positive_constraints() {
    let bag = AttributeBag::new().with("modality", AttributeValue::from("CT"));
    let rule = Rule::new("laterality", Constraint::equals("L"));
    let result = RuleMatcher::default().match_attributes(&bag, &[rule]);

    assert_eq!(result.score, 0.0);
    assert_eq!(result.details.failed.len(), 1);
}
