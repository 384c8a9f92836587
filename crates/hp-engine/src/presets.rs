//! 内置协议与视口设置
//!
//! 包括没有协议匹配时使用的默认协议，以及病灶追踪的基线/随访协议。

use crate::protocol::{Protocol, SettingsMap, Stage, Viewport, ViewportStructure};
use crate::settings::DEFAULT_PROTOCOL_ID;
use crate::timepoint::{timepoint_type_resolver, TimepointRegistry};
use hp_matching::{Constraint, CustomAttributeRegistry, Rule};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const LESION_TRACKER_BASELINE_PROTOCOL_ID: &str = "lesionTrackerBaselineProtocol";
pub const LESION_TRACKER_FOLLOWUP_PROTOCOL_ID: &str = "lesionTrackerFollowupProtocol";
pub const TIMEPOINT_TYPE: &str = "timepointType";

/// 默认协议：1x1网格，视口不带任何规则
pub fn default_protocol() -> Protocol {
    let mut protocol = Protocol::new("Default").with_id(DEFAULT_PROTOCOL_ID);
    protocol.add_stage(
        Stage::new(ViewportStructure::grid(1, 1), "oneByOne").with_viewport(Viewport::new()),
    );
    protocol
}

fn timepoint_rule(timepoint_type: &str) -> Rule {
    Rule::new(TIMEPOINT_TYPE, Constraint::equals(timepoint_type)).required()
}

fn body_series_viewport(timepoint_type: &str) -> Viewport {
    Viewport {
        study_matching_rules: vec![timepoint_rule(timepoint_type).for_prior()],
        series_matching_rules: vec![
            Rule::new("seriesDescription", Constraint::contains("Body")).with_weight(5.0),
            Rule::new("seriesDescription", Constraint::contains("Abdomen")),
        ],
        ..Viewport::default()
    }
}

fn lesion_tracker_protocol(id: &str, name: &str, timepoint_type: &str) -> Protocol {
    let mut protocol = Protocol::new(name).with_id(id);
    protocol.add_protocol_matching_rule(
        Rule::new("studyDescription", Constraint::contains("CT")).required(),
    );
    protocol.add_protocol_matching_rule(timepoint_rule(timepoint_type));
    protocol
}

/// 病灶追踪基线协议：单个视口显示基线检查的体部系列
pub fn lesion_tracker_baseline_protocol() -> Protocol {
    let mut protocol = lesion_tracker_protocol(
        LESION_TRACKER_BASELINE_PROTOCOL_ID,
        "LT_Baseline",
        "baseline",
    );
    protocol.add_stage(
        Stage::new(ViewportStructure::grid(1, 1), "oneByOne")
            .with_viewport(body_series_viewport("baseline")),
    );
    protocol
}

/// 病灶追踪随访协议：左侧基线，右侧随访
pub fn lesion_tracker_followup_protocol() -> Protocol {
    let mut protocol = lesion_tracker_protocol(
        LESION_TRACKER_FOLLOWUP_PROTOCOL_ID,
        "LT_BaselineFollowup",
        "followup",
    );

    let mut right = body_series_viewport("followup");
    right.study_matching_rules = vec![timepoint_rule("followup")];

    protocol.add_stage(
        Stage::new(ViewportStructure::grid(1, 2), "oneByTwo")
            .with_viewport(body_series_viewport("baseline"))
            .with_viewport(right),
    );
    protocol
}

/// 注册病灶追踪使用的自定义属性
pub fn register_lesion_tracker_attributes(
    registry: &mut CustomAttributeRegistry,
    timepoints: Arc<TimepointRegistry>,
) {
    registry.register(TIMEPOINT_TYPE, "Timepoint Type", timepoint_type_resolver(timepoints));
}

/// 视口设置项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportSettingValue {
    pub id: String,
    pub name: Option<String>,
    pub default: Value,
}

/// 视口设置类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportSettingType {
    pub id: String,
    pub name: String,
    pub values: Vec<ViewportSettingValue>,
}

impl ViewportSettingType {
    fn new(id: &str, name: &str, values: Vec<(&str, Option<&str>, Value)>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            values: values
                .into_iter()
                .map(|(id, name, default)| ViewportSettingValue {
                    id: id.to_string(),
                    name: name.map(str::to_string),
                    default,
                })
                .collect(),
        }
    }
}

/// 可编辑的视口设置类型
pub fn viewport_setting_types() -> Vec<ViewportSettingType> {
    vec![
        ViewportSettingType::new(
            "voi",
            "Windowing",
            vec![
                ("windowWidth", Some("Window Width"), Value::from(256)),
                ("windowCenter", Some("Window Center"), Value::from(128)),
            ],
        ),
        ViewportSettingType::new("invert", "Invert", vec![("invert", None, Value::Bool(false))]),
        ViewportSettingType::new("hflip", "Horizontal flip", vec![("hflip", None, Value::Bool(false))]),
        ViewportSettingType::new("vflip", "Vertical flip", vec![("vflip", None, Value::Bool(false))]),
    ]
}

/// 所有视口设置的默认值
pub fn default_viewport_settings() -> SettingsMap {
    viewport_setting_types()
        .into_iter()
        .flat_map(|setting| setting.values)
        .map(|value| (value.id, value.default))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_matcher::ImageMatcher;
    use crate::timepoint::{Timepoint, TimepointType};
    use chrono::NaiveDate;
    use hp_core::{Instance, Series, Study};
    use hp_matching::RuleMatcher;

    fn date(y: i32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, 1, 1).unwrap()
    }

    fn ct_study(uid: &str, y: i32) -> Study {
        Study::new(uid, "PAT", date(y))
            .with_description("CT CHEST ABDOMEN")
            .with_series(
                Series::new(&format!("{}.1", uid), "CT")
                    .with_description("Lung 1mm")
                    .with_instance(Instance::image(&format!("{}.1.1", uid), 512, 512)),
            )
            .with_series(
                Series::new(&format!("{}.2", uid), "CT")
                    .with_description("Body Abdomen 5mm")
                    .with_instance(Instance::image(&format!("{}.2.1", uid), 512, 512)),
            )
    }

    fn lesion_matcher() -> RuleMatcher {
        let mut timepoints = TimepointRegistry::new();
        timepoints.insert(Timepoint::new("base", "PAT", TimepointType::Baseline, date(2022)).with_study("b"));
        timepoints.insert(Timepoint::new("follow", "PAT", TimepointType::Followup, date(2024)).with_study("f"));

        let mut registry = CustomAttributeRegistry::new();
        register_lesion_tracker_attributes(&mut registry, Arc::new(timepoints));
        RuleMatcher::with_registry(Arc::new(registry))
    }

    #[test]
    fn test_default_protocol_shape() {
        let protocol = default_protocol();
        assert_eq!(protocol.id, DEFAULT_PROTOCOL_ID);
        assert!(protocol.protocol_matching_rules.is_empty());
        assert_eq!(protocol.stages.len(), 1);
        assert_eq!(protocol.stages[0].viewports, vec![Viewport::new()]);
    }

    #[test]
    fn test_lesion_tracker_protocols_match_by_timepoint() {
        let matcher = lesion_matcher();
        let baseline = lesion_tracker_baseline_protocol();
        let followup = lesion_tracker_followup_protocol();

        let baseline_study = ct_study("b", 2022).attributes();
        let followup_study = ct_study("f", 2024).attributes();

        assert_eq!(matcher.match_attributes(&baseline_study, &baseline.protocol_matching_rules).score, 2.0);
        assert_eq!(matcher.match_attributes(&baseline_study, &followup.protocol_matching_rules).score, 0.0);
        assert_eq!(matcher.match_attributes(&followup_study, &followup.protocol_matching_rules).score, 2.0);
    }

    #[test]
    fn test_followup_layout_places_each_timepoint() {
        let images = ImageMatcher::new(lesion_matcher());
        let stage = &lesion_tracker_followup_protocol().stages[0];
        let studies = vec![ct_study("f", 2024), ct_study("b", 2022)];

        let left = images.match_images(&stage.viewports[0], &studies).best_match.unwrap();
        assert_eq!(left.study_instance_uid, "b");
        assert_eq!(left.series_instance_uid, "b.2");
        assert_eq!(left.matching_score, 7.0);

        let right = images.match_images(&stage.viewports[1], &studies).best_match.unwrap();
        assert_eq!(right.study_instance_uid, "f");
        assert_eq!(right.series_instance_uid, "f.2");
    }

    #[test]
    fn test_default_viewport_settings() {
        let settings = default_viewport_settings();
        assert_eq!(settings.len(), 5);
        assert_eq!(settings.get("windowWidth"), Some(&Value::from(256)));
        assert_eq!(settings.get("windowCenter"), Some(&Value::from(128)));
        assert_eq!(settings.get("vflip"), Some(&Value::Bool(false)));
    }
}
