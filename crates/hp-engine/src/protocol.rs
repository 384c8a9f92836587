//! 挂片协议数据模型
//!
//! 协议由协议匹配规则和有序的显示阶段组成；每个阶段是一个网格布局，
//! 网格中每个视口带有自己的检查/系列/图像匹配规则和显示设置。

use chrono::{DateTime, Utc};
use hp_core::{HpError, Result};
use hp_matching::{ImageMatchingRule, ProtocolMatchingRule, SeriesMatchingRule, StudyMatchingRule};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 视口设置/工具设置 (设置名 -> 值)
pub type SettingsMap = BTreeMap<String, serde_json::Value>;

/// 布局属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutProps {
    pub rows: u32,
    pub columns: u32,
}

/// 视口结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportStructure {
    #[serde(rename = "type")]
    pub layout_type: String,
    pub properties: LayoutProps,
}

impl ViewportStructure {
    /// 网格布局
    pub fn grid(rows: u32, columns: u32) -> Self {
        Self {
            layout_type: "grid".to_string(),
            properties: LayoutProps { rows, columns },
        }
    }

    /// 布局模板名称，未知布局类型返回 `None`
    pub fn layout_template_name(&self) -> Option<&'static str> {
        match self.layout_type.as_str() {
            "grid" => Some("gridLayout"),
            _ => None,
        }
    }

    pub fn cell_count(&self) -> usize {
        (self.properties.rows as usize).saturating_mul(self.properties.columns as usize)
    }
}

/// 视口 (网格中的一个单元)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Viewport {
    pub study_matching_rules: Vec<StudyMatchingRule>,
    pub series_matching_rules: Vec<SeriesMatchingRule>,
    pub image_matching_rules: Vec<ImageMatchingRule>,
    pub viewport_settings: SettingsMap,
    pub tool_settings: SettingsMap,
}

impl Viewport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// 显示阶段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_date: DateTime<Utc>,
    #[serde(default)]
    pub viewport_structure: Option<ViewportStructure>,
    #[serde(default)]
    pub viewports: Vec<Viewport>,
}

impl Stage {
    pub fn new(viewport_structure: ViewportStructure, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: Some(name.to_string()),
            created_date: Utc::now(),
            viewport_structure: Some(viewport_structure),
            viewports: Vec::new(),
        }
    }

    pub fn with_viewport(mut self, viewport: Viewport) -> Self {
        self.viewports.push(viewport);
        self
    }

    /// 复制阶段：新的id和创建时间，不保留名称
    pub fn create_clone(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            created_date: Utc::now(),
            viewport_structure: self.viewport_structure.clone(),
            viewports: self.viewports.clone(),
        }
    }
}

/// 挂片协议
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub protocol_matching_rules: Vec<ProtocolMatchingRule>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// 协议需要引用的既往检查数量
    #[serde(default)]
    pub number_of_priors_referenced: u32,
    #[serde(default = "Utc::now")]
    pub created_date: DateTime<Utc>,
    #[serde(default)]
    pub modified_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locked: bool,
}

impl Protocol {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            protocol_matching_rules: Vec::new(),
            stages: Vec::new(),
            number_of_priors_referenced: 0,
            created_date: Utc::now(),
            modified_date: None,
            locked: false,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn add_protocol_matching_rule(&mut self, rule: ProtocolMatchingRule) {
        self.protocol_matching_rules.push(rule);
        self.touch();
    }

    pub fn add_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
        self.touch();
    }

    /// 删除阶段，返回被删除阶段原来的位置
    pub fn remove_stage(&mut self, stage_id: Uuid) -> Option<(usize, Stage)> {
        let index = self.stage_index(stage_id)?;
        let stage = self.stages.remove(index);
        self.touch();
        Some((index, stage))
    }

    /// 移动阶段，目标位置超出范围时放到末尾
    pub fn move_stage(&mut self, old_index: usize, new_index: usize) -> bool {
        if old_index >= self.stages.len() {
            return false;
        }
        let stage = self.stages.remove(old_index);
        let new_index = new_index.min(self.stages.len());
        self.stages.insert(new_index, stage);
        self.touch();
        true
    }

    pub fn stage_index(&self, stage_id: Uuid) -> Option<usize> {
        self.stages.iter().position(|stage| stage.id == stage_id)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// 从JSON协议文档解析并验证
    pub fn from_json(json: &str) -> Result<Self> {
        let protocol: Protocol = serde_json::from_str(json)?;
        protocol.validate()?;
        Ok(protocol)
    }

    /// 验证协议结构
    ///
    /// 每个阶段都要有非空网格，且视口数不超过网格单元数。
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(HpError::Validation("Protocol id cannot be empty".to_string()));
        }

        for (index, stage) in self.stages.iter().enumerate() {
            let structure = stage.viewport_structure.as_ref().ok_or_else(|| {
                HpError::Validation(format!(
                    "Stage {} of protocol {} has no viewport structure",
                    index, self.id
                ))
            })?;

            if structure.cell_count() == 0 {
                return Err(HpError::Validation(format!(
                    "Stage {} of protocol {} has an empty grid",
                    index, self.id
                )));
            }

            if stage.viewports.len() > structure.cell_count() {
                return Err(HpError::Validation(format!(
                    "Stage {} of protocol {} defines {} viewports for {} cells",
                    index,
                    self.id,
                    stage.viewports.len(),
                    structure.cell_count()
                )));
            }
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.modified_date = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp_matching::{Constraint, Rule};

    fn three_stage_protocol() -> Protocol {
        let mut protocol = Protocol::new("Test");
        for name in ["first", "second", "third"] {
            protocol.add_stage(Stage::new(ViewportStructure::grid(1, 1), name));
        }
        protocol
    }

    #[test]
    fn test_layout_template_name() {
        assert_eq!(ViewportStructure::grid(1, 2).layout_template_name(), Some("gridLayout"));
        assert_eq!(ViewportStructure::grid(2, 2).cell_count(), 4);

        let unknown = ViewportStructure {
            layout_type: "stack".to_string(),
            properties: LayoutProps { rows: 1, columns: 1 },
        };
        assert_eq!(unknown.layout_template_name(), None);
    }

    #[test]
    fn test_stage_clone_drops_name() {
        let stage = Stage::new(ViewportStructure::grid(1, 2), "oneByTwo").with_viewport(Viewport::new());
        let clone = stage.create_clone();

        assert_ne!(clone.id, stage.id);
        assert!(clone.name.is_none());
        assert_eq!(clone.viewports.len(), 1);
        assert_eq!(clone.viewport_structure, stage.viewport_structure);
    }

    #[test]
    fn test_move_and_remove_stages() {
        let mut protocol = three_stage_protocol();
        let first_id = protocol.stages[0].id;

        assert!(protocol.move_stage(0, 10));
        assert_eq!(protocol.stage_index(first_id), Some(2));
        assert!(!protocol.move_stage(5, 0));

        let (index, removed) = protocol.remove_stage(first_id).unwrap();
        assert_eq!(index, 2);
        assert_eq!(removed.name.as_deref(), Some("first"));
        assert_eq!(protocol.stage_count(), 2);
        assert!(protocol.modified_date.is_some());
    }

    #[test]
    fn test_protocol_json_shape() {
        let json = r#"{
            "id": "ctChest",
            "name": "CT Chest",
            "protocolMatchingRules": [
                {"attribute": "studyDescription", "constraint": {"contains": {"value": "CHEST"}}, "required": true}
            ],
            "numberOfPriorsReferenced": 1,
            "stages": [{
                "name": "oneByTwo",
                "viewportStructure": {"type": "grid", "properties": {"rows": 1, "columns": 2}},
                "viewports": [
                    {"seriesMatchingRules": [{"attribute": "seriesDescription", "constraint": {"contains": {"value": "Lung"}}, "weight": 2}]},
                    {"viewportSettings": {"invert": true}}
                ]
            }]
        }"#;

        let protocol: Protocol = serde_json::from_str(json).unwrap();
        assert_eq!(protocol.number_of_priors_referenced, 1);
        assert_eq!(protocol.protocol_matching_rules[0].constraint, Constraint::contains("CHEST"));
        let stage = &protocol.stages[0];
        assert_eq!(stage.viewports[0].series_matching_rules[0].weight, 2.0);
        assert_eq!(
            stage.viewports[1].viewport_settings.get("invert"),
            Some(&serde_json::Value::Bool(true))
        );

        let rule = Rule::new("modality", Constraint::equals("CT"));
        let mut round = protocol.clone();
        round.add_protocol_matching_rule(rule);
        let text = serde_json::to_string(&round).unwrap();
        let back: Protocol = serde_json::from_str(&text).unwrap();
        assert_eq!(back.protocol_matching_rules.len(), 2);
    }

    #[test]
    fn test_validate_rejects_malformed_stages() {
        let mut protocol = Protocol::new("Test").with_id("p");
        protocol.add_stage(
            Stage::new(ViewportStructure::grid(1, 1), "tooMany")
                .with_viewport(Viewport::new())
                .with_viewport(Viewport::new()),
        );
        assert!(matches!(protocol.validate(), Err(HpError::Validation(_))));

        protocol.stages[0].viewports.pop();
        assert!(protocol.validate().is_ok());

        protocol.stages[0].viewport_structure = None;
        assert!(matches!(protocol.validate(), Err(HpError::Validation(_))));

        protocol.stages[0].viewport_structure = Some(ViewportStructure::grid(0, 2));
        assert!(protocol.validate().is_err());
    }

    #[test]
    fn test_large_grid_cell_count() {
        let structure = ViewportStructure::grid(70000, 70000);
        assert_eq!(structure.cell_count(), 70000 * 70000);
        assert_eq!(ViewportStructure::grid(u32::MAX, 0).cell_count(), 0);

        let protocol = Protocol::from_json(
            r#"{"id": "wall", "name": "Wall", "stages": [
                {"viewportStructure": {"type": "grid", "properties": {"rows": 70000, "columns": 70000}},
                 "viewports": [{}, {}]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(protocol.stages[0].viewport_structure.as_ref().unwrap().cell_count(), 4_900_000_000);
    }

    #[test]
    fn test_from_json_errors() {
        assert!(matches!(
            Protocol::from_json("{\"id\": 1"),
            Err(HpError::Serialization(_))
        ));
        assert!(matches!(
            Protocol::from_json(r#"{"id": " ", "name": "Blank"}"#),
            Err(HpError::Validation(_))
        ));

        let protocol = Protocol::from_json(r#"{"id": "empty", "name": "No stages"}"#).unwrap();
        assert_eq!(protocol.stage_count(), 0);
        assert!(!protocol.locked);
    }
}
