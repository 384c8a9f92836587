//! 随访时间点
//!
//! 时间点把同一患者的一组检查标记为基线或随访，
//! 病灶追踪协议通过 `timepointType` 自定义属性区分两者。

use chrono::NaiveDate;
use hp_core::{AttributeBag, AttributeValue, HpError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// 时间点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimepointType {
    Baseline,
    Followup,
}

impl TimepointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimepointType::Baseline => "baseline",
            TimepointType::Followup => "followup",
        }
    }
}

impl fmt::Display for TimepointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 时间点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timepoint {
    pub timepoint_id: String,
    pub patient_id: String,
    pub timepoint_type: TimepointType,
    pub study_instance_uids: Vec<String>,
    /// 时间点内最晚的检查日期
    pub latest_date: NaiveDate,
}

impl Timepoint {
    pub fn new(
        timepoint_id: &str,
        patient_id: &str,
        timepoint_type: TimepointType,
        latest_date: NaiveDate,
    ) -> Self {
        Self {
            timepoint_id: timepoint_id.to_string(),
            patient_id: patient_id.to_string(),
            timepoint_type,
            study_instance_uids: Vec::new(),
            latest_date,
        }
    }

    pub fn with_study(mut self, study_instance_uid: &str) -> Self {
        self.study_instance_uids.push(study_instance_uid.to_string());
        self
    }

    pub fn is_baseline(&self) -> bool {
        self.timepoint_type == TimepointType::Baseline
    }
}

/// 打开时间点时需要加载的检查
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimepointStudies {
    pub study_instance_uids: Vec<String>,
    pub timepoint_ids: Vec<String>,
}

/// 时间点登记表
#[derive(Debug, Clone, Default)]
pub struct TimepointRegistry {
    timepoints: Vec<Timepoint>,
}

impl TimepointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入时间点，同id时替换
    pub fn insert(&mut self, timepoint: Timepoint) {
        match self
            .timepoints
            .iter_mut()
            .find(|t| t.timepoint_id == timepoint.timepoint_id)
        {
            Some(existing) => *existing = timepoint,
            None => self.timepoints.push(timepoint),
        }
    }

    pub fn find(&self, timepoint_id: &str) -> Option<&Timepoint> {
        self.timepoints.iter().find(|t| t.timepoint_id == timepoint_id)
    }

    /// 包含该检查的时间点
    pub fn find_for_study(&self, study_instance_uid: &str) -> Option<&Timepoint> {
        self.timepoints
            .iter()
            .find(|t| t.study_instance_uids.iter().any(|uid| uid == study_instance_uid))
    }

    /// 时间点相关的检查
    ///
    /// 随访时间点还包括不晚于它的最近一个基线时间点。
    pub fn related_studies(&self, timepoint_id: &str) -> Result<TimepointStudies> {
        let timepoint = self
            .find(timepoint_id)
            .ok_or_else(|| HpError::NotFound(format!("No such timepoint exists: {}", timepoint_id)))?;

        if timepoint.study_instance_uids.is_empty() {
            return Err(HpError::NotFound(format!(
                "No studies found that are related to timepoint {}",
                timepoint_id
            )));
        }

        let mut studies = TimepointStudies {
            study_instance_uids: timepoint.study_instance_uids.clone(),
            timepoint_ids: Vec::new(),
        };

        if !timepoint.is_baseline() {
            let baseline = self
                .timepoints
                .iter()
                .filter(|t| {
                    t.is_baseline()
                        && t.patient_id == timepoint.patient_id
                        && t.latest_date <= timepoint.latest_date
                })
                .max_by_key(|t| t.latest_date);

            match baseline {
                Some(baseline) => {
                    studies
                        .study_instance_uids
                        .extend(baseline.study_instance_uids.iter().cloned());
                    studies.timepoint_ids.push(baseline.timepoint_id.clone());
                }
                None => warn!("No baseline found for follow-up timepoint {}", timepoint_id),
            }
        }

        studies.timepoint_ids.push(timepoint.timepoint_id.clone());
        debug!(
            "Timepoint {} relates {} study(ies)",
            timepoint_id,
            studies.study_instance_uids.len()
        );
        Ok(studies)
    }

    pub fn len(&self) -> usize {
        self.timepoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timepoints.is_empty()
    }
}

/// `timepointType` 自定义属性：按 `studyInstanceUid` 查找所属时间点的类型
pub fn timepoint_type_resolver(
    timepoints: Arc<TimepointRegistry>,
) -> impl Fn(&AttributeBag) -> Option<AttributeValue> + Send + Sync + 'static {
    move |attributes: &AttributeBag| {
        let uid = attributes.get("studyInstanceUid")?.as_str()?;
        let timepoint = timepoints.find_for_study(uid)?;
        Some(AttributeValue::from(timepoint.timepoint_type.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn registry() -> TimepointRegistry {
        let mut registry = TimepointRegistry::new();
        registry.insert(
            Timepoint::new("tp-base-old", "PAT", TimepointType::Baseline, date(2020, 1, 1))
                .with_study("s-2020"),
        );
        registry.insert(
            Timepoint::new("tp-base", "PAT", TimepointType::Baseline, date(2022, 1, 1))
                .with_study("s-2022"),
        );
        registry.insert(
            Timepoint::new("tp-follow", "PAT", TimepointType::Followup, date(2023, 1, 1))
                .with_study("s-2023"),
        );
        registry.insert(Timepoint::new("tp-empty", "PAT", TimepointType::Baseline, date(2024, 1, 1)));
        registry
    }

    #[test]
    fn test_followup_includes_latest_baseline() {
        let studies = registry().related_studies("tp-follow").unwrap();
        assert_eq!(studies.study_instance_uids, vec!["s-2023", "s-2022"]);
        assert_eq!(studies.timepoint_ids, vec!["tp-base", "tp-follow"]);
    }

    #[test]
    fn test_baseline_only_includes_itself() {
        let studies = registry().related_studies("tp-base").unwrap();
        assert_eq!(studies.study_instance_uids, vec!["s-2022"]);
        assert_eq!(studies.timepoint_ids, vec!["tp-base"]);
    }

    #[test]
    fn test_missing_timepoint_or_studies_is_not_found() {
        let registry = registry();
        assert!(registry.related_studies("nope").unwrap_err().is_not_found());
        assert!(registry.related_studies("tp-empty").unwrap_err().is_not_found());
    }

    #[test]
    fn test_timepoint_type_resolver() {
        let resolver = timepoint_type_resolver(Arc::new(registry()));

        let bag = AttributeBag::new().with("studyInstanceUid", "s-2023");
        assert_eq!(resolver(&bag), Some(AttributeValue::from("followup")));

        let unknown = AttributeBag::new().with("studyInstanceUid", "other");
        assert_eq!(resolver(&unknown), None);
        assert_eq!(resolver(&AttributeBag::new()), None);
    }
}
