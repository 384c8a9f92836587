//! 核心数据模型定义
//!
//! 检查/系列/实例记录以及规则匹配时使用的属性集合。

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::utils::format_dicom_date;

/// 属性值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    List(Vec<AttributeValue>),
}

impl AttributeValue {
    /// 数值视图，文本会尝试按数字解析
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(v) => Some(*v as f64),
            AttributeValue::Number(v) => Some(*v),
            AttributeValue::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(v) => Some(*v),
            AttributeValue::Number(v) if v.fract() == 0.0 => Some(*v as i64),
            AttributeValue::Text(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// 值是否为空 (null、空字符串、空列表)
    pub fn is_empty(&self) -> bool {
        match self {
            AttributeValue::Null => true,
            AttributeValue::Text(s) => s.trim().is_empty(),
            AttributeValue::List(items) => items.is_empty(),
            _ => false,
        }
    }

    /// 宽松相等：数值按数值比较，其余按结构比较
    pub fn loosely_equals(&self, other: &AttributeValue) -> bool {
        match (self.numeric_scalar(), other.numeric_scalar()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    fn numeric_scalar(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(v) => Some(*v as f64),
            AttributeValue::Number(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => write!(f, "null"),
            AttributeValue::Bool(v) => write!(f, "{}", v),
            AttributeValue::Integer(v) => write!(f, "{}", v),
            AttributeValue::Number(v) => write!(f, "{}", v),
            AttributeValue::Text(v) => write!(f, "{}", v),
            AttributeValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|item| item.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Integer(value as i64)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::Integer(value as i64)
    }
}

impl From<usize> for AttributeValue {
    fn from(value: usize) -> Self {
        AttributeValue::Integer(value as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Number(value)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(values: Vec<T>) -> Self {
        AttributeValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// 属性集合 (属性名 -> 属性值)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeBag {
    values: BTreeMap<String, AttributeValue>,
}

impl AttributeBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// 仅在值存在时插入
    pub fn insert_opt<V: Into<AttributeValue>>(&mut self, name: &str, value: Option<V>) {
        if let Some(value) = value {
            self.insert(name, value);
        }
    }

    /// 链式构造
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// 合并另一个集合，同名属性以 `other` 为准
    pub fn extend(&mut self, other: &AttributeBag) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.values.iter()
    }
}

/// 工作列表中的检查摘要
///
/// 用于统计和定位既往检查，不包含系列与实例。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySummary {
    pub study_instance_uid: String,
    pub patient_id: String,
    #[serde(with = "crate::utils::dicom_date_serde")]
    pub study_date: NaiveDate,
    pub study_description: Option<String>,
    #[serde(default)]
    pub extra: AttributeBag,
}

impl StudySummary {
    pub fn attributes(&self) -> AttributeBag {
        let mut bag = AttributeBag::new()
            .with("studyInstanceUid", self.study_instance_uid.as_str())
            .with("patientId", self.patient_id.as_str())
            .with("studyDate", format_dicom_date(self.study_date));
        bag.insert_opt("studyDescription", self.study_description.clone());
        bag.extend(&self.extra);
        bag
    }
}

/// 检查信息 (含完整元数据)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Study {
    pub study_instance_uid: String, // DICOM Study Instance UID
    pub patient_id: String,
    pub patient_name: Option<String>,
    #[serde(with = "crate::utils::dicom_date_serde")]
    pub study_date: NaiveDate,
    pub study_time: Option<String>,
    pub study_description: Option<String>,
    pub accession_number: Option<String>,
    #[serde(default)]
    pub series_list: Vec<Series>,
    /// 附加属性，例如 abstractPriorValue
    #[serde(default)]
    pub extra: AttributeBag,
}

impl Study {
    pub fn new(study_instance_uid: &str, patient_id: &str, study_date: NaiveDate) -> Self {
        Self {
            study_instance_uid: study_instance_uid.to_string(),
            patient_id: patient_id.to_string(),
            patient_name: None,
            study_date,
            study_time: None,
            study_description: None,
            accession_number: None,
            series_list: Vec::new(),
            extra: AttributeBag::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.study_description = Some(description.to_string());
        self
    }

    pub fn with_series(mut self, series: Series) -> Self {
        self.series_list.push(series);
        self
    }

    /// 设置附加属性
    pub fn set_attribute(&mut self, name: &str, value: impl Into<AttributeValue>) {
        self.extra.insert(name, value);
    }

    /// 所有系列的检查设备类型 (去重，保持顺序)
    pub fn modalities(&self) -> Vec<String> {
        let mut modalities: Vec<String> = Vec::new();
        for series in &self.series_list {
            if !modalities.contains(&series.modality) {
                modalities.push(series.modality.clone());
            }
        }
        modalities
    }

    /// 检查级匹配属性
    pub fn attributes(&self) -> AttributeBag {
        let mut bag = AttributeBag::new()
            .with("studyInstanceUid", self.study_instance_uid.as_str())
            .with("patientId", self.patient_id.as_str())
            .with("studyDate", format_dicom_date(self.study_date))
            .with("modalitiesInStudy", self.modalities())
            .with("numberOfSeries", self.series_list.len());
        bag.insert_opt("patientName", self.patient_name.clone());
        bag.insert_opt("studyTime", self.study_time.clone());
        bag.insert_opt("studyDescription", self.study_description.clone());
        bag.insert_opt("accessionNumber", self.accession_number.clone());
        bag.extend(&self.extra);
        bag
    }

    pub fn summary(&self) -> StudySummary {
        StudySummary {
            study_instance_uid: self.study_instance_uid.clone(),
            patient_id: self.patient_id.clone(),
            study_date: self.study_date,
            study_description: self.study_description.clone(),
            extra: self.extra.clone(),
        }
    }
}

/// 系列信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Series {
    pub series_instance_uid: String, // DICOM Series Instance UID
    pub modality: String,
    pub series_number: Option<i32>,
    pub series_description: Option<String>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub extra: AttributeBag,
}

impl Series {
    pub fn new(series_instance_uid: &str, modality: &str) -> Self {
        Self {
            series_instance_uid: series_instance_uid.to_string(),
            modality: modality.to_string(),
            series_number: None,
            series_description: None,
            instances: Vec::new(),
            extra: AttributeBag::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.series_description = Some(description.to_string());
        self
    }

    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.instances.push(instance);
        self
    }

    /// 是否含有可显示的图像实例
    pub fn has_images(&self) -> bool {
        self.instances.iter().any(Instance::is_image)
    }

    /// 系列级匹配属性
    pub fn attributes(&self) -> AttributeBag {
        let mut bag = AttributeBag::new()
            .with("seriesInstanceUid", self.series_instance_uid.as_str())
            .with("modality", self.modality.as_str())
            .with("numImages", self.instances.len());
        bag.insert_opt("seriesNumber", self.series_number);
        bag.insert_opt("seriesDescription", self.series_description.clone());
        bag.extend(&self.extra);
        bag
    }
}

/// 影像实例信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub sop_instance_uid: String, // DICOM SOP Instance UID
    pub sop_class_uid: Option<String>,
    pub instance_number: Option<i32>,
    pub rows: Option<u32>,
    pub columns: Option<u32>,
    pub view_position: Option<String>,
    pub laterality: Option<String>,
    pub image_type: Option<String>,
    pub photometric_interpretation: Option<String>,
    pub slice_thickness: Option<f64>,
    pub frame_time: Option<f64>,
    pub extra: AttributeBag,
}

impl Instance {
    pub fn new(sop_instance_uid: &str) -> Self {
        Self {
            sop_instance_uid: sop_instance_uid.to_string(),
            ..Default::default()
        }
    }

    /// 带像素尺寸的图像实例
    pub fn image(sop_instance_uid: &str, rows: u32, columns: u32) -> Self {
        Self {
            sop_instance_uid: sop_instance_uid.to_string(),
            rows: Some(rows),
            columns: Some(columns),
            ..Default::default()
        }
    }

    /// 是否为图像 (非结构化报告、PDF等)
    pub fn is_image(&self) -> bool {
        matches!((self.rows, self.columns), (Some(r), Some(c)) if r > 0 && c > 0)
    }

    /// 实例级匹配属性，`index` 为实例在系列中的位置
    pub fn attributes(&self, index: usize) -> AttributeBag {
        let mut bag = AttributeBag::new()
            .with("sopInstanceUid", self.sop_instance_uid.as_str())
            .with("index", index);
        bag.insert_opt("sopClassUid", self.sop_class_uid.clone());
        bag.insert_opt("instanceNumber", self.instance_number);
        bag.insert_opt("rows", self.rows);
        bag.insert_opt("columns", self.columns);
        bag.insert_opt("viewPosition", self.view_position.clone());
        bag.insert_opt("laterality", self.laterality.clone());
        bag.insert_opt("imageType", self.image_type.clone());
        bag.insert_opt("photometricInterpretation", self.photometric_interpretation.clone());
        bag.insert_opt("sliceThickness", self.slice_thickness);
        bag.insert_opt("frameTime", self.frame_time);
        bag.extend(&self.extra);
        bag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_study() -> Study {
        Study::new("1.2.3", "PAT-1", NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
            .with_description("CT ABDOMEN")
            .with_series(
                Series::new("1.2.3.1", "CT")
                    .with_description("Body 5mm")
                    .with_instance(Instance::image("1.2.3.1.1", 512, 512))
                    .with_instance(Instance::new("1.2.3.1.2")),
            )
    }

    #[test]
    fn test_study_attributes() {
        let mut study = sample_study();
        study.set_attribute("abstractPriorValue", 0);

        let bag = study.attributes();
        assert_eq!(bag.get("studyDescription"), Some(&AttributeValue::from("CT ABDOMEN")));
        assert_eq!(bag.get("studyDate"), Some(&AttributeValue::from("20240301")));
        assert_eq!(bag.get("abstractPriorValue"), Some(&AttributeValue::Integer(0)));
        assert_eq!(bag.get("modalitiesInStudy"), Some(&AttributeValue::from(vec!["CT"])));
    }

    #[test]
    fn test_series_and_instance_attributes() {
        let study = sample_study();
        let series = &study.series_list[0];
        assert_eq!(series.attributes().get("numImages"), Some(&AttributeValue::Integer(2)));
        assert!(series.has_images());

        assert!(series.instances[0].is_image());
        assert!(!series.instances[1].is_image());
        let bag = series.instances[1].attributes(1);
        assert_eq!(bag.get("index"), Some(&AttributeValue::Integer(1)));
        assert!(bag.get("rows").is_none());
    }

    #[test]
    fn test_attribute_value_conversions() {
        assert_eq!(AttributeValue::from("42").as_f64(), Some(42.0));
        assert_eq!(AttributeValue::Number(3.0).as_i64(), Some(3));
        assert!(AttributeValue::Integer(2).loosely_equals(&AttributeValue::Number(2.0)));
        assert!(!AttributeValue::from("2").loosely_equals(&AttributeValue::Integer(2)));
        assert!(AttributeValue::from("  ").is_empty());
    }

    #[test]
    fn test_study_json_shape() {
        let json = r#"{
            "studyInstanceUid": "1.2.3",
            "patientId": "PAT-1",
            "studyDate": "20240301",
            "studyDescription": "CT CHEST",
            "seriesList": [{
                "seriesInstanceUid": "1.2.3.1",
                "modality": "CT",
                "instances": [{"sopInstanceUid": "1.2.3.1.1", "rows": 512, "columns": 512}]
            }],
            "extra": {"timepointType": "baseline"}
        }"#;

        let study: Study = serde_json::from_str(json).unwrap();
        assert_eq!(study.study_date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert!(study.series_list[0].instances[0].is_image());
        assert_eq!(
            study.attributes().get("timepointType"),
            Some(&AttributeValue::from("baseline"))
        );
    }
}
