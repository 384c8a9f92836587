//! 可匹配属性目录
//!
//! 编辑规则时可供选择的属性列表，按匹配级别划分。

use crate::custom_attributes::CustomAttributeRegistry;
use serde::{Deserialize, Serialize};

/// 匹配级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchLevel {
    Protocol,
    Study,
    Series,
    Instance,
}

/// 属性目录条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeEntry {
    pub id: String,
    pub text: String,
}

impl AttributeEntry {
    fn new(id: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            text: text.to_string(),
        }
    }
}

/// 指定级别的内置属性
pub fn builtin_attributes(level: MatchLevel) -> Vec<AttributeEntry> {
    let entries: &[(&str, &str)] = match level {
        MatchLevel::Protocol => &[
            ("patientId", "(x00100020) Patient ID"),
            ("studyInstanceUid", "(x0020000d) Study Instance UID"),
            ("studyDate", "(x00080020) Study Date"),
            ("studyTime", "(x00080030) Study Time"),
            ("studyDescription", "(x00081030) Study Description"),
            ("anatomicRegion", "Anatomic Region"),
        ],
        MatchLevel::Study => &[
            ("patientId", "(x00100020) Patient ID"),
            ("studyInstanceUid", "(x0020000d) Study Instance UID"),
            ("studyDate", "(x00080020) Study Date"),
            ("studyTime", "(x00080030) Study Time"),
            ("studyDescription", "(x00081030) Study Description"),
            ("abstractPriorValue", "Abstract Prior Value"),
        ],
        MatchLevel::Series => &[
            ("seriesInstanceUid", "(x0020000e) Series Instance UID"),
            ("modality", "(x00080060) Modality"),
            ("seriesNumber", "(x00200011) Series Number"),
            ("seriesDescription", "(x0008103e) Series Description"),
            ("numImages", "Number of Images"),
        ],
        MatchLevel::Instance => &[
            ("sopClassUid", "SOP Class UID"),
            ("sopInstanceUid", "SOP Instance UID"),
            ("viewPosition", "View Position"),
            ("instanceNumber", "Instance Number"),
            ("imageType", "Image Type"),
            ("frameTime", "Frame Time"),
            ("laterality", "Laterality"),
            ("index", "Image Index"),
            ("photometricInterpretation", "Photometric Interpretation"),
            ("sliceThickness", "Slice Thickness"),
        ],
    };

    entries
        .iter()
        .map(|(id, text)| AttributeEntry::new(id, text))
        .collect()
}

/// 内置属性加上已注册的自定义属性 (id重复时跳过)
pub fn catalog_with_custom(
    level: MatchLevel,
    registry: &CustomAttributeRegistry,
) -> Vec<AttributeEntry> {
    let mut entries = builtin_attributes(level);
    for custom in registry.entries() {
        if !entries.iter().any(|entry| entry.id == custom.id) {
            entries.push(AttributeEntry::new(&custom.id, &custom.name));
        }
    }
    entries
}
