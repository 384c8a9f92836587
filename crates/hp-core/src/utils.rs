//! 通用工具函数

use chrono::NaiveDate;

/// DICOM日期格式 (DA)
const DICOM_DATE_FORMAT: &str = "%Y%m%d";

/// 解析DICOM日期字符串 (YYYYMMDD)
pub fn parse_dicom_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.len() != 8 || !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(value, DICOM_DATE_FORMAT).ok()
}

/// 格式化为DICOM日期字符串
pub fn format_dicom_date(date: NaiveDate) -> String {
    date.format(DICOM_DATE_FORMAT).to_string()
}

/// 以DICOM日期格式序列化 `NaiveDate`
pub mod dicom_date_serde {
    use chrono::NaiveDate;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_dicom_date(*date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_dicom_date(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid DICOM date: {}", raw)))
    }
}
