//! 引擎运行参数

use serde::{Deserialize, Serialize};

/// 默认协议id
pub const DEFAULT_PROTOCOL_ID: &str = "defaultProtocol";

/// 协议引擎设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 没有协议匹配时使用的协议
    pub default_protocol_id: String,
    /// 合成的既往检查数量规则是否为必需规则
    pub prior_rule_required: bool,
    /// 是否按需加载视口引用的既往检查
    pub lazy_prior_fetch: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_protocol_id: DEFAULT_PROTOCOL_ID.to_string(),
            prior_rule_required: false,
            lazy_prior_fetch: true,
        }
    }
}
