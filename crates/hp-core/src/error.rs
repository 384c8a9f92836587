//! 错误定义模块

use thiserror::Error;

/// 挂片协议系统统一错误类型
///
/// 匹配失败不是错误（得分为0或没有最佳匹配），只有引用的数据完全找不到时才返回错误。
#[derive(Error, Debug)]
pub enum HpError {
    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("检查元数据获取失败: {0}")]
    Fetch(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HpError {
    /// 是否为资源缺失错误
    pub fn is_not_found(&self) -> bool {
        matches!(self, HpError::NotFound(_))
    }
}

/// 挂片协议系统统一结果类型
pub type Result<T> = std::result::Result<T, HpError>;
