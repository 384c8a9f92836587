//! # 挂片协议管理模块
//!
//! 提供配置加载/验证和日志初始化

pub mod config;
pub mod logging;

pub use config::{
    ConfigManager, ConfigValidator, HangingConfig, LogFormat, LoggingConfig, MatchingConfig,
    PriorsConfig,
};
pub use logging::init_logging;
