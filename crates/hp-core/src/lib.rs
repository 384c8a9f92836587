//! # Hanging Protocol Core
//!
//! 挂片协议系统的核心模块，提供错误定义、检查/系列/实例数据模型和通用工具。

pub mod error;
pub mod models;
pub mod utils;

pub use error::{HpError, Result};
pub use models::*;
