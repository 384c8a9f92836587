//! # 挂片协议
//!
//! 医学影像阅片器的挂片协议选择与布局引擎：
//! - [`core`]：检查/系列/实例记录、属性集合、错误类型
//! - [`matching`]：约束、加权规则与规则匹配器
//! - [`engine`]：协议选择、图像匹配、既往检查加载与阶段导航
//! - [`admin`]：配置与日志

pub use hp_admin as admin;
pub use hp_core as core;
pub use hp_engine as engine;
pub use hp_matching as matching;

pub use hp_core::{HpError, Result};
pub use hp_engine::{ProtocolEngine, ProtocolSelector};
pub use hp_matching::RuleMatcher;
