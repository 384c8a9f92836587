//! # 挂片协议引擎模块
//!
//! 提供挂片协议的选择与布局驱动能力，包括：
//! - 协议模型：协议、显示阶段、视口及其匹配规则
//! - 协议选择器：按得分为当前检查排序所有协议，无匹配时回退到默认协议
//! - 图像匹配器：按 检查/系列/实例 三级为每个视口选出最佳图像
//! - 既往检查加载：按需异步获取视口引用的既往检查，合并重复请求
//! - 协议引擎：阶段导航、协议切换，并通知布局管理器
//! - 随访时间点与内置协议

pub mod engine;
pub mod image_matcher;
pub mod layout;
pub mod presets;
pub mod prior_fetch;
pub mod protocol;
pub mod selector;
pub mod settings;
pub mod store;
pub mod timepoint;

// 重新导出主要类型
pub use engine::{EngineState, ProtocolEngine};
pub use image_matcher::{resolve_prior, tagged_prior_value, ImageDetails, ImageMatchDetails, ImageMatcher, PriorReference};
pub use layout::{LayoutEvent, LayoutManager, LayoutSnapshot, RecordingLayoutManager, ViewportData};
pub use presets::{
    default_protocol, default_viewport_settings, lesion_tracker_baseline_protocol,
    lesion_tracker_followup_protocol, register_lesion_tracker_attributes, viewport_setting_types,
    ViewportSettingType,
};
pub use prior_fetch::{FetchCompletion, FetchRequestOutcome, FetchWaiter, PriorFetchTracker, SettledFetch};
pub use protocol::{LayoutProps, Protocol, SettingsMap, Stage, Viewport, ViewportStructure};
pub use selector::{
    MatchedProtocol, MatchedProtocols, ProtocolMatch, ProtocolSelector, ABSTRACT_PRIOR_VALUE,
    NUMBER_OF_PRIORS_REFERENCED, RELATIVE_TIME,
};
pub use settings::{EngineSettings, DEFAULT_PROTOCOL_ID};
pub use store::{InMemoryProtocolStore, InMemoryStudyStore, ProtocolStore, StudyStore};
pub use timepoint::{
    timepoint_type_resolver, Timepoint, TimepointRegistry, TimepointStudies, TimepointType,
};
