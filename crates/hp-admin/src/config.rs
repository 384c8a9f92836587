//! 配置管理
//!
//! 内置默认值、配置文件和 `HP__` 前缀环境变量三层合并，加载后统一验证。

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use hp_engine::settings::{EngineSettings, DEFAULT_PROTOCOL_ID};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    /// 配置数据
    config: Arc<RwLock<HangingConfig>>,
    /// 配置文件路径
    config_path: Option<String>,
    /// 配置验证器
    validator: ConfigValidator,
}

/// 完整配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HangingConfig {
    /// 协议匹配配置
    pub matching: MatchingConfig,
    /// 既往检查配置
    pub priors: PriorsConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 协议匹配配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// 没有协议匹配时使用的协议id
    pub default_protocol_id: String,
    /// 既往检查数量规则是否为必需规则
    pub prior_rule_required: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            default_protocol_id: DEFAULT_PROTOCOL_ID.to_string(),
            prior_rule_required: false,
        }
    }
}

/// 既往检查配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorsConfig {
    /// 按需加载视口引用的既往检查
    pub lazy_fetch: bool,
}

impl Default for PriorsConfig {
    fn default() -> Self {
        Self { lazy_fetch: true }
    }
}

/// 日志格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Full,
    Pretty,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别 (EnvFilter 语法)
    pub level: String,
    /// 日志格式
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl HangingConfig {
    /// 引擎设置
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            default_protocol_id: self.matching.default_protocol_id.clone(),
            prior_rule_required: self.matching.prior_rule_required,
            lazy_prior_fetch: self.priors.lazy_fetch,
        }
    }
}

impl ConfigManager {
    /// 从配置文件加载
    pub fn new(config_path: &str) -> Result<Self> {
        let config = Self::load_config(File::with_name(config_path))
            .with_context(|| format!("Failed to load configuration from {}", config_path))?;
        info!("Configuration loaded successfully from: {}", config_path);
        Self::with_config(config, Some(config_path.to_string()))
    }

    /// 使用内置默认值
    pub fn from_defaults() -> Result<Self> {
        Self::with_config(HangingConfig::default(), None)
    }

    /// 从TOML文本加载
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config = Self::load_config(File::from_str(content, FileFormat::Toml))?;
        Self::with_config(config, None)
    }

    fn with_config(config: HangingConfig, config_path: Option<String>) -> Result<Self> {
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            validator,
        })
    }

    fn load_config<S>(source: S) -> Result<HangingConfig>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let settings = Config::builder()
            .add_source(Config::try_from(&HangingConfig::default())?)
            .add_source(source)
            .add_source(Environment::with_prefix("HP").separator("__"))
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// 获取配置
    pub async fn get_config(&self) -> HangingConfig {
        let config = self.config.read().await;
        config.clone()
    }

    /// 当前配置对应的引擎设置
    pub async fn engine_settings(&self) -> EngineSettings {
        self.config.read().await.engine_settings()
    }

    /// 更新配置
    pub async fn update_config(&self, new_config: HangingConfig) -> Result<()> {
        self.validator.validate(&new_config)?;

        let mut config = self.config.write().await;
        *config = new_config;

        info!("Configuration updated successfully");
        Ok(())
    }

    /// 重新加载配置文件
    pub async fn reload_config(&self) -> Result<()> {
        let Some(path) = self.config_path.as_deref() else {
            return Ok(());
        };
        let new_config = Self::load_config(File::with_name(path))?;
        self.update_config(new_config).await
    }

    pub fn config_path(&self) -> Option<&str> {
        self.config_path.as_deref()
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: String,
    /// 验证函数
    validator: fn(&HangingConfig) -> Result<()>,
    /// 错误消息
    error_message: String,
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "matching.default_protocol_id".to_string(),
                validator: |config| {
                    if config.matching.default_protocol_id.trim().is_empty() {
                        Err(anyhow::anyhow!("Default protocol id cannot be empty"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid default protocol".to_string(),
            },
            ValidationRule {
                field_path: "logging.level".to_string(),
                validator: |config| {
                    EnvFilter::try_new(&config.logging.level)
                        .map(|_| ())
                        .map_err(|e| anyhow::anyhow!("Unparseable log filter: {}", e))
                },
                error_message: "Invalid log level".to_string(),
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &HangingConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(anyhow::anyhow!("{}: {}", rule.error_message, e));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
