//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// 环境变量前缀（PAYSCRIPT__ENGINE__TRACE -> engine.trace）
pub const ENV_PREFIX: &str = "PAYSCRIPT";

/// 规则引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 是否记录逐步评估追踪
    pub trace: bool,
    /// 规则解析失败时日志中保留的源码字符数
    pub snippet_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trace: false,
            snippet_len: 100,
        }
    }
}

/// 规则文件配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// 规则目录，文件名（不含扩展名）即流程 ID
    pub dir: Option<PathBuf>,
    pub extensions: Vec<String>,
    /// 监听目录变化并自动重新加载
    pub watch: bool,
    pub debounce_ms: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dir: None,
            extensions: vec!["ts".to_string(), "js".to_string()],
            watch: false,
            debounce_ms: 500,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 是否输出 JSON 结构化日志
    pub json_logs: bool,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub engine: EngineConfig,
    pub rules: RulesConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（PAYSCRIPT__ 前缀，`__` 分隔层级）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::load_from(Path::new(&config_dir), service_name)
    }

    /// 从指定目录加载配置
    pub fn load_from(config_dir: &Path, service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("PAYSCRIPT_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            // PAYSCRIPT__RULES__EXTENSIONS=ts,js
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("rules.extensions")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(!config.engine.trace);
        assert_eq!(config.engine.snippet_len, 100);
        assert_eq!(config.rules.extensions, vec!["ts", "js"]);
        assert_eq!(config.observability.metrics_port, 9090);
    }

    #[test]
    fn test_is_production() {
        let mut config = AppConfig::default();
        assert!(!config.is_production());

        config.environment = "production".to_string();
        assert!(config.is_production());
    }

    #[test]
    fn test_load_missing_dir_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path(), "payscript").unwrap();

        assert_eq!(config.service_name, "payscript");
        assert_eq!(config.rules.debounce_ms, 500);
        assert!(config.rules.dir.is_none());
    }

    #[test]
    fn test_service_file_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[engine]\ntrace = false\nsnippet_len = 80\n\n[rules]\ndir = \"rules\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("payscript-test.toml"),
            "[engine]\ntrace = true\n",
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path(), "payscript-test").unwrap();

        assert!(config.engine.trace);
        assert_eq!(config.engine.snippet_len, 80);
        assert_eq!(config.rules.dir, Some(PathBuf::from("rules")));
        assert!(!config.observability.json_logs);
    }
}
