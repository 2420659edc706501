//! 统一可观测性模块
//!
//! 提供 logging 与 metrics 的统一初始化。所有入口通过单一函数配置可观测性，确保一致的指标命名。

pub mod metrics;
pub mod tracing;

pub use crate::config::ObservabilityConfig;

use ::tracing::info;
use anyhow::Result;

/// 可观测性资源守卫
pub struct ObservabilityGuard {
    _metrics_handle: Option<metrics::MetricsHandle>,
}

impl ObservabilityGuard {
    /// 创建一个空的 Guard（用于测试或禁用可观测性时）
    pub fn empty() -> Self {
        Self {
            _metrics_handle: None,
        }
    }

    pub fn metrics_enabled(&self) -> bool {
        self._metrics_handle.is_some()
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics（Prometheus 指标，仅在配置启用时，需要 tokio runtime）
///
/// # Example
///
/// ```ignore
/// use payscript_shared::{config::AppConfig, observability};
///
/// let config = AppConfig::load("payscript")?;
/// let _guard = observability::init(&config.service_name, &config.observability).await?;
/// ```
pub async fn init(service_name: &str, config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    info!(
        service = %service_name,
        metrics_enabled = config.metrics_enabled,
        metrics_port = config.metrics_port,
        "Observability initialized"
    );

    let metrics_handle = if config.metrics_enabled {
        Some(metrics::init(service_name, config).await?)
    } else {
        metrics::describe_metrics();
        None
    };

    Ok(ObservabilityGuard {
        _metrics_handle: metrics_handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn test_empty_guard() {
        assert!(!ObservabilityGuard::empty().metrics_enabled());
    }
}
