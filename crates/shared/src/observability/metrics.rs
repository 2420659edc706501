//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 未安装 recorder 时所有记录函数都是空操作。

use anyhow::{anyhow, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::{error, info};

use super::ObservabilityConfig;

pub const EVALUATIONS_TOTAL: &str = "payscript_evaluations_total";
pub const EVALUATION_DURATION_SECONDS: &str = "payscript_evaluation_duration_seconds";
pub const REGISTRATIONS_TOTAL: &str = "payscript_registrations_total";
pub const CALLOUTS_TOTAL: &str = "payscript_callouts_total";

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    pub addr: SocketAddr,
    _exporter: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 在指定端口启动 HTTP listener 暴露指标，需要在 tokio runtime 中调用。
pub async fn init(service_name: &str, config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", service_name.to_string())
        .build()?;

    // 保存到全局，供其他地方获取指标快照
    let _ = PROMETHEUS_HANDLE.set(recorder.handle());
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow!("metrics recorder already installed"))?;

    let exporter = tokio::spawn(async move {
        if let Err(e) = exporter.await {
            error!("Metrics exporter stopped: {:?}", e);
        }
    });

    describe_metrics();
    info!("Metrics server listening on {}", addr);

    Ok(MetricsHandle {
        addr,
        _exporter: exporter,
    })
}

/// 注册指标描述
pub fn describe_metrics() {
    metrics::describe_counter!(EVALUATIONS_TOTAL, "Total number of PayScript rule evaluations");
    metrics::describe_histogram!(
        EVALUATION_DURATION_SECONDS,
        "PayScript rule evaluation duration in seconds"
    );
    metrics::describe_counter!(
        REGISTRATIONS_TOTAL,
        "Total number of PayScript rule registrations"
    );
    metrics::describe_counter!(CALLOUTS_TOTAL, "Total number of PayScript callouts");
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// 记录规则评估
#[inline]
pub fn record_evaluation(process_id: &str, success: bool, duration_secs: f64) {
    metrics::counter!(
        EVALUATIONS_TOTAL,
        "process_id" => process_id.to_string(),
        "success" => success.to_string()
    )
    .increment(1);

    metrics::histogram!(
        EVALUATION_DURATION_SECONDS,
        "process_id" => process_id.to_string()
    )
    .record(duration_secs);
}

/// 记录规则注册
#[inline]
pub fn record_registration(process_id: &str, status: &str) {
    metrics::counter!(
        REGISTRATIONS_TOTAL,
        "process_id" => process_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录 callout 结果（applied / skipped / noop / failed）
#[inline]
pub fn record_callout(outcome: &str) {
    metrics::counter!(CALLOUTS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}
