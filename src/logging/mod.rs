//! 日志初始化与传输记录
//!
//! 两种输出模式：
//! - 本地模式（`LOCAL_RUN=true`）：`tracing-subscriber` 的彩色人类可读输出
//! - 机器模式：[`CloudJsonFormat`]，每行一个 JSON 对象，遵循云日志的
//!   `severity` 与 trace 链接约定
//!
//! 传输记录（REST / SOAP / PubSub / gRPC 的请求、响应与错误）都是 `transport`
//! target 下的 `tracing` 事件，字段见 [`TransportMessage`]。

mod cloud;
mod record;

pub use cloud::CloudJsonFormat;
pub use record::{
    emit, headers_from_http, truncate_body, Direction, LogKind, TransportMessage, ELLIPSIS,
    TRANSPORT_TARGET,
};

use crate::config::LogConfig;
use crate::error::{Error, Result};
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 安装全局 subscriber，不导出 span
///
/// 重复调用返回错误而不是 panic。`RUST_LOG` 优先于配置中的级别。
pub fn init(config: &LogConfig, project_id: Option<&str>) -> Result<()> {
    init_with_tracer(config, project_id, None)
}

/// 安装全局 subscriber；给定 `provider` 时同时安装 `tracing-opentelemetry` 层，
/// 并注册全局 provider 与 W3C 传播器
pub fn init_with_tracer(
    config: &LogConfig,
    project_id: Option<&str>,
    provider: Option<&SdkTracerProvider>,
) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let spans = provider
        .map(|provider| tracing_opentelemetry::layer().with_tracer(crate::otel::install(provider)));

    let registry = tracing_subscriber::registry().with(filter).with(spans);
    let result = if config.local {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .event_format(CloudJsonFormat::new(project_id.map(str::to_owned))),
            )
            .try_init()
    };
    result.map_err(|e| Error::Config(format!("failed to install log subscriber: {e}")))
}

/// 致命错误：记录后以状态码 1 退出进程
pub fn fatal(message: impl std::fmt::Display) -> ! {
    tracing::error!(fatal = true, "{message}");
    std::process::exit(1)
}
