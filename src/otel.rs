//! OpenTelemetry 桥接
//!
//! 服务端 span 仍然是普通的 `tracing` span，由 `tracing-opentelemetry` 层导出；
//! 该层直接读取 `otel.name`、`otel.kind` 与 `otel.status_code` 字段。
//! 这里负责把 [`TraceContext`] 设为 span 的远端父节点，使导出的 span 与
//! [`CallContext`](crate::CallContext) 属于同一条 trace。
//!
//! 全零 trace（`traceparent` 解析失败）不会设置父节点，导出端会开启新的 trace。

use crate::traceparent::TraceContext;
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState, TracerProvider as _,
};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{SdkTracerProvider, Tracer, TracerProviderBuilder};
use opentelemetry_sdk::Resource;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// 导出 span 时使用的 instrumentation 名称
pub const INSTRUMENTATION_NAME: &str = env!("CARGO_PKG_NAME");

/// 上下文对应的远端父 span
///
/// 有上游 span 时使用上游 span，否则使用本地 span ID。
pub fn remote_parent(trace: &TraceContext) -> Option<SpanContext> {
    if trace.trace_id.is_zero() {
        return None;
    }
    let parent = trace
        .parent_span_id
        .filter(|id| !id.is_zero())
        .unwrap_or(trace.span_id);
    let span_context = SpanContext::new(
        TraceId::from_bytes(trace.trace_id.as_u128().to_be_bytes()),
        SpanId::from_bytes(parent.as_u64().to_be_bytes()),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );
    span_context.is_valid().then_some(span_context)
}

/// 把 `trace` 设为 `span` 的父节点，必须在 span 第一次进入之前调用
pub fn set_parent(span: &Span, trace: &TraceContext) {
    if let Some(parent) = remote_parent(trace) {
        span.set_parent(opentelemetry::Context::new().with_remote_span_context(parent));
    }
}

/// 带 `service.name` 资源的 provider 构造器，服务可以在此基础上追加导出器
pub fn tracer_provider_builder(service_name: &str) -> TracerProviderBuilder {
    let resource = Resource::builder()
        .with_attributes(vec![
            KeyValue::new("service.name", service_name.to_owned()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();
    SdkTracerProvider::builder().with_resource(resource)
}

/// 注册全局 provider 与 W3C 传播器，返回供 `tracing-opentelemetry` 层使用的 tracer
pub fn install(provider: &SdkTracerProvider) -> Tracer {
    global::set_text_map_propagator(TraceContextPropagator::new());
    global::set_tracer_provider(provider.clone());
    provider.tracer(INSTRUMENTATION_NAME)
}

/// 测试用：把 span 导出到内存
#[cfg(test)]
pub(crate) fn capture() -> (
    impl tracing::Subscriber + Send + Sync,
    opentelemetry_sdk::trace::InMemorySpanExporter,
) {
    use tracing_subscriber::layer::SubscriberExt;

    let exporter = opentelemetry_sdk::trace::InMemorySpanExporterBuilder::new().build();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("test")));
    (subscriber, exporter)
}
