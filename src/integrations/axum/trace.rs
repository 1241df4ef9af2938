//! `traceparent` 采用与服务端 span

use crate::context::{self, CallContext};
use crate::response::{ResponseMeta, SpanStatus};
use crate::traceparent::{TraceContext, TRACEPARENT_HEADER};
use axum::{
    extract::{MatchedPath, Request},
    http::{HeaderMap, HeaderValue},
    response::Response,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

/// 追踪层配置
#[derive(Clone, Debug)]
pub struct TraceParentConfig {
    /// 是否创建服务端 span（默认启用）
    pub enable_span: bool,
    /// 是否在响应头中写入 `traceparent`（默认启用）
    pub enable_response_header: bool,
}

impl Default for TraceParentConfig {
    fn default() -> Self {
        Self {
            enable_span: true,
            enable_response_header: true,
        }
    }
}

/// 最外层：采用或生成追踪上下文，开启以 `<服务名> <路由>` 命名的 span
#[derive(Clone)]
pub struct TraceParentLayer {
    service_name: Arc<str>,
    config: TraceParentConfig,
}

impl TraceParentLayer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: Arc::from(service_name.into()),
            config: TraceParentConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TraceParentConfig) -> Self {
        self.config = config;
        self
    }
}

impl<S> Layer<S> for TraceParentLayer {
    type Service = TraceParentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceParentService {
            inner,
            service_name: self.service_name.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TraceParentService<S> {
    inner: S,
    service_name: Arc<str>,
    config: TraceParentConfig,
}

impl<S> Service<Request> for TraceParentService<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let trace = extract_or_generate(req.headers());
        let ctx = CallContext::new(trace);

        let route = req
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_owned())
            .unwrap_or_else(|| req.uri().path().to_owned());
        let method = req.method().clone();

        req.extensions_mut().insert(ctx.clone());

        // 下游的 call 也要在上下文中执行
        let future = context::sync_scope(ctx.clone(), || self.inner.call(req));
        let config = self.config.clone();

        let span = if config.enable_span {
            let name = format!("{} {}", self.service_name, route);
            tracing::info_span!(
                "request",
                otel.name = %name,
                otel.kind = "server",
                trace_id = %ctx.trace_id(),
                span_id = %ctx.span_id(),
                method = %method,
                route = %route,
                http.status_code = tracing::field::Empty,
                otel.status_code = tracing::field::Empty,
            )
        } else {
            tracing::Span::none()
        };
        crate::otel::set_parent(&span, ctx.trace());

        let traced = span.clone();
        Box::pin(
            context::scope(ctx.clone(), async move {
                let mut response = future.await?;

                let status = response.status();
                let span_status = response
                    .extensions()
                    .get::<ResponseMeta>()
                    .map(|meta| meta.code.span_status())
                    .unwrap_or_else(|| SpanStatus::from_http(status));
                traced.record("http.status_code", status.as_u16());
                traced.record("otel.status_code", span_status.as_str());

                if config.enable_response_header {
                    if let Ok(value) = HeaderValue::from_str(&ctx.traceparent()) {
                        response.headers_mut().insert(TRACEPARENT_HEADER, value);
                    }
                }
                Ok(response)
            })
            .instrument(span),
        )
    }
}

/// 头部存在时采用上游 trace（格式错误时退化为全零ID），否则生成新的根上下文
pub(crate) fn extract_or_generate(headers: &HeaderMap) -> TraceContext {
    match headers
        .get(TRACEPARENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
    {
        Some(value) => TraceContext::from_traceparent(value),
        None => TraceContext::new_root(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, routing::get, Router};
    use tower::ServiceExt;

    const UPSTREAM: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    async fn handler() -> String {
        context::current().traceparent()
    }

    #[test]
    fn test_extract_adopts_upstream() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACEPARENT_HEADER, HeaderValue::from_static(UPSTREAM));
        let trace = extract_or_generate(&headers);
        assert_eq!(trace.trace_id.to_string(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(trace.parent_span_id.unwrap().to_string(), "b7ad6b7169203331");
    }

    #[test]
    fn test_extract_malformed_uses_zero_ids() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACEPARENT_HEADER, HeaderValue::from_static("00-zz-yy-01"));
        let trace = extract_or_generate(&headers);
        assert!(trace.trace_id.is_zero());
        assert!(!trace.span_id.is_zero());
    }

    #[test]
    fn test_generate_when_missing() {
        let trace = extract_or_generate(&HeaderMap::new());
        assert!(!trace.trace_id.is_zero());
        assert!(trace.parent_span_id.is_none());
    }

    #[tokio::test]
    async fn test_response_header_matches_handler_context() {
        let app = Router::new()
            .route("/", get(handler))
            .layer(TraceParentLayer::new("svc"));

        let request = Request::builder()
            .uri("/")
            .header(TRACEPARENT_HEADER, UPSTREAM)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let header = response
            .headers()
            .get(TRACEPARENT_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        assert!(header.starts_with("00-0af7651916cd43dd8448eb211c80319c-"));
        assert!(!header.contains("b7ad6b7169203331"));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, header.as_bytes());
    }

    #[tokio::test]
    async fn test_server_span_is_exported_under_upstream_trace() {
        async fn fail() -> StatusCode {
            StatusCode::BAD_GATEWAY
        }

        let (subscriber, exporter) = crate::otel::capture();
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = Router::new()
            .route("/v1/fail", get(fail))
            .layer(TraceParentLayer::new("svc"));
        let request = Request::builder()
            .uri("/v1/fail")
            .header(TRACEPARENT_HEADER, UPSTREAM)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        drop(response);

        let spans = exporter.get_finished_spans().unwrap();
        let span = spans.iter().find(|s| s.name == "svc /v1/fail").unwrap();
        assert_eq!(span.span_kind, opentelemetry::trace::SpanKind::Server);
        assert_eq!(span.span_context.trace_id().to_string(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(span.parent_span_id.to_string(), "b7ad6b7169203331");
        assert!(matches!(span.status, opentelemetry::trace::Status::Error { .. }));
    }

    #[tokio::test]
    async fn test_response_header_can_be_disabled() {
        let app = Router::new().route("/", get(handler)).layer(
            TraceParentLayer::new("svc").with_config(TraceParentConfig {
                enable_span: false,
                enable_response_header: false,
            }),
        );
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.headers().get(TRACEPARENT_HEADER).is_none());
    }
}
