//! tonic 集成
//!
//! - 客户端：[`ContextInterceptor`] 把上下文写入出站元数据
//! - 服务端：[`hydrate_context`] 拦截器或 [`GrpcContextLayer`] 从入站元数据恢复上下文
//! - 流：[`StreamLog`] 只记录每个方向的第一条消息
//!
//! ```ignore
//! let client = OrdersClient::with_interceptor(channel, ContextInterceptor::default());
//!
//! Server::builder()
//!     .layer(GrpcContextLayer::new(logger))
//!     .add_service(OrdersServer::new(service))
//!     .serve(address)
//!     .await?;
//! ```

use crate::context::{self, CallContext};
use crate::logging::{headers_from_http, truncate_body, LogKind, TransportMessage};
use crate::response::SpanStatus;
use crate::sink::TransportLogger;
use crate::traceparent::{TraceContext, TRACEPARENT_HEADER};
use futures_util::Stream;
use http::HeaderMap;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tower::{Layer, Service};
use tracing::Instrument;

/// 把上下文中的受管理键和 `traceparent` 写入元数据
///
/// 无法作为 ASCII 元数据表示的值会被跳过。
pub fn inject_context_to_metadata(ctx: &CallContext, metadata: &mut MetadataMap) {
    if let Ok(value) = AsciiMetadataValue::try_from(ctx.traceparent().as_str()) {
        metadata.insert(TRACEPARENT_HEADER, value);
    }
    for (key, value) in ctx.managed_values() {
        let name = key.metadata_key();
        match (
            AsciiMetadataKey::from_bytes(name.as_bytes()),
            AsciiMetadataValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                metadata.insert(name, value);
            }
            _ => tracing::debug!(key = %key, "skipping value not representable as metadata"),
        }
    }
}

/// 从入站元数据读取受管理键；上游 span 成为父 span
pub fn extract_context_from_metadata(metadata: &MetadataMap) -> CallContext {
    hydrate(|name| metadata.get(name)?.to_str().ok().map(str::to_owned))
}

/// 同 [`extract_context_from_metadata`]，直接读取 HTTP/2 头部
pub fn extract_context_from_headers(headers: &HeaderMap) -> CallContext {
    hydrate(|name| headers.get(name)?.to_str().ok().map(str::to_owned))
}

fn hydrate(get: impl Fn(&str) -> Option<String>) -> CallContext {
    let trace = match get(TRACEPARENT_HEADER).filter(|v| !v.trim().is_empty()) {
        Some(value) => TraceContext::from_traceparent(&value),
        None => TraceContext::new_root(),
    };
    context::managed_keys()
        .into_iter()
        .fold(CallContext::new(trace), |ctx, key| match get(&key.metadata_key()) {
            Some(value) => ctx.with_value(key, value),
            None => ctx,
        })
}

/// 客户端拦截器，一元调用与流式调用都适用
///
/// 以当前任务的上下文（没有时新建根上下文）派生子 span 后写入元数据。
#[derive(Clone, Debug, Default)]
pub struct ContextInterceptor {
    ctx: Option<CallContext>,
}

impl ContextInterceptor {
    /// 固定使用 `ctx`，不读取任务上下文
    pub fn with_context(ctx: CallContext) -> Self {
        Self { ctx: Some(ctx) }
    }
}

impl Interceptor for ContextInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let parent = self
            .ctx
            .clone()
            .or_else(context::try_current)
            .unwrap_or_else(CallContext::new_root);
        inject_context_to_metadata(&parent.child(), request.metadata_mut());
        Ok(request)
    }
}

/// 服务端拦截器：把恢复的上下文放进请求扩展
///
/// 处理函数通过 `request.extensions().get::<CallContext>()` 读取。
/// 需要任务级 [`context::current`] 时改用 [`GrpcContextLayer`]。
#[allow(clippy::result_large_err)]
pub fn hydrate_context(mut request: Request<()>) -> Result<Request<()>, Status> {
    let ctx = extract_context_from_metadata(request.metadata());
    request.extensions_mut().insert(ctx);
    Ok(request)
}

/// 服务端 tower 层
///
/// 在 tonic 服务运行前从头部恢复上下文，整个调用（包括流式处理函数）
/// 都在该上下文中执行，并写出一对请求 / 响应记录（不含消息体）。
#[derive(Clone, Debug)]
pub struct GrpcContextLayer {
    logger: TransportLogger,
}

impl GrpcContextLayer {
    pub fn new(logger: TransportLogger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for GrpcContextLayer {
    type Service = GrpcContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcContextService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct GrpcContextService<S> {
    inner: S,
    logger: TransportLogger,
}

impl<S, B, R> Service<http::Request<B>> for GrpcContextService<S>
where
    S: Service<http::Request<B>, Response = http::Response<R>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + 'static,
    R: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        let ctx = extract_context_from_headers(req.headers());
        let path = req.uri().path().to_owned();
        req.extensions_mut().insert(ctx.clone());

        let request_record = TransportMessage::request(LogKind::Grpc, true, req.method().as_str(), path.as_str())
            .with_headers(headers_from_http(req.headers()));
        let logger = self.logger.clone();
        if logger.enabled() {
            logger.log(&ctx, &request_record);
        }

        let span = tracing::info_span!(
            "grpc",
            otel.name = %path,
            otel.kind = "server",
            trace_id = %ctx.trace_id(),
            span_id = %ctx.span_id(),
            grpc.status = tracing::field::Empty,
            otel.status_code = tracing::field::Empty,
        );
        crate::otel::set_parent(&span, ctx.trace());
        let future = context::sync_scope(ctx.clone(), || self.inner.call(req));
        let traced = span.clone();

        Box::pin(
            context::scope(ctx.clone(), async move {
                match future.await {
                    Ok(response) => {
                        let grpc_status = response
                            .headers()
                            .get("grpc-status")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("0")
                            .to_owned();
                        traced.record("grpc.status", grpc_status.as_str());
                        let span_status = if grpc_status == "0" { SpanStatus::Ok } else { SpanStatus::Error };
                        traced.record("otel.status_code", span_status.as_str());
                        if logger.enabled() {
                            let record =
                                TransportMessage::response_to(&request_record, Some(response.status().as_u16()))
                                    .with_headers(headers_from_http(response.headers()));
                            logger.log(&ctx, &record);
                        }
                        Ok(response)
                    }
                    Err(error) => {
                        traced.record("otel.status_code", SpanStatus::Error.as_str());
                        if logger.enabled() {
                            logger.log(&ctx, &TransportMessage::error_for(&request_record, error.to_string()));
                        }
                        Err(error)
                    }
                }
            })
            .instrument(span),
        )
    }
}

/// 流消息记录器
///
/// 每个方向只记录第一条消息，消息体按 `Debug` 输出并截断。
#[derive(Clone, Debug)]
pub struct StreamLog {
    logger: TransportLogger,
    ctx: CallContext,
    request: TransportMessage,
}

impl StreamLog {
    /// `method` 为完整的 gRPC 方法路径，如 `/orders.Orders/Watch`
    pub fn new(logger: TransportLogger, ctx: CallContext, is_server: bool, method: impl Into<String>) -> Self {
        let method = method.into();
        let request = TransportMessage::request(LogKind::Grpc, is_server, "POST", method);
        Self { logger, ctx, request }
    }

    /// 包装发出的流
    pub fn sent<S>(&self, stream: S) -> FirstMessage<S> {
        self.wrap(stream, !self.request.is_server)
    }

    /// 包装收到的流
    pub fn received<S>(&self, stream: S) -> FirstMessage<S> {
        self.wrap(stream, self.request.is_server)
    }

    fn wrap<S>(&self, stream: S, is_request: bool) -> FirstMessage<S> {
        FirstMessage {
            inner: Box::pin(stream),
            pending: self.logger.enabled().then(|| (self.clone(), is_request)),
        }
    }

    /// 记录单条消息；`is_request` 决定写成请求还是响应记录
    pub fn message<T: fmt::Debug>(&self, message: &T, is_request: bool) {
        let body = truncate_body(format!("{message:?}").as_bytes(), self.logger.payload_limit());
        let record = if is_request {
            self.request.clone()
        } else {
            TransportMessage::response_to(&self.request, None)
        };
        self.logger.log(&self.ctx, &record.with_body(&body));
    }

    pub fn status(&self, status: &Status) {
        let error = format!("{:?}: {}", status.code(), status.message());
        self.logger.log(&self.ctx, &TransportMessage::error_for(&self.request, error));
    }
}

/// 只记录第一项的流包装
pub struct FirstMessage<S> {
    inner: Pin<Box<S>>,
    pending: Option<(StreamLog, bool)>,
}

impl<S, T> Stream for FirstMessage<S>
where
    S: Stream<Item = Result<T, Status>>,
    T: fmt::Debug,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(item)) = &polled {
            if let Some((log, is_request)) = self.pending.take() {
                match item {
                    Ok(message) => log.message(message, is_request),
                    Err(status) => log.status(status),
                }
            }
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
