//! 请求 / 响应审计日志层

use super::failure_response;
use crate::body_clone::{clone_body, BodyClone, CloneGuard, OriginalBody};
use crate::context::{self, new_context_from_trace_parent, CallContext};
use crate::logging::{headers_from_http, LogKind, TransportMessage};
use crate::response::ResponseCode;
use crate::sink::TransportLogger;
use axum::{
    body::{Body, HttpBody},
    extract::Request,
    http::{header, HeaderMap},
    response::Response,
};
use bytes::Bytes;
use futures_util::StreamExt;
use std::task::{Context, Poll};
use tower::{Layer, Service};

const EVENT_STREAM: &str = "text/event-stream";

/// 克隆请求与响应消息体并写出传输记录
///
/// 请求记录在调用处理函数之前写出，响应记录在其返回之后写出。
/// 日志出口全部关闭时直接透传。
#[derive(Clone, Debug)]
pub struct LoggingLayer {
    logger: TransportLogger,
}

impl LoggingLayer {
    pub fn new(logger: TransportLogger) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService {
            inner,
            logger: self.logger.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingService<S> {
    inner: S,
    logger: TransportLogger,
}

impl<S> Service<Request> for LoggingService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        if !self.logger.enabled() {
            return Box::pin(self.inner.call(req));
        }

        // 已就绪的是 self.inner，把它换出来带进 async 块
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let logger = self.logger.clone();

        Box::pin(async move {
            let ctx = context::current();
            let background = new_context_from_trace_parent(&ctx);
            let limit = logger.payload_limit();

            let (parts, body) = req.into_parts();
            let declared = declared_length(&parts.headers, &body);
            let request_record =
                TransportMessage::request(LogKind::Rest, true, parts.method.as_str(), parts.uri.to_string())
                    .with_headers(headers_from_http(&parts.headers));

            let cloned = match clone_body(declared, limit, ctx.trace(), body.into_data_stream()).await {
                Ok(cloned) => cloned,
                Err(error) => {
                    tracing::error!(%error, "failed to clone request body");
                    logger.log(&background, &TransportMessage::error_for(&request_record, error.to_string()));
                    return Ok(failure_response(ResponseCode::GENERAL_ERROR));
                }
            };
            let (original, audit, guard) = match split(cloned).await {
                Ok(split) => split,
                Err(error) => {
                    tracing::error!(%error, "failed to read request body clone");
                    logger.log(&background, &TransportMessage::error_for(&request_record, error.to_string()));
                    return Ok(failure_response(ResponseCode::GENERAL_ERROR));
                }
            };
            let request_record = request_record.with_body(&audit);
            logger.log(&background, &request_record);

            let req = Request::from_parts(parts, guarded_body(original, guard));
            let response = inner.call(req).await?;

            Ok(log_response(&logger, &background, &ctx, &request_record, response).await)
        })
    }
}

async fn log_response(
    logger: &TransportLogger,
    background: &CallContext,
    ctx: &CallContext,
    request_record: &TransportMessage,
    response: Response,
) -> Response {
    let (parts, body) = response.into_parts();
    let record = TransportMessage::response_to(request_record, Some(parts.status.as_u16()))
        .with_headers(headers_from_http(&parts.headers));

    if is_event_stream(&parts.headers) {
        logger.log(background, &record);
        return Response::from_parts(parts, body);
    }

    let declared = declared_length(&parts.headers, &body);
    let cloned = match clone_body(declared, logger.payload_limit(), ctx.trace(), body.into_data_stream()).await {
        Ok(cloned) => cloned,
        Err(error) => {
            tracing::error!(%error, "failed to clone response body");
            logger.log(background, &TransportMessage::error_for(request_record, error.to_string()));
            return failure_response(ResponseCode::GENERAL_ERROR);
        }
    };
    match split(cloned).await {
        Ok((original, audit, guard)) => {
            logger.log(background, &record.with_body(&audit));
            Response::from_parts(parts, guarded_body(original, guard))
        }
        Err(error) => {
            tracing::error!(%error, "failed to read response body clone");
            logger.log(background, &TransportMessage::error_for(request_record, error.to_string()));
            failure_response(ResponseCode::GENERAL_ERROR)
        }
    }
}

async fn split(cloned: BodyClone) -> std::io::Result<(OriginalBody, Bytes, CloneGuard)> {
    let BodyClone {
        original,
        cloned,
        guard,
        ..
    } = cloned;
    let audit = cloned.into_bytes().await?;
    Ok((original, audit, guard))
}

/// 由原始体重建消息体；临时文件随消息体一起释放
fn guarded_body(original: OriginalBody, guard: CloneGuard) -> Body {
    let stream = original.into_stream().map(move |chunk| {
        let _held = &guard;
        chunk
    });
    Body::from_stream(stream)
}

fn declared_length(headers: &HeaderMap, body: &Body) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| body.size_hint().exact())
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(EVENT_STREAM))
}
