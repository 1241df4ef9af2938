//! 响应信封层

use super::{failure_response, APPLICATION_JSON};
use crate::envelope::{frame, Envelope};
use crate::response::{RawResponse, ResponseCode, ResponseMeta};
use axum::{
    body::{Body, HttpBody},
    extract::Request,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::Response,
    BoxError,
};
use bytes::Bytes;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// 标记：响应已经包过信封，再次经过信封层时原样透传
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Enveloped;

/// 把 JSON（或未声明类型的）响应体包进 `{"response":…,"data":…}`
///
/// 响应码取自处理函数声明的 [`ResponseMeta`]，否则按 HTTP 状态推断。
/// 带 [`RawResponse`] 标记或非 JSON 的响应原样透传。
#[derive(Clone, Debug, Default)]
pub struct EnvelopeLayer;

impl EnvelopeLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for EnvelopeLayer {
    type Service = EnvelopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        EnvelopeService { inner }
    }
}

#[derive(Clone, Debug)]
pub struct EnvelopeService<S> {
    inner: S,
}

impl<S, B> Service<Request> for EnvelopeService<S>
where
    S: Service<Request, Response = Response<B>> + Send + 'static,
    S::Future: Send + 'static,
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
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
        let head = req.method() == Method::HEAD;
        let future = self.inner.call(req);
        Box::pin(async move {
            let response = future.await?.map(Body::new);
            Ok(wrap(response, head).await)
        })
    }
}

async fn wrap(response: Response, head: bool) -> Response {
    let extensions = response.extensions();
    if extensions.get::<Enveloped>().is_some()
        || extensions.get::<RawResponse>().is_some()
        || !is_json_or_empty(response.headers())
        || must_stay_empty(&response, head)
    {
        return response;
    }

    let (code, pagination) = match extensions.get::<ResponseMeta>() {
        Some(meta) => (meta.code, meta.pagination),
        None => (ResponseCode::from_status(response.status()), None),
    };
    let envelope = Envelope::new(code, pagination);

    let (mut parts, body) = response.into_parts();
    let body_len = body.size_hint().exact();
    let framed = match frame(&envelope, body.into_data_stream(), body_len).await {
        Ok(framed) => framed,
        Err(error) => {
            tracing::error!(%error, "failed to read response body for envelope");
            return failure_response(ResponseCode::GENERAL_ERROR);
        }
    };

    parts
        .headers
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    match framed.content_length {
        Some(len) => {
            parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        None => {
            parts.headers.remove(header::CONTENT_LENGTH);
        }
    }
    parts.extensions.insert(Enveloped);
    if parts.extensions.get::<ResponseMeta>().is_none() {
        parts.extensions.insert(ResponseMeta { code, pagination });
    }

    Response::from_parts(parts, Body::from_stream(framed.body))
}

/// 204 / 304 不允许有响应体，HEAD 的空响应也不加信封
fn must_stay_empty(response: &Response, head: bool) -> bool {
    matches!(response.status(), StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED)
        || (head && response.body().size_hint().exact() == Some(0))
}

/// 未声明类型时视为 JSON
fn is_json_or_empty(headers: &HeaderMap) -> bool {
    match headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        None => true,
        Some(value) => {
            let essence = value.split(';').next().unwrap_or_default().trim();
            essence.is_empty()
                || essence.eq_ignore_ascii_case(APPLICATION_JSON)
                || essence.to_ascii_lowercase().ends_with("+json")
        }
    }
}
