//! Axum 服务端拦截链
//!
//! 由外到内：
//! 1. [`TraceParentLayer`]：采用 / 生成追踪上下文，开启服务端 span，写回 `traceparent` 响应头
//! 2. [`LoggingLayer`]：克隆消息体并写出请求、响应记录
//! 3. CORS
//! 4. [`EnvelopeLayer`]：把 JSON 响应包进标准信封
//! 5. panic 恢复：渲染 `GeneralError`
//! 6. [`AuthLayer`]：认证头部与令牌声明投影
//!
//! [`RestServer`] 按上述顺序装配；`/health` 不经过拦截链。

mod auth;
mod envelope;
mod logging;
mod server;
mod trace;

pub use auth::AuthLayer;
pub use envelope::{EnvelopeLayer, Enveloped};
pub use logging::LoggingLayer;
pub use server::{origin_matches, RestServer};
pub use trace::{TraceParentConfig, TraceParentLayer};

use crate::context::{self, CallContext};
use crate::envelope::Envelope;
use crate::error::Error;
use crate::response::{ApiResponse, RawResponse, ResponseCode};
use crate::traceparent::TraceContext;
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::convert::Infallible;

/// 在 handler 签名中直接获取调用上下文
///
/// 优先取拦截链放入扩展中的上下文，其次取当前任务的上下文。
impl<S> FromRequestParts<S> for CallContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<CallContext>()
            .cloned()
            .unwrap_or_else(context::current))
    }
}

impl<S> FromRequestParts<S> for TraceContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let ctx = CallContext::from_request_parts(parts, state).await?;
        Ok(*ctx.trace())
    }
}

/// 数据序列化为 JSON；响应码与分页随扩展交给信封层
impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let meta = self.meta();
        let mut response = match &self.data {
            Some(data) => Json(data).into_response(),
            None => Json(serde_json::Value::Null).into_response(),
        };
        if response.status().is_success() {
            *response.status_mut() = self.status();
        }
        response.extensions_mut().insert(meta);
        if self.is_raw {
            response.extensions_mut().insert(RawResponse);
        }
        response
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "request failed");
        ApiResponse::error(self.response_code()).into_response()
    }
}

/// 信封层之外的失败响应：自行渲染信封
pub(crate) fn failure_response(code: ResponseCode) -> Response {
    let body = Envelope::new(code, None).without_data();
    let mut response = (code.status(), body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(APPLICATION_JSON),
    );
    response.extensions_mut().insert(ApiResponse::<()>::error(code).meta());
    response.extensions_mut().insert(Enveloped);
    response
}

pub(crate) const APPLICATION_JSON: &str = "application/json";
