//! 传输记录：每条调用边上的请求 / 响应 / 错误

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 传输记录使用的 `tracing` target
pub const TRANSPORT_TARGET: &str = "transport";

/// 截断标记
pub const ELLIPSIS: &str = "...";

/// 传输种类，同时也是审计表 `type` 列的取值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Rest,
    Soap,
    PubSub,
    Grpc,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Soap => "soap",
            Self::PubSub => "pubsub",
            Self::Grpc => "grpc",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
    Error,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
        }
    }
}

/// 一次传输交互在某条边上的快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    pub log_type: LogKind,
    pub is_server: bool,
    pub is_request: bool,
    /// URL、主题或 gRPC 方法路径
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransportMessage {
    pub fn request(
        log_type: LogKind,
        is_server: bool,
        method: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            log_type,
            is_server,
            is_request: true,
            url: url.into(),
            method: method.into(),
            headers: BTreeMap::new(),
            body: None,
            status_code: None,
            error: None,
        }
    }

    /// 由请求记录派生响应记录（沿用 url 与 method，清空头部与消息体）
    pub fn response_to(request: &Self, status_code: Option<u16>) -> Self {
        Self {
            is_request: false,
            headers: BTreeMap::new(),
            body: None,
            status_code,
            error: None,
            ..request.clone()
        }
    }

    /// 由请求记录派生错误记录
    pub fn error_for(request: &Self, error: impl Into<String>) -> Self {
        Self {
            is_request: false,
            headers: BTreeMap::new(),
            body: None,
            status_code: None,
            error: Some(error.into()),
            ..request.clone()
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, Vec<String>>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.entry(key.into()).or_default().push(value.into());
        self
    }

    /// 消息体按 UTF-8 有损解码后保存；空消息体不记录
    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = (!body.is_empty()).then(|| String::from_utf8_lossy(body).into_owned());
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn direction(&self) -> Direction {
        if self.error.is_some() {
            Direction::Error
        } else if self.is_request {
            Direction::Request
        } else {
            Direction::Response
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// 把 HTTP 头部转换为 key → 多值 的映射
pub fn headers_from_http(headers: &http::HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

/// 超过上限时截断并追加 `...`
pub fn truncate_body(body: &[u8], limit: usize) -> Bytes {
    if body.len() <= limit {
        return Bytes::copy_from_slice(body);
    }
    let mut out = Vec::with_capacity(limit + ELLIPSIS.len());
    out.extend_from_slice(&body[..limit]);
    out.extend_from_slice(ELLIPSIS.as_bytes());
    Bytes::from(out)
}

/// 把传输记录写到标准输出日志
///
/// 错误记录使用 error 级别，其他使用 info 级别。
pub fn emit(message: &TransportMessage) {
    let headers = serde_json::to_string(&message.headers).unwrap_or_default();
    let body = message.body.as_deref().unwrap_or_default();
    let side = if message.is_server { "server" } else { "client" };
    let direction = message.direction().as_str();

    match &message.error {
        Some(error) => tracing::error!(
            target: TRANSPORT_TARGET,
            logType = message.log_type.as_str(),
            isServer = message.is_server,
            isRequest = message.is_request,
            url = %message.url,
            method = %message.method,
            headers = headers.as_str(),
            body = %body,
            statusCode = message.status_code,
            error = %error,
            "[{}] {side} {direction} {} {}",
            message.log_type,
            message.method,
            message.url,
        ),
        None => tracing::info!(
            target: TRANSPORT_TARGET,
            logType = message.log_type.as_str(),
            isServer = message.is_server,
            isRequest = message.is_request,
            url = %message.url,
            method = %message.method,
            headers = headers.as_str(),
            body = %body,
            statusCode = message.status_code,
            "[{}] {side} {direction} {} {}",
            message.log_type,
            message.method,
            message.url,
        ),
    }
}
