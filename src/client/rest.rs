use crate::config::RestConfig;
use crate::context::{self, CallContext};
use crate::error::{Error, Result};
use crate::logging::{headers_from_http, truncate_body, LogKind, TransportMessage};
use crate::sink::TransportLogger;
use crate::traceparent::TRACEPARENT_HEADER;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

const APPLICATION_JSON: &str = "application/json";

/// 出站 HTTP 客户端
///
/// 每个请求派生子 span、携带 `traceparent`，并写出请求 / 响应 / 错误记录。
/// 健康检查地址（`/v?/health`）不记录。
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    logger: TransportLogger,
}

/// 客户端选项
#[derive(Debug, Clone, Default)]
pub struct RestClientOptions {
    pub timeout: Option<Duration>,
    /// 跳过 TLS 证书校验
    pub insecure_skip_verify: bool,
}

impl From<&RestConfig> for RestClientOptions {
    fn from(config: &RestConfig) -> Self {
        Self {
            timeout: config.timeout(),
            insecure_skip_verify: config.insecure_skip_verify,
        }
    }
}

impl RestClient {
    pub fn new(options: RestClientOptions, logger: TransportLogger) -> Result<Self> {
        let http = build_http(&options)?;
        Ok(Self { http, logger })
    }

    /// 复用已有的 reqwest 客户端
    pub fn with_http(http: reqwest::Client, logger: TransportLogger) -> Self {
        Self { http, logger }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn logger(&self) -> &TransportLogger {
        &self.logger
    }

    /// 绑定到 `ctx` 的请求构造器，默认 JSON 内容类型
    pub fn new_request(&self, ctx: &CallContext, method: Method, url: impl Into<String>) -> RestRequest<'_> {
        RestRequest {
            client: self,
            ctx: ctx.clone(),
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(&self, ctx: &CallContext, url: impl Into<String>) -> RestRequest<'_> {
        self.new_request(ctx, Method::GET, url)
    }

    pub fn post(&self, ctx: &CallContext, url: impl Into<String>) -> RestRequest<'_> {
        self.new_request(ctx, Method::POST, url)
    }

    pub fn put(&self, ctx: &CallContext, url: impl Into<String>) -> RestRequest<'_> {
        self.new_request(ctx, Method::PUT, url)
    }

    pub fn delete(&self, ctx: &CallContext, url: impl Into<String>) -> RestRequest<'_> {
        self.new_request(ctx, Method::DELETE, url)
    }
}

pub(crate) fn build_http(options: &RestClientOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(options.insecure_skip_verify);
    if let Some(timeout) = options.timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

/// 待发送的请求
#[derive(Debug)]
pub struct RestRequest<'a> {
    client: &'a RestClient,
    ctx: CallContext,
    method: Method,
    url: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    body: Bytes,
}

impl RestRequest<'_> {
    /// 非法的头部名或值会被忽略并记录 warn
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => tracing::warn!(header = name, "ignoring invalid request header"),
        }
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.body = Bytes::from(serde_json::to_vec(value)?);
        Ok(self)
    }

    pub async fn send(self) -> Result<RestResponse> {
        let RestRequest {
            client,
            ctx,
            method,
            url,
            mut headers,
            query,
            body,
        } = self;

        let ctx = ctx.child();
        if let Ok(value) = HeaderValue::from_str(&ctx.traceparent()) {
            headers.insert(TRACEPARENT_HEADER, value);
        }
        headers
            .entry(header::CONTENT_TYPE)
            .or_insert(HeaderValue::from_static(APPLICATION_JSON));

        let logger = &client.logger;
        let logged = !is_health_check(&url);
        let request_record = TransportMessage::request(LogKind::Rest, false, method.as_str(), url.as_str())
            .with_headers(headers_from_http(&headers))
            .with_body(&truncate_body(&body, logger.payload_limit()));
        if logged {
            logger.log(&ctx, &request_record);
        }

        let request = client
            .http
            .request(method, url.as_str())
            .headers(headers)
            .query(&query)
            .body(body);
        let outcome = context::scope(ctx.clone(), async {
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(RestResponse { status, headers, body })
        })
        .await;

        match outcome {
            Ok(response) => {
                if logged {
                    let record = TransportMessage::response_to(&request_record, Some(response.status.as_u16()))
                        .with_headers(headers_from_http(&response.headers))
                        .with_body(&truncate_body(&response.body, logger.payload_limit()));
                    logger.log(&ctx, &record);
                }
                Ok(response)
            }
            Err(error) => {
                if logged {
                    logger.log(&ctx, &TransportMessage::error_for(&request_record, error.to_string()));
                }
                Err(error.into())
            }
        }
    }
}

/// 已读完消息体的响应
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RestResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// 非 2xx 时返回 `Error::Http`
    pub fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(Error::Http(format!("unexpected status {}: {}", self.status, self.text())))
        }
    }
}

/// 路径形如 `/v<任意一个字符>/health`
pub fn is_health_check(url: &str) -> bool {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_owned(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_owned(),
    };
    let Some(rest) = path.strip_prefix("/v") else {
        return false;
    };
    let mut chars = rest.chars();
    chars.next().is_some() && chars.as_str() == "/health"
}
