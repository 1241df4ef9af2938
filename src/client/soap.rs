//! SOAP 1.1 客户端
//!
//! 按 WSDL 地址缓存客户端：首次调用时拉取 WSDL 并解析 `soap:address location`，
//! 之后复用。每次调用都写出请求、响应与错误三类 `soap` 记录。

use super::rest::{build_http, RestClientOptions};
use crate::context::{self, CallContext};
use crate::error::{Error, Result};
use crate::logging::{headers_from_http, truncate_body, LogKind, TransportMessage};
use crate::sink::TransportLogger;
use crate::traceparent::TRACEPARENT_HEADER;
use http::{header, HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const TEXT_XML: &str = "text/xml; charset=utf-8";
/// `SOAPAction`，头部名大小写不敏感
const SOAP_ACTION: &str = "soapaction";

/// 把消息体片段包进 SOAP 1.1 信封
pub fn envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soap:Envelope xmlns:soap="{SOAP_ENV_NS}"><soap:Body>{body}</soap:Body></soap:Envelope>"#
    )
}

/// 解析 WSDL 中第一个 `address` 元素的 `location`
///
/// 找不到时退回去掉 `?wsdl` 查询串的 WSDL 地址。
pub fn resolve_address(wsdl_url: &str, wsdl: &str) -> String {
    find_elements(wsdl, "address")
        .find_map(|tag| attribute(tag, "location"))
        .map(|location| unescape(&location))
        .unwrap_or_else(|| strip_wsdl_query(wsdl_url))
}

fn strip_wsdl_query(wsdl_url: &str) -> String {
    match wsdl_url.rfind('?') {
        Some(idx) if wsdl_url[idx + 1..].eq_ignore_ascii_case("wsdl") => wsdl_url[..idx].to_owned(),
        _ => wsdl_url.to_owned(),
    }
}

/// 响应中的 `Fault`：返回 `faultstring`（没有时返回整段 Fault）
pub fn fault(xml: &str) -> Option<String> {
    let start = find_elements(xml, "Fault").next()?;
    let offset = xml.find(start)?;
    let fault = &xml[offset..];
    Some(
        element_text(fault, "faultstring")
            .map(|text| unescape(text.trim()))
            .unwrap_or_else(|| fault.to_owned()),
    )
}

/// `Body` 元素的内部 XML
pub fn body_content(xml: &str) -> Option<&str> {
    element_text(xml, "Body").map(str::trim)
}

/// 依次返回本地名为 `local` 的起始标签（含 `<` 与 `>`），忽略命名空间前缀
fn find_elements<'a>(xml: &'a str, local: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    let mut cursor = 0;
    std::iter::from_fn(move || {
        while let Some(pos) = xml[cursor..].find('<') {
            let start = cursor + pos;
            let end = start + xml[start..].find('>')? + 1;
            cursor = end;
            let tag = &xml[start..end];
            if tag_local_name(tag) == Some(local) {
                return Some(tag);
            }
        }
        None
    })
}

fn tag_local_name(tag: &str) -> Option<&str> {
    let inner = tag.strip_prefix('<')?;
    if inner.starts_with(['/', '?', '!']) {
        return None;
    }
    let name = inner
        .split(|c: char| c.is_whitespace() || c == '>' || c == '/')
        .next()?;
    Some(name.rsplit(':').next().unwrap_or(name))
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    let mut rest = tag;
    while let Some(idx) = rest.find(name) {
        let before = rest[..idx].chars().last();
        let after = rest[idx + name.len()..].trim_start();
        rest = &rest[idx + name.len()..];
        if !before.is_some_and(char::is_whitespace) {
            continue;
        }
        let Some(value) = after.strip_prefix('=') else {
            continue;
        };
        let value = value.trim_start();
        let quote = value.chars().next().filter(|c| *c == '"' || *c == '\'')?;
        let value = &value[1..];
        return value.find(quote).map(|end| value[..end].to_owned());
    }
    None
}

/// 第一个本地名为 `local` 的元素的内部文本
fn element_text<'a>(xml: &'a str, local: &str) -> Option<&'a str> {
    let open = find_elements(xml, local).next()?;
    let start = xml.find(open)? + open.len();
    if open.ends_with("/>") {
        return Some("");
    }
    let prefix = open[1..]
        .split(|c: char| c.is_whitespace() || c == '>')
        .next()
        .unwrap_or(local);
    let close = format!("</{prefix}>");
    let end = xml[start..].find(&close)?;
    Some(&xml[start..start + end])
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// 绑定到单个服务端点的 SOAP 客户端
#[derive(Debug, Clone)]
pub struct SoapClient {
    http: reqwest::Client,
    wsdl: String,
    endpoint: String,
    logger: TransportLogger,
}

impl SoapClient {
    /// 拉取 WSDL 并解析服务地址
    pub async fn compile(http: reqwest::Client, wsdl: &str, logger: TransportLogger) -> Result<Self> {
        let response = http.get(wsdl).send().await?.error_for_status()?;
        let document = response.text().await?;
        let endpoint = resolve_address(wsdl, &document);
        tracing::debug!(wsdl, endpoint = %endpoint, "compiled wsdl");
        Ok(Self::with_endpoint(http, wsdl, endpoint, logger))
    }

    pub fn with_endpoint(
        http: reqwest::Client,
        wsdl: impl Into<String>,
        endpoint: impl Into<String>,
        logger: TransportLogger,
    ) -> Self {
        Self {
            http,
            wsdl: wsdl.into(),
            endpoint: endpoint.into(),
            logger,
        }
    }

    pub fn wsdl(&self) -> &str {
        &self.wsdl
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 调用一个操作，返回响应 `Body` 的内部 XML
    ///
    /// 传输失败返回 `Error::Http`，响应中带 `Fault` 返回 `Error::Soap`。
    pub async fn call(&self, ctx: &CallContext, action: &str, body: &str) -> Result<String> {
        let ctx = ctx.child();
        let payload = envelope(body);

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_XML));
        if let Ok(value) = HeaderValue::from_str(&format!("\"{action}\"")) {
            headers.insert(SOAP_ACTION, value);
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.traceparent()) {
            headers.insert(TRACEPARENT_HEADER, value);
        }

        let limit = self.logger.payload_limit();
        let request_record = TransportMessage::request(LogKind::Soap, false, "POST", self.endpoint.as_str())
            .with_headers(headers_from_http(&headers))
            .with_body(&truncate_body(payload.as_bytes(), limit));
        self.logger.log(&ctx, &request_record);

        let request = self.http.post(self.endpoint.as_str()).headers(headers).body(payload);
        let outcome = context::scope(ctx.clone(), async {
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let text = response.text().await?;
            Ok::<_, reqwest::Error>((status, headers, text))
        })
        .await;

        let (status, headers, text) = match outcome {
            Ok(parts) => parts,
            Err(error) => {
                self.logger
                    .log(&ctx, &TransportMessage::error_for(&request_record, error.to_string()));
                return Err(error.into());
            }
        };

        if let Some(fault) = fault(&text) {
            let failed = TransportMessage::error_for(&request_record, fault.clone())
                .with_status(status.as_u16())
                .with_body(&truncate_body(text.as_bytes(), limit));
            self.logger.log(&ctx, &failed);
            return Err(Error::Soap(fault));
        }

        let record = TransportMessage::response_to(&request_record, Some(status.as_u16()))
            .with_headers(headers_from_http(&headers))
            .with_body(&truncate_body(text.as_bytes(), limit));
        self.logger.log(&ctx, &record);

        if !status.is_success() {
            return Err(Error::Http(format!("soap endpoint returned {status}")));
        }
        Ok(body_content(&text).unwrap_or_default().to_owned())
    }
}

/// 按 WSDL 地址缓存的 SOAP 客户端
///
/// 首次插入时的竞争可以接受：重复编译出的客户端功能等价。
#[derive(Debug)]
pub struct SoapClients {
    http: reqwest::Client,
    logger: TransportLogger,
    clients: RwLock<HashMap<String, Arc<SoapClient>>>,
}

impl SoapClients {
    pub fn new(options: RestClientOptions, logger: TransportLogger) -> Result<Self> {
        Ok(Self {
            http: build_http(&options)?,
            logger,
            clients: RwLock::new(HashMap::new()),
        })
    }

    /// 取缓存的客户端，没有时编译
    pub async fn get(&self, wsdl: &str) -> Result<Arc<SoapClient>> {
        if let Some(client) = self.clients.read().await.get(wsdl) {
            return Ok(client.clone());
        }
        let compiled = Arc::new(SoapClient::compile(self.http.clone(), wsdl, self.logger.clone()).await?);
        let mut clients = self.clients.write().await;
        Ok(clients.entry(wsdl.to_owned()).or_insert(compiled).clone())
    }

    /// 预先放入一个客户端（例如地址已知时跳过 WSDL 拉取）
    pub async fn insert(&self, client: SoapClient) -> Arc<SoapClient> {
        let client = Arc::new(client);
        self.clients
            .write()
            .await
            .insert(client.wsdl.clone(), client.clone());
        client
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// 便捷调用：按 WSDL 取客户端后调用
    pub async fn call(&self, ctx: &CallContext, wsdl: &str, action: &str, body: &str) -> Result<String> {
        self.get(wsdl).await?.call(ctx, action, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemoryAuditStore, TransportLogSink};
    use axum::{routing::get, Router};
    use std::time::Duration;

    const WSDL: &str = r#"<?xml version="1.0"?>
<definitions xmlns:soap="http://schemas.xmlsoap.org/wsdl/soap/">
  <service name="Calc">
    <port name="CalcPort" binding="tns:CalcBinding">
      <soap:address location="http://example.com/calc?a=1&amp;b=2"/>
    </port>
  </service>
</definitions>"#;

    #[test]
    fn test_resolve_address() {
        assert_eq!(resolve_address("http://x/calc?wsdl", WSDL), "http://example.com/calc?a=1&b=2");
        assert_eq!(resolve_address("http://x/calc?wsdl", "<definitions/>"), "http://x/calc");
        assert_eq!(resolve_address("http://x/calc?WSDL", "<definitions/>"), "http://x/calc");
    }

    #[test]
    fn test_envelope_and_body() {
        let wrapped = envelope("<Add><a>1</a></Add>");
        assert!(wrapped.contains(SOAP_ENV_NS));
        assert_eq!(body_content(&wrapped), Some("<Add><a>1</a></Add>"));
    }

    #[test]
    fn test_fault_detection() {
        let xml = r#"<s:Envelope xmlns:s="x"><s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>bad &amp; wrong</faultstring></s:Fault></s:Body></s:Envelope>"#;
        assert_eq!(fault(xml).as_deref(), Some("bad & wrong"));
        assert_eq!(fault(&envelope("<ok/>")), None);
    }

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{address}")
    }

    #[tokio::test]
    async fn test_cached_client_calls_endpoint() {
        let router = Router::new()
            .route(
                "/calc",
                get(|| async { "<definitions/>" }).post(|body: String| async move {
                    if body.contains("<Fail/>") {
                        envelope("<soap:Fault><faultstring>nope</faultstring></soap:Fault>")
                    } else {
                        envelope("<AddResult>3</AddResult>")
                    }
                }),
            );
        let base = spawn(router).await;
        let store = Arc::new(MemoryAuditStore::new());
        let (sink, _writer) = TransportLogSink::start(store.clone(), 16, "svc");
        let clients = SoapClients::new(
            RestClientOptions::default(),
            TransportLogger::new(false, Some(sink), 1024),
        )
        .unwrap();

        let wsdl = format!("{base}/calc?wsdl");
        let ctx = CallContext::new_root();
        let result = clients.call(&ctx, &wsdl, "Add", "<Add/>").await.unwrap();
        assert_eq!(result, "<AddResult>3</AddResult>");
        assert_eq!(clients.get(&wsdl).await.unwrap().endpoint(), format!("{base}/calc"));
        assert_eq!(clients.len().await, 1);

        let failed = clients.call(&ctx, &wsdl, "Add", "<Fail/>").await;
        assert!(matches!(failed, Err(Error::Soap(message)) if message == "nope"));

        assert!(store.wait_for(4, Duration::from_secs(2)).await);
        let records = store.records();
        assert!(records.iter().all(|r| r.kind == LogKind::Soap));
        assert_eq!(records[3].error_message.as_deref(), Some("nope"));
    }
}
