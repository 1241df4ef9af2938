//! 错误处理和边界情况测试
//!
//! 验证解析失败的降级、审计失败的隔离、错误响应的信封与配置校验

use std::time::Duration;
use transport_trace::config;
use transport_trace::response::ResponseCode;
use transport_trace::traceparent::{self, TraceContext};
use transport_trace::{Error, SpanId, TraceId};

#[cfg(feature = "axum")]
use axum::{
    body::Body,
    extract::Request,
    http::{header, StatusCode},
    routing::get,
    Router,
};
#[cfg(feature = "axum")]
use serde_json::{json, Value};
#[cfg(feature = "axum")]
use std::sync::Arc;
#[cfg(feature = "axum")]
use tower::ServiceExt;
#[cfg(feature = "axum")]
use transport_trace::config::RestConfig;
#[cfg(feature = "axum")]
use transport_trace::sink::{MemoryAuditStore, TransportLogSink, TransportLogger};
#[cfg(feature = "axum")]
use transport_trace::{ApiResponse, RestServer, TRACEPARENT_HEADER};

/// 测试ID验证的边界情况
#[test]
fn test_id_validation_edge_cases() {
    let invalid = [
        "",
        "short",
        "0af7651916cd43dd8448eb211c80319",   // 31 个字符
        "0af7651916cd43dd8448eb211c80319ca", // 33 个字符
        "0AF7651916CD43DD8448EB211C80319C",  // 大写
        "0af7651916cd43dd8448eb211c80319g",  // 非十六进制
        "0af7651916cd43dd8448eb211c80319 ",  // 空格
        "00000000000000000000000000000000",  // 全零
    ];
    for id in invalid {
        assert!(TraceId::from_string_validated(id).is_none(), "应当拒绝: {id:?}");
    }
    assert!(TraceId::from_string_validated("0af7651916cd43dd8448eb211c80319c").is_some());

    assert!(SpanId::from_string_validated("b7ad6b7169203331").is_some());
    assert!(SpanId::from_string_validated("0000000000000000").is_none());
    assert!(SpanId::from_string_validated("b7ad6b716920333").is_none());
}

/// 测试格式错误的 traceparent 退化为全零ID而不是报错
#[test]
fn test_malformed_traceparent_degrades_to_zero() {
    for value in ["", "garbage", "00-xyz-abc-01"] {
        let ctx = TraceContext::from_traceparent(value);
        assert!(ctx.trace_id.is_zero(), "应当退化为全零: {value:?}");
        assert_eq!(ctx.parent_span_id, Some(SpanId::ZERO));
        assert!(!ctx.span_id.is_zero(), "服务端 span 总是新生成的");
    }

    // trace 合法、span 缺失
    let (trace_id, span_id) = traceparent::parse("00-0af7651916cd43dd8448eb211c80319c");
    assert!(!trace_id.is_zero());
    assert!(span_id.is_zero());

    // 缺失的ID格式化为全零
    assert_eq!(
        traceparent::format(TraceId::ZERO, SpanId::ZERO),
        "00-00000000000000000000000000000000-0000000000000000-01"
    );
    assert!(!traceparent::is_well_formed("00-xyz-abc-01"));
}

/// 测试错误到响应码的映射
#[test]
fn test_error_response_codes() {
    assert_eq!(Error::Http("down".into()).response_code(), ResponseCode::EXTERNAL_SERVICE_ERROR);
    assert_eq!(Error::Decode("bad".into()).response_code(), ResponseCode::DECODE_FAILED);
    assert_eq!(Error::Publish("x".into()).response_code(), ResponseCode::PUBLISH_FAILED);
    assert_eq!(Error::Claims("x".into()).response_code(), ResponseCode::GENERAL_ERROR);
    assert_eq!(
        Error::AvroSchemaNotFound("User".into()).to_string(),
        "avro schema not found: User"
    );
}

/// 测试配置校验失败
#[test]
fn test_config_validation_errors() {
    let dir = tempfile::tempdir().unwrap();

    let path = dir.path().join("empty-name.yaml");
    std::fs::write(&path, "serviceName: \"\"\n").unwrap();
    assert!(matches!(config::load(&path), Err(Error::Config(_))));

    let path = dir.path().join("zero-limit.yaml");
    std::fs::write(&path, "serviceName: orders\nlog:\n  payloadLogSizeLimit: 0\n").unwrap();
    assert!(matches!(config::load(&path), Err(Error::Config(_))));

    // 文件缺失时使用默认值
    let loaded = config::load(dir.path().join("absent.yaml")).unwrap();
    assert_eq!(loaded.rest.whitelist_header, "X-Forwarded-Host");
}

#[cfg(feature = "axum")]
async fn failing_handler() -> Result<ApiResponse<Value>, Error> {
    Err(Error::Http("upstream refused".into()))
}

#[cfg(feature = "axum")]
async fn not_found() -> ApiResponse<Value> {
    ApiResponse::with_code(ResponseCode::DATA_NOT_FOUND, None)
}

#[cfg(feature = "axum")]
async fn raw() -> ApiResponse<Value> {
    ApiResponse::ok(json!({"plain": true})).raw()
}

#[cfg(feature = "axum")]
async fn ok() -> ApiResponse<Value> {
    ApiResponse::ok(json!({"ok": true}))
}

#[cfg(feature = "axum")]
fn app(logger: TransportLogger) -> Router {
    RestServer::new("svc", &RestConfig::default(), logger)
        .route(
            Router::new()
                .route("/v1/fail", get(failing_handler))
                .route("/v1/missing", get(not_found))
                .route("/v1/raw", get(raw))
                .route("/v1/ok", get(ok)),
        )
        .build()
}

#[cfg(feature = "axum")]
async fn call(router: Router, request: Request) -> (StatusCode, Option<String>, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let header = response
        .headers()
        .get(TRACEPARENT_HEADER)
        .map(|v| v.to_str().unwrap().to_owned());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, header, serde_json::from_slice(&body).unwrap())
}

#[cfg(feature = "axum")]
fn get_request(uri: &str) -> Request {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// 测试处理函数返回的错误被渲染为信封
#[cfg(feature = "axum")]
#[tokio::test]
async fn test_handler_error_is_enveloped() {
    let (status, _, body) = call(app(TransportLogger::disabled()), get_request("/v1/fail")).await;
    let code = ResponseCode::EXTERNAL_SERVICE_ERROR;
    assert_eq!(status, code.status());
    assert_eq!(body["response"]["code"], code.code());
    assert!(body.get("data").is_none());

    let (status, _, body) = call(app(TransportLogger::disabled()), get_request("/v1/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"response": {"code": "0005", "description": "data not found"}}));
}

/// 测试原样输出的响应不包信封
#[cfg(feature = "axum")]
#[tokio::test]
async fn test_raw_response_passes_through() {
    let (status, _, body) = call(app(TransportLogger::disabled()), get_request("/v1/raw")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"plain": true}));
}

/// 测试格式错误的 traceparent 不会中断请求
#[cfg(feature = "axum")]
#[tokio::test]
async fn test_malformed_traceparent_request_still_served() {
    let request = Request::builder()
        .uri("/v1/ok")
        .header(TRACEPARENT_HEADER, "not-a-traceparent")
        .body(Body::empty())
        .unwrap();
    let (status, header, body) = call(app(TransportLogger::disabled()), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({"ok": true}));
    assert!(header
        .unwrap()
        .starts_with("00-00000000000000000000000000000000-"));
}

/// 测试审计存储失败不影响响应
#[cfg(feature = "axum")]
#[tokio::test]
async fn test_audit_failure_does_not_change_response() {
    let healthy = Arc::new(MemoryAuditStore::new());
    let failing = Arc::new(MemoryAuditStore::new());
    failing.set_failing(true);

    let mut bodies = Vec::new();
    for store in [healthy.clone(), failing.clone()] {
        let (sink, _writer) = TransportLogSink::start(store, 16, "svc");
        let (status, _, body) = call(
            app(TransportLogger::new(false, Some(sink), 1024)),
            get_request("/v1/ok"),
        )
        .await;
        bodies.push((status, body));
    }
    assert_eq!(bodies[0], bodies[1]);

    assert!(healthy.wait_for(2, Duration::from_secs(2)).await);
    // 失败的存储仍被尝试写入，但没有记录
    for _ in 0..100 {
        if failing.attempts() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(failing.attempts(), 2);
    assert!(failing.is_empty());
}

/// 测试无法解析的令牌被拒绝，响应仍带 traceparent
#[cfg(feature = "axum")]
#[tokio::test]
async fn test_invalid_token_rejected() {
    let request = Request::builder()
        .uri("/v1/ok")
        .header(header::AUTHORIZATION, "Bearer a.%%%.c")
        .body(Body::empty())
        .unwrap();
    let (status, header, body) = call(app(TransportLogger::disabled()), request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["response"]["code"], "0001");
    assert!(header.is_some());
}
