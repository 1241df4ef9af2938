//! 后端服务的传输可观测性基座
//!
//! 负责调用上下文在各条传输边上的传递与记录：
//! - W3C `traceparent` 的解析、生成与传递，trace / span ID 与身份信息都放在
//!   任务级的 [`CallContext`] 中
//! - REST 服务端拦截链：追踪、请求 / 响应记录、CORS、响应信封、panic 恢复、认证声明
//! - REST / SOAP 出站客户端、gRPC 拦截器、消息总线的发布与订阅
//! - 传输记录同时输出到标准日志与审计存储（[`sink`]）
//!
//! 核心部分与 Web 框架无关；框架集成由 feature 控制：
//! `axum`、`client`（reqwest）、`grpc`（tonic）、`postgres`（sqlx 审计存储）。
//!
//! ## Usage
//!
//! ### 基础用法：采用上游 `traceparent`
//! ```
//! use transport_trace::{CallContext, TraceContext};
//!
//! let upstream = TraceContext::new_root();
//! let header = upstream.traceparent();
//!
//! // 服务端沿用 trace，上游 span 成为父 span
//! let ctx = CallContext::new(TraceContext::from_traceparent(&header));
//! assert_eq!(ctx.trace_id(), upstream.trace_id);
//! assert_eq!(ctx.trace().parent_span_id, Some(upstream.span_id));
//!
//! // 格式错误的头部退化为全零ID，而不是报错
//! let broken = TraceContext::from_traceparent("garbage");
//! assert!(broken.trace_id.is_zero());
//! ```
//!
//! ### Axum 集成（需要启用 axum feature）
//! ```ignore
//! use axum::{routing::get, Router};
//! use transport_trace::{ApiResponse, CallContext, RestServer};
//!
//! async fn handler(ctx: CallContext) -> ApiResponse<String> {
//!     // 直接在函数签名中获取调用上下文
//!     ApiResponse::ok(format!("trace {}", ctx.trace_id()))
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = transport_trace::app::bootstrap()
//!         .await
//!         .unwrap_or_else(|e| transport_trace::logging::fatal(e));
//!     let server = app
//!         .rest_server()
//!         .route(Router::new().route("/v1/hello", get(handler)));
//!     server.bind_and_serve().await.unwrap_or_else(|e| transport_trace::logging::fatal(e));
//!     app.shutdown().await;
//! }
//! ```

mod trace_id;

pub mod app;
pub mod body_clone;
pub mod claims;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod otel;
pub mod pubsub;
pub mod response;
pub mod sink;
pub mod traceparent;

#[cfg(feature = "client")]
pub mod client;

#[cfg(any(feature = "axum", feature = "grpc"))]
pub mod integrations;

pub use context::{current, new_context_from_trace_parent, scope, CallContext, ManagedKey};
pub use error::{Error, Result};
pub use response::{ApiResponse, Pagination, ResponseCode};
pub use trace_id::{SpanId, TraceId};
pub use traceparent::{TraceContext, TRACEPARENT_HEADER};

// -- axum feature --
#[cfg(feature = "axum")]
pub use integrations::axum::{RestServer, TraceParentLayer};

// -- grpc feature --
#[cfg(feature = "grpc")]
pub use integrations::tonic::{ContextInterceptor, GrpcContextLayer};
