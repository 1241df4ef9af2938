use super::{AuthLayer, EnvelopeLayer, LoggingLayer, TraceParentLayer};
use crate::claims::WhitelistSettings;
use crate::config::RestConfig;
use crate::error::{Error, Result};
use crate::response::{ApiResponse, ResponseCode};
use crate::sink::TransportLogger;
use axum::{
    http::{request::Parts, HeaderValue, Method, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};

/// REST 服务装配
///
/// ```ignore
/// let server = RestServer::new("orders", &config.rest, logger)
///     .route(Router::new().route("/v1/orders", get(list_orders)));
/// server.serve(TcpListener::bind(&config.rest.address).await?).await?;
/// ```
pub struct RestServer {
    service_name: String,
    config: RestConfig,
    logger: TransportLogger,
    routes: Router,
}

impl RestServer {
    pub fn new(service_name: impl Into<String>, config: &RestConfig, logger: TransportLogger) -> Self {
        Self {
            service_name: service_name.into(),
            config: config.clone(),
            logger,
            routes: Router::new(),
        }
    }

    /// 合并业务路由
    pub fn route(mut self, router: Router) -> Self {
        self.routes = self.routes.merge(router);
        self
    }

    /// 组装完整的路由：拦截链、未注册 API 回退与 `/health`
    pub fn build(self) -> Router {
        let whitelist = WhitelistSettings::new(
            self.config.whitelist_header.clone(),
            self.config.whitelisted_hosts.clone(),
        );
        let chain = ServiceBuilder::new()
            .layer(TraceParentLayer::new(self.service_name))
            .layer(LoggingLayer::new(self.logger))
            .layer(cors_layer(&self.config.cors_origins))
            .layer(EnvelopeLayer::new())
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(AuthLayer::new(self.config.project_claims, whitelist));

        self.routes
            .fallback(api_not_registered)
            .layer(chain)
            .route("/health", get(health))
    }

    /// 在给定监听器上运行，收到 Ctrl-C 后优雅退出
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let address = listener.local_addr()?;
        tracing::info!(%address, "rest server listening");
        axum::serve(listener, self.build())
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        tracing::info!("rest server stopped");
        Ok(())
    }

    /// 绑定配置中的地址并运行
    pub async fn bind_and_serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.address)
            .await
            .map_err(|e| Error::Config(format!("cannot bind {}: {e}", self.config.address)))?;
        self.serve(listener).await
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn api_not_registered(method: Method, uri: Uri) -> Response {
    ApiResponse::with_code(
        ResponseCode::API_NOT_REGISTERED,
        Some(json!({ "method": method.as_str(), "path": uri.path() })),
    )
    .into_response()
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = detail, "handler panicked");
    ApiResponse::error(ResponseCode::GENERAL_ERROR).into_response()
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let patterns: Arc<[String]> = origins.iter().map(|o| o.trim().to_owned()).collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _: &Parts| {
            origin
                .to_str()
                .is_ok_and(|origin| patterns.iter().any(|p| origin_matches(p, origin)))
        }))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

/// 来源匹配，`*` 匹配任意长度的字符
pub fn origin_matches(pattern: &str, origin: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return false;
    };
    let Some(mut rest) = origin.strip_prefix(first) else {
        return false;
    };
    let mut segments: Vec<&str> = parts.collect();
    let Some(last) = segments.pop() else {
        // 没有 `*`
        return rest.is_empty();
    };
    for segment in segments {
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
