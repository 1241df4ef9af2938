//! 认证头部与令牌声明投影

use super::failure_response;
use crate::claims::{self, WhitelistSettings};
use crate::context::{self, CallContext};
use crate::response::ResponseCode;
use axum::{
    extract::{Query, Request},
    http::header,
    response::Response,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// 最内层：把认证信息与声明写入上下文后再调用处理函数
///
/// 认证头或令牌无法解析时中断请求，返回 `GeneralError`。
#[derive(Clone, Debug)]
pub struct AuthLayer {
    settings: Arc<AuthSettings>,
}

#[derive(Debug)]
struct AuthSettings {
    project_claims: bool,
    whitelist: WhitelistSettings,
}

impl AuthLayer {
    pub fn new(project_claims: bool, whitelist: WhitelistSettings) -> Self {
        Self {
            settings: Arc::new(AuthSettings {
                project_claims,
                whitelist,
            }),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            settings: self.settings.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthService<S> {
    inner: S,
    settings: Arc<AuthSettings>,
}

impl<S> Service<Request> for AuthService<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
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

    fn call(&mut self, mut req: Request) -> Self::Future {
        let base = req
            .extensions()
            .get::<CallContext>()
            .cloned()
            .unwrap_or_else(context::current);

        let ctx = match authorize(&self.settings, &base, &req) {
            Ok(ctx) => ctx,
            Err(error) => {
                tracing::warn!(%error, "rejecting request with invalid credentials");
                return Box::pin(async { Ok(failure_response(ResponseCode::GENERAL_ERROR)) });
            }
        };

        req.extensions_mut().insert(ctx.clone());
        let future = context::sync_scope(ctx.clone(), || self.inner.call(req));
        Box::pin(context::scope(ctx, future))
    }
}

fn authorize(settings: &AuthSettings, base: &CallContext, req: &Request) -> crate::Result<CallContext> {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let ctx = claims::apply_authorization(base, authorization)?;
    if !settings.project_claims {
        return Ok(ctx);
    }

    let host = req
        .headers()
        .get(settings.whitelist.header.as_str())
        .and_then(|v| v.to_str().ok());
    claims::project(&ctx, host, &settings.whitelist, || {
        let headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)));
        let query = Query::<Vec<(String, String)>>::try_from_uri(req.uri())
            .map(|Query(pairs)| pairs)
            .unwrap_or_default();
        claims::pseudo_claims(headers, query)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get, Router};
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;
    use serde_json::json;
    use tower::ServiceExt;

    async fn whoami(ctx: CallContext) -> String {
        format!(
            "{}|{}|{}",
            ctx.username().unwrap_or("-"),
            ctx.user_id().unwrap_or("-"),
            ctx.terminal_id().unwrap_or("-")
        )
    }

    fn app(whitelist: WhitelistSettings) -> Router {
        Router::new()
            .route("/me", get(whoami))
            .layer(AuthLayer::new(true, whitelist))
    }

    async fn body_of(router: Router, request: Request) -> (u16, String) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status().as_u16();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn token(claims: serde_json::Value) -> String {
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("eyJhbGciOiJub25lIn0.{payload}.sig")
    }

    #[tokio::test]
    async fn test_bearer_claims_are_projected() {
        let request = Request::builder()
            .uri("/me")
            .header(
                header::AUTHORIZATION,
                format!(
                    "Bearer {}",
                    token(json!({"sub": "u-1", "preferred_username": "alice"}))
                ),
            )
            .body(Body::empty())
            .unwrap();
        let (status, body) = body_of(app(WhitelistSettings::default()), request).await;
        assert_eq!(status, 200);
        assert_eq!(body, "alice|u-1|-");
    }

    #[tokio::test]
    async fn test_basic_sets_username() {
        let request = Request::builder()
            .uri("/me")
            .header(header::AUTHORIZATION, format!("Basic {}", STANDARD.encode("bob:secret")))
            .body(Body::empty())
            .unwrap();
        let (_, body) = body_of(app(WhitelistSettings::default()), request).await;
        assert!(body.starts_with("bob|"));
    }

    #[tokio::test]
    async fn test_whitelisted_host_uses_pseudo_claims() {
        let whitelist = WhitelistSettings::new("X-Forwarded-Host", vec!["internal.local".to_owned()]);
        let request = Request::builder()
            .uri("/me?terminalId=T-9")
            .header("x-forwarded-host", "INTERNAL.local")
            .body(Body::empty())
            .unwrap();
        let (_, body) = body_of(app(whitelist.clone()), request).await;
        assert_eq!(body, "-|-|T-9");

        let request = Request::builder()
            .uri("/me?terminalId=T-9")
            .header("x-forwarded-host", "other.local")
            .body(Body::empty())
            .unwrap();
        let (_, body) = body_of(app(whitelist), request).await;
        assert_eq!(body, "-|-|-");
    }

    #[tokio::test]
    async fn test_malformed_token_is_rejected() {
        let request = Request::builder()
            .uri("/me")
            .header(header::AUTHORIZATION, "Bearer not-a-jwt")
            .body(Body::empty())
            .unwrap();
        let (status, body) = body_of(app(WhitelistSettings::default()), request).await;
        assert_eq!(status, 500);
        assert!(body.contains("\"0001\""));
    }
}
