//! 调用上下文管理
//!
//! [`CallContext`] 是不可变的传播容器：追踪ID、认证身份与自定义声明。
//! 每个 `with_*` 返回遮蔽父值的新上下文，父上下文保持不变（内部以 `Arc` 共享，写时复制）。
//!
//! 与 Web 框架无关的环境访问使用 `tokio::task_local`：入口中间件调用 [`scope`]，
//! 下游代码（格式化器、出站客户端）通过 [`current`] 读取。
//! task-local 不会被 `tokio::spawn` 继承，派生任务时请显式传入上下文。

use crate::trace_id::{SpanId, TraceId};
use crate::traceparent::TraceContext;
use futures_util::Stream;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, Mutex};
use std::task::{Context, Poll};
use tokio::task_local;

task_local! {
    static CURRENT_CONTEXT: CallContext;
}

/// 受管理的上下文键
///
/// 受管理的键会自动跨 gRPC 元数据与消息属性传播。键名被驻留为 `&'static str`，
/// 因此键本身可以按值复制。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManagedKey(&'static str);

impl ManagedKey {
    pub const TOKEN: ManagedKey = ManagedKey("token");
    pub const USER_ID: ManagedKey = ManagedKey("userId");
    pub const USERNAME: ManagedKey = ManagedKey("username");
    pub const FULL_NAME: ManagedKey = ManagedKey("fullName");
    pub const EMAIL: ManagedKey = ManagedKey("email");
    pub const REALM: ManagedKey = ManagedKey("realm");
    pub const ROLES: ManagedKey = ManagedKey("roles");
    pub const TERMINAL_ID: ManagedKey = ManagedKey("terminalId");
    pub const PROVIDER_ID: ManagedKey = ManagedKey("providerId");

    const WELL_KNOWN: [ManagedKey; 9] = [
        Self::TOKEN,
        Self::USER_ID,
        Self::USERNAME,
        Self::FULL_NAME,
        Self::EMAIL,
        Self::REALM,
        Self::ROLES,
        Self::TERMINAL_ID,
        Self::PROVIDER_ID,
    ];

    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// gRPC 元数据要求小写键名
    pub fn metadata_key(&self) -> String {
        self.0.to_ascii_lowercase()
    }
}

impl fmt::Display for ManagedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// 进程级、只增不减的受管理键集合
static MANAGED_KEYS: LazyLock<Mutex<BTreeSet<ManagedKey>>> =
    LazyLock::new(|| Mutex::new(ManagedKey::WELL_KNOWN.into_iter().collect()));

/// 声明一个自定义声明键，幂等且线程安全
pub fn register_managed_key(name: &str) -> ManagedKey {
    let mut keys = MANAGED_KEYS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = keys.iter().find(|k| k.0 == name) {
        return *existing;
    }
    let key = ManagedKey(Box::leak(name.to_owned().into_boxed_str()));
    keys.insert(key);
    key
}

/// 按名称查找已注册的键
pub fn lookup_managed_key(name: &str) -> Option<ManagedKey> {
    let keys = MANAGED_KEYS.lock().unwrap_or_else(|e| e.into_inner());
    keys.iter().find(|k| k.0 == name).copied()
}

/// 当前所有受管理键的快照
pub fn managed_keys() -> Vec<ManagedKey> {
    let keys = MANAGED_KEYS.lock().unwrap_or_else(|e| e.into_inner());
    keys.iter().copied().collect()
}

#[derive(Clone, Default, PartialEq, Eq)]
struct Identity {
    token: Option<String>,
    user_id: Option<String>,
    username: Option<String>,
    full_name: Option<String>,
    email: Option<String>,
    realm: Option<String>,
    roles: Option<Vec<String>>,
    terminal_id: Option<String>,
    provider_id: Option<String>,
}

/// 请求级调用上下文
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    trace: TraceContext,
    identity: Arc<Identity>,
    custom: Arc<BTreeMap<ManagedKey, String>>,
}

macro_rules! string_field {
    ($with:ident, $get:ident, $field:ident) => {
        #[doc = concat!("返回设置了 `", stringify!($field), "` 的子上下文")]
        pub fn $with(&self, value: impl Into<String>) -> Self {
            let mut next = self.clone();
            Arc::make_mut(&mut next.identity).$field = Some(value.into());
            next
        }

        pub fn $get(&self) -> Option<&str> {
            self.identity.$field.as_deref()
        }
    };
}

impl CallContext {
    /// 仅携带追踪信息的根上下文
    pub fn new(trace: TraceContext) -> Self {
        Self {
            trace,
            ..Self::default()
        }
    }

    /// 以全新 trace 创建根上下文
    pub fn new_root() -> Self {
        Self::new(TraceContext::new_root())
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.trace.span_id
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.trace.parent_span_id
    }

    /// 替换追踪信息，身份与声明保持不变
    pub fn with_trace(&self, trace: TraceContext) -> Self {
        let mut next = self.clone();
        next.trace = trace;
        next
    }

    /// 为出站调用派生子 span
    pub fn child(&self) -> Self {
        self.with_trace(self.trace.child())
    }

    /// 当前 span 的 `traceparent`
    pub fn traceparent(&self) -> String {
        self.trace.traceparent()
    }

    string_field!(with_token, token, token);
    string_field!(with_user_id, user_id, user_id);
    string_field!(with_username, username, username);
    string_field!(with_full_name, full_name, full_name);
    string_field!(with_email, email, email);
    string_field!(with_realm, realm, realm);
    string_field!(with_terminal_id, terminal_id, terminal_id);
    string_field!(with_provider_id, provider_id, provider_id);

    pub fn with_roles<I, S>(&self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        Arc::make_mut(&mut next.identity).roles = Some(roles.into_iter().map(Into::into).collect());
        next
    }

    pub fn roles(&self) -> Option<&[String]> {
        self.identity.roles.as_deref()
    }

    /// 按受管理键设置值；内建键写入对应字段，`roles` 按逗号切分
    pub fn with_value(&self, key: ManagedKey, value: impl Into<String>) -> Self {
        let value = value.into();
        match key {
            ManagedKey::TOKEN => self.with_token(value),
            ManagedKey::USER_ID => self.with_user_id(value),
            ManagedKey::USERNAME => self.with_username(value),
            ManagedKey::FULL_NAME => self.with_full_name(value),
            ManagedKey::EMAIL => self.with_email(value),
            ManagedKey::REALM => self.with_realm(value),
            ManagedKey::TERMINAL_ID => self.with_terminal_id(value),
            ManagedKey::PROVIDER_ID => self.with_provider_id(value),
            ManagedKey::ROLES => self.with_roles(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_owned)
                    .collect::<Vec<_>>(),
            ),
            custom => {
                let mut next = self.clone();
                Arc::make_mut(&mut next.custom).insert(custom, value);
                next
            }
        }
    }

    /// 按受管理键读取值的字符串形式
    pub fn value(&self, key: ManagedKey) -> Option<String> {
        match key {
            ManagedKey::TOKEN => self.token().map(str::to_owned),
            ManagedKey::USER_ID => self.user_id().map(str::to_owned),
            ManagedKey::USERNAME => self.username().map(str::to_owned),
            ManagedKey::FULL_NAME => self.full_name().map(str::to_owned),
            ManagedKey::EMAIL => self.email().map(str::to_owned),
            ManagedKey::REALM => self.realm().map(str::to_owned),
            ManagedKey::TERMINAL_ID => self.terminal_id().map(str::to_owned),
            ManagedKey::PROVIDER_ID => self.provider_id().map(str::to_owned),
            ManagedKey::ROLES => self.roles().map(|roles| roles.join(",")),
            custom => self.custom.get(&custom).cloned(),
        }
    }

    /// 所有已设置的受管理键值对
    pub fn managed_values(&self) -> Vec<(ManagedKey, String)> {
        managed_keys()
            .into_iter()
            .filter_map(|key| self.value(key).map(|value| (key, value)))
            .collect()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("trace", &self.trace)
            .field("token", &self.identity.token.as_ref().map(|_| "<redacted>"))
            .field("user_id", &self.identity.user_id)
            .field("username", &self.identity.username)
            .field("realm", &self.identity.realm)
            .field("roles", &self.identity.roles)
            .field("custom", &self.custom)
            .finish()
    }
}

/// 仅保留追踪ID的全新根上下文
///
/// 用于派生需要比调用方活得更久的后台任务（例如审计日志写入），
/// 这样请求取消或结束都不会影响它们。
pub fn new_context_from_trace_parent(ctx: &CallContext) -> CallContext {
    CallContext::new(TraceContext::from_ids(ctx.trace_id(), ctx.span_id()))
}

/// 获取当前上下文
///
/// 不在任何作用域内时返回空的根上下文（追踪ID全零）。
/// 这里不能打日志：日志格式化器本身会调用它。
pub fn current() -> CallContext {
    CURRENT_CONTEXT
        .try_with(CallContext::clone)
        .unwrap_or_default()
}

/// 获取当前上下文，不在作用域内时返回 `None`
pub fn try_current() -> Option<CallContext> {
    CURRENT_CONTEXT.try_with(CallContext::clone).ok()
}

/// 在指定的上下文中执行异步操作
pub async fn scope<F, T>(ctx: CallContext, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT_CONTEXT.scope(ctx, future).await
}

/// 在指定的上下文中执行同步闭包
pub fn sync_scope<F, T>(ctx: CallContext, f: F) -> T
where
    F: FnOnce() -> T,
{
    CURRENT_CONTEXT.sync_scope(ctx, f)
}

/// 每次轮询时都处于给定上下文中的流
///
/// 用于流式响应：处理函数返回后，流仍会在作用域之外被轮询。
pub struct ScopedStream<S> {
    ctx: CallContext,
    inner: Pin<Box<S>>,
}

/// 包装流，使其每次轮询都能读到 `ctx`
pub fn scoped_stream<S: Stream>(ctx: CallContext, stream: S) -> ScopedStream<S> {
    ScopedStream {
        ctx,
        inner: Box::pin(stream),
    }
}

impl<S: Stream> Stream for ScopedStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let ctx = this.ctx.clone();
        let inner = &mut this.inner;
        CURRENT_CONTEXT.sync_scope(ctx, || inner.as_mut().poll_next(cx))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_with_field_shadows_parent() {
        let parent = CallContext::new_root().with_username("alice");
        let child = parent.with_username("bob").with_email("bob@example.com");

        assert_eq!(parent.username(), Some("alice"));
        assert_eq!(parent.email(), None);
        assert_eq!(child.username(), Some("bob"));
        assert_eq!(child.email(), Some("bob@example.com"));
        assert_eq!(child.trace_id(), parent.trace_id());
    }

    #[test]
    fn test_register_managed_key_is_idempotent() {
        let first = register_managed_key("branchCode");
        let second = register_managed_key("branchCode");
        assert_eq!(first, second);
        assert_eq!(lookup_managed_key("branchCode"), Some(first));
        assert!(managed_keys().contains(&ManagedKey::USER_ID));
    }

    #[test]
    fn test_value_roundtrip_through_managed_keys() {
        let key = register_managed_key("merchantId");
        let ctx = CallContext::new_root()
            .with_value(key, "M-1")
            .with_value(ManagedKey::ROLES, "admin, viewer")
            .with_value(ManagedKey::USER_ID, "u-1");

        assert_eq!(ctx.value(key).as_deref(), Some("M-1"));
        assert_eq!(ctx.roles().unwrap(), ["admin", "viewer"]);
        assert_eq!(ctx.value(ManagedKey::ROLES).as_deref(), Some("admin,viewer"));
        assert_eq!(ctx.user_id(), Some("u-1"));

        let values = ctx.managed_values();
        assert!(values.contains(&(key, "M-1".to_string())));
    }

    #[test]
    fn test_new_context_from_trace_parent_drops_identity() {
        let ctx = CallContext::new_root().with_token("secret").with_user_id("u-1");
        let forked = new_context_from_trace_parent(&ctx);
        assert_eq!(forked.trace_id(), ctx.trace_id());
        assert_eq!(forked.span_id(), ctx.span_id());
        assert_eq!(forked.token(), None);
        assert_eq!(forked.user_id(), None);
    }

    #[test]
    fn test_debug_redacts_token() {
        let ctx = CallContext::new_root().with_token("very-secret");
        let rendered = format!("{ctx:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    /// 验证在没有上下文时，current 返回全零的根上下文
    #[tokio::test]
    async fn test_current_outside_scope() {
        assert!(try_current().is_none());
        assert!(current().trace_id().is_zero());
    }

    /// 验证 scope 在整个异步作用域内（包括 await 点之后）都保持上下文
    #[tokio::test]
    async fn test_scope_persists_across_await() {
        let expected = CallContext::new_root().with_user_id("u-42");

        let result = scope(expected.clone(), async {
            assert_eq!(current(), expected);
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(current().user_id(), Some("u-42"));
            "done"
        })
        .await;

        assert_eq!(result, "done");
        assert!(try_current().is_none(), "上下文不应泄漏到作用域之外");
    }

    /// 验证嵌套上下文的覆盖和恢复
    #[tokio::test]
    async fn test_nested_scope() {
        let outer = CallContext::new_root();
        let inner = outer.child();

        scope(outer.clone(), async {
            assert_eq!(current(), outer);
            scope(inner.clone(), async {
                assert_eq!(current(), inner);
            })
            .await;
            assert_eq!(current(), outer);
        })
        .await;
    }

    #[tokio::test]
    async fn test_scoped_stream_sees_context_when_polled_outside() {
        let ctx = CallContext::new_root().with_username("streamer");
        let stream = futures_util::stream::iter(0..3)
            .map(|_| current().username().map(str::to_owned));
        let seen: Vec<_> = scoped_stream(ctx, stream).collect().await;
        assert_eq!(seen, vec![Some("streamer".to_string()); 3]);
    }
}
