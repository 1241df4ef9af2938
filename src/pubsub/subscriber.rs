use super::codec::{DecodeOption, Decoded};
use super::{AvroSchemaRegistry, PubSubTransport, ReceivedMessage, ATTR_TRACEPARENT, STATE_ANY};
use crate::context::{self, CallContext};
use crate::error::{Error, Result};
use crate::logging::{LogKind, TransportMessage};
use crate::sink::TransportLogger;
use crate::traceparent::TraceContext;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

/// 接收时消息体超过该大小则不打印
const RECEIVE_LOG_BODY_LIMIT: usize = 64 * 1024;

/// 拉取设置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSettings {
    pub max_outstanding_messages: usize,
    pub max_outstanding_bytes: usize,
    /// 同时执行的处理函数数量
    pub num_workers: usize,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            max_outstanding_messages: 1000,
            max_outstanding_bytes: 1_000_000_000,
            num_workers: 10,
        }
    }
}

/// 订阅处理函数，负责 ack / nack
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: CallContext, message: ReceivedMessage, decoded: Option<Decoded>);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(CallContext, ReceivedMessage, Option<Decoded>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, ctx: CallContext, message: ReceivedMessage, decoded: Option<Decoded>) {
        (self)(ctx, message, decoded).await
    }
}

/// 一个已登记的订阅
pub struct Subscription {
    id: String,
    /// 小写；`*` 表示不过滤
    state: String,
    decoders: Vec<Arc<dyn DecodeOption>>,
    handler: Arc<dyn MessageHandler>,
    settings: ReceiveSettings,
}

impl Subscription {
    pub fn new(id: impl Into<String>, handler: impl MessageHandler) -> Self {
        Self {
            id: id.into(),
            state: STATE_ANY.to_owned(),
            decoders: Vec::new(),
            handler: Arc::new(handler),
            settings: ReceiveSettings::default(),
        }
    }

    /// 只处理 `state` 属性等于给定值（忽略大小写）的消息
    pub fn with_state(mut self, state: impl AsRef<str>) -> Self {
        self.state = state.as_ref().trim().to_lowercase();
        self
    }

    /// 追加解码选项，按追加顺序尝试
    pub fn with_decoder(mut self, decoder: impl DecodeOption) -> Self {
        self.decoders.push(Arc::new(decoder));
        self
    }

    pub fn with_settings(mut self, settings: ReceiveSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// 状态过滤：通配或忽略大小写相等
    pub fn accepts_state(&self, state: Option<&str>) -> bool {
        self.state == STATE_ANY
            || state.is_some_and(|s| s.trim().to_lowercase() == self.state)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("decoders", &self.decoders.len())
            .field("settings", &self.settings)
            .finish()
    }
}

/// 登记阶段
pub struct SubscriberRegistry {
    transport: Arc<dyn PubSubTransport>,
    registry: Arc<AvroSchemaRegistry>,
    logger: TransportLogger,
    subscriptions: Vec<Subscription>,
}

impl SubscriberRegistry {
    pub fn new(transport: Arc<dyn PubSubTransport>) -> Self {
        Self {
            transport,
            registry: Arc::new(AvroSchemaRegistry::new()),
            logger: TransportLogger::disabled(),
            subscriptions: Vec::new(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<AvroSchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_logger(mut self, logger: TransportLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn subscribe(&mut self, subscription: Subscription) -> &mut Self {
        self.subscriptions.push(subscription);
        self
    }

    /// 不过滤状态的订阅
    pub fn receive<I>(&mut self, id: &str, decoders: I, handler: impl MessageHandler) -> &mut Self
    where
        I: IntoIterator<Item = Arc<dyn DecodeOption>>,
    {
        self.receive_with_state(id, STATE_ANY, decoders, handler)
    }

    pub fn receive_with_state<I>(
        &mut self,
        id: &str,
        state: &str,
        decoders: I,
        handler: impl MessageHandler,
    ) -> &mut Self
    where
        I: IntoIterator<Item = Arc<dyn DecodeOption>>,
    {
        let mut subscription = Subscription::new(id, handler).with_state(state);
        subscription.decoders.extend(decoders);
        self.subscribe(subscription)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// 并发校验所有订阅都存在
    ///
    /// 任意一个缺失即返回 `SubscriptionNotFound`，调用方应视为启动失败。
    pub async fn validate(self) -> Result<SubscriberRunner> {
        let mut checks = JoinSet::new();
        for subscription in &self.subscriptions {
            let transport = self.transport.clone();
            let id = subscription.id.clone();
            checks.spawn(async move {
                let exists = transport.subscription_exists(&id).await;
                (id, exists)
            });
        }

        let mut first_error = None;
        while let Some(joined) = checks.join_next().await {
            let outcome = match joined {
                Ok((_, Ok(true))) => continue,
                Ok((id, Ok(false))) => Error::SubscriptionNotFound(id),
                Ok((_, Err(error))) => error,
                Err(join_error) => Error::general(join_error.to_string()),
            };
            tracing::error!(error = %outcome, "subscription validation failed");
            first_error.get_or_insert(outcome);
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        tracing::info!(count = self.subscriptions.len(), "all subscriptions validated");
        Ok(SubscriberRunner {
            transport: self.transport,
            shared: Arc::new(Shared {
                registry: self.registry,
                logger: self.logger,
            }),
            subscriptions: self.subscriptions,
        })
    }
}

struct Shared {
    registry: Arc<AvroSchemaRegistry>,
    logger: TransportLogger,
}

/// 已校验、尚未开始接收
pub struct SubscriberRunner {
    transport: Arc<dyn PubSubTransport>,
    shared: Arc<Shared>,
    subscriptions: Vec<Subscription>,
}

impl SubscriberRunner {
    /// 为每个订阅启动一个接收循环
    pub fn start(self) -> SubscriberHandle {
        let (shutdown, signal) = watch::channel(false);
        let mut loops = JoinSet::new();
        for subscription in self.subscriptions {
            loops.spawn(receive_loop(
                self.transport.clone(),
                self.shared.clone(),
                Arc::new(subscription),
                signal.clone(),
            ));
        }
        SubscriberHandle { shutdown, loops }
    }
}

/// 运行中的订阅
///
/// drop 时接收循环会被中止；需要等待处理函数结束时调用 [`SubscriberHandle::shutdown`]。
pub struct SubscriberHandle {
    shutdown: watch::Sender<bool>,
    loops: JoinSet<()>,
}

impl SubscriberHandle {
    /// 停止接收，等待正在执行的处理函数结束
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.loops.join_next().await {
            if let Err(error) = joined {
                tracing::error!(%error, "subscription loop panicked");
            }
        }
    }

    /// 等待所有接收循环自行结束
    pub async fn join(mut self) {
        while self.loops.join_next().await.is_some() {}
    }
}

async fn receive_loop(
    transport: Arc<dyn PubSubTransport>,
    shared: Arc<Shared>,
    subscription: Arc<Subscription>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut messages = match transport.receive(&subscription.id, &subscription.settings).await {
        Ok(messages) => messages,
        Err(error) => {
            tracing::error!(subscription = %subscription.id, %error, "failed to start receiving");
            return;
        }
    };
    let workers = subscription.settings.num_workers.max(1);
    let permits = Arc::new(Semaphore::new(workers));
    tracing::info!(subscription = %subscription.id, workers, "receiving");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = messages.recv() => {
                let Some(message) = next else { break };
                let Ok(permit) = permits.clone().acquire_owned().await else { break };
                let shared = shared.clone();
                let subscription = subscription.clone();
                tokio::spawn(async move {
                    dispatch(&shared, &subscription, message).await;
                    drop(permit);
                });
            }
        }
    }

    // 等待执行中的处理函数
    let _ = permits.acquire_many(workers as u32).await;
    tracing::info!(subscription = %subscription.id, "stopped receiving");
}

async fn dispatch(shared: &Shared, subscription: &Subscription, message: ReceivedMessage) {
    let trace = match message.attribute(ATTR_TRACEPARENT) {
        Some(traceparent) => TraceContext::from_traceparent(traceparent),
        None => TraceContext::new_root(),
    };
    let ctx = CallContext::new(trace);
    let span = tracing::info_span!(
        "pubsub receive",
        otel.name = %format!("pubsub receive {}", subscription.id),
        otel.kind = "consumer",
        subscription = %subscription.id,
        message_id = %message.id,
        trace_id = %ctx.trace_id(),
    );
    crate::otel::set_parent(&span, ctx.trace());

    context::scope(ctx.clone(), process(shared, subscription, ctx, message))
        .instrument(span)
        .await
}

async fn process(shared: &Shared, subscription: &Subscription, ctx: CallContext, message: ReceivedMessage) {
    if shared.logger.enabled() {
        let mut record = TransportMessage::request(LogKind::PubSub, true, "RECEIVE", &subscription.id)
            .with_headers(
                message
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), vec![v.clone()]))
                    .collect(),
            )
            .with_header("messageId", message.id.clone());
        if message.data.len() < RECEIVE_LOG_BODY_LIMIT {
            record = record.with_body(&message.data);
        }
        shared.logger.log(&ctx, &record);
    }

    if !subscription.accepts_state(message.state()) {
        tracing::debug!(
            filter = %subscription.state,
            state = message.state().unwrap_or_default(),
            "state filter mismatch, acking without dispatch"
        );
        message.ack();
        return;
    }

    let mut decoded = None;
    for decoder in &subscription.decoders {
        match decoder.decode(&message, &shared.registry) {
            Ok(Some(value)) => {
                decoded = Some(value);
                break;
            }
            Ok(None) => continue,
            Err(error) => {
                tracing::error!(%error, "failed to decode message, nacking");
                message.nack();
                return;
            }
        }
    }

    subscription.handler.handle(ctx, message, decoded).await;
}
