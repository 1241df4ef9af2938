//! 传输审计日志
//!
//! [`TransportLogSink`] 把每条传输记录包装为 [`AuditRecord`] 后送入有界队列，
//! 由唯一的写入任务消费并调用 [`AuditStore::insert`]。
//!
//! - 生产者从不阻塞：队列满时丢弃最旧的待写记录并记录 warn
//! - 写入失败只在本地记录 error 日志，永不返回给调用方
//! - 写入任务在记录自身的追踪ID作用域内执行，不受原请求取消的影响

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryAuditStore;
#[cfg(feature = "postgres")]
pub use postgres::PgAuditStore;

use crate::context::{self, CallContext};
use crate::error::Result;
use crate::logging::{self, Direction, LogKind, TransportMessage};
use crate::trace_id::{SpanId, TraceId};
use crate::traceparent::TraceContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 审计表中的一行
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub id: Uuid,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub kind: LogKind,
    /// 序列化后的 [`TransportMessage`]
    pub log: serde_json::Value,
    pub error_message: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub producer_name: String,
}

impl AuditRecord {
    pub fn new(ctx: &CallContext, message: &TransportMessage, producer_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            trace_id: ctx.trace_id(),
            span_id: ctx.span_id(),
            kind: message.log_type,
            log: message.to_json(),
            error_message: message.error.clone(),
            processed_at: Utc::now(),
            producer_name: producer_name.to_owned(),
        }
    }
}

/// 审计存储
#[async_trait]
pub trait AuditStore: Send + Sync + 'static {
    /// 写入一行；每条记录恰好调用一次
    async fn insert(&self, record: &AuditRecord) -> Result<()>;
}

/// 审计写入端，克隆开销很小
#[derive(Clone)]
pub struct TransportLogSink {
    sender: broadcast::Sender<Arc<AuditRecord>>,
    producer_name: Arc<str>,
}

impl std::fmt::Debug for TransportLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLogSink")
            .field("producer_name", &self.producer_name)
            .field("pending", &self.sender.len())
            .finish()
    }
}

macro_rules! typed_save {
    ($($name:ident => $kind:ident, $direction:ident;)*) => {
        $(
            #[doc = concat!("保存一条 ", stringify!($kind), " ", stringify!($direction), " 记录")]
            pub fn $name(&self, ctx: &CallContext, message: &TransportMessage) {
                self.save_as(LogKind::$kind, Direction::$direction, ctx, message);
            }
        )*
    };
}

impl TransportLogSink {
    /// 创建写入端并在当前 tokio 运行时上启动写入任务
    ///
    /// 返回的 `JoinHandle` 在所有写入端被 drop 且队列排空后结束。
    pub fn start(
        store: Arc<dyn AuditStore>,
        capacity: usize,
        producer_name: impl Into<String>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        let writer = tokio::spawn(run_writer(store, receiver));
        let sink = Self {
            sender,
            producer_name: Arc::from(producer_name.into()),
        };
        (sink, writer)
    }

    pub fn producer_name(&self) -> &str {
        &self.producer_name
    }

    /// 入队一条审计记录，从不阻塞也从不失败
    pub fn save(&self, record: AuditRecord) {
        if self.sender.send(Arc::new(record)).is_err() {
            tracing::error!("audit writer is not running, record dropped");
        }
    }

    /// 由传输记录构造审计记录并入队
    pub fn save_message(&self, ctx: &CallContext, message: &TransportMessage) {
        self.save(AuditRecord::new(ctx, message, &self.producer_name));
    }

    fn save_as(
        &self,
        kind: LogKind,
        direction: Direction,
        ctx: &CallContext,
        message: &TransportMessage,
    ) {
        if message.log_type != kind || message.direction() != direction {
            tracing::debug!(
                expected_kind = kind.as_str(),
                actual_kind = message.log_type.as_str(),
                expected_direction = direction.as_str(),
                "transport message shape differs from helper"
            );
        }
        let mut message = message.clone();
        message.log_type = kind;
        self.save_message(ctx, &message);
    }

    typed_save! {
        save_rest_request => Rest, Request;
        save_rest_response => Rest, Response;
        save_rest_error => Rest, Error;
        save_soap_request => Soap, Request;
        save_soap_response => Soap, Response;
        save_soap_error => Soap, Error;
        save_pubsub_request => PubSub, Request;
        save_pubsub_response => PubSub, Response;
        save_pubsub_error => PubSub, Error;
    }
}

async fn run_writer(store: Arc<dyn AuditStore>, mut receiver: broadcast::Receiver<Arc<AuditRecord>>) {
    loop {
        match receiver.recv().await {
            Ok(record) => {
                let ctx = CallContext::new(TraceContext::from_ids(record.trace_id, record.span_id));
                let result = context::scope(ctx, store.insert(&record)).await;
                if let Err(error) = result {
                    tracing::error!(
                        audit_id = %record.id,
                        kind = record.kind.as_str(),
                        %error,
                        "failed to write audit record"
                    );
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "audit queue full, oldest records dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

const DEFAULT_PAYLOAD_LIMIT: usize = 64 * 1024;

/// 一条传输边的记录出口：标准输出日志和/或审计写入
///
/// 两个出口相互独立，可以都开、都关或只开其一。
#[derive(Debug, Clone)]
pub struct TransportLogger {
    stdout: bool,
    sink: Option<TransportLogSink>,
    payload_limit: usize,
}

impl TransportLogger {
    pub fn new(stdout: bool, sink: Option<TransportLogSink>, payload_limit: usize) -> Self {
        Self {
            stdout,
            sink,
            payload_limit,
        }
    }

    /// 两个出口都关闭
    pub fn disabled() -> Self {
        Self::new(false, None, DEFAULT_PAYLOAD_LIMIT)
    }

    pub fn enabled(&self) -> bool {
        self.stdout || self.sink.is_some()
    }

    pub fn stdout(&self) -> bool {
        self.stdout
    }

    pub fn sink(&self) -> Option<&TransportLogSink> {
        self.sink.as_ref()
    }

    pub fn payload_limit(&self) -> usize {
        self.payload_limit
    }

    /// 在 `ctx` 的作用域内输出记录，保证日志行带上正确的 trace 链接
    pub fn log(&self, ctx: &CallContext, message: &TransportMessage) {
        if self.stdout {
            context::sync_scope(ctx.clone(), || logging::emit(message));
        }
        if let Some(sink) = &self.sink {
            sink.save_message(ctx, message);
        }
    }
}
