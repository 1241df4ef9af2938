//! 发布 / 订阅
//!
//! - [`Publisher`]：编码负载、写入追踪属性、等待服务端分配的消息ID、记录结果
//! - [`SubscriberRegistry`] → [`SubscriberRunner`] → [`SubscriberHandle`]：
//!   先登记并校验所有订阅，全部通过后才开始接收
//! - [`PubSubTransport`]：消息总线的抽象，[`MemoryBus`] 是进程内实现
//!
//! 消息属性约定：
//! - `traceparent`：发布时必带
//! - `originPublishTime`：发布时必带，Asia/Jakarta 时区的 RFC3339 时间
//! - `state`：可选，`start` / `success` / `failed`；`*` 只用作订阅端通配
//! - `googclient_schemaencoding`：总线提供的 Protobuf 编码方式，`BINARY` 或 `JSON`

mod avro;
mod codec;
mod memory;
mod publisher;
mod subscriber;

pub use avro::AvroSchemaRegistry;
pub use codec::{
    decode_with, Codec, DecodeOption, Decoded, JsonDecoder, Payload, ProtoEncoding,
    ProtobufDecoder, AvroDecoder,
};
pub use memory::MemoryBus;
pub use publisher::{origin_publish_time, Publisher, PublishOption};
pub use subscriber::{
    MessageHandler, ReceiveSettings, SubscriberHandle, SubscriberRegistry, SubscriberRunner,
    Subscription,
};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const ATTR_TRACEPARENT: &str = crate::traceparent::TRACEPARENT_HEADER;
pub const ATTR_ORIGIN_PUBLISH_TIME: &str = "originPublishTime";
pub const ATTR_STATE: &str = "state";
pub const ATTR_SCHEMA_ENCODING: &str = "googclient_schemaencoding";

pub const STATE_START: &str = "start";
pub const STATE_SUCCESS: &str = "success";
pub const STATE_FAILED: &str = "failed";
/// 订阅端通配，不作为消息属性取值
pub const STATE_ANY: &str = "*";

/// 消息属性
pub type Attributes = BTreeMap<String, String>;

/// 待发布的消息
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub attributes: Attributes,
}

/// 确认回调，由总线实现
pub trait AckHandler: Send + Sync + 'static {
    fn ack(&self, message_id: &str);
    fn nack(&self, message_id: &str);
}

/// 收到的消息
///
/// `ack` / `nack` 只有第一次调用生效。处理函数负责确认；
/// 状态不匹配与解码失败由订阅循环代为确认。
pub struct ReceivedMessage {
    pub id: String,
    pub subscription: String,
    pub data: Bytes,
    pub attributes: Attributes,
    pub publish_time: DateTime<Utc>,
    pub delivery_attempt: u32,
    acker: Arc<dyn AckHandler>,
    settled: AtomicBool,
}

impl ReceivedMessage {
    pub fn new(
        id: impl Into<String>,
        subscription: impl Into<String>,
        message: OutgoingMessage,
        delivery_attempt: u32,
        acker: Arc<dyn AckHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            subscription: subscription.into(),
            data: message.data,
            attributes: message.attributes,
            publish_time: Utc::now(),
            delivery_attempt,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn state(&self) -> Option<&str> {
        self.attribute(ATTR_STATE)
    }

    pub fn ack(&self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.acker.ack(&self.id);
        }
    }

    pub fn nack(&self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.acker.nack(&self.id);
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("id", &self.id)
            .field("subscription", &self.subscription)
            .field("attributes", &self.attributes)
            .field("len", &self.data.len())
            .field("delivery_attempt", &self.delivery_attempt)
            .finish()
    }
}

/// 消息总线
#[async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    /// 发布并返回服务端分配的消息ID
    async fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<String>;

    async fn subscription_exists(&self, subscription: &str) -> Result<bool>;

    /// 开始拉取；通道关闭表示订阅结束
    async fn receive(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
    ) -> Result<mpsc::Receiver<ReceivedMessage>>;
}
