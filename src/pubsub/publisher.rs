use super::codec::{encode, Codec, Payload, ProtoEncoding};
use super::{
    Attributes, AvroSchemaRegistry, OutgoingMessage, PubSubTransport, ATTR_ORIGIN_PUBLISH_TIME,
    ATTR_SCHEMA_ENCODING, ATTR_STATE, ATTR_TRACEPARENT,
};
use crate::context::{self, new_context_from_trace_parent, CallContext};
use crate::error::{Error, Result};
use crate::logging::{self, LogKind, TransportMessage};
use crate::sink::TransportLogger;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use chrono_tz::Asia::Jakarta;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// 当前时间，Asia/Jakarta 时区的 RFC3339 格式
pub fn origin_publish_time() -> String {
    Utc::now()
        .with_timezone(&Jakarta)
        .to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// 发布选项，按给定顺序作用于消息属性
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOption {
    State(String),
    Attribute(String, String),
}

impl PublishOption {
    pub fn with_state(state: impl Into<String>) -> Self {
        Self::State(state.into())
    }

    pub fn with_attribute(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Attribute(key.into(), value.into())
    }

    fn apply(&self, attributes: &mut Attributes) {
        match self {
            Self::State(state) => {
                attributes.insert(ATTR_STATE.to_owned(), state.clone());
            }
            Self::Attribute(key, value) => {
                attributes.insert(key.clone(), value.clone());
            }
        }
    }
}

/// 按顺序应用发布选项，之后写入 `traceparent` 与 `originPublishTime`
///
/// 这两个属性总是由发布者生成，选项中的同名键会被覆盖。
fn stamp_attributes(ctx: &CallContext, options: &[PublishOption]) -> Attributes {
    let mut attributes = Attributes::new();
    for option in options {
        option.apply(&mut attributes);
    }
    attributes.insert(ATTR_TRACEPARENT.to_owned(), ctx.traceparent());
    attributes.insert(ATTR_ORIGIN_PUBLISH_TIME.to_owned(), origin_publish_time());
    attributes
}

/// 绑定到单个主题的发布者，克隆开销很小
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn PubSubTransport>,
    topic: Arc<str>,
    codec: Option<Codec>,
    registry: Arc<AvroSchemaRegistry>,
    logger: TransportLogger,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(transport: Arc<dyn PubSubTransport>, topic: impl Into<String>) -> Self {
        Self {
            transport,
            topic: Arc::from(topic.into()),
            codec: None,
            registry: Arc::new(AvroSchemaRegistry::new()),
            logger: TransportLogger::disabled(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn with_json_encoder(self) -> Self {
        self.with_codec(Codec::Json)
    }

    pub fn with_avro_encoder(self, schema: impl Into<String>) -> Self {
        self.with_codec(Codec::Avro(schema.into()))
    }

    pub fn with_protobuf_encoder(self, encoding: ProtoEncoding) -> Self {
        self.with_codec(Codec::Protobuf(encoding))
    }

    pub fn with_registry(mut self, registry: Arc<AvroSchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// 成功记录受 `logger` 的标准输出开关控制，失败记录总是输出
    pub fn with_logger(mut self, logger: TransportLogger) -> Self {
        self.logger = logger;
        self
    }

    /// 发布单条消息，返回服务端分配的消息ID
    pub async fn publish(
        &self,
        ctx: &CallContext,
        payload: impl Into<Payload>,
        options: &[PublishOption],
    ) -> Result<String> {
        let ctx = ctx.child();
        let payload = payload.into();

        let mut attributes = stamp_attributes(&ctx, options);
        if let Some(Codec::Protobuf(encoding)) = &self.codec {
            attributes
                .entry(ATTR_SCHEMA_ENCODING.to_owned())
                .or_insert_with(|| encoding.as_str().to_owned());
        }

        let record = TransportMessage::request(LogKind::PubSub, false, "PUBLISH", self.topic.as_ref())
            .with_headers(
                attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), vec![v.clone()]))
                    .collect(),
            );

        let data = match encode(self.codec.as_ref(), &payload, &self.registry) {
            Ok(data) => data,
            Err(error) => {
                self.log_failure(&ctx, &record, &error);
                return Err(error);
            }
        };
        let record = record.with_body(&logging::truncate_body(&data, self.logger.payload_limit()));

        let message = OutgoingMessage {
            data: Bytes::from(data),
            attributes,
        };
        let publish = context::scope(ctx.clone(), self.transport.publish(&self.topic, message)).await;
        match publish {
            Ok(id) => {
                let response = TransportMessage::response_to(&record, None)
                    .with_header("messageId", id.clone());
                self.logger.log(&ctx, &response);
                Ok(id)
            }
            Err(error) => {
                let error = match error {
                    Error::Publish(_) => error,
                    other => Error::Publish(other.to_string()),
                };
                self.log_failure(&ctx, &record, &error);
                Err(error)
            }
        }
    }

    fn log_failure(&self, ctx: &CallContext, record: &TransportMessage, error: &Error) {
        let failed = TransportMessage::error_for(record, error.to_string());
        context::sync_scope(ctx.clone(), || logging::emit(&failed));
        if let Some(sink) = self.logger.sink() {
            sink.save_pubsub_error(ctx, &failed);
        }
    }

    /// 并发发布多条消息
    ///
    /// 每条消息在独立任务与独立上下文中发布，互不取消；
    /// 全部完成后返回，任意一条失败时返回汇总的 `General` 错误。
    pub async fn batch_publish<P>(
        &self,
        ctx: &CallContext,
        payloads: Vec<P>,
        options: &[PublishOption],
    ) -> Result<Vec<String>>
    where
        P: Into<Payload> + Send + 'static,
    {
        let total = payloads.len();
        let mut workers = JoinSet::new();
        for (index, payload) in payloads.into_iter().enumerate() {
            let publisher = self.clone();
            let options = options.to_vec();
            let item_ctx = new_context_from_trace_parent(ctx);
            workers.spawn(context::scope(item_ctx.clone(), async move {
                let result = publisher.publish(&item_ctx, payload, &options).await;
                (index, result)
            }));
        }

        let mut ids = vec![String::new(); total];
        let mut failures: BTreeMap<usize, String> = BTreeMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, Ok(id))) => ids[index] = id,
                Ok((index, Err(error))) => {
                    failures.insert(index, error.to_string());
                }
                Err(join_error) => {
                    tracing::error!(%join_error, "batch publish worker failed");
                    failures.insert(usize::MAX - failures.len(), join_error.to_string());
                }
            }
        }

        if failures.is_empty() {
            return Ok(ids);
        }
        let detail = failures
            .iter()
            .map(|(index, error)| format!("#{index}: {error}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::general(format!(
            "batch publish to {} failed for {} of {total} messages: {detail}",
            self.topic,
            failures.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn test_origin_publish_time_is_jakarta_rfc3339() {
        let value = origin_publish_time();
        let parsed = DateTime::parse_from_rfc3339(&value).unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 7 * 3600);
        assert!(value.ends_with("+07:00"));
    }

    #[test]
    fn test_reserved_attributes_cannot_be_overridden() {
        let ctx = CallContext::new_root();
        let attributes = stamp_attributes(
            &ctx,
            &[
                PublishOption::with_attribute(ATTR_TRACEPARENT, ""),
                PublishOption::with_attribute(ATTR_ORIGIN_PUBLISH_TIME, "x"),
                PublishOption::with_state("start"),
            ],
        );
        assert!(crate::traceparent::is_well_formed(&attributes[ATTR_TRACEPARENT]));
        assert_eq!(attributes[ATTR_TRACEPARENT], ctx.traceparent());
        assert!(DateTime::parse_from_rfc3339(&attributes[ATTR_ORIGIN_PUBLISH_TIME]).is_ok());
        assert_eq!(attributes[ATTR_STATE], "start");
    }

    #[tokio::test]
    async fn test_publish_keeps_reserved_attributes() {
        let bus = Arc::new(crate::pubsub::MemoryBus::new());
        bus.create_topic("orders");
        let publisher = Publisher::new(bus.clone(), "orders");
        publisher
            .publish(
                &CallContext::new_root(),
                "x",
                &[
                    PublishOption::with_attribute(ATTR_TRACEPARENT, ""),
                    PublishOption::with_attribute(ATTR_ORIGIN_PUBLISH_TIME, "x"),
                ],
            )
            .await
            .unwrap();

        let (_, message) = &bus.published("orders")[0];
        assert!(crate::traceparent::is_well_formed(&message.attributes[ATTR_TRACEPARENT]));
        assert!(DateTime::parse_from_rfc3339(&message.attributes[ATTR_ORIGIN_PUBLISH_TIME]).is_ok());
    }

    #[test]
    fn test_options_apply_in_order() {
        let mut attributes = Attributes::new();
        for option in [
            PublishOption::with_state("start"),
            PublishOption::with_attribute("state", "failed"),
            PublishOption::with_attribute("region", "id"),
        ] {
            option.apply(&mut attributes);
        }
        assert_eq!(attributes["state"], "failed");
        assert_eq!(attributes["region"], "id");
    }
}
