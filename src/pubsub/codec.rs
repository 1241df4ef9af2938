//! 负载编码与解码

use super::{AvroSchemaRegistry, ReceivedMessage, ATTR_SCHEMA_ENCODING};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

/// Protobuf 在总线上的编码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtoEncoding {
    #[default]
    Binary,
    Json,
}

impl ProtoEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "BINARY",
            Self::Json => "JSON",
        }
    }

    pub fn from_attribute(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("BINARY") {
            Some(Self::Binary)
        } else if value.eq_ignore_ascii_case("JSON") {
            Some(Self::Json)
        } else {
            None
        }
    }
}

/// 发布端编码器
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    Json,
    /// 使用注册表中的具名模式
    Avro(String),
    Protobuf(ProtoEncoding),
}

/// 待编码的负载
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// 结构化值；字符串、数字、布尔值在无编码器时按文本形式发送
    Json(Value),
    /// 已编码的 Protobuf 消息，以及可选的 JSON 表示
    Protobuf { binary: Vec<u8>, json: Option<Value> },
}

impl Payload {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|e| Error::Encode(e.to_string()))
    }

    pub fn protobuf<M: prost::Message>(message: &M) -> Self {
        Self::Protobuf {
            binary: message.encode_to_vec(),
            json: None,
        }
    }

    /// 同时携带 JSON 表示，供 `ProtoEncoding::Json` 的主题使用
    pub fn protobuf_with_json<M: prost::Message + Serialize>(message: &M) -> Result<Self> {
        let json = serde_json::to_value(message).map_err(|e| Error::Encode(e.to_string()))?;
        Ok(Self::Protobuf {
            binary: message.encode_to_vec(),
            json: Some(json),
        })
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Json(Value::Null) => "null",
            Self::Json(Value::Bool(_)) => "bool",
            Self::Json(Value::Number(_)) => "number",
            Self::Json(Value::String(_)) => "string",
            Self::Json(Value::Array(_)) => "array",
            Self::Json(Value::Object(_)) => "object",
            Self::Protobuf { .. } => "protobuf",
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Json(Value::String(value.to_owned()))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Json(Value::String(value))
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Self::Json(Value::from(value))
    }
}

impl From<bool> for Payload {
    fn from(value: bool) -> Self {
        Self::Json(Value::Bool(value))
    }
}

/// 按编码器编码负载
///
/// 未配置编码器时只接受原始类型，其他负载返回 `UnsupportedType`。
pub fn encode(codec: Option<&Codec>, payload: &Payload, registry: &AvroSchemaRegistry) -> Result<Vec<u8>> {
    match (codec, payload) {
        (None, Payload::Json(Value::String(s))) => Ok(s.clone().into_bytes()),
        (None, Payload::Json(v @ (Value::Number(_) | Value::Bool(_)))) => Ok(v.to_string().into_bytes()),
        (None, other) => Err(Error::UnsupportedType(other.type_name().to_owned())),

        (Some(Codec::Json), Payload::Json(value))
        | (Some(Codec::Json), Payload::Protobuf { json: Some(value), .. }) => {
            serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
        }
        (Some(Codec::Json), Payload::Protobuf { json: None, .. }) => Err(Error::Encode(
            "protobuf payload has no JSON representation".into(),
        )),

        (Some(Codec::Avro(schema)), Payload::Json(value)) => registry.encode(schema, value),
        (Some(Codec::Avro(_)), other) => Err(Error::UnsupportedType(other.type_name().to_owned())),

        (Some(Codec::Protobuf(ProtoEncoding::Binary)), Payload::Protobuf { binary, .. }) => {
            Ok(binary.clone())
        }
        (Some(Codec::Protobuf(ProtoEncoding::Json)), Payload::Protobuf { json: Some(value), .. }) => {
            serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
        }
        (Some(Codec::Protobuf(encoding)), other) => Err(Error::Encode(format!(
            "cannot encode {} payload as {} protobuf",
            other.type_name(),
            encoding.as_str()
        ))),
    }
}

/// 解码结果，处理函数按具体类型取回
pub struct Decoded(Box<dyn Any + Send + Sync>);

impl Decoded {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn downcast<T: Any>(self) -> std::result::Result<T, Self> {
        match self.0.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(inner) => Err(Self(inner)),
        }
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl fmt::Debug for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Decoded(..)")
    }
}

/// 订阅端解码选项
///
/// 返回 `Ok(None)` 表示不适用，交给下一个选项；返回错误会导致消息被 nack。
pub trait DecodeOption: Send + Sync + 'static {
    fn decode(&self, message: &ReceivedMessage, registry: &AvroSchemaRegistry) -> Result<Option<Decoded>>;
}

fn schema_encoding(message: &ReceivedMessage) -> Option<ProtoEncoding> {
    message
        .attribute(ATTR_SCHEMA_ENCODING)
        .and_then(ProtoEncoding::from_attribute)
}

/// JSON 解码；空消息体与二进制编码的消息不适用
pub struct JsonDecoder<T>(PhantomData<fn() -> T>);

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DecodeOption for JsonDecoder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn decode(&self, message: &ReceivedMessage, _registry: &AvroSchemaRegistry) -> Result<Option<Decoded>> {
        if message.data.is_empty() || schema_encoding(message) == Some(ProtoEncoding::Binary) {
            return Ok(None);
        }
        serde_json::from_slice::<T>(&message.data)
            .map(|value| Some(Decoded::new(value)))
            .map_err(|e| Error::Decode(format!("json: {e}")))
    }
}

/// Avro 解码
pub struct AvroDecoder<T> {
    schema: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AvroDecoder<T> {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            _marker: PhantomData,
        }
    }
}

impl<T> DecodeOption for AvroDecoder<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn decode(&self, message: &ReceivedMessage, registry: &AvroSchemaRegistry) -> Result<Option<Decoded>> {
        if message.data.is_empty() {
            return Ok(None);
        }
        registry
            .decode::<T>(&self.schema, &message.data)
            .map(|value| Some(Decoded::new(value)))
    }
}

/// Protobuf 二进制解码；标记为 JSON 编码的消息不适用
pub struct ProtobufDecoder<M>(PhantomData<fn() -> M>);

impl<M> ProtobufDecoder<M> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<M> Default for ProtobufDecoder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> DecodeOption for ProtobufDecoder<M>
where
    M: prost::Message + Default + Send + Sync + 'static,
{
    fn decode(&self, message: &ReceivedMessage, _registry: &AvroSchemaRegistry) -> Result<Option<Decoded>> {
        if schema_encoding(message) == Some(ProtoEncoding::Json) {
            return Ok(None);
        }
        M::decode(message.data.as_ref())
            .map(|value| Some(Decoded::new(value)))
            .map_err(|e| Error::Decode(format!("protobuf: {e}")))
    }
}

struct FnDecoder<F>(F);

impl<F, T> DecodeOption for FnDecoder<F>
where
    F: Fn(&ReceivedMessage) -> Result<Option<T>> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    fn decode(&self, message: &ReceivedMessage, _registry: &AvroSchemaRegistry) -> Result<Option<Decoded>> {
        (self.0)(message).map(|value| value.map(Decoded::new))
    }
}

/// 由闭包构造解码选项
pub fn decode_with<F, T>(f: F) -> impl DecodeOption
where
    F: Fn(&ReceivedMessage) -> Result<Option<T>> + Send + Sync + 'static,
    T: Any + Send + Sync,
{
    FnDecoder(f)
}
