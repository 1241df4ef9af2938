//! 响应信封
//!
//! 输出形如 `{"response":{"code":…,"description":…},"pagination":…,"data":…}`。
//! 信封的前缀、处理函数的原始字节与结尾的 `}` 依次写出，处理函数的 JSON 不会被重新解析或序列化。
//!
//! `data` 的取值规则：
//! - 对象、数组、JSON 字符串：原样写入
//! - 字面量 `null` 或空消息体：省略 `data` 字段
//! - 数字与布尔值：原样写入
//! - 其他文本：作为 JSON 字符串写入

use crate::response::{Pagination, ResponseCode, ResponseStatus};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use serde_json::Value;

const DATA_KEY: &[u8] = b",\"data\":";
const CLOSE: &[u8] = b"}";

/// 信封的头部信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    status: ResponseStatus,
    pagination: Option<Pagination>,
}

impl Envelope {
    pub fn new(code: ResponseCode, pagination: Option<Pagination>) -> Self {
        Self {
            status: code.into(),
            pagination,
        }
    }

    /// `{"response":{...}` 以及可选的 `,"pagination":{...}`，不含结尾
    fn head(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(b"{\"response\":{\"code\":");
        out.extend_from_slice(Value::String(self.status.code.clone()).to_string().as_bytes());
        out.extend_from_slice(b",\"description\":");
        out.extend_from_slice(
            Value::String(self.status.description.clone())
                .to_string()
                .as_bytes(),
        );
        out.push(b'}');
        if let Some(p) = &self.pagination {
            out.extend_from_slice(
                format!(
                    ",\"pagination\":{{\"prevPage\":{},\"nextPage\":{},\"totalPage\":{},\"totalItem\":{}}}",
                    p.prev_page, p.next_page, p.total_page, p.total_item
                )
                .as_bytes(),
            );
        }
        out
    }

    /// 带 `,"data":` 的前缀
    pub fn prefix(&self) -> Bytes {
        let mut head = self.head();
        head.extend_from_slice(DATA_KEY);
        Bytes::from(head)
    }

    /// 不含 `data` 的完整信封
    pub fn without_data(&self) -> Bytes {
        let mut head = self.head();
        head.extend_from_slice(CLOSE);
        Bytes::from(head)
    }

    /// 在内存中包装完整消息体
    pub fn wrap_bytes(&self, body: &[u8]) -> Bytes {
        match classify(body) {
            Data::Omit => self.without_data(),
            Data::Verbatim => self.join(body),
            Data::Scalar(bytes) => self.join(&bytes),
        }
    }

    fn join(&self, data: &[u8]) -> Bytes {
        let prefix = self.prefix();
        let mut out = BytesMut::with_capacity(prefix.len() + data.len() + 1);
        out.extend_from_slice(&prefix);
        out.extend_from_slice(data);
        out.extend_from_slice(CLOSE);
        out.freeze()
    }

    /// 渲染一个由值构成的信封（错误响应、回退路由等）
    pub fn render(&self, data: Option<&Value>) -> Bytes {
        match data {
            None | Some(Value::Null) => self.without_data(),
            Some(value) => self.join(value.to_string().as_bytes()),
        }
    }
}

enum Data {
    Omit,
    Verbatim,
    Scalar(Vec<u8>),
}

fn first_significant(body: &[u8]) -> Option<u8> {
    body.iter().copied().find(|b| !b.is_ascii_whitespace())
}

fn classify(body: &[u8]) -> Data {
    match first_significant(body) {
        None => Data::Omit,
        Some(b'{' | b'[' | b'"') => Data::Verbatim,
        Some(_) => {
            let trimmed = body.trim_ascii();
            match serde_json::from_slice::<Value>(trimmed) {
                Ok(Value::Null) => Data::Omit,
                Ok(Value::Number(_) | Value::Bool(_)) => Data::Scalar(trimmed.to_vec()),
                _ => Data::Scalar(
                    Value::String(String::from_utf8_lossy(trimmed).into_owned())
                        .to_string()
                        .into_bytes(),
                ),
            }
        }
    }
}

/// 流式包装的结果
pub struct Framed<E> {
    pub body: BoxStream<'static, Result<Bytes, E>>,
    /// 已知时为包装后的精确长度
    pub content_length: Option<u64>,
}

impl<E> std::fmt::Debug for Framed<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framed")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// 流式包装消息体
///
/// 只预读到第一个非空白字节为止；对象、数组与字符串随后直接透传。
/// 标量消息体很小，整体读入后再决定写法。`body_len` 为原消息体的精确长度（若已知）。
pub async fn frame<S, E>(envelope: &Envelope, body: S, body_len: Option<u64>) -> Result<Framed<E>, E>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    let mut body = Box::pin(body);
    let mut head = BytesMut::new();

    let first = loop {
        if let Some(first) = first_significant(&head) {
            break Some(first);
        }
        match body.next().await {
            Some(chunk) => head.extend_from_slice(&chunk?),
            None => break None,
        }
    };

    match first {
        Some(b'{' | b'[' | b'"') => {
            let prefix = envelope.prefix();
            let content_length = body_len.map(|len| prefix.len() as u64 + len + CLOSE.len() as u64);
            let stream = stream::iter([Ok(prefix), Ok(head.freeze())])
                .chain(body)
                .chain(stream::once(async { Ok(Bytes::from_static(CLOSE)) }))
                .boxed();
            Ok(Framed {
                body: stream,
                content_length,
            })
        }
        _ => {
            while let Some(chunk) = body.next().await {
                head.extend_from_slice(&chunk?);
            }
            let wrapped = envelope.wrap_bytes(&head);
            Ok(Framed {
                content_length: Some(wrapped.len() as u64),
                body: stream::once(async move { Ok(wrapped) }).boxed(),
            })
        }
    }
}
