//! 流式消息体克隆
//!
//! 把一个长度未知或可能很大的消息体复制为两份：
//! - 原始体：可以从头读取，就像从未被观察过一样
//! - 克隆体：有界的审计副本，最多 `limit + 3` 字节（超限时以 `...` 结尾）
//!
//! 长度未知或超过上限时，原始体先落盘到临时文件 `rest-o-<trace>-<span>-<uuid>`，
//! 避免耗尽内存；超限的克隆体写入第二个临时文件 `rest-c-…`。
//! 两个临时文件都归 [`CloneGuard`] 所有，在 `cleanup` 或 drop 时关闭并删除。

use crate::error::{Error, Result};
use crate::logging::ELLIPSIS;
use crate::traceparent::TraceContext;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use std::io::SeekFrom;
use std::path::Path;
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const CHUNK_SIZE: usize = 64 * 1024;

/// 可从头读取的原始消息体
#[derive(Debug)]
pub enum OriginalBody {
    Empty,
    Memory(Bytes),
    File(tokio::fs::File),
}

impl OriginalBody {
    /// 转换为字节流，供框架重新构造请求体
    pub fn into_stream(self) -> BoxStream<'static, std::io::Result<Bytes>> {
        match self {
            Self::Empty => stream::empty().boxed(),
            Self::Memory(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            Self::File(file) => file_stream(file).boxed(),
        }
    }

    /// 整体读入内存
    pub async fn into_bytes(self) -> std::io::Result<Bytes> {
        read_all(self.into_stream()).await
    }
}

/// 有界的审计副本
#[derive(Debug)]
pub enum ClonedBody {
    Empty,
    Memory(Bytes),
    File(tokio::fs::File),
}

impl ClonedBody {
    pub async fn into_bytes(self) -> std::io::Result<Bytes> {
        match self {
            Self::Empty => Ok(Bytes::new()),
            Self::Memory(bytes) => Ok(bytes),
            Self::File(file) => read_all(file_stream(file)).await,
        }
    }
}

/// 临时文件的所有者
///
/// `cleanup` 幂等；drop 时自动执行，因此所有退出路径（包括 panic 展开）都会释放文件。
#[derive(Debug, Default)]
pub struct CloneGuard {
    paths: Vec<TempPath>,
}

impl CloneGuard {
    /// 关闭并删除所有临时文件
    pub fn cleanup(&mut self) {
        for path in self.paths.drain(..) {
            let temp_path = path.to_path_buf();
            if let Err(error) = path.close() {
                tracing::warn!(path = %temp_path.display(), %error, "failed to remove body clone temp file");
            }
        }
    }

    /// 当前持有的临时文件路径
    pub fn paths(&self) -> Vec<&Path> {
        self.paths.iter().map(|p| p.as_ref()).collect()
    }

    fn track(&mut self, path: TempPath) {
        self.paths.push(path);
    }
}

impl Drop for CloneGuard {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// 一次克隆的结果
#[derive(Debug)]
pub struct BodyClone {
    pub original: OriginalBody,
    pub cloned: ClonedBody,
    pub guard: CloneGuard,
    /// 实测长度
    pub content_length: u64,
    /// 原始体是否已落盘
    pub spilled: bool,
}

impl BodyClone {
    fn empty() -> Self {
        Self {
            original: OriginalBody::Empty,
            cloned: ClonedBody::Empty,
            guard: CloneGuard::default(),
            content_length: 0,
            spilled: false,
        }
    }
}

/// 克隆消息体
///
/// * `content_length` - 声明的长度，`None` 表示未知
/// * `limit` - 审计副本的载荷上限
/// * `trace` - 用于临时文件命名
///
/// I/O 错误会被返回；已创建的临时文件随错误一起释放。
pub async fn clone_body<S, E>(
    content_length: Option<u64>,
    limit: usize,
    trace: &TraceContext,
    body: S,
) -> Result<BodyClone>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send,
    E: std::fmt::Display,
{
    if content_length == Some(0) {
        return Ok(BodyClone::empty());
    }

    let mut body = Box::pin(body);
    let spill = content_length.map_or(true, |len| len > limit as u64);

    if !spill {
        let mut buffer = BytesMut::with_capacity(content_length.unwrap_or_default() as usize);
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk.map_err(stream_error)?);
        }
        let bytes = buffer.freeze();
        let cloned = if bytes.is_empty() {
            ClonedBody::Empty
        } else {
            ClonedBody::Memory(crate::logging::truncate_body(&bytes, limit))
        };
        return Ok(BodyClone {
            content_length: bytes.len() as u64,
            original: if bytes.is_empty() {
                OriginalBody::Empty
            } else {
                OriginalBody::Memory(bytes)
            },
            cloned,
            guard: CloneGuard::default(),
            spilled: false,
        });
    }

    let mut guard = CloneGuard::default();
    let (mut original, spill_path) = create_temp("rest-o", trace, &mut guard)?;

    let mut measured: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(stream_error)?;
        original.write_all(&chunk).await?;
        measured += chunk.len() as u64;
    }
    original.flush().await?;
    original.sync_all().await?;
    original.seek(SeekFrom::Start(0)).await?;

    let cloned = if measured == 0 {
        ClonedBody::Empty
    } else if measured <= limit as u64 {
        ClonedBody::Memory(Bytes::from(tokio::fs::read(&spill_path).await?))
    } else {
        let (mut cloned, _) = create_temp("rest-c", trace, &mut guard)?;
        let mut head = tokio::fs::File::open(&spill_path).await?.take(limit as u64);
        tokio::io::copy(&mut head, &mut cloned).await?;
        cloned.write_all(ELLIPSIS.as_bytes()).await?;
        cloned.flush().await?;
        cloned.sync_all().await?;
        cloned.seek(SeekFrom::Start(0)).await?;
        ClonedBody::File(cloned)
    };

    Ok(BodyClone {
        original: OriginalBody::File(original),
        cloned,
        guard,
        content_length: measured,
        spilled: true,
    })
}

fn create_temp(
    prefix: &str,
    trace: &TraceContext,
    guard: &mut CloneGuard,
) -> Result<(tokio::fs::File, std::path::PathBuf)> {
    let name = format!(
        "{prefix}-{}-{}-{}",
        trace.trace_id,
        trace.span_id,
        uuid::Uuid::new_v4()
    );
    let named = tempfile::Builder::new()
        .prefix(&name)
        .rand_bytes(0)
        .tempfile()?;
    let (file, path) = named.into_parts();
    let path_buf = path.to_path_buf();
    guard.track(path);
    Ok((tokio::fs::File::from_std(file), path_buf))
}

fn stream_error<E: std::fmt::Display>(error: E) -> Error {
    Error::Io(std::io::Error::other(format!("body stream error: {error}")))
}

fn file_stream(file: tokio::fs::File) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    stream::unfold(Some(file), |state| async move {
        let mut file = state?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        match file.read(&mut buffer).await {
            Ok(0) => None,
            Ok(n) => {
                buffer.truncate(n);
                Some((Ok(Bytes::from(buffer)), Some(file)))
            }
            Err(error) => Some((Err(error), None)),
        }
    })
}

async fn read_all<S>(stream: S) -> std::io::Result<Bytes>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    let mut stream = Box::pin(stream);
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}
