//! W3C `traceparent` 编解码
//!
//! 线上格式固定为 `00-<32位小写十六进制>-<16位小写十六进制>-01`，
//! 版本号与标志位都是字面量。解析失败从不拒绝请求：记录 warn 日志并以全零ID代替。

use crate::trace_id::{SpanId, TraceId};
use std::fmt;

/// HTTP 头部 / 消息属性 / gRPC 元数据中的字段名
pub const TRACEPARENT_HEADER: &str = "traceparent";

const VERSION: &str = "00";
const FLAGS: &str = "01";

/// 一条调用边上的追踪上下文
///
/// 在同一个 span 内不可变；每条出站边通过 [`TraceContext::child`] 派生新的 span。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
}

impl TraceContext {
    /// 生成全新的根上下文（新的 trace，新的 span）
    pub fn new_root() -> Self {
        Self {
            trace_id: TraceId::new(),
            span_id: SpanId::new(),
            parent_span_id: None,
        }
    }

    /// 采用上游的 `traceparent`：沿用其 trace，上游 span 成为父 span
    pub fn from_traceparent(value: &str) -> Self {
        let (trace_id, parent) = parse(value);
        Self {
            trace_id,
            span_id: SpanId::new(),
            parent_span_id: Some(parent),
        }
    }

    /// 仅携带给定ID的上下文，不派生新 span
    pub fn from_ids(trace_id: TraceId, span_id: SpanId) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id: None,
        }
    }

    /// 派生子 span
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::new(),
            parent_span_id: Some(self.span_id),
        }
    }

    /// 当前 span 对应的 `traceparent` 字符串
    pub fn traceparent(&self) -> String {
        format(self.trace_id, self.span_id)
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{VERSION}-{}-{}-{FLAGS}", self.trace_id, self.span_id)
    }
}

/// 解析 `traceparent`
///
/// 按 `-` 切分；任一ID无法解码时记录 warn 并以全零ID代替，但仍返回可用的值。
pub fn parse(value: &str) -> (TraceId, SpanId) {
    let mut parts = value.trim().split('-');
    let _version = parts.next();
    let raw_trace = parts.next().unwrap_or_default();
    let raw_span = parts.next().unwrap_or_default();

    let trace_id = TraceId::from_string_validated(raw_trace).unwrap_or_else(|| {
        tracing::warn!(traceparent = %value, "invalid trace id in traceparent, using zero id");
        TraceId::ZERO
    });
    let span_id = SpanId::from_string_validated(raw_span).unwrap_or_else(|| {
        tracing::warn!(traceparent = %value, "invalid span id in traceparent, using zero id");
        SpanId::ZERO
    });
    (trace_id, span_id)
}

/// 格式化 `traceparent`，缺失的ID输出全零
pub fn format(trace_id: TraceId, span_id: SpanId) -> String {
    format!("{VERSION}-{trace_id}-{span_id}-{FLAGS}")
}

/// 判断字符串是否为格式良好的 `traceparent`（四段，ID为小写十六进制）
pub fn is_well_formed(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    parts.len() == 4
        && parts[0].len() == 2
        && parts[3].len() == 2
        && parts[1].len() == 32
        && parts[2].len() == 16
        && parts[1..3]
            .iter()
            .all(|p| p.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    #[test]
    fn test_parse_valid() {
        let (trace_id, span_id) = parse(SAMPLE);
        assert_eq!(trace_id.to_string(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(span_id.to_string(), "b7ad6b7169203331");
    }

    #[test]
    fn test_parse_invalid_substitutes_zero() {
        let (trace_id, span_id) = parse("garbage");
        assert!(trace_id.is_zero());
        assert!(span_id.is_zero());

        // 只有 span 损坏时，trace 仍被保留
        let (trace_id, span_id) = parse("00-0af7651916cd43dd8448eb211c80319c-zzzz-01");
        assert!(!trace_id.is_zero());
        assert!(span_id.is_zero());
    }

    #[test]
    fn test_format_always_four_fields() {
        assert_eq!(
            format(TraceId::ZERO, SpanId::ZERO),
            "00-00000000000000000000000000000000-0000000000000000-01"
        );
        let (trace_id, span_id) = parse(SAMPLE);
        assert_eq!(format(trace_id, span_id), SAMPLE);
        assert!(is_well_formed(&format(TraceId::new(), SpanId::new())));
    }

    #[test]
    fn test_from_traceparent_adopts_trace_and_parent() {
        let ctx = TraceContext::from_traceparent(SAMPLE);
        assert_eq!(ctx.trace_id.to_string(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(ctx.parent_span_id.unwrap().to_string(), "b7ad6b7169203331");
        assert_ne!(ctx.span_id.to_string(), "b7ad6b7169203331");
        assert!(is_well_formed(&ctx.traceparent()));
    }

    #[test]
    fn test_child_keeps_trace() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, Some(root.span_id));
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.to_string(), child.traceparent());
    }

    #[test]
    fn test_is_well_formed_rejects_bad_shapes() {
        assert!(is_well_formed(SAMPLE));
        assert!(!is_well_formed("00-abc-def-01"));
        assert!(!is_well_formed("0af7651916cd43dd8448eb211c80319c"));
        assert!(!is_well_formed(
            "00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01"
        ));
    }
}
