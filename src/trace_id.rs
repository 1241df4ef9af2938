//! TraceId / SpanId 核心结构体定义

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// 高性能追踪ID生成器
///
/// 使用时间戳 + 原子计数器的组合，生成符合W3C TraceContext规范的128位ID
static COUNTER: AtomicU64 = AtomicU64::new(0);

/// 机器ID，基于进程ID和启动时间戳生成，确保不同进程/实例的ID不冲突
static MACHINE_ID: LazyLock<u16> = LazyLock::new(|| {
    let pid = std::process::id();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    ((pid ^ timestamp) & 0xFFFF) as u16
});

/// 追踪ID（128位，W3C trace-id）
///
/// 全零值是合法的"缺失"占位符：解析失败时使用它，而不是中断请求。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TraceId(u128);

impl TraceId {
    /// 全零追踪ID
    pub const ZERO: TraceId = TraceId(0);

    /// 生成新的追踪ID（符合 W3C TraceContext 规范）
    ///
    /// 结构：timestamp(48位) + machine_id(16位) + counter(32位) + random(32位)
    #[inline]
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
        let machine_id = *MACHINE_ID;
        let random_part = fastrand::u32(..);

        let high_64 = ((timestamp & 0xFFFF_FFFF_FFFF) << 16) | (machine_id as u64);
        let low_64 = ((counter & 0xFFFF_FFFF) << 32) | (random_part as u64);

        Self(((high_64 as u128) << 64) | low_64 as u128)
    }

    /// 从字符串创建追踪ID，并进行 W3C TraceContext 规范校验
    ///
    /// # 校验规则
    /// - 长度必须是 32 个字符
    /// - 只能包含小写十六进制字符（0-9, a-f）
    /// - 不能全为零
    #[inline]
    pub fn from_string_validated(id: &str) -> Option<Self> {
        if id.len() != 32 || !is_valid_hex_bytes(id.as_bytes()) {
            return None;
        }
        match u128::from_str_radix(id, 16) {
            Ok(0) | Err(_) => None,
            Ok(value) => Some(Self(value)),
        }
    }

    /// 从原始数值创建
    #[inline]
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// 原始数值
    #[inline]
    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    /// 是否为全零占位符
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// 跨度ID（64位，W3C parent-id）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpanId(u64);

impl SpanId {
    /// 全零跨度ID
    pub const ZERO: SpanId = SpanId(0);

    /// 生成新的随机跨度ID，保证非零
    #[inline]
    pub fn new() -> Self {
        loop {
            let value = fastrand::u64(..);
            if value != 0 {
                return Self(value);
            }
        }
    }

    /// 校验规则同 [`TraceId::from_string_validated`]，长度为 16
    #[inline]
    pub fn from_string_validated(id: &str) -> Option<Self> {
        if id.len() != 16 || !is_valid_hex_bytes(id.as_bytes()) {
            return None;
        }
        match u64::from_str_radix(id, 16) {
            Ok(0) | Err(_) => None,
            Ok(value) => Some(Self(value)),
        }
    }

    #[inline]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// 高性能字节级十六进制字符验证
///
/// 使用字节比较避免Unicode处理开销，只接受小写
#[inline]
fn is_valid_hex_bytes(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|&b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_creation() {
        let trace_id = TraceId::new();
        let id_str = trace_id.to_string();

        // 验证长度：必须是 32 个字符
        assert_eq!(id_str.len(), 32);

        // 验证只包含小写十六进制字符
        assert!(id_str
            .chars()
            .all(|c| c.is_ascii_hexdigit() && (c.is_ascii_digit() || c.is_ascii_lowercase())));

        // 验证不全为零
        assert!(!trace_id.is_zero());
    }

    #[test]
    fn test_trace_id_display_pads_leading_zeros() {
        let trace_id = TraceId::from_u128(0xab);
        assert_eq!(trace_id.to_string(), "000000000000000000000000000000ab");
        assert_eq!(TraceId::ZERO.to_string(), "0".repeat(32));
    }

    #[test]
    fn test_from_string_validated() {
        let valid_id = "0af7651916cd43dd8448eb211c80319c";
        let parsed = TraceId::from_string_validated(valid_id).unwrap();
        assert_eq!(parsed.to_string(), valid_id);

        // 长度不正确
        assert_eq!(TraceId::from_string_validated("short"), None);
        assert_eq!(
            TraceId::from_string_validated("toolongtraceidentifierthatexceeds32chars"),
            None
        );

        // 包含大写字符
        assert_eq!(
            TraceId::from_string_validated("0AF7651916CD43DD8448EB211C80319C"),
            None
        );

        // 包含非十六进制字符
        assert_eq!(
            TraceId::from_string_validated("0af7651916cd43dd8448eb211c80319g"),
            None
        );

        // 全为零
        assert_eq!(
            TraceId::from_string_validated("00000000000000000000000000000000"),
            None
        );
    }

    #[test]
    fn test_span_id_validation() {
        let parsed = SpanId::from_string_validated("b7ad6b7169203331").unwrap();
        assert_eq!(parsed.to_string(), "b7ad6b7169203331");
        assert!(SpanId::from_string_validated("0000000000000000").is_none());
        assert!(SpanId::from_string_validated("b7ad6b716920333").is_none());
        assert!(SpanId::from_string_validated("B7AD6B7169203331").is_none());
    }

    #[test]
    fn test_trace_id_uniqueness() {
        let mut ids = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(ids.insert(TraceId::new()), "Generated duplicate trace ID");
        }
    }

    #[test]
    fn test_span_id_never_zero() {
        for _ in 0..1000 {
            let span_id = SpanId::new();
            assert!(!span_id.is_zero());
            assert_eq!(span_id.to_string().len(), 16);
        }
    }
}
