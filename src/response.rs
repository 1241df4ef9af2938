//! 响应码表、分页与处理函数声明的响应
//!
//! 响应码是四位补零的字符串，来自固定枚举并映射到 HTTP 状态码。
//! [`ResponseCode`] 是开放结构体：服务可以追加自己的常量。

use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 响应码：业务码、描述与 HTTP 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode {
    code: u16,
    description: &'static str,
    status: StatusCode,
}

macro_rules! response_codes {
    ($($name:ident = ($code:expr, $desc:expr, $status:ident);)*) => {
        impl ResponseCode {
            $(pub const $name: ResponseCode = ResponseCode::new($code, $desc, StatusCode::$status);)*

            /// 内建响应码表
            pub const BUILTIN: &'static [ResponseCode] = &[$(ResponseCode::$name),*];
        }
    };
}

response_codes! {
    SUCCESS = (0, "success", OK);
    GENERAL_ERROR = (1, "general error", INTERNAL_SERVER_ERROR);
    INVALID_REQUEST = (2, "invalid request", BAD_REQUEST);
    UNAUTHORIZED = (3, "unauthorized", UNAUTHORIZED);
    FORBIDDEN = (4, "forbidden", FORBIDDEN);
    DATA_NOT_FOUND = (5, "data not found", NOT_FOUND);
    API_NOT_REGISTERED = (6, "API not registered", NOT_FOUND);
    DUPLICATE_DATA = (7, "duplicate data", CONFLICT);
    TIMEOUT = (8, "timeout", GATEWAY_TIMEOUT);
    SERVICE_UNAVAILABLE = (9, "service unavailable", SERVICE_UNAVAILABLE);
    INVALID_TOKEN = (10, "invalid token", UNAUTHORIZED);
    TOKEN_EXPIRED = (11, "token expired", UNAUTHORIZED);
    VALIDATION_ERROR = (12, "validation error", BAD_REQUEST);
    METHOD_NOT_ALLOWED = (13, "method not allowed", METHOD_NOT_ALLOWED);
    PAYLOAD_TOO_LARGE = (14, "payload too large", PAYLOAD_TOO_LARGE);
    UNSUPPORTED_MEDIA_TYPE = (15, "unsupported media type", UNSUPPORTED_MEDIA_TYPE);
    TOO_MANY_REQUESTS = (16, "too many requests", TOO_MANY_REQUESTS);
    CONFLICT = (17, "conflict", CONFLICT);
    INVALID_STATE = (18, "invalid state", UNPROCESSABLE_ENTITY);
    EXTERNAL_SERVICE_ERROR = (19, "external service error", BAD_GATEWAY);
    DATABASE_ERROR = (20, "database error", INTERNAL_SERVER_ERROR);
    PUBLISH_FAILED = (21, "publish failed", INTERNAL_SERVER_ERROR);
    DECODE_FAILED = (22, "decode failed", BAD_REQUEST);
    ENCODE_FAILED = (23, "encode failed", INTERNAL_SERVER_ERROR);
    INVALID_PAGE_NUMBER = (24, "invalid page number", BAD_REQUEST);
    PAGE_SIZE_EXCEEDS_MAX_LIMIT = (25, "page size exceeds max limit", BAD_REQUEST);
}

impl ResponseCode {
    /// 定义新的响应码（追加到服务自己的表中）
    pub const fn new(code: u16, description: &'static str, status: StatusCode) -> Self {
        Self {
            code,
            description,
            status,
        }
    }

    /// 四位补零的业务码，例如 `0000`
    pub fn code(&self) -> String {
        format!("{:04}", self.code)
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// 对应的 span 状态：5xx 为错误
    pub fn span_status(&self) -> SpanStatus {
        SpanStatus::from_http(self.status)
    }

    /// 为未声明响应码的响应挑选默认码
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            s if s.is_success() => Self::SUCCESS,
            StatusCode::BAD_REQUEST => Self::INVALID_REQUEST,
            StatusCode::UNAUTHORIZED => Self::UNAUTHORIZED,
            StatusCode::FORBIDDEN => Self::FORBIDDEN,
            StatusCode::NOT_FOUND => Self::DATA_NOT_FOUND,
            StatusCode::METHOD_NOT_ALLOWED => Self::METHOD_NOT_ALLOWED,
            StatusCode::CONFLICT => Self::CONFLICT,
            StatusCode::PAYLOAD_TOO_LARGE => Self::PAYLOAD_TOO_LARGE,
            StatusCode::UNSUPPORTED_MEDIA_TYPE => Self::UNSUPPORTED_MEDIA_TYPE,
            StatusCode::UNPROCESSABLE_ENTITY => Self::INVALID_STATE,
            StatusCode::TOO_MANY_REQUESTS => Self::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY => Self::EXTERNAL_SERVICE_ERROR,
            StatusCode::SERVICE_UNAVAILABLE => Self::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT => Self::TIMEOUT,
            s => Self::new(Self::GENERAL_ERROR.code, Self::GENERAL_ERROR.description, s),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04} {}", self.code, self.description)
    }
}

/// 信封中的 `response` 对象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub code: String,
    pub description: String,
}

impl From<ResponseCode> for ResponseStatus {
    fn from(code: ResponseCode) -> Self {
        Self {
            code: code.code(),
            description: code.description().to_owned(),
        }
    }
}

/// 分页信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub prev_page: u64,
    pub next_page: u64,
    pub total_page: u64,
    pub total_item: u64,
}

impl Pagination {
    /// 根据当前页（从 1 开始）、每页条数和总条数计算
    pub fn compute(page: u64, page_size: u64, total_item: u64) -> Self {
        let total_page = if page_size == 0 {
            0
        } else {
            total_item.div_ceil(page_size)
        };
        Self {
            prev_page: page.saturating_sub(1),
            next_page: if page < total_page { page + 1 } else { 0 },
            total_page,
            total_item,
        }
    }
}

/// OpenTelemetry 风格的 span 状态，作为 `otel.status_code` 字段记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    pub fn from_http(status: StatusCode) -> Self {
        if status.is_server_error() {
            Self::Error
        } else {
            Self::Ok
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "UNSET",
            Self::Ok => "OK",
            Self::Error => "ERROR",
        }
    }
}

/// 处理函数声明的响应所附带的元信息
///
/// 信封层据此决定业务码与分页，优先于从 HTTP 状态推断的默认值。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseMeta {
    pub code: ResponseCode,
    pub pagination: Option<Pagination>,
}

/// 标记：响应体原样透传，不包信封
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawResponse;

/// 处理函数声明的响应
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub code: ResponseCode,
    pub pagination: Option<Pagination>,
    pub data: Option<T>,
    pub is_raw: bool,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self::with_code(ResponseCode::SUCCESS, Some(data))
    }

    pub fn with_code(code: ResponseCode, data: Option<T>) -> Self {
        Self {
            code,
            pagination: None,
            data,
            is_raw: false,
        }
    }

    pub fn paginated(data: T, pagination: Pagination) -> Self {
        Self {
            pagination: Some(pagination),
            ..Self::ok(data)
        }
    }

    /// 响应体原样输出，不包信封
    pub fn raw(mut self) -> Self {
        self.is_raw = true;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    pub fn span_status(&self) -> SpanStatus {
        self.code.span_status()
    }

    pub fn meta(&self) -> ResponseMeta {
        ResponseMeta {
            code: self.code,
            pagination: self.pagination,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(code: ResponseCode) -> Self {
        Self::with_code(code, None)
    }
}
