//! 错误类型

use crate::response::ResponseCode;

/// 本 crate 的统一错误
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 启动期配置缺失或非法，走 fatal 路径
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unsupported payload type: {0}")]
    UnsupportedType(String),

    #[error("avro schema not found: {0}")]
    AvroSchemaNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("soap fault: {0}")]
    Soap(String),

    #[error("invalid claims: {0}")]
    Claims(String),

    #[error("{0}")]
    General(String),
}

/// 本 crate 的结果类型
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn general(message: impl Into<String>) -> Self {
        Self::General(message.into())
    }

    /// 渲染到响应信封时使用的响应码
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Self::Decode(_) | Self::Json(_) => ResponseCode::DECODE_FAILED,
            Self::Encode(_) | Self::UnsupportedType(_) | Self::AvroSchemaNotFound(_) => {
                ResponseCode::ENCODE_FAILED
            }
            Self::Publish(_) => ResponseCode::PUBLISH_FAILED,
            Self::Http(_) | Self::Soap(_) => ResponseCode::EXTERNAL_SERVICE_ERROR,
            Self::Config(_)
            | Self::Io(_)
            | Self::SubscriptionNotFound(_)
            | Self::Claims(_)
            | Self::General(_) => ResponseCode::GENERAL_ERROR,
        }
    }
}

#[cfg(feature = "client")]
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
