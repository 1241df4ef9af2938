//! 配置
//!
//! 加载顺序（后者覆盖前者）：
//! 1. 内建默认值
//! 2. YAML 配置文件（默认 `conf/app.yaml`，可由第一个位置参数覆盖）
//! 3. 以 `APP_` 为前缀的环境变量，`__` 表示嵌套，例如 `APP_LOG__LEVEL=debug`
//!
//! 另外两个约定俗成的环境变量：`LOCAL_RUN` 切换彩色本地日志，
//! `GOOGLE_APPLICATION_CREDENTIALS` 优先于配置中的凭据内容。

use crate::error::{Error, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "conf/app.yaml";

/// 本地运行开关
pub const LOCAL_RUN_ENV: &str = "LOCAL_RUN";

/// 凭据文件路径
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub service_name: String,
    /// 云日志 trace 链接使用的项目ID
    pub project_id: Option<String>,
    pub log: LogConfig,
    pub rest: RestConfig,
    pub pubsub: PubSubConfig,
    pub audit: AuditConfig,
    /// 内联的凭据 JSON
    pub credentials_json: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: "service".to_owned(),
            project_id: None,
            log: LogConfig::default(),
            rest: RestConfig::default(),
            pubsub: PubSubConfig::default(),
            audit: AuditConfig::default(),
            credentials_json: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    /// 默认日志级别，`RUST_LOG` 优先
    pub level: String,
    /// 彩色人类可读输出（由 `LOCAL_RUN` 控制）
    pub local: bool,
    /// 是否把传输记录打印到标准输出
    pub stdout: bool,
    /// 审计副本的载荷大小上限（字节）
    pub payload_log_size_limit: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            local: false,
            stdout: true,
            payload_log_size_limit: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestConfig {
    pub address: String,
    /// 出站请求超时（秒），0 表示不设置
    pub timeout_secs: u64,
    pub insecure_skip_verify: bool,
    /// CORS 允许的来源，支持 `*` 通配
    pub cors_origins: Vec<String>,
    /// 白名单主机：匹配时把头部与查询参数合并为伪声明
    pub whitelisted_hosts: Vec<String>,
    pub whitelist_header: String,
    /// 是否解析令牌声明
    pub project_claims: bool,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_owned(),
            timeout_secs: 30,
            insecure_skip_verify: false,
            cors_origins: Vec::new(),
            whitelisted_hosts: Vec::new(),
            whitelist_header: "X-Forwarded-Host".to_owned(),
            project_claims: true,
        }
    }
}

impl RestConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PubSubConfig {
    /// Avro 模式目录（`*.avsc`）
    pub schema_dir: Option<PathBuf>,
    /// 发布成功时是否打印日志（失败总是打印）
    pub publish_log: bool,
    /// 接收时是否打印日志
    pub receive_log: bool,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            schema_dir: None,
            publish_log: true,
            receive_log: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditConfig {
    /// 审计库连接串；为空时不写库
    pub database_url: Option<String>,
    pub table: String,
    pub queue_capacity: usize,
    /// 写入 `processBy` 列的生产者名，默认取服务名
    pub producer_name: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            table: "transport_log".to_owned(),
            queue_capacity: 1024,
            producer_name: None,
        }
    }
}

/// 凭据来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsSource {
    File(PathBuf),
    Inline(String),
}

impl AppConfig {
    /// 环境变量 `GOOGLE_APPLICATION_CREDENTIALS` 优先于内联凭据
    pub fn credentials_source(&self) -> Option<CredentialsSource> {
        self.credentials_source_with(|name| std::env::var(name).ok())
    }

    fn credentials_source_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<CredentialsSource> {
        match lookup(CREDENTIALS_ENV).filter(|v| !v.is_empty()) {
            Some(path) => Some(CredentialsSource::File(PathBuf::from(path))),
            None => self.credentials_json.clone().map(CredentialsSource::Inline),
        }
    }

    pub fn producer_name(&self) -> &str {
        self.audit
            .producer_name
            .as_deref()
            .unwrap_or(&self.service_name)
    }
}

/// 第一个位置参数可覆盖配置文件路径
pub fn config_path_from_args<I>(args: I) -> PathBuf
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .nth(1)
        .filter(|arg| !arg.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// 加载配置：默认值 → YAML 文件 → `APP_` 环境变量 → `LOCAL_RUN`
pub fn load(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults and environment");
    }
    let mut config: AppConfig = Figment::new()
        .merge(Serialized::defaults(AppConfig::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed("APP_").split("__"))
        .extract()
        .map_err(|e| Error::Config(e.to_string()))?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(value) = lookup(LOCAL_RUN_ENV) {
        config.log.local = parse_bool(&value);
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.service_name.trim().is_empty() {
        return Err(Error::Config("serviceName must not be empty".into()));
    }
    if config.log.payload_log_size_limit == 0 {
        return Err(Error::Config("log.payloadLogSizeLimit must be positive".into()));
    }
    if config.audit.queue_capacity == 0 {
        return Err(Error::Config("audit.queueCapacity must be positive".into()));
    }
    if config.producer_name().len() > 255 {
        return Err(Error::Config("audit producer name exceeds 255 characters".into()));
    }
    Ok(())
}

/// 宽松布尔解析："1"、"true"、"yes"、"on"（忽略大小写）
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
