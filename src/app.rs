//! 组合根
//!
//! 启动时构造一次，之后以引用传递给各组件。

use crate::config::{self, AppConfig, CredentialsSource};
use crate::error::Result;
use crate::logging;
use crate::otel;
use crate::pubsub::{AvroSchemaRegistry, PubSubTransport, Publisher, SubscriberRegistry};
use crate::sink::{AuditStore, TransportLogSink, TransportLogger};
use std::sync::Arc;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(feature = "client")]
use crate::client::{RestClient, RestClientOptions, SoapClients};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct App {
    config: AppConfig,
    sink: Option<TransportLogSink>,
    writer: Option<JoinHandle<()>>,
    tracer_provider: Option<SdkTracerProvider>,
    registry: Arc<AvroSchemaRegistry>,
    #[cfg(feature = "client")]
    rest: RestClient,
    #[cfg(feature = "client")]
    soap: Arc<SoapClients>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("service", &self.config.service_name)
            .field("audit", &self.sink.is_some())
            .field("schemas", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// 进程入口：按命令行参数加载配置、安装日志并构造 [`App`]
///
/// 任何一步失败都应由调用方交给 [`logging::fatal`]。
pub async fn bootstrap() -> Result<App> {
    let path = config::config_path_from_args(std::env::args());
    let config = config::load(&path)?;
    let provider = otel::tracer_provider_builder(&config.service_name).build();
    logging::init_with_tracer(&config.log, config.project_id.as_deref(), Some(&provider))?;
    tracing::info!(path = %path.display(), service = %config.service_name, "configuration loaded");
    Ok(App::build(config).await?.with_tracer_provider(provider))
}

impl App {
    /// 按配置连接审计库；未配置 `audit.databaseUrl` 时不写库
    pub async fn build(config: AppConfig) -> Result<Self> {
        let store = match config.audit.database_url.as_deref() {
            Some(url) => Some(connect_store(url, &config.audit.table).await?),
            None => None,
        };
        Self::assemble(config, store)
    }

    /// 使用给定的审计存储
    pub fn with_store(config: AppConfig, store: Arc<dyn AuditStore>) -> Result<Self> {
        Self::assemble(config, Some(store))
    }

    fn assemble(config: AppConfig, store: Option<Arc<dyn AuditStore>>) -> Result<Self> {
        let registry = match &config.pubsub.schema_dir {
            Some(dir) => AvroSchemaRegistry::load_dir(dir)?,
            None => AvroSchemaRegistry::new(),
        };

        let (sink, writer) = match store {
            Some(store) => {
                let (sink, writer) =
                    TransportLogSink::start(store, config.audit.queue_capacity, config.producer_name());
                (Some(sink), Some(writer))
            }
            None => (None, None),
        };

        match config.credentials_source() {
            Some(CredentialsSource::File(path)) => {
                tracing::debug!(path = %path.display(), "bus credentials from file")
            }
            Some(CredentialsSource::Inline(_)) => tracing::debug!("bus credentials from configuration"),
            None => tracing::debug!("no bus credentials configured"),
        }

        #[cfg(feature = "client")]
        let logger = TransportLogger::new(config.log.stdout, sink.clone(), config.log.payload_log_size_limit);
        #[cfg(feature = "client")]
        let rest = RestClient::new(RestClientOptions::from(&config.rest), logger.clone())?;
        #[cfg(feature = "client")]
        let soap = Arc::new(SoapClients::new(RestClientOptions::from(&config.rest), logger)?);

        Ok(Self {
            config,
            sink,
            writer,
            tracer_provider: None,
            registry: Arc::new(registry),
            #[cfg(feature = "client")]
            rest,
            #[cfg(feature = "client")]
            soap,
        })
    }

    /// 关闭时一并刷新并关闭 span 导出
    pub fn with_tracer_provider(mut self, provider: SdkTracerProvider) -> Self {
        self.tracer_provider = Some(provider);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AvroSchemaRegistry> {
        &self.registry
    }

    /// REST、SOAP 与 gRPC 共用的记录出口
    pub fn logger(&self) -> TransportLogger {
        self.logger_with_stdout(self.config.log.stdout)
    }

    fn logger_with_stdout(&self, stdout: bool) -> TransportLogger {
        TransportLogger::new(stdout, self.sink.clone(), self.config.log.payload_log_size_limit)
    }

    /// 已配置日志出口与 Avro 模式的发布者
    pub fn publisher(&self, transport: Arc<dyn PubSubTransport>, topic: impl Into<String>) -> Publisher {
        let stdout = self.config.log.stdout && self.config.pubsub.publish_log;
        Publisher::new(transport, topic)
            .with_registry(self.registry.clone())
            .with_logger(self.logger_with_stdout(stdout))
    }

    pub fn subscribers(&self, transport: Arc<dyn PubSubTransport>) -> SubscriberRegistry {
        let stdout = self.config.log.stdout && self.config.pubsub.receive_log;
        SubscriberRegistry::new(transport)
            .with_registry(self.registry.clone())
            .with_logger(self.logger_with_stdout(stdout))
    }

    #[cfg(feature = "client")]
    pub fn rest_client(&self) -> &RestClient {
        &self.rest
    }

    #[cfg(feature = "client")]
    pub fn soap_clients(&self) -> &Arc<SoapClients> {
        &self.soap
    }

    #[cfg(feature = "axum")]
    pub fn rest_server(&self) -> crate::integrations::axum::RestServer {
        crate::integrations::axum::RestServer::new(
            self.config.service_name.clone(),
            &self.config.rest,
            self.logger(),
        )
    }

    #[cfg(feature = "grpc")]
    pub fn grpc_layer(&self) -> crate::integrations::tonic::GrpcContextLayer {
        crate::integrations::tonic::GrpcContextLayer::new(self.logger())
    }

    /// 释放自身持有的写入端并等待审计队列排空
    ///
    /// 其他组件仍持有写入端时，最多等待五秒。
    pub async fn shutdown(mut self) {
        let writer = self.writer.take();
        let provider = self.tracer_provider.take();
        drop(self);
        if let Some(writer) = writer {
            match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
                Ok(Ok(())) => tracing::info!("audit writer drained"),
                Ok(Err(error)) => tracing::error!(%error, "audit writer task failed"),
                Err(_) => tracing::warn!("audit writer still has live producers, not waiting further"),
            }
        }
        if let Some(provider) = provider {
            if let Err(error) = provider.shutdown() {
                tracing::warn!(%error, "span exporter shutdown failed");
            }
        }
    }
}

#[cfg(feature = "postgres")]
async fn connect_store(url: &str, table: &str) -> Result<Arc<dyn AuditStore>> {
    let store = crate::sink::PgAuditStore::connect(url, table).await?;
    store.ensure_table().await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn connect_store(_url: &str, _table: &str) -> Result<Arc<dyn AuditStore>> {
    Err(crate::error::Error::Config(
        "audit.databaseUrl is set but the postgres feature is disabled".into(),
    ))
}
