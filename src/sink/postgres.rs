use super::{AuditRecord, AuditStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// PostgreSQL 审计存储
///
/// 列：`id`、`"traceID"`、`"spanID"`、`type`、`log`、`"errorMessage"`、`"processDT"`、`"processBy"`。
#[derive(Debug, Clone)]
pub struct PgAuditStore {
    pool: PgPool,
    table: String,
    insert_sql: String,
}

impl PgAuditStore {
    /// 表名只允许字母、数字、下划线与 `.`（schema 限定）
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        let valid = !table.is_empty()
            && table
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.');
        if !valid {
            return Err(Error::Config(format!("invalid audit table name: {table:?}")));
        }
        let insert_sql = format!(
            r#"INSERT INTO {table} (id, "traceID", "spanID", type, log, "errorMessage", "processDT", "processBy") VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#
        );
        Ok(Self {
            pool,
            table,
            insert_sql,
        })
    }

    pub async fn connect(database_url: &str, table: impl Into<String>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| Error::Config(format!("failed to connect audit database: {e}")))?;
        Self::new(pool, table)
    }

    /// 不存在时建表
    pub async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                "traceID" VARCHAR(32) NOT NULL,
                "spanID" VARCHAR(16) NOT NULL,
                type VARCHAR(16) NOT NULL,
                log JSONB NOT NULL,
                "errorMessage" TEXT,
                "processDT" TIMESTAMPTZ NOT NULL DEFAULT now(),
                "processBy" VARCHAR(255) NOT NULL
            )"#,
            self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::general(format!("failed to create audit table: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn insert(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(&self.insert_sql)
            .bind(record.id)
            .bind(record.trace_id.to_string())
            .bind(record.span_id.to_string())
            .bind(record.kind.as_str())
            .bind(sqlx::types::Json(&record.log))
            .bind(record.error_message.as_deref())
            .bind(record.processed_at)
            .bind(&record.producer_name)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::general(format!("audit insert failed: {e}")))?;
        Ok(())
    }
}
