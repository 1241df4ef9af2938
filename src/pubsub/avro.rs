use crate::error::{Error, Result};
use apache_avro::Schema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Avro 模式注册表
///
/// 启动时加载一次，之后只读；以文件名（不含扩展名）作为模式名。
#[derive(Debug, Clone, Default)]
pub struct AvroSchemaRegistry {
    schemas: HashMap<String, Arc<Schema>>,
}

impl AvroSchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加载目录下所有 `*.avsc` 文件
    ///
    /// 同一目录内的模式可以相互引用具名类型。
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut names = Vec::new();
        let mut sources = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("avsc") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            names.push(stem.to_owned());
            sources.push(std::fs::read_to_string(&path)?);
        }

        let refs: Vec<&str> = sources.iter().map(String::as_str).collect();
        let parsed = Schema::parse_list(&refs)
            .map_err(|e| Error::Config(format!("invalid avro schema in {}: {e}", dir.display())))?;

        let schemas: HashMap<_, _> = names.into_iter().zip(parsed.into_iter().map(Arc::new)).collect();
        tracing::info!(dir = %dir.display(), count = schemas.len(), "avro schemas loaded");
        Ok(Self { schemas })
    }

    /// 注册单个模式
    pub fn register(&mut self, name: impl Into<String>, schema_json: &str) -> Result<()> {
        let name = name.into();
        let schema = Schema::parse_str(schema_json)
            .map_err(|e| Error::Config(format!("invalid avro schema {name}: {e}")))?;
        self.schemas.insert(name, Arc::new(schema));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Schema> {
        self.schemas
            .get(name)
            .map(Arc::as_ref)
            .ok_or_else(|| Error::AvroSchemaNotFound(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// 按模式编码为单条 Avro datum（不含容器头）
    pub fn encode<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<Vec<u8>> {
        let schema = self.get(name)?;
        let value = apache_avro::to_value(value)
            .and_then(|v| v.resolve(schema))
            .map_err(|e| Error::Encode(format!("avro {name}: {e}")))?;
        apache_avro::to_avro_datum(schema, value).map_err(|e| Error::Encode(format!("avro {name}: {e}")))
    }

    pub fn decode<T: DeserializeOwned>(&self, name: &str, data: &[u8]) -> Result<T> {
        let schema = self.get(name)?;
        let mut reader = data;
        let value = apache_avro::from_avro_datum(schema, &mut reader, None)
            .map_err(|e| Error::Decode(format!("avro {name}: {e}")))?;
        apache_avro::from_value::<T>(&value).map_err(|e| Error::Decode(format!("avro {name}: {e}")))
    }
}
