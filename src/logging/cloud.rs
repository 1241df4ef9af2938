//! 云日志 JSON 格式化器

use crate::context;
use serde_json::{Map, Value};
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const TRACE_KEY: &str = "logging.googleapis.com/trace";
const SPAN_KEY: &str = "logging.googleapis.com/spanId";
const SAMPLED_KEY: &str = "logging.googleapis.com/trace_sampled";
const SOURCE_KEY: &str = "logging.googleapis.com/sourceLocation";

/// 每行一个 JSON 对象的事件格式
///
/// 追踪字段取自当前任务的 [`crate::CallContext`]，因此请求作用域内的每条日志都会被关联。
#[derive(Debug, Clone, Default)]
pub struct CloudJsonFormat {
    project_id: Option<String>,
}

impl CloudJsonFormat {
    pub fn new(project_id: Option<String>) -> Self {
        Self { project_id }
    }

    fn trace_link(&self, trace_id: &str) -> String {
        match &self.project_id {
            Some(project) => format!("projects/{project}/traces/{trace_id}"),
            None => trace_id.to_owned(),
        }
    }
}

fn severity(level: &Level) -> &'static str {
    match *level {
        Level::TRACE | Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARNING",
        Level::ERROR => "ERROR",
    }
}

impl<S, N> FormatEvent<S, N> for CloudJsonFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut record = Map::new();
        record.insert("severity".into(), severity(metadata.level()).into());
        record.insert(
            "time".into(),
            chrono::Utc::now()
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
                .into(),
        );
        record.insert(
            "message".into(),
            visitor.fields.remove("message").unwrap_or_else(|| "".into()),
        );
        record.insert("target".into(), metadata.target().into());

        if let Some(span) = ctx.lookup_current() {
            record.insert("span".into(), span.name().into());
        }

        if let Some(call) = context::try_current() {
            if !call.trace_id().is_zero() {
                record.insert(TRACE_KEY.into(), self.trace_link(&call.trace_id().to_string()).into());
                record.insert(SPAN_KEY.into(), call.span_id().to_string().into());
                record.insert(SAMPLED_KEY.into(), true.into());
            }
        }

        let mut source = Map::new();
        if let Some(file) = metadata.file() {
            source.insert("file".into(), file.into());
        }
        if let Some(line) = metadata.line() {
            source.insert("line".into(), line.to_string().into());
        }
        source.insert(
            "function".into(),
            metadata.module_path().unwrap_or(metadata.target()).into(),
        );
        record.insert(SOURCE_KEY.into(), Value::Object(source));

        for (key, value) in visitor.fields {
            record.entry(key).or_insert(value);
        }

        let line = serde_json::to_string(&record).map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

#[derive(Default)]
struct JsonVisitor {
    fields: Map<String, Value>,
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.fields
            .insert(field.name().to_owned(), Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        // 结构化字段（如 headers）以 JSON 文本传入，展开为对象
        let trimmed = value.trim_start();
        let parsed = if field.name() != "message"
            && (trimmed.starts_with('{') || trimmed.starts_with('['))
        {
            serde_json::from_str::<Value>(value).ok()
        } else {
            None
        };
        self.fields.insert(
            field.name().to_owned(),
            parsed.unwrap_or_else(|| Value::String(value.to_owned())),
        );
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_owned(), Value::Bool(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_owned(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_owned(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        let number = serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number);
        self.fields.insert(field.name().to_owned(), number);
    }
}
