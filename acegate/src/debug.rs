//! Debug-record sinks.
//!
//! The JSONL sink appends one line per record through a non-blocking file
//! writer, so recording never stalls a streaming request.

use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

use fleet::debug::{
    DebugSink, ErrorRecord, HealthRecord, LifecycleRecord, ProvisioningRecord, RequestRecord,
    SelectionRecord, StressRecord,
};

pub use fleet::debug::NoopSink;

pub struct JsonlSink {
    writer: NonBlocking,
    _guard: WorkerGuard,
}

impl JsonlSink {
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let appender = tracing_appender::rolling::daily(dir, "acegate-debug.jsonl");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        Ok(Self {
            writer,
            _guard: guard,
        })
    }

    fn write_record(&self, kind: &str, record: impl Serialize) {
        let value = match serde_json::to_value(record) {
            Ok(value) => value,
            Err(e) => {
                warn!(kind, error = %e, "unserializable debug record");
                return;
            }
        };
        let line = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "type": kind,
            "record": value,
        });
        let mut writer = self.writer.clone();
        let _ = writeln!(writer, "{line}");
    }
}

impl DebugSink for JsonlSink {
    fn request(&self, record: RequestRecord) {
        self.write_record("request", record);
    }

    fn selection(&self, record: SelectionRecord) {
        self.write_record("engine_selection", record);
    }

    fn provisioning(&self, record: ProvisioningRecord) {
        self.write_record("provisioning", record);
    }

    fn orchestrator_health(&self, record: HealthRecord) {
        self.write_record("orchestrator_health", record);
    }

    fn stream_lifecycle(&self, record: LifecycleRecord) {
        self.write_record("stream_lifecycle", record);
    }

    fn stress(&self, record: StressRecord) {
        self.write_record("stress", record);
    }

    fn error(&self, record: ErrorRecord) {
        self.write_record("error", record);
    }
}
