use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Handle, Runtime};
use uuid::Uuid;

use crate::progress::{ProgressMessage, ProgressSender};

/// Builder for pipeline telemetry sinks.
pub struct PipelineTelemetryBuilder {
    module: String,
    run_id: Option<Uuid>,
    log_path: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    progress: Option<ProgressSender>,
}

impl PipelineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            run_id: None,
            log_path: None,
            event_publisher: None,
            progress: None,
        }
    }

    /// Sets the run the telemetry belongs to. A fresh id is used otherwise.
    #[must_use]
    pub const fn run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Forwards rendered log lines to a progress stream.
    #[must_use]
    pub fn progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<PipelineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(Arc::new(JsonLogger::new(path)?)),
            None => None,
        };
        Ok(PipelineTelemetry {
            module: self.module,
            run_id: self.run_id.unwrap_or_else(Uuid::new_v4),
            sinks: Arc::new(TelemetrySinks {
                logger,
                event: self
                    .event_publisher
                    .map(|publisher| Arc::new(EventHandle::new(publisher))),
                progress: self.progress,
            }),
        })
    }
}

/// Telemetry handle shared by the orchestrator and its stages.
///
/// Each record fans out to the JSON logger, the event bus and the progress
/// stream, whichever are configured.
#[derive(Clone)]
pub struct PipelineTelemetry {
    module: String,
    run_id: Uuid,
    sinks: Arc<TelemetrySinks>,
}

impl fmt::Debug for PipelineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTelemetry")
            .field("module", &self.module)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

struct TelemetrySinks {
    logger: Option<Arc<JsonLogger>>,
    event: Option<Arc<EventHandle>>,
    progress: Option<ProgressSender>,
}

struct EventHandle {
    runtime: OnceCell<Runtime>,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            runtime: OnceCell::new(),
            publisher,
        }
    }

    fn publish(&self, record: EventRecord) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            let runtime = self.runtime.get_or_try_init(Runtime::new)?;
            runtime.block_on(self.publisher.publish(record))
        }
    }
}

impl PipelineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> PipelineTelemetryBuilder {
        PipelineTelemetryBuilder::new(module)
    }

    /// Telemetry with no sinks.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            module: "pipeline".into(),
            run_id: Uuid::new_v4(),
            sinks: Arc::new(TelemetrySinks {
                logger: None,
                event: None,
                progress: None,
            }),
        }
    }

    /// Same sinks and run, reported under another module name.
    #[must_use]
    pub fn for_module(&self, module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            run_id: self.run_id,
            sinks: Arc::clone(&self.sinks),
        }
    }

    /// Same logger and bus, with log lines also forwarded to `sender`.
    #[must_use]
    pub fn with_progress(&self, sender: ProgressSender) -> Self {
        Self {
            module: self.module.clone(),
            run_id: self.run_id,
            sinks: Arc::new(TelemetrySinks {
                logger: self.sinks.logger.clone(),
                event: self.sinks.event.clone(),
                progress: Some(sender),
            }),
        }
    }

    /// Run the telemetry is attributed to.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Module name stamped on records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let record = LogRecord::new(&self.module, level, message).with_metadata(&metadata);
        if let Some(progress) = &self.sinks.progress {
            progress.send(ProgressMessage::Line(record.render_line()));
        }
        if let Some(logger) = &self.sinks.logger {
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Logs an informational message without metadata. Sink failures are ignored.
    pub fn info(&self, message: &str) {
        let _ = self.log(LogLevel::Info, message, Value::Null);
    }

    /// Logs a warning without metadata. Sink failures are ignored.
    pub fn warn(&self, message: &str) {
        let _ = self.log(LogLevel::Warn, message, Value::Null);
    }

    /// Emits an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.sinks.event {
            handle.publish(EventRecord::new(
                self.run_id,
                self.module.clone(),
                event_type,
                payload,
            ))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_event_and_progress_line() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("run.log.jsonl");
        let bus = Arc::new(MemoryEventBus::new(16));
        let (sender, mut receiver) = progress::channel();
        let run_id = Uuid::new_v4();
        let telemetry = PipelineTelemetry::builder("training_pipeline")
            .run_id(run_id)
            .log_path(&path)
            .event_publisher(bus.clone())
            .progress(sender)
            .build()
            .unwrap();
        let ingestion = telemetry.for_module("data_ingestion");
        ingestion
            .log(LogLevel::Info, "Exported 100 records", json!({ "rows": 100 }))
            .unwrap();
        ingestion
            .event("pipeline.stage.completed", json!({ "stage": "data_ingestion" }))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("Exported 100 records"));
        assert!(content.contains("\"rows\":100"));
        let events = bus.events_for(run_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, "data_ingestion");
        match receiver.try_recv().unwrap() {
            ProgressMessage::Line(line) => {
                assert!(line.ends_with(" - data_ingestion - INFO - Exported 100 records"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn closed_progress_stream_does_not_fail_logging() {
        let (sender, receiver) = progress::channel();
        drop(receiver);
        let telemetry = PipelineTelemetry::disabled().with_progress(sender);
        telemetry
            .log(LogLevel::Warn, "nobody is listening", Value::Null)
            .unwrap();
    }
}
