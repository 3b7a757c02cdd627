use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use crate::{
    error::PipelineError,
    prediction::{PredictionPipeline, PredictionResponse, VehicleData},
    training_pipeline::{CancelToken, PipelineRun, TrainingPipeline},
};

/// One item of a progress stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressMessage {
    /// A rendered log line.
    Line(String),
    /// Final structured result.
    Result(Value),
    /// A failure description.
    Error(String),
    /// Completion marker; always the last message.
    Finished,
}

impl ProgressMessage {
    /// Server-sent-event style rendering.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Line(line) => format!("data: {line}"),
            Self::Result(value) => format!("data: RESULT:{value}"),
            Self::Error(message) => format!("data: ERROR: {message}"),
            Self::Finished => "data: DONE".to_owned(),
        }
    }
}

/// Producer half of a progress stream. Sending never blocks and is a no-op
/// once the consumer is gone.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: UnboundedSender<ProgressMessage>,
}

impl ProgressSender {
    /// Queues a message. Returns `false` when the consumer has gone away.
    pub fn send(&self, message: ProgressMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Creates a connected sender/receiver pair.
#[must_use]
pub fn channel() -> (ProgressSender, UnboundedReceiver<ProgressMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, rx)
}

/// Consumer half of a background job: progress messages plus the job's result.
pub struct ProgressStream<T> {
    receiver: UnboundedReceiver<ProgressMessage>,
    worker: JoinHandle<T>,
    cancel: CancelToken,
    join_timeout: Duration,
    done: bool,
}

impl<T: Send + 'static> ProgressStream<T> {
    fn new(
        receiver: UnboundedReceiver<ProgressMessage>,
        worker: JoinHandle<T>,
        cancel: CancelToken,
        join_timeout: Duration,
    ) -> Self {
        Self {
            receiver,
            worker,
            cancel,
            join_timeout,
            done: false,
        }
    }

    /// Waits for the next message. Returns `None` after [`ProgressMessage::Finished`]
    /// or once the producer has gone away.
    pub async fn next(&mut self) -> Option<ProgressMessage> {
        if self.done {
            return None;
        }
        let message = self.receiver.recv().await;
        if matches!(message, None | Some(ProgressMessage::Finished)) {
            self.done = true;
        }
        message
    }

    /// Requests cooperative cancellation of the job.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token shared with the job.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stops consuming and waits a bounded time for the job.
    ///
    /// Returns `Ok(None)` when the job is still running after the timeout; it
    /// is left to finish on its own.
    pub async fn finish(self) -> Result<Option<T>, PipelineError> {
        let Self {
            receiver,
            worker,
            join_timeout,
            ..
        } = self;
        drop(receiver);
        match tokio::time::timeout(join_timeout, worker).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(err)) => Err(PipelineError::Worker(err.to_string())),
            Err(_) => Ok(None),
        }
    }
}

/// Runs `pipeline` on a blocking worker, streaming its log lines.
///
/// Must be called from within a tokio runtime.
pub fn spawn_training(
    pipeline: TrainingPipeline,
    join_timeout: Duration,
) -> ProgressStream<Result<PipelineRun, PipelineError>> {
    let (sender, receiver) = channel();
    let pipeline = pipeline.with_progress(sender.clone());
    let cancel = pipeline.cancel_token();
    let worker = tokio::task::spawn_blocking(move || {
        let result = pipeline.run();
        match &result {
            Ok(run) => {
                sender.send(ProgressMessage::Result(json!({
                    "status": "success",
                    "run_id": run.run_id,
                    "outcome": run.outcome.label(),
                })));
            }
            Err(err) => {
                sender.send(ProgressMessage::Error(err.to_string()));
            }
        }
        sender.send(ProgressMessage::Finished);
        result
    });
    ProgressStream::new(receiver, worker, cancel, join_timeout)
}

/// Runs one prediction on a blocking worker, streaming its log lines and a
/// `{status, prediction}` result.
///
/// Must be called from within a tokio runtime.
pub fn spawn_prediction(
    pipeline: Arc<PredictionPipeline>,
    data: VehicleData,
    join_timeout: Duration,
) -> ProgressStream<PredictionResponse> {
    let (sender, receiver) = channel();
    let cancel = CancelToken::new();
    let worker = tokio::task::spawn_blocking(move || {
        let telemetry = pipeline.telemetry().with_progress(sender.clone());
        telemetry.info("Starting prediction");
        let response = match pipeline.predict_with(&data, &telemetry) {
            Ok(prediction) => PredictionResponse::success(prediction),
            Err(err) => PredictionResponse::failure(format!("{err:#}")),
        };
        match &response.error {
            None => {
                let payload = serde_json::to_value(&response).unwrap_or(Value::Null);
                sender.send(ProgressMessage::Result(payload));
            }
            Some(message) => {
                sender.send(ProgressMessage::Error(message.clone()));
            }
        }
        sender.send(ProgressMessage::Finished);
        response
    });
    ProgressStream::new(receiver, worker, cancel, join_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::{MemoryDocumentStore, MemoryObjectStore},
        telemetry::PipelineTelemetry,
        test_support,
    };
    use tempfile::tempdir;
    use tokio::runtime::Runtime;

    #[test]
    fn renders_stream_lines() {
        assert_eq!(
            ProgressMessage::Line("x - y - INFO - z".into()).render(),
            "data: x - y - INFO - z"
        );
        let rendered =
            ProgressMessage::Result(json!({ "status": "success", "prediction": 1 })).render();
        let payload: Value =
            serde_json::from_str(rendered.strip_prefix("data: RESULT:").unwrap()).unwrap();
        assert_eq!(payload["prediction"], 1);
        assert_eq!(
            ProgressMessage::Error("boom".into()).render(),
            "data: ERROR: boom"
        );
        assert_eq!(ProgressMessage::Finished.render(), "data: DONE");
    }

    fn training_pipeline(dir: &std::path::Path) -> TrainingPipeline {
        let documents = Arc::new(MemoryDocumentStore::new());
        documents.insert_many(
            test_support::COLLECTION,
            test_support::synthetic_records(90, 11),
        );
        TrainingPipeline::new(
            test_support::test_config(dir),
            documents,
            Arc::new(MemoryObjectStore::new()),
            PipelineTelemetry::disabled(),
        )
    }

    #[test]
    fn training_stream_ends_with_result_and_done() {
        let dir = tempdir().unwrap();
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut stream = spawn_training(training_pipeline(dir.path()), Duration::from_secs(5));
            let mut messages = Vec::new();
            while let Some(message) = stream.next().await {
                messages.push(message);
            }
            assert!(messages
                .iter()
                .any(|m| matches!(m, ProgressMessage::Line(line) if line.contains("data_ingestion"))));
            assert!(matches!(
                messages[messages.len() - 2],
                ProgressMessage::Result(_)
            ));
            assert_eq!(messages.last(), Some(&ProgressMessage::Finished));
            let run = stream.finish().await.unwrap().unwrap().unwrap();
            assert!(run.outcome.is_pushed());
        });
    }

    #[test]
    fn dropping_the_consumer_early_does_not_block_the_producer() {
        let dir = tempdir().unwrap();
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut stream = spawn_training(training_pipeline(dir.path()), Duration::from_millis(50));
            let first = stream.next().await;
            assert!(first.is_some());
            let started = std::time::Instant::now();
            let joined = stream.finish().await;
            assert!(joined.is_ok());
            assert!(started.elapsed() < Duration::from_secs(5));
        });
    }

    #[test]
    fn cancellation_stops_between_stages() {
        let dir = tempdir().unwrap();
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let pipeline = training_pipeline(dir.path());
            pipeline.cancel_token().cancel();
            let mut stream = spawn_training(pipeline, Duration::from_secs(5));
            let mut saw_error = false;
            while let Some(message) = stream.next().await {
                if let ProgressMessage::Error(text) = message {
                    assert!(text.contains("cancelled"));
                    saw_error = true;
                }
            }
            assert!(saw_error);
            let result = stream.finish().await.unwrap().unwrap();
            assert!(matches!(result, Err(PipelineError::Cancelled(_))));
        });
    }
}
