use crate::{errors::ControllerError, utils::metric_name};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Meter},
};

const ERROR_SINK: &'static str = "error_sink";

/// Receives failures which are not retried (dropped items, malformed keys)
/// and panics recovered inside a worker.
pub(crate) trait ErrorSink: Send + Sync {
    fn report_error(&self, context: &str, error: &ControllerError);
}

/// Logs reported errors and counts them per controller.
pub(crate) struct LogErrorSink {
    reported_errors: Counter<u64>,
    labels: [KeyValue; 1],
}

impl LogErrorSink {
    pub fn new(controller: &str) -> Self {
        Self::with_meter(controller, &global::meter(ERROR_SINK))
    }

    fn with_meter(controller: &str, meter: &Meter) -> Self {
        let reported_errors = meter
            .u64_counter(metric_name("reported_errors"))
            .with_description("Count of errors reported to the error sink")
            .build();
        Self {
            reported_errors,
            labels: [KeyValue::new("controller", controller.to_string())],
        }
    }
}

impl ErrorSink for LogErrorSink {
    fn report_error(&self, context: &str, error: &ControllerError) {
        error!("{}: {}", context, error);
        self.reported_errors.add(1, &self.labels);
    }
}
