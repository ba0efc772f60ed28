use serde_json::{json, Map, Value};

use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
    pub context: Map<String, Value>,
}

impl ErrorReport {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            context: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// Sink for failures that must be visible to operators.
/// Implementations swallow their own errors.
pub trait ErrorReporter {
    fn report(&self, report: &ErrorReport);
}

/// Writes reports as error-level audit log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, report: &ErrorReport) {
        let mut fields = obj(&[
            ("kind", v_str(&report.kind)),
            ("msg", v_str(&report.message)),
        ]);
        fields.insert("context".to_string(), json!(report.context));
        log(Level::Error, Domain::Audit, "error_report", fields);
    }
}
