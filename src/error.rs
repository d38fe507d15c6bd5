use crate::record::Record;
use serde_json::json;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

/// Errors produced while building sinks or handling records.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("failed to format log record: {0}")]
    Format(String),

    #[error("failed to compress payload: {0}")]
    Compression(#[source] std::io::Error),

    #[error("failed to create HTTP request: {0}")]
    Request(String),

    #[error("failed to execute HTTP request: {0}")]
    Transport(String),

    #[error("log endpoint returned non-OK status: {status}, body: {body}")]
    Response { status: u16, body: String },

    #[error("failed to write log record: {0}")]
    Write(#[from] std::io::Error),

    #[error("invalid sink options: {0}")]
    Config(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("failed to (un)marshal sink options: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error("unsupported sink type: {0}")]
    UnsupportedType(String),

    #[error("{0}: sink type is already registered")]
    TypeExists(String),

    #[error("failed to build '{sink_type}' sink: {source}")]
    Build {
        sink_type: String,
        #[source]
        source: Box<SinkError>,
    },

    #[error("sink panicked: {0}")]
    Panic(String),

    #[error("failed to write record: {0}")]
    HandleRecord(#[source] Box<SinkError>),

    #[error("{}", join_messages(.0))]
    Multiple(Vec<SinkError>),
}

fn join_messages(errors: &[SinkError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl SinkError {
    /// Merges the errors of several sinks: `Ok` when empty, the error itself
    /// when there is exactly one.
    pub fn join(mut errors: Vec<SinkError>) -> Result<(), SinkError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SinkError::Multiple(errors)),
        }
    }

    /// Stable numeric code for the error kind.
    pub fn code(&self) -> u32 {
        match self {
            SinkError::InvalidParameter(_) => 1,
            SinkError::HandleRecord(_) | SinkError::Format(_) | SinkError::Write(_) => 2,
            SinkError::Build { .. } => 3,
            SinkError::Marshal(_) => 9,
            SinkError::UnsupportedType(_) => 10,
            SinkError::Config(_) => 11,
            SinkError::TypeExists(_) => 12,
            SinkError::Compression(_) => 13,
            SinkError::Transport(_) => 14,
            SinkError::Request(_) => 15,
            SinkError::Response { .. } => 16,
            SinkError::Panic(_) => 17,
            SinkError::Multiple(_) => 18,
        }
    }
}

#[cfg(feature = "hec")]
impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            SinkError::Request(err.to_string())
        } else {
            SinkError::Transport(err.to_string())
        }
    }
}

type ErrorHandlerFn = dyn Fn(SinkError, Option<&Record>) -> Option<SinkError> + Send + Sync;

/// Hook invoked with every error a sink produces, together with the record
/// that triggered it when one is available.
///
/// Returning `None` suppresses the error; returning `Some` surfaces it
/// (possibly transformed) to the caller. Errors from asynchronous deliveries
/// can only be observed here.
#[derive(Clone)]
pub struct ErrorHandler(Arc<ErrorHandlerFn>);

impl ErrorHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(SinkError, Option<&Record>) -> Option<SinkError> + Send + Sync + 'static,
    {
        ErrorHandler(Arc::new(f))
    }

    pub fn call(&self, err: SinkError, record: Option<&Record>) -> Option<SinkError> {
        (self.0)(err, record)
    }
}

impl fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorHandler(..)")
    }
}

/// Passes `err` through `handler`, if any.
pub(crate) fn route_error(
    handler: Option<&ErrorHandler>,
    err: SinkError,
    record: Option<&Record>,
) -> Result<(), SinkError> {
    match handler {
        Some(handler) => match handler.call(err, record) {
            Some(err) => Err(err),
            None => Ok(()),
        },
        None => Err(err),
    }
}

/// Writes a JSON description of the error (and the record, when present) to
/// stderr and returns it wrapped as [`SinkError::HandleRecord`].
pub fn default_error_handler() -> ErrorHandler {
    ErrorHandler::new(|err, record| {
        let report = error_report(&err, record);
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{report}");
        Some(SinkError::HandleRecord(Box::new(err)))
    })
}

fn error_report(err: &SinkError, record: Option<&Record>) -> serde_json::Value {
    let mut report = serde_json::Map::new();
    if let Some(record) = record {
        report.insert("record".into(), serde_json::Value::Object(record.to_map()));
    }
    report.insert(
        "error".into(),
        json!({
            "message": format!("failed to write record: {err}"),
            "code": err.code(),
        }),
    );
    serde_json::Value::Object(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;

    #[test]
    fn join_collapses_single_errors() {
        assert!(SinkError::join(vec![]).is_ok());
        let single = SinkError::join(vec![SinkError::Panic("boom".into())]).unwrap_err();
        assert!(matches!(single, SinkError::Panic(_)));
        let many = SinkError::join(vec![
            SinkError::Panic("a".into()),
            SinkError::Config("b".into()),
        ])
        .unwrap_err();
        assert_eq!(many.to_string(), "sink panicked: a\ninvalid sink options: b");
    }

    #[test]
    fn route_error_lets_handler_suppress_or_transform() {
        let suppress = ErrorHandler::new(|_, _| None);
        assert!(route_error(Some(&suppress), SinkError::Panic("x".into()), None).is_ok());

        let wrap = ErrorHandler::new(|err, _| Some(SinkError::HandleRecord(Box::new(err))));
        let err = route_error(Some(&wrap), SinkError::Panic("x".into()), None).unwrap_err();
        assert_eq!(err.code(), 2);

        let err = route_error(None, SinkError::Panic("x".into()), None).unwrap_err();
        assert_eq!(err.code(), 17);
    }

    #[test]
    fn report_carries_record_and_code() {
        let record = Record::new(Level::ERROR, "lost");
        let report = error_report(&SinkError::Config("missing".into()), Some(&record));
        assert_eq!(report["error"]["code"], 11);
        assert_eq!(report["record"]["msg"], "lost");
    }

    #[test]
    fn default_handler_wraps_error() {
        let handler = default_error_handler();
        let err = handler.call(SinkError::Panic("x".into()), None).unwrap();
        assert!(matches!(err, SinkError::HandleRecord(_)));
    }
}
