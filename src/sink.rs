use crate::error::SinkError;
use crate::level::{Level, LevelGate};
use crate::record::{Attr, Record};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Destination for [`Record`]s.
///
/// Callers check [`enabled`](Sink::enabled) before [`handle`](Sink::handle);
/// `handle` itself does not re-check the level. Sinks are shared as
/// `Arc<dyn Sink>` and `handle` may be called from many tasks at once.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Whether a record at `level` would be handled.
    fn enabled(&self, level: Level) -> bool;

    /// Processes one record.
    ///
    /// **Returns**
    /// - `Ok(())` when the record was written or buffered.
    /// - `Err(..)` when formatting or writing failed and the sink's error
    ///   handler (if any) did not suppress the error.
    async fn handle(&self, record: &Record) -> Result<(), SinkError>;

    /// A sink that includes `attrs` in every record it handles. The
    /// receiver is left unchanged.
    fn with_attrs(&self, attrs: Vec<Attr>) -> Arc<dyn Sink>;

    /// A sink that nests subsequent attributes under `name`. An empty name
    /// yields an equivalent sink.
    fn with_group(&self, name: &str) -> Arc<dyn Sink>;

    /// Flushes and releases resources. Calling it more than once is
    /// harmless.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Registry name of the sink type, e.g. `"console"`.
    fn sink_type(&self) -> &str;

    /// The sink's options as JSON.
    fn options(&self) -> serde_json::Value;

    /// Sinks wrapped by a composite sink.
    fn child_sinks(&self) -> Vec<Arc<dyn Sink>> {
        Vec::new()
    }

    /// Level thresholds, for sinks that have them.
    fn level_gate(&self) -> Option<&LevelGate> {
        None
    }
}

/// Serializes sink options for [`Sink::options`]; a failure is reported
/// inline instead of being propagated.
pub(crate) fn options_json<T: Serialize>(options: &T) -> serde_json::Value {
    serde_json::to_value(options)
        .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }))
}

/// Options-derived gate: `level` defaults to INFO and `max_level` is
/// optional. The `LevelVar` handles are shared, not copied.
pub(crate) fn gate_from(
    level: &Option<crate::level::LevelVar>,
    max_level: &Option<crate::level::LevelVar>,
) -> LevelGate {
    LevelGate::new(level.clone().unwrap_or_default(), max_level.clone())
}
