use crate::error::SinkError;
use crate::level::Level;
use crate::record::{Attr, Record};
use crate::sink::Sink;
use async_trait::async_trait;
use std::sync::Arc;

pub const DISCARD_SINK_TYPE: &str = "discard";

/// A sink that drops every record.
///
/// It reports itself as disabled at every level, so a fan-out containing
/// only discard sinks never formats anything. Useful as a placeholder in
/// configuration and for measuring pipeline overhead.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

impl DiscardSink {
    pub fn new() -> Self {
        DiscardSink
    }
}

#[async_trait]
impl Sink for DiscardSink {
    fn enabled(&self, _level: Level) -> bool {
        false
    }

    async fn handle(&self, _record: &Record) -> Result<(), SinkError> {
        Ok(())
    }

    fn with_attrs(&self, _attrs: Vec<Attr>) -> Arc<dyn Sink> {
        Arc::new(*self)
    }

    fn with_group(&self, _name: &str) -> Arc<dyn Sink> {
        Arc::new(*self)
    }

    fn sink_type(&self) -> &str {
        DISCARD_SINK_TYPE
    }

    fn options(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discards_everything() {
        let sink = DiscardSink::new();
        assert!(!sink.enabled(Level::ERROR.offset(100)));
        assert!(sink.handle(&Record::new(Level::ERROR, "gone")).await.is_ok());
        let derived = sink.with_attrs(vec![Attr::new("a", 1)]).with_group("g");
        assert!(!derived.enabled(Level::ERROR));
        assert_eq!(derived.sink_type(), "discard");
        assert!(derived.close().await.is_ok());
        assert!(derived.level_gate().is_none());
    }
}
