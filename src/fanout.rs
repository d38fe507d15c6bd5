use crate::error::SinkError;
use crate::level::Level;
use crate::record::{Attr, Record};
use crate::sink::Sink;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub const FANOUT_SINK_TYPE: &str = "fanout";

/// Dispatches every record to each enabled child sink.
///
/// Children are invoked in order, each with its own copy of the record. A
/// failing or panicking child does not prevent the others from running;
/// all errors are returned together.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn Sink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        FanoutSink { sinks }
    }

    fn map_children(&self, f: impl Fn(&Arc<dyn Sink>) -> Arc<dyn Sink>) -> Arc<dyn Sink> {
        Arc::new(FanoutSink {
            sinks: self.sinks.iter().map(f).collect(),
        })
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl Sink for FanoutSink {
    fn enabled(&self, level: Level) -> bool {
        self.sinks.iter().any(|s| s.enabled(level))
    }

    async fn handle(&self, record: &Record) -> Result<(), SinkError> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if !sink.enabled(record.level) {
                continue;
            }
            let copy = record.clone();
            match AssertUnwindSafe(sink.handle(&copy)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(payload) => {
                    let message = panic_message(payload);
                    tracing::warn!(sink = sink.sink_type(), %message, "sink panicked while handling record");
                    errors.push(SinkError::Panic(message));
                }
            }
        }
        SinkError::join(errors)
    }

    fn with_attrs(&self, attrs: Vec<Attr>) -> Arc<dyn Sink> {
        self.map_children(|s| s.with_attrs(attrs.clone()))
    }

    fn with_group(&self, name: &str) -> Arc<dyn Sink> {
        if name.is_empty() {
            return Arc::new(self.clone());
        }
        self.map_children(|s| s.with_group(name))
    }

    async fn close(&self) -> Result<(), SinkError> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(err) = sink.close().await {
                errors.push(err);
            }
        }
        SinkError::join(errors)
    }

    fn sink_type(&self) -> &str {
        FANOUT_SINK_TYPE
    }

    fn options(&self) -> serde_json::Value {
        let handlers: Vec<_> = self
            .sinks
            .iter()
            .map(|s| json!({"type": s.sink_type(), "options": s.options()}))
            .collect();
        json!({ "handlers": handlers })
    }

    fn child_sinks(&self) -> Vec<Arc<dyn Sink>> {
        self.sinks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discard::DiscardSink;
    use parking_lot::Mutex;

    /// Records what it receives; optionally fails or panics.
    #[derive(Clone, Default)]
    struct Probe {
        seen: Arc<Mutex<Vec<(String, usize)>>>,
        min: i32,
        fail: bool,
        panic: bool,
        attrs: usize,
    }

    #[async_trait]
    impl Sink for Probe {
        fn enabled(&self, level: Level) -> bool {
            level.value() >= self.min
        }

        async fn handle(&self, record: &Record) -> Result<(), SinkError> {
            if self.panic {
                panic!("probe exploded");
            }
            self.seen
                .lock()
                .push((record.message.clone(), self.attrs + record.attrs.len()));
            if self.fail {
                return Err(SinkError::Config("probe failure".into()));
            }
            Ok(())
        }

        fn with_attrs(&self, attrs: Vec<Attr>) -> Arc<dyn Sink> {
            Arc::new(Probe {
                attrs: self.attrs + attrs.len(),
                ..self.clone()
            })
        }

        fn with_group(&self, _name: &str) -> Arc<dyn Sink> {
            Arc::new(self.clone())
        }

        fn sink_type(&self) -> &str {
            "probe"
        }

        fn options(&self) -> serde_json::Value {
            json!({"min": self.min})
        }
    }

    #[tokio::test]
    async fn panics_and_errors_do_not_stop_other_children() {
        let good = Probe::default();
        let sinks: Vec<Arc<dyn Sink>> = vec![
            Arc::new(Probe { panic: true, ..Default::default() }),
            Arc::new(Probe { fail: true, ..Default::default() }),
            Arc::new(good.clone()),
        ];
        let fanout = FanoutSink::new(sinks);

        let err = fanout.handle(&Record::new(Level::INFO, "m")).await.unwrap_err();
        match err {
            SinkError::Multiple(errors) => {
                assert!(matches!(&errors[0], SinkError::Panic(m) if m == "probe exploded"));
                assert!(matches!(&errors[1], SinkError::Config(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(good.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn disabled_children_are_skipped() {
        let quiet = Probe { min: Level::ERROR.value(), ..Default::default() };
        let loud = Probe::default();
        let fanout = FanoutSink::new(vec![Arc::new(quiet.clone()), Arc::new(loud.clone())]);

        fanout.handle(&Record::new(Level::INFO, "info")).await.unwrap();
        assert!(quiet.seen.lock().is_empty());
        assert_eq!(loud.seen.lock().len(), 1);
    }

    #[test]
    fn enabled_if_any_child_is() {
        let fanout = FanoutSink::new(vec![
            Arc::new(DiscardSink),
            Arc::new(Probe { min: Level::WARN.value(), ..Default::default() }),
        ]);
        assert!(!fanout.enabled(Level::INFO));
        assert!(fanout.enabled(Level::WARN));
        assert!(!FanoutSink::default().enabled(Level::ERROR));
    }

    #[tokio::test]
    async fn extension_leaves_original_untouched() {
        let probe = Probe::default();
        let base = FanoutSink::new(vec![Arc::new(probe.clone())]);
        let derived = base.with_attrs(vec![Attr::new("a", 1), Attr::new("b", 2)]);

        base.handle(&Record::new(Level::INFO, "base")).await.unwrap();
        derived.handle(&Record::new(Level::INFO, "derived")).await.unwrap();

        let seen = probe.seen.lock().clone();
        assert_eq!(seen, vec![("base".to_string(), 0), ("derived".to_string(), 2)]);
        assert_eq!(derived.child_sinks().len(), 1);
    }

    #[test]
    fn options_list_children() {
        let fanout = FanoutSink::new(vec![Arc::new(DiscardSink)]);
        assert_eq!(
            fanout.options(),
            json!({"handlers": [{"type": "discard", "options": {}}]})
        );
    }
}
