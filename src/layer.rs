use crate::level::Level;
use crate::record::{Attr, Record, Source};
use crate::sink::Sink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

const MIN_CHANNEL_BUFFER: usize = 16;

/// Settings of [`SinkLayer`].
#[derive(Debug, Clone)]
pub struct LayerConfig {
    /// Records that may wait for the background task before new ones are
    /// dropped. Values below 16 are raised to 16.
    pub channel_buffer: usize,
}

impl Default for LayerConfig {
    fn default() -> Self {
        LayerConfig {
            channel_buffer: 1024,
        }
    }
}

/// `tracing_subscriber` layer that turns events into [`Record`]s and
/// forwards them to a [`Sink`] via a bounded channel and background task.
///
/// Events the sink is not enabled for are skipped before any allocation.
/// The sink is never awaited on the application thread; when the channel is
/// full the record is dropped and counted. Dropping the layer lets the task
/// drain the channel and close the sink.
pub struct SinkLayer {
    sender: mpsc::Sender<Record>,
    sink: Arc<dyn Sink>,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Successfully enqueued into channel.
    pub enqueued_events: Arc<AtomicU64>,
    /// Dropped because the channel was full.
    pub dropped_events: Arc<AtomicU64>,
}

impl SinkLayer {
    /// Create a new layer and spawn a background task that pulls
    /// [`Record`]s from a bounded channel and hands them to `sink`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(sink: Arc<dyn Sink>, config: LayerConfig) -> (Self, JoinHandle<()>) {
        let buffer = config.channel_buffer.max(MIN_CHANNEL_BUFFER);
        let (tx, mut rx) = mpsc::channel::<Record>(buffer);

        let task_sink = Arc::clone(&sink);
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = task_sink.handle(&record).await {
                    eprintln!("error handling log record: {}", e);
                }
            }
            if let Err(e) = task_sink.close().await {
                eprintln!("error closing log sink: {}", e);
            }
        });

        (
            Self {
                sender: tx,
                sink,
                total_events: Arc::new(AtomicU64::new(0)),
                enqueued_events: Arc::new(AtomicU64::new(0)),
                dropped_events: Arc::new(AtomicU64::new(0)),
            },
            handle,
        )
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let meta = event.metadata();
        // the sinks log through tracing themselves
        if meta.target().starts_with(env!("CARGO_CRATE_NAME")) {
            return;
        }
        let level = Level::from(*meta.level());
        if !self.sink.enabled(level) {
            return;
        }

        let mut attrs = Vec::new();
        let mut message = None;
        event.record(&mut FieldVisitor {
            attrs: &mut attrs,
            message: &mut message,
        });

        let mut record = Record::new(level, message.unwrap_or_default());
        record.attrs = attrs;
        if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
            record.source = Some(Source {
                function: meta.module_path().unwrap_or_default().to_string(),
                file: file.to_string(),
                line,
            });
        }

        match self.sender.try_send(record) {
            Ok(()) => {
                self.enqueued_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                eprintln!("log channel full, dropping log record");
            }
        }
    }
}

struct FieldVisitor<'a> {
    attrs: &'a mut Vec<Attr>,
    message: &'a mut Option<String>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.attrs.push(Attr::new(field.name(), value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.attrs.push(Attr::new(field.name(), value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.attrs.push(Attr::new(field.name(), value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.attrs.push(Attr::new(field.name(), value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.attrs.push(Attr::new(field.name(), value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.attrs.push(Attr::new(field.name(), format!("{:?}", value)));
        }
    }
}
