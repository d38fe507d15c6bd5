use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;

use log_dispatch_sink::file::FilePath;
use log_dispatch_sink::{
    Attr, ConsoleOptions, ConsoleSink, FanoutSink, FileOptions, FileSink, LayerConfig, Level, LevelVar, Sink,
    SinkLayer,
};

#[tokio::main]
async fn main() {
    let path = std::env::temp_dir().join("fanout_demo").join("service.log");

    let console = ConsoleSink::new(ConsoleOptions {
        level: Some(LevelVar::new(Level::DEBUG)),
        ..Default::default()
    });
    let file = match FileSink::new(FileOptions {
        file: FilePath {
            path: path.to_string_lossy().into_owned(),
            ..Default::default()
        },
        level: Some(LevelVar::new(Level::WARN)),
        max_count: 3,
        compress: true,
        ..Default::default()
    }) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("cannot open {}: {e}", path.display());
            return;
        }
    };

    let sink: Arc<dyn Sink> = Arc::new(FanoutSink::new(vec![Arc::new(console), Arc::new(file)]))
        .with_attrs(vec![Attr::new("service", "checkout")]);

    let (layer, worker) = SinkLayer::new(sink, LayerConfig::default());
    let dropped = Arc::clone(&layer.dropped_events);
    let dispatch = tracing_subscriber::registry().with(layer);

    tracing::subscriber::with_default(dispatch, || {
        info!("starting service");
        warn!(latency_ms = 1250_u64, "slow upstream");
        error!(user_id = 42, reason = "invalid password", "authentication failed");
    });

    // the subscriber (and its channel) is gone; the worker drains and closes
    if worker.await.is_err() {
        eprintln!("log worker panicked");
    }

    println!(
        "warnings and errors written to {} ({} dropped)",
        path.display(),
        dropped.load(std::sync::atomic::Ordering::Relaxed)
    );
}
