use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;

use log_dispatch_sink::{
    BuilderRegistry, LayerConfig, SinkConfig, SinkError, SinkLayer, SinkOptionsMut,
};

/// Sink layout as it would appear in a service's configuration file. The HEC
/// handler is only built when `LOG_SINK_HEC_API_TOKEN` is set.
fn config() -> serde_json::Value {
    let mut handlers = vec![
        serde_json::json!({"type": "console", "options": {"format": "plaintext", "level": "debug"}}),
        serde_json::json!({"type": "file", "options": {
            "file": {"path": "${TMPDIR}/from_config/app.log"},
            "buffer_size": "16KB",
            "max_size": 10,
            "max_count": 5,
            "max_age": 7
        }}),
    ];
    if std::env::var_os("LOG_SINK_HEC_API_TOKEN").is_some() {
        handlers.push(serde_json::json!({"type": "sentinelone:hec", "options": {
            "buffer_size": "64KB",
            "fields": {"env": "demo"}
        }}));
    }
    serde_json::json!({"type": "fanout", "options": {"handlers": handlers}})
}

#[tokio::main]
async fn main() -> Result<(), SinkError> {
    if std::env::var_os("TMPDIR").is_none() {
        std::env::set_var("TMPDIR", std::env::temp_dir());
    }

    let config: SinkConfig = serde_json::from_value(config())?;
    let registry = BuilderRegistry::default();

    let callback = |sink_type: &str, options: SinkOptionsMut<'_>| -> Result<(), SinkError> {
        match options {
            SinkOptionsMut::File(file) => {
                file.error_handler = Some(log_dispatch_sink::default_error_handler());
            }
            #[cfg(feature = "hec")]
            SinkOptionsMut::Hec(hec) => {
                let from_env = log_dispatch_sink::HecOptions::from_env()?;
                hec.api_token = from_env.api_token;
                hec.ingest_hostname = from_env.ingest_hostname;
                hec.ingest_url = from_env.ingest_url;
                hec.scope = from_env.scope;
                hec.error_handler = Some(log_dispatch_sink::ErrorHandler::new(|err, _| {
                    eprintln!("event batch rejected: {err}");
                    None
                }));
            }
            _ => {}
        }
        println!("building {sink_type}");
        Ok(())
    };
    let sink = registry.build(&config, Some(&callback))?;
    println!("{}", serde_json::to_string_pretty(&sink.options())?);

    let (layer, worker) = SinkLayer::new(Arc::clone(&sink), LayerConfig { channel_buffer: 4096 });
    let dispatch = tracing_subscriber::registry().with(layer);

    tracing::subscriber::with_default(dispatch, || {
        info!(version = env!("CARGO_PKG_VERSION"), "service started");
        error!(order_id = 1017_u64, "payment declined");
    });

    // the worker closes the sink once the layer is dropped
    if worker.await.is_err() {
        eprintln!("log worker panicked");
    }
    Ok(())
}
