use crate::config::{opt_duration, ByteSize};
use crate::env::{executable_name, hostname};
use crate::error::{route_error, ErrorHandler, SinkError};
use crate::format::Encoder;
use crate::level::{Level, LevelGate, LevelVar};
use crate::record::{Attr, Record, Value, LEVEL_KEY, MESSAGE_KEY, TIME_KEY};
use crate::scope::{AttrScope, ReplaceAttr};
use crate::sink::{gate_from, options_json, Sink};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as Json};
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

pub const HEC_SINK_TYPE: &str = "sentinelone:hec";

pub const DEFAULT_CALLER_KEY: &str = "caller";
pub const DEFAULT_DATASOURCE_CATEGORY: &str = "applog";
pub const DEFAULT_DATASOURCE_VENDOR: &str = "Unknown";
pub const DEFAULT_SOURCETYPE: &str = "gron";
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
const UNKNOWN: &str = "unknown";
const SCOPE_HEADER: &str = "S1-Scope";
/// Upper bound on the memory reserved for a batch ahead of time.
const BATCH_PREALLOC: usize = 64 * 1024;

/// Maps a level to the collector's `severity` text.
#[derive(Clone)]
pub struct LevelTranslator(Arc<dyn Fn(Level) -> String + Send + Sync>);

impl LevelTranslator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Level) -> String + Send + Sync + 'static,
    {
        LevelTranslator(Arc::new(f))
    }

    pub fn translate(&self, level: Level) -> String {
        (self.0)(level)
    }
}

impl fmt::Debug for LevelTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LevelTranslator(..)")
    }
}

/// Default severity mapping. Each band is exclusive at the bottom: `INFO`
/// is `info`, `INFO+1` is `warning`.
pub fn default_severity(level: Level) -> &'static str {
    if level > Level::ERROR {
        "critical"
    } else if level > Level::WARN {
        "error"
    } else if level > Level::INFO {
        "warning"
    } else if level > Level::DEBUG {
        "info"
    } else if level > Level::DEBUG.offset(-4) {
        "debug"
    } else if level > Level::DEBUG.offset(-8) {
        "trace"
    } else {
        "finest"
    }
}

fn mask_secret<S: Serializer>(secret: &str, serializer: S) -> Result<S::Ok, S::Error> {
    if secret.is_empty() {
        serializer.serialize_str("")
    } else {
        serializer.serialize_str("********")
    }
}

/// Options of [`HecSink`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HecOptions {
    /// Bearer token. Required.
    #[serde(serialize_with = "mask_secret")]
    pub api_token: String,
    /// Bytes to accumulate before a batch is sent; 0 sends every record
    /// as soon as the next one arrives.
    pub buffer_size: ByteSize,
    /// Key of the call-site object inside `event`.
    pub caller_key: String,
    /// Deliver batches on the calling task instead of a spawned one.
    pub disable_async: bool,
    pub datasource_category: String,
    pub datasource_name: String,
    pub datasource_vendor: String,
    /// Extra object sent as the top-level `fields` key.
    pub fields: Map<String, Json>,
    pub host: String,
    pub include_caller: bool,
    /// Collector host name; required unless `ingest_url` is set.
    pub ingest_hostname: String,
    /// Full ingestion URL, for proxies.
    pub ingest_url: Option<String>,
    pub level: Option<LevelVar>,
    pub max_level: Option<LevelVar>,
    /// Value of the `S1-Scope` header. Required.
    pub scope: String,
    /// Per-request timeout; 10s when unset, `"0s"` disables it.
    #[serde(with = "opt_duration")]
    pub send_timeout: Option<Duration>,
    pub source: String,
    pub sourcetype: String,
    /// Send batches uncompressed.
    pub disable_compression: bool,
    #[serde(skip)]
    pub level_translator: Option<LevelTranslator>,
    #[serde(skip)]
    pub replace_attr: Option<ReplaceAttr>,
    #[serde(skip)]
    pub error_handler: Option<ErrorHandler>,
}

impl HecOptions {
    fn validate(&self) -> Result<(), SinkError> {
        if self.api_token.is_empty() {
            return Err(SinkError::Config("api_token is a required setting".into()));
        }
        if self.ingest_hostname.is_empty() && self.ingest_url.is_none() {
            return Err(SinkError::Config("ingest_hostname is a required setting".into()));
        }
        if self.scope.is_empty() {
            return Err(SinkError::Config("scope is a required setting".into()));
        }
        Ok(())
    }

    fn apply_defaults(&mut self) {
        let exe = executable_name();
        self.level.get_or_insert_with(|| LevelVar::new(Level::INFO));
        fill(&mut self.caller_key, || DEFAULT_CALLER_KEY.to_string());
        fill(&mut self.datasource_category, || DEFAULT_DATASOURCE_CATEGORY.to_string());
        fill(&mut self.datasource_name, || exe.clone().unwrap_or_else(|| UNKNOWN.to_string()));
        fill(&mut self.datasource_vendor, || DEFAULT_DATASOURCE_VENDOR.to_string());
        fill(&mut self.host, || hostname().unwrap_or_else(|| UNKNOWN.to_string()));
        fill(&mut self.source, || exe.clone().unwrap_or_else(|| UNKNOWN.to_string()));
        fill(&mut self.sourcetype, || DEFAULT_SOURCETYPE.to_string());
        self.send_timeout.get_or_insert(DEFAULT_SEND_TIMEOUT);
    }

    fn url(&self) -> String {
        match &self.ingest_url {
            Some(url) => url.clone(),
            None => format!("https://{}/services/collector/event", self.ingest_hostname),
        }
    }
}

fn fill(value: &mut String, default: impl FnOnce() -> String) {
    if value.is_empty() {
        *value = default();
    }
}

/// Encoded records waiting to be sent, shared by every clone of a sink.
struct PendingBatch {
    buf: Mutex<Vec<u8>>,
    threshold: usize,
}

impl PendingBatch {
    fn new(threshold: usize) -> Self {
        PendingBatch {
            buf: Mutex::new(Vec::with_capacity(threshold.min(BATCH_PREALLOC))),
            threshold,
        }
    }

    /// Appends `line`, first cutting the pending bytes off as a batch when
    /// the line would not fit. A single line larger than the threshold is
    /// still accepted.
    fn append(&self, line: &[u8]) -> Option<Vec<u8>> {
        let mut buf = self.buf.lock();
        let cut = if !buf.is_empty()
            && (self.threshold == 0 || buf.len() + line.len() > self.threshold)
        {
            Some(std::mem::replace(
                &mut *buf,
                Vec::with_capacity(self.threshold.min(BATCH_PREALLOC)),
            ))
        } else {
            None
        };
        buf.extend_from_slice(line);
        cut
    }

    fn drain(&self) -> Option<Vec<u8>> {
        let mut buf = self.buf.lock();
        if buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *buf))
        }
    }
}

/// Everything needed to POST a batch; immutable once the sink is built.
struct Delivery {
    client: Client,
    url: String,
    auth: String,
    scope: String,
    compress: bool,
    error_handler: Option<ErrorHandler>,
}

impl Delivery {
    async fn post(&self, payload: Vec<u8>) -> Result<(), SinkError> {
        let body = if self.compress {
            gzip(&payload)?
        } else {
            payload
        };

        let mut request = self
            .client
            .post(&self.url)
            .header(AUTHORIZATION, &self.auth)
            .header(CONTENT_TYPE, "application/json")
            .header(SCOPE_HEADER, &self.scope);
        if self.compress {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(SinkError::Response {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn deliver(&self, payload: Vec<u8>, record: Option<&Record>) -> Result<(), SinkError> {
        match self.post(payload).await {
            Ok(()) => Ok(()),
            Err(err) => route_error(self.error_handler.as_ref(), err, record),
        }
    }
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>, SinkError> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 4), Compression::default());
    encoder.write_all(payload).map_err(SinkError::Compression)?;
    encoder.finish().map_err(SinkError::Compression)
}

/// Batches records as newline-delimited JSON and posts them to an HTTP
/// event collector.
///
/// Records accumulate in a buffer shared by every sink derived from the
/// same base. When the next record would overflow `buffer_size`, the buffer
/// is cut off and sent, on a spawned task unless `disable_async` is set.
/// [`close`](Sink::close) sends whatever is left, always synchronously.
/// Batches are never retried.
#[derive(Clone)]
pub struct HecSink {
    options: Arc<HecOptions>,
    gate: LevelGate,
    encoder: Arc<Encoder>,
    scope: AttrScope,
    batch: Arc<PendingBatch>,
    delivery: Arc<Delivery>,
}

impl HecSink {
    pub fn new(mut options: HecOptions) -> Result<Self, SinkError> {
        options.validate()?;
        options.apply_defaults();

        let mut client = Client::builder();
        if let Some(timeout) = options.send_timeout.filter(|t| !t.is_zero()) {
            client = client.timeout(timeout);
        }
        let client = client
            .build()
            .map_err(|e| SinkError::Config(format!("failed to create HTTP client: {e}")))?;

        let delivery = Delivery {
            client,
            url: options.url(),
            auth: format!("Bearer {}", options.api_token),
            scope: options.scope.clone(),
            compress: !options.disable_compression,
            error_handler: options.error_handler.clone(),
        };

        let user_replace = options.replace_attr.clone();
        let replace = ReplaceAttr::new(move |groups, attr| {
            let attr = match &user_replace {
                Some(replace) => replace.apply(groups, attr)?,
                None => attr,
            };
            if !groups.is_empty() {
                return Some(attr);
            }
            match (attr.key.as_str(), &attr.value) {
                (TIME_KEY, Value::Time(time)) => Some(Attr::new(TIME_KEY, time.timestamp_millis())),
                (LEVEL_KEY, _) | (MESSAGE_KEY, _) => None,
                _ => Some(attr),
            }
        });
        let encoder = Encoder {
            replace: Some(replace),
            ..Encoder::json()
        };

        Ok(HecSink {
            gate: gate_from(&options.level, &options.max_level),
            batch: Arc::new(PendingBatch::new(options.buffer_size.as_usize())),
            options: Arc::new(options),
            encoder: Arc::new(encoder),
            scope: AttrScope::new(),
            delivery: Arc::new(delivery),
        })
    }

    fn severity(&self, level: Level) -> String {
        match &self.options.level_translator {
            Some(translator) => translator.translate(level),
            None => default_severity(level).to_string(),
        }
    }

    /// The record as the collector expects it: user attributes moved into
    /// `event` next to the message, severity, caller and data source.
    fn event_record(&self, record: &Record) -> Record {
        let options = &self.options;
        let mut event = Vec::with_capacity(record.attrs.len() + 4);
        event.extend(record.attrs.iter().cloned());
        event.push(Attr::new("message", record.message.as_str()));
        event.push(Attr::new("severity", self.severity(record.level)));
        if options.include_caller {
            if let Some(source) = &record.source {
                event.push(Attr::group(options.caller_key.as_str(), source.to_attrs()));
            }
        }
        event.push(Attr::group(
            "dataSource",
            vec![
                Attr::new("category", options.datasource_category.as_str()),
                Attr::new("name", options.datasource_name.as_str()),
                Attr::new("vendor", options.datasource_vendor.as_str()),
            ],
        ));

        let mut out = Record {
            time: record.time,
            level: record.level,
            message: record.message.clone(),
            attrs: Vec::with_capacity(5),
            source: None,
        };
        out.add_attrs([
            Attr::group("event", event),
            Attr::new("host", options.host.as_str()),
            Attr::new("source", options.source.as_str()),
            Attr::new("sourcetype", options.sourcetype.as_str()),
        ]);
        if !options.fields.is_empty() {
            out.add_attrs([Attr::new("fields", Json::Object(options.fields.clone()))]);
        }
        out
    }

    fn encode(&self, record: &Record) -> Result<Vec<u8>, SinkError> {
        self.encoder.encode(&self.event_record(record), &self.scope)
    }

    fn with_scope(&self, scope: AttrScope) -> Arc<dyn Sink> {
        Arc::new(HecSink {
            scope,
            ..self.clone()
        })
    }
}

#[async_trait]
impl Sink for HecSink {
    fn enabled(&self, level: Level) -> bool {
        self.gate.enabled(level)
    }

    async fn handle(&self, record: &Record) -> Result<(), SinkError> {
        let line = match self.encode(record) {
            Ok(line) => line,
            Err(err) => return route_error(self.options.error_handler.as_ref(), err, Some(record)),
        };

        let Some(batch) = self.batch.append(&line) else {
            return Ok(());
        };
        tracing::debug!(bytes = batch.len(), "sending event batch");

        if self.options.disable_async {
            return self.delivery.deliver(batch, Some(record)).await;
        }

        let delivery = Arc::clone(&self.delivery);
        let record = record.clone();
        tokio::spawn(async move {
            if let Err(err) = delivery.deliver(batch, Some(&record)).await {
                tracing::warn!(error = %err, url = %delivery.url, "failed to deliver event batch");
            }
        });
        Ok(())
    }

    fn with_attrs(&self, attrs: Vec<Attr>) -> Arc<dyn Sink> {
        self.with_scope(self.scope.with_attrs(attrs))
    }

    fn with_group(&self, name: &str) -> Arc<dyn Sink> {
        self.with_scope(self.scope.with_group(name))
    }

    async fn close(&self) -> Result<(), SinkError> {
        match self.batch.drain() {
            Some(batch) => {
                tracing::debug!(bytes = batch.len(), "sending final event batch");
                self.delivery.deliver(batch, None).await
            }
            None => Ok(()),
        }
    }

    fn sink_type(&self) -> &str {
        HEC_SINK_TYPE
    }

    fn options(&self) -> serde_json::Value {
        options_json(&*self.options)
    }

    fn level_gate(&self) -> Option<&LevelGate> {
        Some(&self.gate)
    }
}
