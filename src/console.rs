use crate::error::{route_error, ErrorHandler, SinkError};
use crate::format::{Encoder, Format};
use crate::level::{Level, LevelGate, LevelVar};
use crate::record::{Attr, Record};
use crate::scope::{AttrScope, ReplaceAttr};
use crate::sink::{gate_from, options_json, Sink};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{IsTerminal, Write};
use std::sync::Arc;

pub const CONSOLE_SINK_TYPE: &str = "console";

/// A writer shared by every clone of a console sink.
#[derive(Clone)]
pub struct SharedWriter(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedWriter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        SharedWriter(Arc::new(Mutex::new(Box::new(writer))))
    }

    fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
        let mut out = self.0.lock();
        out.write_all(line)?;
        out.flush()
    }
}

impl fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedWriter(..)")
    }
}

/// Options of [`ConsoleSink`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleOptions {
    /// `json`, `plaintext` or `pretty` (the default).
    pub format: Format,
    /// Adds the call-site to each line.
    pub include_caller: bool,
    /// Minimum level; INFO when unset.
    pub level: Option<LevelVar>,
    pub max_level: Option<LevelVar>,
    /// Write to stderr instead of stdout.
    pub stderr: bool,
    #[serde(skip)]
    pub error_handler: Option<ErrorHandler>,
    #[serde(skip)]
    pub replace_attr: Option<ReplaceAttr>,
    /// Overrides the stdout/stderr target.
    #[serde(skip)]
    pub writer: Option<SharedWriter>,
}

/// Writes records to stdout or stderr.
///
/// The pretty format is colorized only when the target is a terminal and
/// `NO_COLOR` is not set.
#[derive(Clone)]
pub struct ConsoleSink {
    options: Arc<ConsoleOptions>,
    gate: LevelGate,
    encoder: Arc<Encoder>,
    scope: AttrScope,
    out: SharedWriter,
}

impl ConsoleSink {
    pub fn new(mut options: ConsoleOptions) -> Self {
        options.level.get_or_insert_with(|| LevelVar::new(Level::INFO));
        let gate = gate_from(&options.level, &options.max_level);

        let (out, terminal) = match &options.writer {
            Some(writer) => (writer.clone(), false),
            None if options.stderr => {
                let stderr = std::io::stderr();
                let terminal = stderr.is_terminal();
                (SharedWriter::new(stderr), terminal)
            }
            None => {
                let stdout = std::io::stdout();
                let terminal = stdout.is_terminal();
                (SharedWriter::new(stdout), terminal)
            }
        };
        let color = options.format == Format::Pretty
            && terminal
            && std::env::var_os("NO_COLOR").is_none();

        let encoder = Encoder {
            format: options.format,
            include_source: options.include_caller,
            replace: options.replace_attr.clone(),
            color,
        };

        ConsoleSink {
            options: Arc::new(options),
            gate,
            encoder: Arc::new(encoder),
            scope: AttrScope::new(),
            out,
        }
    }

    fn with_scope(&self, scope: AttrScope) -> Arc<dyn Sink> {
        Arc::new(ConsoleSink {
            scope,
            ..self.clone()
        })
    }
}

#[async_trait]
impl Sink for ConsoleSink {
    fn enabled(&self, level: Level) -> bool {
        self.gate.enabled(level)
    }

    async fn handle(&self, record: &Record) -> Result<(), SinkError> {
        let result = self
            .encoder
            .encode(record, &self.scope)
            .and_then(|line| self.out.write_line(&line).map_err(SinkError::from));
        match result {
            Ok(()) => Ok(()),
            Err(err) => route_error(self.options.error_handler.as_ref(), err, Some(record)),
        }
    }

    fn with_attrs(&self, attrs: Vec<Attr>) -> Arc<dyn Sink> {
        self.with_scope(self.scope.with_attrs(attrs))
    }

    fn with_group(&self, name: &str) -> Arc<dyn Sink> {
        self.with_scope(self.scope.with_group(name))
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.out.0.lock().flush()?;
        Ok(())
    }

    fn sink_type(&self) -> &str {
        CONSOLE_SINK_TYPE
    }

    fn options(&self) -> serde_json::Value {
        options_json(&*self.options)
    }

    fn level_gate(&self) -> Option<&LevelGate> {
        Some(&self.gate)
    }
}
