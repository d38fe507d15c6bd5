use crate::config::{expand_env, ByteSize};
use crate::env::executable_name;
use crate::error::{route_error, ErrorHandler, SinkError};
use crate::format::Encoder;
use crate::level::{Level, LevelGate, LevelVar};
use crate::record::{Attr, Record};
use crate::roller::{RollPolicy, RollingFile};
use crate::scope::{AttrScope, ReplaceAttr};
use crate::sink::{gate_from, options_json, Sink};
use crate::writer::BufferedWriter;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const FILE_SINK_TYPE: &str = "file";

const DEFAULT_LOG_NAME: &str = "app";
const SECONDS_PER_DAY: u64 = 86_400;

/// Location and permissions of the log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilePath {
    /// May contain `$VAR` or `${VAR}`. When empty, `<executable>.log` in the
    /// working directory is used.
    pub path: String,
    pub auto_create_parent: bool,
    pub dir_mode: u32,
    pub file_mode: u32,
    /// Apply `file_mode` to an existing file.
    pub auto_chmod: bool,
    /// Apply `owner`/`group` when opening the file.
    pub auto_chown: bool,
    pub owner: Option<u32>,
    pub group: Option<u32>,
}

impl Default for FilePath {
    fn default() -> Self {
        FilePath {
            path: String::new(),
            auto_create_parent: true,
            dir_mode: 0o755,
            file_mode: 0o640,
            auto_chmod: true,
            auto_chown: false,
            owner: None,
            group: None,
        }
    }
}

/// Options of [`FileSink`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOptions {
    /// In-memory buffer in front of the file; 0 writes each record through.
    pub buffer_size: ByteSize,
    /// Gzip rotated files.
    pub compress: bool,
    pub file: FilePath,
    pub include_caller: bool,
    pub level: Option<LevelVar>,
    pub max_level: Option<LevelVar>,
    /// Days to keep rotated files; 0 keeps them regardless of age.
    pub max_age: u32,
    /// Rotated files to keep; 0 keeps all.
    pub max_count: usize,
    /// Megabytes before rotation; 0 means 100.
    pub max_size: u64,
    #[serde(skip)]
    pub error_handler: Option<ErrorHandler>,
    #[serde(skip)]
    pub replace_attr: Option<ReplaceAttr>,
}

impl FileOptions {
    fn roll_policy(&self) -> RollPolicy {
        let file = &self.file;
        RollPolicy {
            max_size_mb: self.max_size,
            max_count: self.max_count,
            max_age: (self.max_age > 0)
                .then(|| Duration::from_secs(u64::from(self.max_age) * SECONDS_PER_DAY)),
            compress: self.compress,
            create_parent: file.auto_create_parent,
            dir_mode: file.dir_mode,
            file_mode: file.file_mode,
            chmod: file.auto_chmod,
            chown: file.auto_chown.then_some((file.owner, file.group)),
        }
    }
}

/// Resolves the configured path: environment expansion, the default name
/// when empty, and an absolute result.
fn resolve_path(configured: &str) -> Result<PathBuf, SinkError> {
    let expanded = expand_env(configured.trim());
    let path = if expanded.is_empty() {
        let stem = executable_name().unwrap_or_else(|| DEFAULT_LOG_NAME.to_string());
        PathBuf::from(format!("{stem}.log"))
    } else {
        PathBuf::from(expanded)
    };
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir()
        .map_err(|e| SinkError::Config(format!("failed to resolve log file path: {e}")))?;
    Ok(cwd.join(path))
}

/// Writes JSON lines to a size-rotated file.
#[derive(Clone)]
pub struct FileSink {
    options: Arc<FileOptions>,
    gate: LevelGate,
    encoder: Arc<Encoder>,
    scope: AttrScope,
    writer: Arc<BufferedWriter<RollingFile>>,
}

impl FileSink {
    /// Opens the log file, creating it (and its parents) as configured.
    pub fn new(mut options: FileOptions) -> Result<Self, SinkError> {
        options.level.get_or_insert_with(|| LevelVar::new(Level::INFO));
        let path = resolve_path(&options.file.path)?;
        let file = RollingFile::open(&path, options.roll_policy()).map_err(|e| {
            SinkError::Config(format!("failed to open log file '{}': {e}", path.display()))
        })?;
        options.file.path = path.to_string_lossy().into_owned();

        let gate = gate_from(&options.level, &options.max_level);
        let encoder = Encoder {
            include_source: options.include_caller,
            replace: options.replace_attr.clone(),
            ..Encoder::json()
        };
        let writer = BufferedWriter::new(file, options.buffer_size.as_usize());

        Ok(FileSink {
            options: Arc::new(options),
            gate,
            encoder: Arc::new(encoder),
            scope: AttrScope::new(),
            writer: Arc::new(writer),
        })
    }

    /// Absolute path of the active log file.
    pub fn path(&self) -> &str {
        &self.options.file.path
    }

    fn with_scope(&self, scope: AttrScope) -> Arc<dyn Sink> {
        Arc::new(FileSink {
            scope,
            ..self.clone()
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn enabled(&self, level: Level) -> bool {
        self.gate.enabled(level)
    }

    async fn handle(&self, record: &Record) -> Result<(), SinkError> {
        let result = self
            .encoder
            .encode(record, &self.scope)
            .and_then(|line| self.writer.write(&line).map_err(SinkError::from));
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

    /// Flushes the buffer, then closes the file. A later `handle` reopens it.
    async fn close(&self) -> Result<(), SinkError> {
        self.writer.with_inner(|file| file.close())?;
        Ok(())
    }

    fn sink_type(&self) -> &str {
        FILE_SINK_TYPE
    }

    fn options(&self) -> serde_json::Value {
        options_json(&*self.options)
    }

    fn level_gate(&self) -> Option<&LevelGate> {
        Some(&self.gate)
    }
}
