pub mod level;
pub mod record;
pub mod error;
pub mod scope;
pub mod format;
pub mod sink;
pub mod config;
pub mod env;
pub mod writer;
pub mod roller;
pub mod layer;
pub mod builder;

pub mod console;
pub mod discard;
pub mod fanout;
pub mod file;

#[cfg(feature = "hec")]
pub mod hec;

pub use builder::{custom_builder, BuildCallback, BuilderRegistry, SinkBuilder, SinkConfig, SinkOptionsMut};
pub use console::{ConsoleOptions, ConsoleSink};
pub use discard::DiscardSink;
pub use error::{default_error_handler, ErrorHandler, SinkError};
pub use fanout::FanoutSink;
pub use file::{FileOptions, FileSink};
#[cfg(feature = "hec")]
pub use hec::{HecOptions, HecSink};
pub use layer::{LayerConfig, SinkLayer};
pub use level::{Level, LevelGate, LevelVar};
pub use record::{Attr, Record, Source, Value};
pub use scope::ReplaceAttr;
pub use sink::Sink;
