use crate::console::{ConsoleOptions, ConsoleSink, CONSOLE_SINK_TYPE};
use crate::discard::{DiscardSink, DISCARD_SINK_TYPE};
use crate::error::SinkError;
use crate::fanout::{FanoutSink, FANOUT_SINK_TYPE};
use crate::file::{FileOptions, FileSink, FILE_SINK_TYPE};
#[cfg(feature = "hec")]
use crate::hec::{HecOptions, HecSink, HEC_SINK_TYPE};
use crate::sink::{options_json, Sink};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Mutable, typed view of a builder's options handed to a [`BuildCallback`]
/// right before the sink is constructed.
///
/// This is where programmatic-only settings (error handlers, attribute
/// rewrites, level translators) are attached to sinks described by
/// configuration.
pub enum SinkOptionsMut<'a> {
    Console(&'a mut ConsoleOptions),
    Discard,
    File(&'a mut FileOptions),
    #[cfg(feature = "hec")]
    Hec(&'a mut HecOptions),
    /// The child builders of a fan-out, in dispatch order.
    Fanout(&'a mut Vec<Box<dyn SinkBuilder>>),
    /// Options of a sink type registered outside this crate.
    Custom(&'a mut dyn Any),
}

/// Called with the sink type and its options before each sink is built.
pub type BuildCallback = dyn Fn(&str, SinkOptionsMut<'_>) -> Result<(), SinkError> + Send + Sync;

/// Creates a builder from raw JSON options. The registry is passed along so
/// composite builders can resolve their children.
pub type BuilderFactory =
    Arc<dyn Fn(&BuilderRegistry, Json) -> Result<Box<dyn SinkBuilder>, SinkError> + Send + Sync>;

/// A sink described by configuration but not yet constructed.
pub trait SinkBuilder: Send {
    fn sink_type(&self) -> &str;

    /// Current options as JSON.
    fn options(&self) -> Json;

    /// Runs `callback` (if any) on the options, then constructs the sink.
    /// Construction failures are wrapped in [`SinkError::Build`].
    fn build(self: Box<Self>, callback: Option<&BuildCallback>) -> Result<Arc<dyn Sink>, SinkError>;
}

/// `{"type": "...", "options": {...}}` entry of a configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub sink_type: String,
    #[serde(default)]
    pub options: Json,
}

/// Builder for sinks whose options are a plain serde struct.
struct TypedBuilder<O> {
    sink_type: &'static str,
    options: O,
    view: fn(&mut O) -> SinkOptionsMut<'_>,
    make: fn(O) -> Result<Arc<dyn Sink>, SinkError>,
}

impl<O: Serialize + Send + 'static> SinkBuilder for TypedBuilder<O> {
    fn sink_type(&self) -> &str {
        self.sink_type
    }

    fn options(&self) -> Json {
        options_json(&self.options)
    }

    fn build(self: Box<Self>, callback: Option<&BuildCallback>) -> Result<Arc<dyn Sink>, SinkError> {
        let TypedBuilder {
            sink_type,
            mut options,
            view,
            make,
        } = *self;
        if let Some(callback) = callback {
            callback(sink_type, view(&mut options))?;
        }
        make(options).map_err(|e| build_error(sink_type, e))
    }
}

/// Builder for a sink type defined outside this crate. A build callback sees
/// its options as [`SinkOptionsMut::Custom`] and can downcast them to `O`.
pub fn custom_builder<O>(
    sink_type: &'static str,
    options: O,
    make: fn(O) -> Result<Arc<dyn Sink>, SinkError>,
) -> Box<dyn SinkBuilder>
where
    O: Serialize + Send + 'static,
{
    Box::new(TypedBuilder {
        sink_type,
        options,
        view: |o| SinkOptionsMut::Custom(o),
        make,
    })
}

fn build_error(sink_type: &str, source: SinkError) -> SinkError {
    SinkError::Build {
        sink_type: sink_type.to_string(),
        source: Box::new(source),
    }
}

/// Deserializes sink options; `null` is treated as an empty object.
pub fn parse_options<O: DeserializeOwned>(options: Json) -> Result<O, SinkError> {
    let options = if options.is_null() { json!({}) } else { options };
    Ok(serde_json::from_value(options)?)
}

#[derive(Deserialize)]
struct FanoutConfig {
    #[serde(default)]
    handlers: Vec<SinkConfig>,
}

struct FanoutBuilder {
    children: Vec<Box<dyn SinkBuilder>>,
}

impl SinkBuilder for FanoutBuilder {
    fn sink_type(&self) -> &str {
        FANOUT_SINK_TYPE
    }

    fn options(&self) -> Json {
        let handlers: Vec<_> = self
            .children
            .iter()
            .map(|c| json!({"type": c.sink_type(), "options": c.options()}))
            .collect();
        json!({ "handlers": handlers })
    }

    fn build(mut self: Box<Self>, callback: Option<&BuildCallback>) -> Result<Arc<dyn Sink>, SinkError> {
        if let Some(callback) = callback {
            callback(FANOUT_SINK_TYPE, SinkOptionsMut::Fanout(&mut self.children))?;
        }
        let sinks = self
            .children
            .into_iter()
            .map(|child| child.build(callback))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| build_error(FANOUT_SINK_TYPE, e))?;
        Ok(Arc::new(FanoutSink::new(sinks)))
    }
}

fn console_factory(_: &BuilderRegistry, options: Json) -> Result<Box<dyn SinkBuilder>, SinkError> {
    Ok(Box::new(TypedBuilder {
        sink_type: CONSOLE_SINK_TYPE,
        options: parse_options::<ConsoleOptions>(options)?,
        view: |o| SinkOptionsMut::Console(o),
        make: |o| Ok(Arc::new(ConsoleSink::new(o)) as Arc<dyn Sink>),
    }))
}

fn discard_factory(_: &BuilderRegistry, _options: Json) -> Result<Box<dyn SinkBuilder>, SinkError> {
    Ok(Box::new(TypedBuilder {
        sink_type: DISCARD_SINK_TYPE,
        options: json!({}),
        view: |_| SinkOptionsMut::Discard,
        make: |_| Ok(Arc::new(DiscardSink) as Arc<dyn Sink>),
    }))
}

fn file_factory(_: &BuilderRegistry, options: Json) -> Result<Box<dyn SinkBuilder>, SinkError> {
    Ok(Box::new(TypedBuilder {
        sink_type: FILE_SINK_TYPE,
        options: parse_options::<FileOptions>(options)?,
        view: |o| SinkOptionsMut::File(o),
        make: |o| Ok(Arc::new(FileSink::new(o)?) as Arc<dyn Sink>),
    }))
}

#[cfg(feature = "hec")]
fn hec_factory(_: &BuilderRegistry, options: Json) -> Result<Box<dyn SinkBuilder>, SinkError> {
    Ok(Box::new(TypedBuilder {
        sink_type: HEC_SINK_TYPE,
        options: parse_options::<HecOptions>(options)?,
        view: |o| SinkOptionsMut::Hec(o),
        make: |o| Ok(Arc::new(HecSink::new(o)?) as Arc<dyn Sink>),
    }))
}

fn fanout_factory(registry: &BuilderRegistry, options: Json) -> Result<Box<dyn SinkBuilder>, SinkError> {
    let config: FanoutConfig = parse_options(options)?;
    let children = config
        .handlers
        .into_iter()
        .map(|c| registry.builder_from_config(&c.sink_type, c.options))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Box::new(FanoutBuilder { children }))
}

fn normalize(sink_type: &str) -> String {
    sink_type.trim().to_ascii_lowercase()
}

/// Maps sink type names to builder factories.
///
/// Names are matched case-insensitively after trimming. A registry is an
/// ordinary value: applications that want one shared instance keep it
/// themselves.
#[derive(Clone)]
pub struct BuilderRegistry {
    factories: HashMap<String, BuilderFactory>,
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl BuilderRegistry {
    /// A registry with no sink types.
    pub fn new() -> Self {
        BuilderRegistry {
            factories: HashMap::new(),
        }
    }

    /// A registry with `console`, `discard`, `fanout`, `file` and, with the
    /// `hec` feature, `sentinelone:hec`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, BuilderFactory); 4] = [
            (CONSOLE_SINK_TYPE, Arc::new(console_factory)),
            (DISCARD_SINK_TYPE, Arc::new(discard_factory)),
            (FANOUT_SINK_TYPE, Arc::new(fanout_factory)),
            (FILE_SINK_TYPE, Arc::new(file_factory)),
        ];
        for (name, factory) in builtins {
            registry.factories.insert(name.to_string(), factory);
        }
        #[cfg(feature = "hec")]
        {
            registry
                .factories
                .insert(HEC_SINK_TYPE.to_string(), Arc::new(hec_factory));
        }
        registry
    }

    /// Registers `factory` under `sink_type`.
    ///
    /// **Returns**
    /// - `Err(InvalidParameter)` when the name is blank.
    /// - `Err(TypeExists)` when the name is taken and `overwrite` is false.
    pub fn register<F>(&mut self, sink_type: &str, factory: F, overwrite: bool) -> Result<(), SinkError>
    where
        F: Fn(&BuilderRegistry, Json) -> Result<Box<dyn SinkBuilder>, SinkError> + Send + Sync + 'static,
    {
        let key = normalize(sink_type);
        if key.is_empty() {
            return Err(SinkError::InvalidParameter("sink type cannot be empty".into()));
        }
        if self.factories.contains_key(&key) && !overwrite {
            return Err(SinkError::TypeExists(key));
        }
        self.factories.insert(key, Arc::new(factory));
        Ok(())
    }

    pub fn is_registered(&self, sink_type: &str) -> bool {
        self.factories.contains_key(&normalize(sink_type))
    }

    /// Registered names, sorted.
    pub fn sink_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Creates an unbuilt sink of `sink_type` from JSON options.
    pub fn builder_from_config(&self, sink_type: &str, options: Json) -> Result<Box<dyn SinkBuilder>, SinkError> {
        let key = normalize(sink_type);
        match self.factories.get(&key) {
            Some(factory) => factory(self, options),
            None => Err(SinkError::UnsupportedType(key)),
        }
    }

    /// Parses and builds a sink in one step.
    pub fn build(&self, config: &SinkConfig, callback: Option<&BuildCallback>) -> Result<Arc<dyn Sink>, SinkError> {
        self.builder_from_config(&config.sink_type, config.options.clone())?
            .build(callback)
    }
}
