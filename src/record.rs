use crate::level::Level;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value as Json};
use std::time::Duration;

/// Key of the record's timestamp in [`Record::to_map`] and encoded output.
pub const TIME_KEY: &str = "time";
/// Key of the record's level.
pub const LEVEL_KEY: &str = "level";
/// Key of the record's message.
pub const MESSAGE_KEY: &str = "msg";
/// Key of the record's call-site group.
pub const SOURCE_KEY: &str = "source";
/// Key under which [`Record::to_map`] nests user attributes.
pub const ATTRS_KEY: &str = "attrs";
pub const FILE_KEY: &str = "file";
pub const LINE_KEY: &str = "line";
pub const FUNCTION_KEY: &str = "function";

/// Value carried by an [`Attr`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Time(DateTime<Utc>),
    Duration(Duration),
    /// Nested attributes rendered as an object.
    Group(Vec<Attr>),
    /// Arbitrary JSON, used for values that don't fit the other variants.
    Json(Json),
}

impl Value {
    /// Converts the value to JSON. Times use RFC 3339 with milliseconds and
    /// durations are encoded as integer nanoseconds.
    pub fn to_json(&self) -> Json {
        match self {
            Value::String(s) => Json::String(s.clone()),
            Value::Int(i) => Json::from(*i),
            Value::Uint(u) => Json::from(*u),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Bool(b) => Json::Bool(*b),
            Value::Time(t) => Json::String(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Duration(d) => Json::from(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)),
            Value::Group(attrs) => Json::Object(
                attrs
                    .iter()
                    .map(|a| (a.key.clone(), a.value.to_json()))
                    .collect(),
            ),
            Value::Json(v) => v.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl From<Duration> for Value {
    fn from(v: Duration) -> Self {
        Value::Duration(v)
    }
}

impl From<Json> for Value {
    fn from(v: Json) -> Self {
        Value::Json(v)
    }
}

/// A key/value pair attached to a record or a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub key: String,
    pub value: Value,
}

impl Attr {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Attr {
            key: key.into(),
            value: value.into(),
        }
    }

    /// A group attribute holding `attrs`.
    pub fn group(key: impl Into<String>, attrs: Vec<Attr>) -> Self {
        Attr {
            key: key.into(),
            value: Value::Group(attrs),
        }
    }
}

/// Call-site of a log statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl Source {
    /// Captures the caller's file and line. The function name is not
    /// available from the location and is left empty.
    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Source {
            function: String::new(),
            file: location.file().to_string(),
            line: location.line(),
        }
    }

    /// The source as a group of `function`, `file` and `line` attributes.
    pub fn to_attrs(&self) -> Vec<Attr> {
        vec![
            Attr::new(FUNCTION_KEY, self.function.as_str()),
            Attr::new(FILE_KEY, self.file.as_str()),
            Attr::new(LINE_KEY, self.line),
        ]
    }
}

/// One log event.
///
/// Sinks receive records by reference; a sink that needs a wider attribute
/// set clones the record and calls [`Record::add_attrs`] on its own copy.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub time: DateTime<Utc>,
    pub level: Level,
    pub message: String,
    pub attrs: Vec<Attr>,
    pub source: Option<Source>,
}

impl Record {
    /// A record stamped with the current time.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Record {
            time: Utc::now(),
            level,
            message: message.into(),
            attrs: Vec::new(),
            source: None,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.push(Attr::new(key, value));
        self
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Records the call-site of the caller.
    #[track_caller]
    pub fn with_caller(self) -> Self {
        self.with_source(Source::caller())
    }

    pub fn add_attrs(&mut self, attrs: impl IntoIterator<Item = Attr>) {
        self.attrs.extend(attrs);
    }

    /// Converts the record into a JSON map with the built-in fields under
    /// [`TIME_KEY`], [`LEVEL_KEY`], [`MESSAGE_KEY`] and [`SOURCE_KEY`], and
    /// every user attribute under [`ATTRS_KEY`].
    pub fn to_map(&self) -> Map<String, Json> {
        let mut map = Map::with_capacity(5);
        map.insert(TIME_KEY.into(), Value::Time(self.time).to_json());
        map.insert(LEVEL_KEY.into(), Json::String(self.level.to_string()));
        map.insert(MESSAGE_KEY.into(), Json::String(self.message.clone()));
        if let Some(source) = &self.source {
            let mut src = Map::with_capacity(3);
            src.insert(FILE_KEY.into(), Json::String(source.file.clone()));
            src.insert(LINE_KEY.into(), Json::from(source.line));
            src.insert(FUNCTION_KEY.into(), Json::String(source.function.clone()));
            map.insert(SOURCE_KEY.into(), Json::Object(src));
        }
        if !self.attrs.is_empty() {
            let attrs: Map<String, Json> = self
                .attrs
                .iter()
                .map(|a| (a.key.clone(), a.value.to_json()))
                .collect();
            map.insert(ATTRS_KEY.into(), Json::Object(attrs));
        }
        map
    }
}
