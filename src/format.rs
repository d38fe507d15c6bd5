use crate::error::SinkError;
use crate::record::{Attr, Record, Value, LEVEL_KEY, MESSAGE_KEY, SOURCE_KEY, TIME_KEY};
use crate::scope::{insert_attrs, AttrScope, ReplaceAttr};
use chrono::Local;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value as Json};
use std::fmt::Write as _;
use std::str::FromStr;

const RESET: &str = "\x1b[0m";
const FAINT: &str = "\x1b[2m";
const RED: &str = "\x1b[91m";
const GREEN: &str = "\x1b[92m";
const YELLOW: &str = "\x1b[93m";

/// Output format of text-oriented sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// One JSON object per line.
    Json,
    /// `key=value` pairs, group members joined with dots.
    Plaintext,
    /// Human-oriented, optionally colorized.
    #[default]
    Pretty,
}

impl FromStr for Format {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "plaintext" => Ok(Format::Plaintext),
            "pretty" | "" => Ok(Format::Pretty),
            _ => Err(SinkError::Config(format!("{s}: invalid format"))),
        }
    }
}

impl<'de> Deserialize<'de> for Format {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Turns a record plus the sink's scope into one line of output.
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    pub format: Format,
    pub include_source: bool,
    pub replace: Option<ReplaceAttr>,
    pub color: bool,
}

impl Encoder {
    pub fn json() -> Self {
        Encoder {
            format: Format::Json,
            ..Default::default()
        }
    }

    /// Encodes `record` including the trailing newline.
    pub fn encode(&self, record: &Record, scope: &AttrScope) -> Result<Vec<u8>, SinkError> {
        let builtins = self.builtins(record);
        let mut attrs = Map::new();
        scope.render_into(&mut attrs, &record.attrs, self.replace.as_ref());

        match self.format {
            Format::Json => {
                let mut out = Map::with_capacity(builtins.len() + attrs.len());
                insert_attrs(&mut out, &builtins, None, &mut Vec::new());
                out.extend(attrs);
                let mut line = serde_json::to_vec(&Json::Object(out))
                    .map_err(|e| SinkError::Format(e.to_string()))?;
                line.push(b'\n');
                Ok(line)
            }
            Format::Plaintext => {
                let mut line = String::new();
                for attr in &builtins {
                    push_pair(&mut line, &attr.key, &builtin_text(attr), false);
                }
                flatten(&mut line, "", &attrs, false);
                line.push('\n');
                Ok(line.into_bytes())
            }
            Format::Pretty => Ok(self.pretty(record, &builtins, &attrs).into_bytes()),
        }
    }

    /// `time`, `level`, `source` (when enabled and known) and `msg`, after
    /// the replace hook.
    fn builtins(&self, record: &Record) -> Vec<Attr> {
        let mut attrs = Vec::with_capacity(4);
        attrs.push(Attr::new(TIME_KEY, record.time));
        attrs.push(Attr::new(LEVEL_KEY, record.level.to_string()));
        if self.include_source {
            if let Some(source) = &record.source {
                attrs.push(Attr::new(
                    SOURCE_KEY,
                    json!({"function": source.function, "file": source.file, "line": source.line}),
                ));
            }
        }
        attrs.push(Attr::new(MESSAGE_KEY, record.message.as_str()));

        match &self.replace {
            Some(replace) => attrs
                .into_iter()
                .filter_map(|attr| replace.apply(&[], attr))
                .filter(|attr| !attr.key.is_empty())
                .collect(),
            None => attrs,
        }
    }

    fn pretty(&self, record: &Record, builtins: &[Attr], attrs: &Map<String, Json>) -> String {
        let mut line = String::new();
        let mut extra = Vec::new();
        for attr in builtins {
            match (attr.key.as_str(), &attr.value) {
                (TIME_KEY, Value::Time(time)) => {
                    let time = time.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
                    self.paint(&mut line, FAINT, &time.to_string());
                    line.push(' ');
                }
                (LEVEL_KEY, _) => {
                    let color = match record.level {
                        l if l >= crate::level::Level::ERROR => RED,
                        l if l >= crate::level::Level::WARN => YELLOW,
                        l if l >= crate::level::Level::INFO => GREEN,
                        _ => "",
                    };
                    self.paint(&mut line, color, &record.level.short_name());
                    line.push(' ');
                }
                (SOURCE_KEY, _) => {
                    self.paint(&mut line, FAINT, &builtin_text(attr));
                    line.push(' ');
                }
                (MESSAGE_KEY, Value::String(msg)) => line.push_str(msg),
                _ => extra.push(attr),
            }
        }
        for attr in extra {
            push_pair(&mut line, &attr.key, &builtin_text(attr), self.color);
        }
        flatten(&mut line, "", attrs, self.color);
        line.push('\n');
        line
    }

    fn paint(&self, line: &mut String, color: &str, text: &str) {
        if self.color && !color.is_empty() {
            let _ = write!(line, "{color}{text}{RESET}");
        } else {
            line.push_str(text);
        }
    }
}

/// Text form of a built-in attribute; sources render as `file:line`.
fn builtin_text(attr: &Attr) -> String {
    match (&attr.value, attr.key.as_str()) {
        (Value::Json(Json::Object(src)), SOURCE_KEY) => match (src.get("file"), src.get("line")) {
            (Some(Json::String(file)), Some(line)) => format!("{file}:{line}"),
            _ => text_value(&attr.value.to_json()),
        },
        (value, _) => text_value(&value.to_json()),
    }
}

fn flatten(line: &mut String, prefix: &str, map: &Map<String, Json>, color: bool) {
    for (key, value) in map {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Json::Object(inner) => flatten(line, &key, inner, color),
            other => push_pair(line, &key, &text_value(other), color),
        }
    }
}

fn push_pair(line: &mut String, key: &str, value: &str, color: bool) {
    if !line.is_empty() && !line.ends_with(' ') {
        line.push(' ');
    }
    if color {
        let _ = write!(line, "{FAINT}{key}={RESET}{value}");
    } else {
        let _ = write!(line, "{key}={value}");
    }
}

fn text_value(value: &Json) -> String {
    match value {
        Json::String(s) if needs_quoting(s) => format!("{s:?}"),
        Json::String(s) => s.clone(),
        Json::Null => "<nil>".to_string(),
        other => other.to_string(),
    }
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty()
        || s
            .chars()
            .any(|c| c.is_whitespace() || c == '=' || c == '"' || c.is_control())
}
