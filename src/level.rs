use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Severity of a [`Record`](crate::record::Record).
///
/// Levels are plain integers so that sinks can use values between the named
/// ones (`INFO+2`, `DEBUG-4`). The named levels are spaced four apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Level(i32);

impl Level {
    pub const DEBUG: Level = Level(-4);
    pub const INFO: Level = Level(0);
    pub const WARN: Level = Level(4);
    pub const ERROR: Level = Level(8);

    pub const fn new(value: i32) -> Self {
        Level(value)
    }

    pub const fn value(self) -> i32 {
        self.0
    }

    /// Returns the level shifted by `delta`, saturating at the `i32` bounds.
    pub const fn offset(self, delta: i32) -> Self {
        Level(self.0.saturating_add(delta))
    }

    /// Base name and offset, e.g. `("INFO", 2)` for `INFO+2`.
    fn base(self) -> (&'static str, i32) {
        if self < Level::INFO {
            ("DEBUG", self.0 - Level::DEBUG.0)
        } else if self < Level::WARN {
            ("INFO", self.0 - Level::INFO.0)
        } else if self < Level::ERROR {
            ("WARN", self.0 - Level::WARN.0)
        } else {
            ("ERROR", self.0 - Level::ERROR.0)
        }
    }

    /// Three-letter form used by the pretty console format (`INF`, `WRN+1`).
    pub fn short_name(self) -> String {
        let (base, delta) = self.base();
        let short = match base {
            "DEBUG" => "DBG",
            "INFO" => "INF",
            "WARN" => "WRN",
            _ => "ERR",
        };
        if delta == 0 {
            short.to_string()
        } else {
            format!("{short}{delta:+}")
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::INFO
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (base, delta) = self.base();
        if delta == 0 {
            f.write_str(base)
        } else {
            write!(f, "{base}{delta:+}")
        }
    }
}

impl From<tracing::Level> for Level {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => Level::DEBUG.offset(-4),
            tracing::Level::DEBUG => Level::DEBUG,
            tracing::Level::INFO => Level::INFO,
            tracing::Level::WARN => Level::WARN,
            _ => Level::ERROR,
        }
    }
}

/// Error returned when a level name cannot be parsed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid level '{0}'")]
pub struct ParseLevelError(pub String);

impl FromStr for Level {
    type Err = ParseLevelError;

    /// Accepts `DEBUG`, `INFO`, `WARN`, `ERROR` in any case, optionally followed
    /// by a signed offset (`warn-1`, `INFO+2`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed.find(['+', '-']).unwrap_or(trimmed.len());
        let (name, delta) = trimmed.split_at(split);
        let base = match name.to_ascii_uppercase().as_str() {
            "DEBUG" => Level::DEBUG,
            "INFO" => Level::INFO,
            "WARN" | "WARNING" => Level::WARN,
            "ERROR" => Level::ERROR,
            _ => return Err(ParseLevelError(s.to_string())),
        };
        if delta.is_empty() {
            return Ok(base);
        }
        delta
            .parse::<i32>()
            .ok()
            .and_then(|delta| base.0.checked_add(delta))
            .map(Level)
            .ok_or_else(|| ParseLevelError(s.to_string()))
    }
}

impl Serialize for Level {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i32),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Level(n)),
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A level that can be changed at runtime.
///
/// Cloning a `LevelVar` yields another handle to the *same* value, so every
/// sink derived from a common base observes `set` immediately.
#[derive(Clone)]
pub struct LevelVar(Arc<AtomicI32>);

impl LevelVar {
    pub fn new(level: Level) -> Self {
        LevelVar(Arc::new(AtomicI32::new(level.value())))
    }

    pub fn level(&self) -> Level {
        Level(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, level: Level) {
        self.0.store(level.value(), Ordering::Relaxed);
    }

    /// True when both handles point at the same underlying value.
    pub fn shares_with(&self, other: &LevelVar) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for LevelVar {
    fn default() -> Self {
        LevelVar::new(Level::INFO)
    }
}

impl fmt::Debug for LevelVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LevelVar({})", self.level())
    }
}

impl Serialize for LevelVar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.level().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LevelVar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Level::deserialize(deserializer).map(LevelVar::new)
    }
}

/// Minimum and optional maximum level consulted by a sink's `enabled`.
#[derive(Debug, Clone, Default)]
pub struct LevelGate {
    min: LevelVar,
    max: Option<LevelVar>,
}

impl LevelGate {
    pub fn new(min: LevelVar, max: Option<LevelVar>) -> Self {
        LevelGate { min, max }
    }

    /// A gate with only a minimum threshold.
    pub fn at_least(level: Level) -> Self {
        LevelGate::new(LevelVar::new(level), None)
    }

    pub fn enabled(&self, level: Level) -> bool {
        if level < self.min.level() {
            return false;
        }
        match &self.max {
            Some(max) => level <= max.level(),
            None => true,
        }
    }

    /// Handle for changing the minimum level.
    pub fn min(&self) -> &LevelVar {
        &self.min
    }

    /// Handle for changing the maximum level, if the gate has one.
    pub fn max(&self) -> Option<&LevelVar> {
        self.max.as_ref()
    }
}
