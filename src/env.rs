//! Environment variable names used by this crate for convenient
//! configuration of sinks from services, plus discovery of the executable
//! name and host name used as option defaults.
//!
//! These are purely helpers; the sink types themselves never read the
//! environment except to fill in defaults.

/// Bearer token for the event collector.
pub const LOG_SINK_HEC_API_TOKEN_ENV: &str = "LOG_SINK_HEC_API_TOKEN";

/// Event collector host name, e.g. `ingest.us1.example.net`.
pub const LOG_SINK_HEC_INGEST_HOSTNAME_ENV: &str = "LOG_SINK_HEC_INGEST_HOSTNAME";

/// Full ingestion URL, overriding the host name.
pub const LOG_SINK_HEC_INGEST_URL_ENV: &str = "LOG_SINK_HEC_INGEST_URL";

/// Value of the `S1-Scope` header.
pub const LOG_SINK_HEC_SCOPE_ENV: &str = "LOG_SINK_HEC_SCOPE";

/// Optional minimum level, e.g. `warn`.
pub const LOG_SINK_HEC_LEVEL_ENV: &str = "LOG_SINK_HEC_LEVEL";

/// Optional batch size, e.g. `64KB`.
pub const LOG_SINK_HEC_BUFFER_SIZE_ENV: &str = "LOG_SINK_HEC_BUFFER_SIZE";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// File stem of the running executable, with symlinks resolved.
pub fn executable_name() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    let exe = exe.canonicalize().unwrap_or(exe);
    exe.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Host name from `HOSTNAME`, then the system.
pub fn hostname() -> Option<String> {
    if let Some(name) = non_empty("HOSTNAME") {
        return Some(name);
    }

    #[cfg(unix)]
    {
        match nix::unistd::gethostname() {
            Ok(name) => {
                if let Some(name) = name.to_str().filter(|n| !n.is_empty()) {
                    return Some(name.to_string());
                }
            }
            Err(e) => tracing::warn!("failed to get system hostname: {e}"),
        }
    }

    None
}

#[cfg(feature = "hec")]
impl crate::hec::HecOptions {
    /// Options populated from the `LOG_SINK_HEC_*` variables. Unset
    /// variables leave the defaults in place; validation happens when the
    /// sink is created.
    pub fn from_env() -> Result<Self, crate::error::SinkError> {
        use crate::error::SinkError;
        use crate::level::LevelVar;

        let mut options = Self::default();
        options.api_token = env_or(LOG_SINK_HEC_API_TOKEN_ENV, "");
        options.ingest_hostname = env_or(LOG_SINK_HEC_INGEST_HOSTNAME_ENV, "");
        options.ingest_url = non_empty(LOG_SINK_HEC_INGEST_URL_ENV);
        options.scope = env_or(LOG_SINK_HEC_SCOPE_ENV, "");
        if let Some(level) = non_empty(LOG_SINK_HEC_LEVEL_ENV) {
            let level = level
                .parse()
                .map_err(|e| SinkError::Config(format!("{LOG_SINK_HEC_LEVEL_ENV}: {e}")))?;
            options.level = Some(LevelVar::new(level));
        }
        if let Some(size) = non_empty(LOG_SINK_HEC_BUFFER_SIZE_ENV) {
            options.buffer_size = size
                .parse()
                .map_err(|e| SinkError::Config(format!("{LOG_SINK_HEC_BUFFER_SIZE_ENV}: {e}")))?;
        }
        Ok(options)
    }
}
