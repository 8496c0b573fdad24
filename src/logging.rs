//! Logger bootstrap.
//!
//! # Invariants
//! - Initialization happens at most once per process.
//! - Re-initialization with the same level is a no-op; a different level is rejected.
//! - Initialization never panics.

use flexi_logger::{Logger, LoggerHandle, WriteMode};
use log::info;
use once_cell::sync::OnceCell;

use crate::error::{ReconError, ReconResult};

static LOGGING_STATE: OnceCell<LoggingState> = OnceCell::new();

struct LoggingState {
    level: &'static str,
    _logger: LoggerHandle,
}

/// `debug` for debug builds, `info` for release builds.
pub fn default_log_level() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    }
}

fn normalize_level(level: &str) -> ReconResult<&'static str> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(ReconError::InvalidConfig(format!(
            "unsupported log level `{other}`; expected trace|debug|info|warn|error"
        ))),
    }
}

/// Starts stderr logging at `level`.
///
/// # Errors
/// - Unsupported level name.
/// - Logging already active at a different level.
/// - Backend setup failure.
pub fn init_logging(level: &str) -> ReconResult<()> {
    let level = normalize_level(level)?;
    let state = LOGGING_STATE.get_or_try_init(|| -> ReconResult<LoggingState> {
        let logger = Logger::try_with_str(level)
            .map_err(|e| ReconError::InvalidConfig(format!("invalid log level `{level}`: {e}")))?
            .log_to_stderr()
            .format(flexi_logger::detailed_format)
            .write_mode(WriteMode::Direct)
            .start()
            .map_err(|e| ReconError::InvalidConfig(format!("failed to start logger: {e}")))?;
        info!(
            "event=logging_init module=logging status=ok level={} version={}",
            level,
            env!("CARGO_PKG_VERSION")
        );
        Ok(LoggingState {
            level,
            _logger: logger,
        })
    })?;

    if state.level != level {
        return Err(ReconError::InvalidConfig(format!(
            "logging already initialized with level `{}`; refusing to switch to `{}`",
            state.level, level
        )));
    }
    Ok(())
}

/// Active level, `None` before [`init_logging`].
pub fn logging_level() -> Option<&'static str> {
    LOGGING_STATE.get().map(|s| s.level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_level_accepts_known_values() {
        assert_eq!(normalize_level("INFO").unwrap(), "info");
        assert_eq!(normalize_level(" warning ").unwrap(), "warn");
        assert!(normalize_level("loud").is_err());
    }

    #[test]
    fn init_is_idempotent_and_rejects_conflicts() {
        init_logging("info").expect("first init should succeed");
        init_logging("INFO").expect("same level should be idempotent");
        let err = init_logging("debug").expect_err("level conflict should fail");
        assert!(err.to_string().contains("refusing to switch"));
        assert_eq!(logging_level(), Some("info"));
    }
}
