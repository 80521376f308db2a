//! Startup configuration.
//!
//! [`StartupConfig`] is the shape an external launcher hands the engine.
//! [`EngineConfig::load`] validates it once, collecting every violation
//! rather than failing on the first, and produces the immutable value
//! every other component is constructed from.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::gpu::keystone::Corners;
use crate::metrics::EngineMetrics;

/// External draw callback invoked once per frame after the video pass,
/// before `present`. Not serializable — absent from any config loaded
/// from a file, only ever set programmatically by the launcher. Errors
/// are logged and the frame's overlay pass is skipped; they never reach
/// [`EngineError`] (§7, *External*).
pub struct OverlayHook(pub Box<dyn FnMut(&EngineMetrics) -> anyhow::Result<()> + Send>);

impl std::fmt::Debug for OverlayHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OverlayHook(..)")
    }
}

/// Recognized log levels, also settable via the `log_level_env`
/// environment variable (which takes precedence over this field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

fn default_max_decode_attempts() -> u32 {
    3
}

fn default_decode_timeout_ms() -> u64 {
    5000
}

fn default_memory_limit_mb() -> u32 {
    512
}

fn default_max_video_width() -> u32 {
    3840
}

fn default_max_video_height() -> u32 {
    2160
}

/// The launcher-supplied configuration, serializable so it can be loaded
/// from a file; the core itself performs no file I/O.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// 1 or 2 media paths/URIs.
    pub sources: Vec<String>,
    /// Attempt hardware decode first if true.
    pub prefer_hardware: bool,
    /// Hardware failure threshold before software fallback.
    #[serde(default = "default_max_decode_attempts")]
    pub max_decode_attempts: u32,
    /// First-frame decode deadline, in milliseconds.
    #[serde(default = "default_decode_timeout_ms")]
    pub decode_timeout_ms: u64,
    /// Soft ceiling enforced at pool allocation, in megabytes.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,
    /// Reject streams wider than this.
    #[serde(default = "default_max_video_width")]
    pub max_video_width: u32,
    /// Reject streams taller than this.
    #[serde(default = "default_max_video_height")]
    pub max_video_height: u32,
    /// ERROR/WARN/INFO/DEBUG/TRACE, overridable by `log_level_env`.
    pub log_level: LogLevel,
    /// Optional external draw callback invoked after the video pass.
    #[serde(skip)]
    pub overlay_hook: Option<OverlayHook>,
    /// Initial keystone corner positions; defaults to identity.
    pub keystone_initial: Corners,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            prefer_hardware: true,
            max_decode_attempts: default_max_decode_attempts(),
            decode_timeout_ms: default_decode_timeout_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            max_video_width: default_max_video_width(),
            max_video_height: default_max_video_height(),
            log_level: LogLevel::default(),
            overlay_hook: None,
            keystone_initial: Corners::identity(),
        }
    }
}

/// Name of the environment variable that overrides `log_level`.
pub const LOG_LEVEL_ENV: &str = "log_level_env";

/// Validated, immutable configuration every other component is built
/// from. Nothing past this point re-validates these fields.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sources: Vec<String>,
    pub prefer_hardware: bool,
    pub max_decode_attempts: u32,
    pub decode_timeout_ms: u64,
    pub memory_limit_mb: u32,
    pub max_video_width: u32,
    pub max_video_height: u32,
    pub log_level: LogLevel,
    pub overlay_hook: Option<OverlayHook>,
    pub keystone_initial: Corners,
}

impl EngineConfig {
    /// Validate a [`StartupConfig`], applying the `log_level_env`
    /// override, and collect every violation found rather than stopping
    /// at the first.
    pub fn load(config: StartupConfig) -> Result<Self, EngineError> {
        let mut problems = Vec::new();

        if config.sources.is_empty() {
            problems.push("sources must contain at least one media path".to_string());
        }
        if config.sources.len() > 2 {
            problems.push(format!(
                "sources must contain at most 2 media paths, got {}",
                config.sources.len()
            ));
        }
        if config.max_video_width == 0 || config.max_video_height == 0 {
            problems.push("max_video_width/height must be nonzero".to_string());
        }
        if config.memory_limit_mb == 0 {
            problems.push("memory_limit_mb must be nonzero".to_string());
        }
        if config.max_decode_attempts == 0 {
            problems.push("max_decode_attempts must be at least 1".to_string());
        }
        if config.decode_timeout_ms == 0 {
            problems.push("decode_timeout_ms must be nonzero".to_string());
        }
        if !config.keystone_initial.is_non_degenerate() {
            problems.push("keystone_initial corners must form a non-degenerate quad".to_string());
        }

        let log_level = resolve_log_level(config.log_level);

        if !problems.is_empty() {
            return Err(EngineError::Configuration(problems.join("; ")));
        }

        Ok(EngineConfig {
            sources: config.sources,
            prefer_hardware: config.prefer_hardware,
            max_decode_attempts: config.max_decode_attempts,
            decode_timeout_ms: config.decode_timeout_ms,
            memory_limit_mb: config.memory_limit_mb,
            max_video_width: config.max_video_width,
            max_video_height: config.max_video_height,
            log_level,
            overlay_hook: config.overlay_hook,
            keystone_initial: config.keystone_initial,
        })
    }
}

/// Apply the `log_level_env` override if present and parseable;
/// otherwise fall back to the configured level.
fn resolve_log_level(configured: LogLevel) -> LogLevel {
    match std::env::var(LOG_LEVEL_ENV) {
        Ok(value) => match value.to_uppercase().as_str() {
            "ERROR" => LogLevel::Error,
            "WARN" => LogLevel::Warn,
            "INFO" => LogLevel::Info,
            "DEBUG" => LogLevel::Debug,
            "TRACE" => LogLevel::Trace,
            _ => configured,
        },
        Err(_) => configured,
    }
}

/// Install the process-wide logger honoring the resolved level (C11).
pub fn init_logging(level: LogLevel) {
    let _ = env_logger::Builder::new()
        .parse_filters(level.as_filter_str())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> StartupConfig {
        StartupConfig {
            sources: vec!["/media/a.mp4".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn empty_sources_is_rejected() {
        let config = StartupConfig {
            sources: vec![],
            ..Default::default()
        };
        let err = EngineConfig::load(config).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn three_sources_is_rejected() {
        let config = StartupConfig {
            sources: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        };
        assert!(EngineConfig::load(config).is_err());
    }

    #[test]
    fn width_exactly_at_max_is_accepted() {
        let config = valid_config();
        assert!(EngineConfig::load(config).is_ok());
    }

    #[test]
    fn aggregates_multiple_problems_into_one_error() {
        let config = StartupConfig {
            sources: vec![],
            max_video_width: 0,
            memory_limit_mb: 0,
            ..Default::default()
        };
        let err = EngineConfig::load(config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("sources"));
        assert!(message.contains("max_video_width"));
        assert!(message.contains("memory_limit_mb"));
    }

    #[test]
    fn log_level_env_overrides_configured_level() {
        std::env::set_var(LOG_LEVEL_ENV, "DEBUG");
        let config = StartupConfig {
            log_level: LogLevel::Error,
            ..valid_config()
        };
        let resolved = EngineConfig::load(config).unwrap();
        assert_eq!(resolved.log_level, LogLevel::Debug);
        std::env::remove_var(LOG_LEVEL_ENV);
    }
}
