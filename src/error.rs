//! Error taxonomy and process exit codes.
//!
//! Every component past [`crate::config`] returns one of these variants
//! rather than a bare `anyhow::Error`; the supervisor maps the terminal
//! variant observed at shutdown to a process exit code.

use thiserror::Error;

/// Discriminated engine error, covering every category in the design's
/// error-handling section.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration invalid: {0}")]
    Configuration(String),

    #[error("display acquisition failed: {0}")]
    Display(#[source] anyhow::Error),

    #[error("stream {index} decode-fatal: {source}")]
    DecodeFatal {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("resource allocation refused: {0}")]
    Resource(String),

    #[error("all streams broken")]
    AllStreamsBroken,

    #[error("fatal signal received: {0}")]
    FatalSignal(i32),
}

impl EngineError {
    /// Process exit code per §6. 0 is reserved for clean quit and is
    /// never produced by this mapping.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Configuration(_) => 1,
            EngineError::Display(_) => 2,
            EngineError::AllStreamsBroken => 3,
            EngineError::DecodeFatal { .. } => 3,
            EngineError::Resource(_) => 1,
            EngineError::FatalSignal(_) => 4,
        }
    }
}

/// Per-frame decode result, distinct from [`EngineError`]: most variants
/// here are expected steady-state outcomes, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A fully decoded frame is available in the requested slot.
    Ok,
    /// No output yet; the caller may call again immediately.
    Retry,
    /// End of stream; no further frames will be produced.
    Eof,
    /// Unrecoverable; the stream is now broken.
    Fatal,
}

/// Errors from opening a media source.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("cannot open source: {0}")]
    CannotOpen(String),
    #[error("no video track found")]
    NoVideoTrack,
    #[error("codec unsupported: {0}")]
    CodecUnsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_nonzero_and_distinct_by_category() {
        let config = EngineError::Configuration("bad path".into());
        let display = EngineError::Display(anyhow::anyhow!("no crtc"));
        let broken = EngineError::AllStreamsBroken;
        let signal = EngineError::FatalSignal(11);

        assert_eq!(config.exit_code(), 1);
        assert_eq!(display.exit_code(), 2);
        assert_eq!(broken.exit_code(), 3);
        assert_eq!(signal.exit_code(), 4);
    }
}
