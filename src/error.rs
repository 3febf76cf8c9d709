//! Error types for the sonification engine.
//!
//! The real-time trigger path never surfaces errors to the caller beyond
//! dropping the offending event: allocation failures are local and
//! recoverable. Only initialization and explicit settings updates return
//! errors.

use thiserror::Error;

/// Fatal initialization and settings-update errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No usable audio output device. Nothing downstream can compensate,
    /// so this is the one hard failure the engine surfaces.
    #[error("audio output unavailable: {0}")]
    AudioUnavailable(String),

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: String,
        source: toml::de::Error,
    },

    #[error("unknown instrument in settings update: {0}")]
    UnknownInstrument(String),

    /// A settings update carried an out-of-range or non-finite value.
    #[error("invalid settings value: {0}")]
    InvalidSettings(String),
}

/// Local, recoverable allocation failures. Callers drop the event.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// The named instrument does not exist or is currently disabled.
    #[error("instrument disabled or unknown")]
    InstrumentDisabled,

    /// Non-finite frequency, velocity outside [0,1], or non-positive duration.
    #[error("invalid trigger parameters")]
    InvalidParameters,

    /// Global ceiling saturated and no voice anywhere was eligible to steal.
    #[error("voice pool exhausted")]
    PoolExhausted,
}
