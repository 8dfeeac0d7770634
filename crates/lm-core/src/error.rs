//! Error types for RustLM.

use thiserror::Error;

/// Main error type for LM operations.
#[derive(Error, Debug)]
pub enum LmError {
    /// Configuration errors (malformed config.json, unknown architecture).
    #[error("Config error: {0}")]
    Config(String),

    /// Model loading errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Tokenizer errors.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Generation/session errors (model evaluation failure mid-session).
    #[error("Generation error: {0}")]
    Generation(String),

    /// Device errors (Metal/CUDA unavailable or unstable).
    #[error("Device error: {0}")]
    Device(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for LM operations.
pub type LmResult<T> = Result<T, LmError>;
