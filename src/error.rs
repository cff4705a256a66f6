//! Error types for the generation pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Initialization,
    State,
    Validation,
    Cancelled,
    Callback,
    Engine,
    Config,
}

/// Malformed arguments passed to `generate`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Prompt must be a string")]
    PromptNotString,

    #[error("Generation callback must be a function")]
    CallbackNotFunction,

    #[error("Options must be an object")]
    OptionsNotObject,

    #[error("Invalid value for option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },
}

impl ValidationError {
    pub(crate) fn invalid_option(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Main error type for the pipeline controller.
///
/// Every failed operation leaves the controller state untouched.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// `init` called on a controller that already owns an engine.
    #[error("Pipeline is already initialized")]
    AlreadyInitialized,

    #[error("Unknown pipeline kind '{0}'")]
    UnknownKind(String),

    #[error("Pipeline is not initialized")]
    NotInitialized,

    #[error("Chat is already started")]
    ChatAlreadyStarted,

    #[error("Chat is not started")]
    ChatNotStarted,

    /// Overlapping `generate`, or a chat transition while one is running.
    #[error("Generation is already in progress")]
    GenerationInProgress,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Generation was cancelled")]
    Cancelled,

    /// The caller-supplied chunk callback returned an error.
    #[error("Generation callback failed: {0}")]
    Callback(#[source] anyhow::Error),

    #[error("Engine error: {0}")]
    Engine(#[source] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyInitialized | Self::UnknownKind(_) => ErrorKind::Initialization,
            Self::NotInitialized
            | Self::ChatAlreadyStarted
            | Self::ChatNotStarted
            | Self::GenerationInProgress => ErrorKind::State,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Callback(_) => ErrorKind::Callback,
            Self::Engine(_) => ErrorKind::Engine,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}
