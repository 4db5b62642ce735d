//! Error types for the dispatcher and its configuration.

/// Contract violations reported by the dispatcher, queue and handles.
///
/// Every variant indicates a programming mistake rather than a transient
/// condition. They are returned as `Err` instead of aborting the process;
/// callers that want them to be fatal can `expect` at the call site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The calling thread already owns a dispatcher
    #[error("Only one dispatcher may be created per thread")]
    AlreadyPrepared,

    /// A main dispatcher was already registered for this process
    #[error("The main dispatcher has already been prepared")]
    MainAlreadyPrepared,

    /// The calling thread has no dispatcher
    #[error("No dispatcher; Dispatcher::prepare() wasn't called on this thread")]
    NotPrepared,

    /// The dispatch loop of this thread already exited after a quit
    #[error("The dispatch loop has already terminated")]
    LoopTerminated,

    /// The queue belongs to the main dispatcher and cannot quit
    #[error("Main dispatcher is not allowed to quit")]
    QuitNotAllowed,

    /// A task was submitted without an owning handle
    #[error("Task must have a target handle")]
    MissingTarget,

    /// A task was submitted or recycled while still in use
    #[error("Task is already in use")]
    TaskInUse,

    /// No sync barrier with this token is queued
    #[error("The specified sync barrier token {0} has not been posted or has already been removed")]
    BarrierNotFound(i32),

    /// Dispatcher configuration rejected
    #[error("Invalid dispatcher configuration: {0}")]
    Config(String),
}

/// Result alias used across the crate
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors that can occur while loading a [`DispatcherConfig`](crate::DispatcherConfig)
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or schema error
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Serialize error: {0}")]
    Serialize(String),

    /// Parsed values failed validation
    #[error(transparent)]
    Invalid(#[from] DispatchError),
}
