use thiserror::Error;

/// Failure classification for a single booking attempt, per the executor's
/// state machine. These are the only variants that ever reach a
/// [`crate::domain::notifier::Notifier`]; everything else is recovered
/// internally or retried without surfacing to the user.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("target time slot not found on calendar (likely already taken)")]
    TimeSlotNotFound,
    #[error("reservation form did not appear after clicking the slot")]
    FormLoadTimeout,
    #[error("form rendered but the submit control could not be located")]
    SubmitButtonNotFound,
    #[error("submit was clicked but no confirmation or error appeared in time")]
    ConfirmationTimeout,
    #[error("bot detection sentinel observed on page")]
    BotDetected,
    #[error("internal error during booking attempt: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// Whether this failure is terminal for the *current* booking window
    /// (§7 of the design doc): no further retries until the next window.
    pub fn is_terminal_for_window(&self) -> bool {
        matches!(self, ExecutorError::BotDetected)
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("court {0} is not configured")]
    UnknownCourt(u32),
    #[error("court {0} has no healthy page available")]
    CourtUnavailable(u32),
    #[error("navigation failed for court {court}: {message}")]
    NavigationFailed { court: u32, message: String },
    #[error("page evaluation failed: {0}")]
    EvaluationFailed(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("reservation request {0} was not found")]
    NotFound(String),
    #[error("reservation request {0} is already in a terminal state")]
    AlreadyTerminal(String),
    #[error("request {0} is already being executed for this user and slot")]
    AlreadyExecuting(String),
    #[error("request {id} was already confirmed with a different confirmation id ({existing} != {attempted})")]
    ConfirmationMismatch {
        id: String,
        existing: String,
        attempted: String,
    },
    #[error("persistence failure: {0}")]
    Persistence(#[from] std::io::Error),
    #[error("failed to (de)serialize queue records: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level crate error. Component errors are converted here only at call
/// sites that must unify heterogeneous failure sources, e.g. the
/// orchestrator collecting results from the pool, the queue, and the
/// executor in one place.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
