use thiserror::Error;

/// Errors that can be handed back to a caller.
/// Broken internal invariants are not represented here, see [`invariant_violation`].
#[derive(Debug, Error)]
pub enum MemSysError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed trace record at line {line}: {reason}")]
    TraceParse { line: usize, reason: String },

    #[error("Replay worker for core {core} stopped: {reason}")]
    ReplayWorker { core: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] json::Error),
}

pub type MemSysResult<T> = Result<T, MemSysError>;

/// A state the model can never legally reach, e.g. a recency counter overflow.
/// The simulation results are meaningless past this point, so we report and abort.
#[cold]
#[track_caller]
pub fn invariant_violation(what: &str) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!("Invariant violation at {}: {}", location, what);
    eprintln!("Error: Failed assertion at {}: {}", location, what);
    std::process::abort()
}
