use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenient result alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an error for the structured result surface.
///
/// Every [`Error`] variant maps onto exactly one kind; callers group
/// failures by range → guest → task and report the kind alongside the
/// component that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The range description referenced unknown ids, contained cycles, or
    /// requested an unsatisfiable host assignment. Raised before any side
    /// effect.
    Validation,
    /// Out of disk, out of memory, or a host at capacity.
    Resource,
    /// SSH/SCP failure that survived the executor's retry policy.
    Transport,
    /// Driver-level hypervisor error.
    Hypervisor,
    /// A guest command exited non-zero.
    Task,
    /// A per-step time budget was exceeded.
    Timeout,
    /// Content fingerprint mismatch after transfer.
    Integrity,
    /// Invariant violation inside the orchestrator.
    Internal,
}

impl ErrorKind {
    /// Short lowercase label used in journal entries and result maps.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Resource => "resource",
            ErrorKind::Transport => "transport",
            ErrorKind::Hypervisor => "hypervisor",
            ErrorKind::Task => "task",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Cyris library error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read range description at {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Range description at {path} could not be parsed: {source}")]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Range description validation failed for {path}: {message}")]
    InvalidConfig { path: PathBuf, message: String },
    #[error("The range description path {path} does not exist or is not readable.")]
    ExplicitConfigMissing { path: PathBuf },
    #[error("Spec validation failed: {message}")]
    Validation { message: String },
    #[error("Resource shortfall for {resource}: {message}")]
    Resource { resource: String, message: String },
    #[error("Transport failure against {target}: {message}")]
    Transport { target: String, message: String },
    #[error("Hypervisor operation failed on host `{host}`: {message}")]
    Hypervisor { host: String, message: String },
    #[error("Task `{task}` failed on guest `{guest}`: {message}")]
    TaskFailed {
        guest: String,
        task: String,
        message: String,
    },
    #[error("Operation `{operation}` exceeded its {budget:?} budget")]
    Timeout { operation: String, budget: Duration },
    #[error("Integrity check failed for {path}: expected {expected}, found {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("Failed to persist registry state at {path}: {source}")]
    WriteState {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read registry state at {path}: {source}")]
    ReadState {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Registry journal entry could not be encoded: {source}")]
    EncodeState {
        #[source]
        source: serde_json::Error,
    },
    #[error(
        "Another cyris controller already holds the state root at {path}. \
         Stop it or point --state-root elsewhere."
    )]
    StateRootLocked { path: PathBuf },
    #[error("No range with id `{range}` is recorded in the registry.")]
    UnknownRange { range: String },
    #[error("Preflight failed: {message}")]
    PreflightFailed { message: String },
    #[error("Internal invariant violated: {message}")]
    Internal { message: String },
}

impl Error {
    /// Map the variant onto the result-surface taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ReadConfig { .. }
            | Error::ParseConfig { .. }
            | Error::InvalidConfig { .. }
            | Error::ExplicitConfigMissing { .. }
            | Error::Validation { .. }
            | Error::UnknownRange { .. } => ErrorKind::Validation,
            Error::Resource { .. } | Error::PreflightFailed { .. } => ErrorKind::Resource,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Hypervisor { .. } => ErrorKind::Hypervisor,
            Error::TaskFailed { .. } => ErrorKind::Task,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Integrity { .. } => ErrorKind::Integrity,
            Error::CreateDir { .. }
            | Error::WriteState { .. }
            | Error::ReadState { .. }
            | Error::EncodeState { .. }
            | Error::StateRootLocked { .. }
            | Error::Internal { .. } => ErrorKind::Internal,
        }
    }
}
