//! Crate-wide tagged error types.
//!
//! Each subsystem gets its own `thiserror`-derived enum so call sites can match
//! on a specific failure mode instead of inspecting a string. All of them are
//! convertible into [`EngineError`], which is what the orchestrator and CLI
//! deal with.

use crate::model::TestId;

/// Errors raised while resolving the dependency DAG (see [`crate::deps`]).
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("dependency cycle detected involving test {0}")]
    Cycle(TestId),

    #[error("other dependency error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Errors raised by the resource pool (see [`crate::resources`]).
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("insufficient resources: requested {requested_cores} cores / {requested_devices} devices, pool has {available_cores} cores / {available_devices} devices")]
    Insufficient {
        requested_cores: u32,
        requested_devices: u32,
        available_cores: u32,
        available_devices: u32,
    },

    #[error("resource handle released twice or from a stale pool generation")]
    DoubleRelease,
}

/// Errors raised while executing a test directly (see [`crate::executor`]).
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to create execute directory {path}: {source}")]
    XdirCreate {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("glob pattern {pattern:?} matched {count} files, expected exactly one")]
    AmbiguousGlob { pattern: String, count: usize },

    #[error("copy/link source path must not be absolute unless explicitly allowed: {0}")]
    AbsoluteSourcePath(std::path::PathBuf),

    #[error("failed to open log file {path}: {source}")]
    LogOpen {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write utility script {path}: {source}")]
    ScriptWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch test after {attempts} attempts: {source}")]
    LaunchFailed {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("executor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the batch manager (see [`crate::batch`]).
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch adapter failed to submit job: {0}")]
    SubmitFailed(String),

    #[error("batch adapter failed to query jobs: {0}")]
    QueryFailed(String),

    #[error("batch adapter failed to cancel jobs: {0}")]
    CancelFailed(String),

    #[error("failed to write batch script {path}: {source}")]
    ScriptWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("batch I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the results journal (see [`crate::journal`]).
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("failed to open journal {path}: {source}")]
    Open {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed journal record: {0}")]
    Malformed(String),
}

/// The top-level error type the orchestrator and CLI operate on.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("other engine error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
