//! # dagrun
//!
//! A dependency-DAG test execution orchestrator: resolves a suite's declared
//! test dependencies into a DAG, then drives it to completion either by
//! running tests directly as local child processes or by packing them into
//! batch-queue jobs.
//!
//! ## Architecture
//!
//! - [`model`] — the typed data model (`TestId`, `TestSpec`, `TestStatus`, ...)
//! - [`store`] — the in-memory registry of parsed tests for a run
//! - [`deps`] — dependency-pattern resolution and cycle detection
//! - [`resources`] — the CPU-core/accelerator-device pool
//! - [`scheduler`] — the dependency- and resource-aware ready queue
//! - [`executor`] — direct-mode launch, poll, and timeout escalation
//! - [`batch`] — indirect batch-queue grouping, submission, and polling
//! - [`journal`] — the append-only crash-safe results log
//! - [`report`] — run summaries and console progress output
//! - [`orchestrator`] — ties the above together behind one run loop
//!
//! ## Quick Start
//!
//! ```no_run
//! use dagrun::config::load_config;
//! use dagrun::store::TestCaseStore;
//! use dagrun::journal::Journal;
//! use dagrun::orchestrator::Orchestrator;
//! use dagrun::executor::process::ProcessBackend;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("dagrun.toml"))?;
//!     let store = TestCaseStore::new();
//!     let journal = Journal::open(&config.directories.results_root.join("journal.jsonl"))?;
//!
//!     let mut orchestrator = Orchestrator::new(config, store, journal, "local");
//!     orchestrator.resolve_dependencies()?;
//!     let summary = orchestrator.run_direct::<ProcessBackend>().await?;
//!
//!     std::process::exit(summary.exit_code());
//! }
//! ```

pub mod batch;
pub mod childenv;
pub mod config;
pub mod deps;
pub mod error;
pub mod executor;
pub mod journal;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod resources;
pub mod scheduler;
pub mod store;

// Re-export commonly used types for convenience.

pub use config::{load_config, load_config_str, Config};
pub use error::{EngineError, EngineResult};
pub use journal::Journal;
pub use model::{TestCase, TestId, TestSpec, TestStatus};
pub use orchestrator::Orchestrator;
pub use report::RunSummary;
pub use store::TestCaseStore;
