//! **tagsafe** - apply generated analytics-tagging edits to a repository safely
//!
//! Every write is preceded by a side-by-side backup, every instruction gets a
//! recorded outcome, and any run can be diffed or rolled back later.

/// Command-line interface with clap integration
pub mod cli;

/// Engine: instructions, idempotency, backups, apply, diff, rollback, state
pub mod core {
    /// Error taxonomy shared by every component
    pub mod errors;
    pub use errors::EngineError;

    /// Typed edit instructions and suggestion-file ingestion
    pub mod instruction;
    pub use instruction::{EditInstruction, InstructionKind, JsonSuggestionSource, SuggestionSource};

    /// Generator interface, deadline wrapper and external-command adapter
    pub mod generator;
    pub use generator::{CommandGenerator, EditGenerator, Generation, GenerationError};

    /// Marker scan plus optional verifier
    pub mod idempotency;
    pub use idempotency::IdempotencyGate;

    /// Side-by-side backups with first-snapshot-wins semantics
    pub mod backup;
    pub use backup::BackupStore;

    /// Unified diffs and repository diff reports
    pub mod diff;

    /// Per-instruction orchestration, sequential or per-file parallel
    pub mod apply_engine;
    pub use apply_engine::{ApplyEngine, ApplyOptions, ApplyReport, CancellationToken};

    /// Repository-wide restore
    pub mod rollback;
    pub use rollback::{RollbackEngine, RollbackReport};

    /// Advisory phase state and persisted reports
    pub mod state;
    pub use state::StateTracker;

    /// Facade tying the engines to state persistence
    pub mod workflow;
    pub use workflow::Workflow;

    /// CLI runners
    pub mod commands;
}

/// Infrastructure - configuration, atomic I/O, walking, logging
pub mod infra {
    /// Layered configuration (file + TAGSAFE__* env)
    pub mod config;
    pub use config::{Config, init as config_init, load_config};

    /// Strict UTF-8 reads and atomic writes
    pub mod io;

    /// Backup discovery walker
    pub mod walk;
    pub use walk::FileWalker;

    /// tracing subscriber setup
    pub mod logging;
}

pub use cli::{AppContext, Cli, Commands};
pub use infra::{Config, FileWalker, load_config};
