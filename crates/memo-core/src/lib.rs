//! memo-core
//!
//! Memoization engine for file-producing pipelines:
//! - Canonical value form with content-addressed file-records
//! - Streaming SHA-256 file digests
//! - Code fingerprinting with an opt-in transitive closure
//! - Stages: hit/miss decision, invocation, cache persistence
//! - A pipeline evaluator threading results between stages
//! - An external-command stage factory for shell tools
//!
//! A stage with a cache directory persists three sibling files per run:
//! `<name>.stage` (raw fingerprint bytes), `<name>.inputs` and
//! `<name>.outputs` (canonicalized JSON). A later run whose code, inputs,
//! and recorded outputs all still match replays the cached results
//! instead of executing.

pub mod canonical;
pub mod command;
pub mod config;
pub mod digest;
pub mod errors;
pub mod fingerprint;
pub mod path;
pub mod pipeline;
pub mod stage;
pub mod workdir;

pub use crate::errors::{MemoError, MemoResult};

/// Convenience re-exports.
pub mod prelude {
    pub use crate::canonical::{canonicalize, project, Projection, ValueMap};
    pub use crate::command::command_stage;
    pub use crate::digest::{digest_bytes, digest_file};
    pub use crate::fingerprint::{compile, fingerprint, CallableRegistry, CodeObject};
    pub use crate::pipeline::{stage_ref, Edge, Feed, Pipeline, StageRef};
    pub use crate::stage::{RunFlags, Stage, Worker};
    pub use crate::{MemoError, MemoResult};
}
