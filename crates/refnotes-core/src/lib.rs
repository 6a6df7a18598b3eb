//! refnotes-core library.
//!
//! Review metadata for a change (patch sets, votes, comments, messages,
//! reviewers) lives as a linear commit history on one ref per change, with
//! inline comments stored as notes keyed by revision. This crate holds the
//! codecs for that history, the update pipeline that appends to it, the
//! rebuilder that replays relational rows into it, and the migration
//! machinery that moves a change's system of record between the two stores.
//!
//! # Conventions
//!
//! - **Errors**: library operations return [`error::NotesError`]; backend
//!   calls return [`repo::RepoError`]. `anyhow` is reserved for config
//!   loading and bulk drivers that aggregate failures.
//! - **Logging**: `tracing` macros with structured fields. The library never
//!   installs a subscriber.
//! - **Configuration**: [`config::NotesConfig`] is passed explicitly to every
//!   component that needs it.

pub mod config;
pub mod db;
pub mod error;
pub mod migration;
pub mod model;
pub mod note;
pub mod notes;
pub mod rebuild;
pub mod repo;
pub mod retry;
pub mod sequence;
pub mod token;
pub mod update;

pub use error::{ErrorCode, NotesError};
