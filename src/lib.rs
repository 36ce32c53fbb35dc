//! # Context Connectors
//!
//! Keeps named indexes of remote content (git repositories, websites,
//! local directories) up to date, filtered and ready for a search engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Sources    │──▶│    Filter    │──▶│  Sync driver  │
//! │ Git/Web/FS   │   │ ignore+core  │   │   (ingest)    │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │ save
//!                                    ┌─────────▼─────────┐
//!                                    │   Primary store    │
//!                                    │ SQLite/Filesystem  │
//!                                    └─────────┬─────────┘
//!                                              │ miss
//!                                    ┌─────────▼─────────┐
//!                                    │  Remote (S3, RO)   │
//!                                    └───────────────────┘
//! ```
//!
//! The runtime-free model, filter, [`Source`](context_connectors_core::source::Source)
//! trait and store traits live in `context-connectors-core`; this crate
//! supplies the concrete sources and backends.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`ignore_rules`] | `.augmentignore` / `.gitignore` evaluation |
//! | [`source_fs`] | Local directory source |
//! | [`source_git`] | Git repository source with incremental diff |
//! | [`source_website`] | Website crawler source |
//! | [`sources`] | Source and store construction from config |
//! | [`fs_store`] | Directory-backed store |
//! | [`sqlite_store`] | SQLite-backed store with conditional writes |
//! | [`s3_store`] | S3 store (SigV4) |
//! | [`ingest`] | Sync driver |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod fs_store;
pub mod ignore_rules;
pub mod ingest;
pub mod migrate;
pub mod s3_store;
pub mod source_fs;
pub mod source_git;
pub mod source_website;
pub mod sources;
pub mod sqlite_store;

pub use context_connectors_core as core;
