//! # Context Connectors Core
//!
//! Runtime-free logic for Context Connectors: the file and index-state
//! model, the content filter, the [`Source`](source::Source) capability
//! trait, and the index-state store abstraction including the layered
//! primary/remote view.
//!
//! This crate contains no tokio, filesystem, or network dependencies.
//! Concrete sources and stores live in the `context-connectors` crate.

pub mod filter;
pub mod models;
pub mod search;
pub mod source;
pub mod store;
