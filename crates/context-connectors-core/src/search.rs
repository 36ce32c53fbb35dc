//! Search engine seam.
//!
//! Ranking and snippet extraction are owned by an external engine. The
//! engine consumes the query-only projection loaded from a store.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::IndexStateSearchOnly;

/// Options passed through to the engine.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Upper bound on the length of the returned text, if the engine honors it.
    pub max_output_length: Option<usize>,
}

/// A natural-language search engine over one index.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Answer `query`, returning formatted result text, or `None` when
    /// nothing relevant was found.
    async fn search(
        &self,
        index: &IndexStateSearchOnly,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Option<String>>;
}
