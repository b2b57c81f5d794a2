//! Search over indexed business cards.
//!
//! [`SearchService`] is the read path used by the HTTP API: it puts the
//! [`QueryCache`] in front of the [`SearchIndex`] and returns the serialized
//! JSON response, so a cached answer is byte-for-byte what the index
//! produced. [`run_search`] is the CLI path (`bizcard search`), which queries
//! the index directly and prints a listing.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::{QueryCache, QueryFingerprint};
use crate::config::Config;
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{FieldValue, SearchHit};
use crate::store::sqlite::SqliteStore;
use crate::store::SearchIndex;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub limit: usize,
    pub hits: Vec<SearchHit>,
}

pub struct SearchService {
    index: Arc<dyn SearchIndex>,
    cache: Arc<QueryCache>,
}

impl SearchService {
    pub fn new(index: Arc<dyn SearchIndex>, cache: Arc<QueryCache>) -> Self {
        Self { index, cache }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Search and return the JSON-encoded [`SearchResponse`].
    ///
    /// `limit` is clamped to `1..=MAX_LIMIT`. An empty query is a permanent
    /// (client) error.
    pub async fn search_json(&self, query: &str, limit: usize) -> PipelineResult<Arc<Vec<u8>>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(PipelineError::permanent("search", "query must not be empty"));
        }
        let limit = limit.clamp(1, MAX_LIMIT);
        let key = QueryFingerprint::new(query, limit);

        let index = &self.index;
        self.cache
            .get_or_compute(key, || async move {
                let hits = index.search(query, limit).await?;
                tracing::debug!(query, hits = hits.len(), "search computed");
                serde_json::to_vec(&SearchResponse {
                    query: query.to_string(),
                    limit,
                    hits,
                })
                .map_err(|e| PipelineError::permanent("encode search response", e))
            })
            .await
    }
}

/// `bizcard search <query>`: query the index and print the hits.
pub async fn run_search(config: &Config, query: &str, limit: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let hits = store.search(query, limit).await?;

    if hits.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let field = |name: &str| hit.fields.get(name).and_then(FieldValue::as_text);
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            hit.score,
            field("name").unwrap_or("(no name)"),
            field("company").unwrap_or("(no company)")
        );
        for name in ["job_title", "email", "phone"] {
            if let Some(value) = field(name) {
                println!("    {}: {}", name, value);
            }
        }
        println!("    excerpt: \"{}\"", hit.snippet.replace('\n', " ").trim());
        println!("    id: {}", hit.image_id);
        println!();
    }

    pool.close().await;
    Ok(())
}
