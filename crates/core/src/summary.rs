//! Deterministic session digests: statistics, TF-IDF key topics, and a
//! short excerpt of the highest-scoring memories.  No language model is
//! involved; the same session always digests to the same output.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analyzer;
use crate::error::{MemoryError, Result};
use crate::query;
use crate::record::{Memory, truncate_chars};
use crate::store::Store;

/// Topics reported per digest.
const KEY_TOPIC_COUNT: usize = 5;
/// A topic must appear in at least this many of the session's memories.
const MIN_TOPIC_MEMORIES: usize = 2;
/// Memories quoted in the excerpt.
const EXCERPT_MEMORIES: usize = 3;
/// Per-memory excerpt truncation.
const EXCERPT_CHARS: usize = 240;

#[derive(Debug, Clone, Serialize)]
pub struct SessionDigest {
    pub session_id: String,
    pub user_id: String,
    pub memory_count: usize,
    /// Mean importance across the session.
    pub importance_score: f32,
    pub summary_text: String,
    pub key_topics: Vec<String>,
    pub time_span: (DateTime<Utc>, DateTime<Utc>),
}

/// Digest one session.  Fails with `SessionEmpty` when the session has no
/// live memories.
pub fn summarize_session(
    store: &Store,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<SessionDigest> {
    let (user_id, ids) = store.with_indexes(|indexes| {
        (
            indexes.session_owner(session_id).map(str::to_string),
            indexes
                .session_docs_newest_first(session_id)
                .collect::<Vec<_>>(),
        )
    });
    let Some(user_id) = user_id else {
        return Err(MemoryError::SessionEmpty(session_id.to_string()));
    };

    let mut memories: Vec<Memory> = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(memory) = store.fetch_live(id)? {
            memories.push(memory);
        }
    }
    if memories.is_empty() {
        return Err(MemoryError::SessionEmpty(session_id.to_string()));
    }

    let memory_count = memories.len();
    let importance_score =
        memories.iter().map(|memory| memory.importance).sum::<f32>() / memory_count as f32;
    let first_created = memories
        .iter()
        .map(|memory| memory.created_at)
        .min()
        .unwrap_or(now);
    let last_created = memories
        .iter()
        .map(|memory| memory.created_at)
        .max()
        .unwrap_or(now);

    let key_topics = key_topics(store, &memories);
    let summary_text = excerpt(&memories, now);

    Ok(SessionDigest {
        session_id: session_id.to_string(),
        user_id,
        memory_count,
        importance_score,
        summary_text,
        key_topics,
        time_span: (first_created, last_created),
    })
}

/// Top-k session terms by TF-IDF, with document frequency drawn from the
/// global inverted index.  Terms present in fewer than two of the session's
/// memories are skipped; ties break on the term itself.
fn key_topics(store: &Store, memories: &[Memory]) -> Vec<String> {
    let mut term_frequency: HashMap<String, u32> = HashMap::new();
    let mut term_memories: HashMap<String, u32> = HashMap::new();
    for memory in memories {
        for (term, frequency) in analyzer::term_frequencies(&memory.content) {
            *term_frequency.entry(term.clone()).or_insert(0) += frequency;
            *term_memories.entry(term).or_insert(0) += 1;
        }
    }

    let total_docs = store.with_indexes(|indexes| indexes.memory_count()) as f64;
    let mut scored: Vec<(String, f64)> = term_frequency
        .into_iter()
        .filter(|(term, _)| term_memories.get(term).copied().unwrap_or(0) >= MIN_TOPIC_MEMORIES as u32)
        .map(|(term, frequency)| {
            let document_frequency =
                store.with_indexes(|indexes| indexes.document_frequency(&term)) as f64;
            let idf = (1.0 + total_docs / (1.0 + document_frequency)).ln();
            (term, frequency as f64 * idf)
        })
        .collect();

    scored.sort_unstable_by(|(a_term, a_score), (b_term, b_score)| {
        b_score
            .total_cmp(a_score)
            .then_with(|| a_term.cmp(b_term))
    });
    scored
        .into_iter()
        .take(KEY_TOPIC_COUNT)
        .map(|(term, _)| term)
        .collect()
}

/// Concatenate the highest-scoring memories newest-first, each truncated.
/// Text relevance is zero here; ranking is importance, recency, and access.
fn excerpt(memories: &[Memory], now: DateTime<Utc>) -> String {
    let now_ms = now.timestamp_millis();
    let mut ranked: Vec<&Memory> = memories.iter().collect();
    ranked.sort_unstable_by(|a, b| {
        let a_score = query::base_score(a.importance, now_ms - a.created_ms(), a.access_count);
        let b_score = query::base_score(b.importance, now_ms - b.created_ms(), b.access_count);
        b_score
            .total_cmp(&a_score)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut quoted: Vec<&Memory> = ranked.into_iter().take(EXCERPT_MEMORIES).collect();
    quoted.sort_unstable_by(|a, b| b.created_at.cmp(&a.created_at));
    quoted
        .iter()
        .map(|memory| truncate_chars(&memory.content, EXCERPT_CHARS))
        .collect::<Vec<_>>()
        .join("\n")
}
