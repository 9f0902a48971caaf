//! Deterministic recall planning over the secondary indexes.
//!
//! Plans never touch segment files: filtering and ranking run entirely
//! against [`Indexes`] doc entries and posting lists, and only the trimmed
//! result set is fetched from disk by the caller.
//!
//! Scoring model (weights sum to 1.0):
//! ```text
//! score = importance(0.55) + recency(0.25) + text(0.15) + access(0.05)
//! ```
//! Recency decays as `exp(-age / half_life)` with a 14-day half-life; text
//! relevance is BM25-lite over the matched terms, normalized to [0, 1];
//! access weight saturates as `1 - 1/(1 + access_count)`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::analyzer;
use crate::error::{MemoryError, Result};
use crate::index::{IMPORTANCE_BUCKET_COUNT, Indexes, time_bucket};

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 1000;

const W_IMPORTANCE: f64 = 0.55;
const W_RECENCY: f64 = 0.25;
const W_TEXT: f64 = 0.15;
const W_ACCESS: f64 = 0.05;

const RECENCY_HALF_LIFE_MS: f64 = 14.0 * 24.0 * 3600.0 * 1000.0;
const BM25_K1: f64 = 1.2;

/// A date range must span less than this to qualify as the seed index.
const TIME_SEED_MAX_MS: i64 = 7 * 24 * 3600 * 1000;

#[derive(Debug, Clone, Default)]
pub struct RecallFilter {
    pub user_id: String,
    pub session_id: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub query: Option<String>,
    pub keywords: Vec<String>,
    pub min_importance: Option<f32>,
    pub limit: Option<usize>,
}

impl RecallFilter {
    pub fn validate(&self) -> Result<()> {
        crate::record::validate_principal("user_id", &self.user_id)?;
        if let Some(min_importance) = self.min_importance {
            if !(0.0..=1.0).contains(&min_importance) {
                return Err(MemoryError::InvalidArgument(format!(
                    "min_importance must be within [0.0, 1.0], got {min_importance}"
                )));
            }
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(MemoryError::InvalidArgument(format!(
                    "date_from {from} is after date_to {to}"
                )));
            }
        }
        Ok(())
    }

    pub fn effective_limit(&self) -> usize {
        match self.limit {
            None | Some(0) => DEFAULT_LIMIT,
            Some(limit) => limit.min(MAX_LIMIT),
        }
    }

    /// Query and keyword text tokenized exactly like the indexer, deduplicated.
    fn terms(&self) -> Vec<String> {
        let mut terms = Vec::new();
        let mut seen = HashSet::new();
        if let Some(query) = &self.query {
            for term in analyzer::tokenize(query) {
                if seen.insert(term.clone()) {
                    terms.push(term);
                }
            }
        }
        for keyword in &self.keywords {
            for term in analyzer::tokenize(keyword) {
                if seen.insert(term.clone()) {
                    terms.push(term);
                }
            }
        }
        terms
    }
}

/// One ranked candidate: everything the caller needs to fetch and order the
/// final records.
#[derive(Debug, Clone, Copy)]
pub struct Hit {
    pub id: Uuid,
    pub score: f64,
}

/// Composite score with the text term fixed at zero.  Shared with eviction
/// and the summarizer, which rank without a text filter.
pub fn base_score(importance: f32, age_ms: i64, access_count: u64) -> f64 {
    W_IMPORTANCE * importance.clamp(0.0, 1.0) as f64
        + W_RECENCY * recency_decay(age_ms)
        + W_ACCESS * access_weight(access_count)
}

pub fn recency_decay(age_ms: i64) -> f64 {
    (-(age_ms.max(0) as f64) / RECENCY_HALF_LIFE_MS).exp()
}

fn access_weight(access_count: u64) -> f64 {
    1.0 - 1.0 / (1.0 + access_count as f64)
}

/// The smallest bucket a record with `importance >= min` can occupy.
fn min_importance_bucket(min_importance: f32) -> u8 {
    let scaled = min_importance.clamp(0.0, 1.0) as f64 * IMPORTANCE_BUCKET_COUNT as f64;
    ((scaled - 1e-6).ceil().max(0.0) as u8).min(IMPORTANCE_BUCKET_COUNT - 1)
}

/// Build and execute a recall plan against one index snapshot.
///
/// Plan order is fixed: seed from the most selective index (session > narrow
/// time range > user), intersect structured filters, apply AND full-text
/// semantics, score, then order by score / created_at / id.  The returned
/// hits are already trimmed to the filter's limit.
pub fn plan(indexes: &Indexes, filter: &RecallFilter, now: DateTime<Utc>) -> Result<Vec<Hit>> {
    filter.validate()?;
    let now_ms = now.timestamp_millis();
    let from_ms = filter.date_from.map(|at| at.timestamp_millis());
    let to_ms = filter.date_to.map(|at| at.timestamp_millis());

    // 1. Seed set, most selective index first.
    let seed: Vec<Uuid> = if let Some(session_id) = &filter.session_id {
        match indexes.session_owner(session_id) {
            // A session belonging to another user never leaks rows.
            Some(owner) if owner != filter.user_id => return Ok(Vec::new()),
            Some(_) => indexes.session_docs_newest_first(session_id).collect(),
            None => return Ok(Vec::new()),
        }
    } else if let (Some(from), Some(to)) = (from_ms, to_ms)
        && to - from < TIME_SEED_MAX_MS
    {
        let mut ids = Vec::new();
        for bucket in time_bucket(from)..=time_bucket(to) {
            if let Some(bucket_ids) = indexes.time_bucket_ids(&filter.user_id, bucket) {
                ids.extend(bucket_ids.iter().copied());
            }
        }
        ids
    } else {
        indexes.user_docs_newest_first(&filter.user_id).collect()
    };

    // 2. Structured intersections.
    let importance_set: Option<HashSet<Uuid>> = match filter.min_importance {
        Some(min) if min > 0.0 => {
            let mut set = HashSet::new();
            for bucket in min_importance_bucket(min)..IMPORTANCE_BUCKET_COUNT {
                if let Some(ids) = indexes.importance_bucket_ids(&filter.user_id, bucket) {
                    set.extend(ids.iter().copied());
                }
            }
            Some(set)
        }
        _ => None,
    };

    let min_importance = filter.min_importance.unwrap_or(0.0);
    let mut candidates: Vec<Uuid> = Vec::with_capacity(seed.len());
    for id in seed {
        let Some(doc) = indexes.doc(&id) else {
            continue;
        };
        if doc.user_id != filter.user_id {
            continue;
        }
        if let Some(set) = &importance_set {
            if !set.contains(&id) || doc.importance < min_importance {
                continue;
            }
        }
        if let Some(from) = from_ms
            && doc.created_ms < from
        {
            continue;
        }
        if let Some(to) = to_ms
            && doc.created_ms > to
        {
            continue;
        }
        if let Some(expires_ms) = doc.expires_ms
            && expires_ms <= now_ms
        {
            // Expired but not yet swept; never surfaced.
            continue;
        }
        candidates.push(id);
    }

    // 3. Full text: AND across every term.  Zero usable terms is a no-op.
    let terms = filter.terms();
    let mut text_scores: HashMap<Uuid, f64> = HashMap::new();
    if !terms.is_empty() {
        let postings: Vec<&HashMap<Uuid, u32>> = {
            let mut postings = Vec::with_capacity(terms.len());
            for term in &terms {
                match indexes.posting(term) {
                    Some(posting) => postings.push(posting),
                    None => return Ok(Vec::new()),
                }
            }
            postings
        };
        let total_docs = indexes.memory_count() as f64;
        candidates.retain(|id| postings.iter().all(|posting| posting.contains_key(id)));
        for id in &candidates {
            let mut relevance = 0.0;
            for (term, posting) in terms.iter().zip(&postings) {
                let tf = posting.get(id).copied().unwrap_or(0) as f64;
                let df = indexes.document_frequency(term) as f64;
                let idf = (1.0 + (total_docs - df + 0.5) / (df + 0.5)).ln();
                relevance += idf * (tf / (tf + BM25_K1));
            }
            text_scores.insert(*id, relevance);
        }
        // Normalize to [0, 1] against the best candidate.
        let max_relevance = text_scores.values().copied().fold(0.0, f64::max);
        if max_relevance > 0.0 {
            for relevance in text_scores.values_mut() {
                *relevance /= max_relevance;
            }
        }
    }

    // 4–6. Score, order, trim.
    let mut hits: Vec<(Hit, i64)> = candidates
        .into_iter()
        .filter_map(|id| {
            let doc = indexes.doc(&id)?;
            let text = text_scores.get(&id).copied().unwrap_or(0.0);
            let score = base_score(doc.importance, now_ms - doc.created_ms, doc.access_count)
                + W_TEXT * text;
            Some((Hit { id, score }, doc.created_ms))
        })
        .collect();

    hits.sort_unstable_by(|(a, a_created), (b, b_created)| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b_created.cmp(a_created))
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(filter.effective_limit());
    Ok(hits.into_iter().map(|(hit, _)| hit).collect())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{RecallFilter, base_score, min_importance_bucket, plan};
    use crate::index::Indexes;
    use crate::record::Memory;
    use crate::segment::RecordLocation;

    fn seeded(entries: &[(&str, &str, &str, f32, i64)]) -> (Indexes, Vec<Uuid>) {
        let mut indexes = Indexes::default();
        let now = Utc::now();
        let mut ids = Vec::new();
        for (i, (user, session, content, importance, age_hours)) in entries.iter().enumerate() {
            let created_at = now - Duration::hours(*age_hours);
            let memory = Memory {
                id: Uuid::now_v7(),
                user_id: (*user).into(),
                session_id: (*session).into(),
                content: (*content).into(),
                metadata: Default::default(),
                importance: *importance,
                initial_importance: *importance,
                created_at,
                expires_at: None,
                last_accessed_at: created_at,
                access_count: 0,
            };
            indexes.apply_put(
                &memory,
                RecordLocation {
                    segment_id: 1,
                    offset: 48 + 64 * i as u64,
                    len: 64,
                },
            );
            ids.push(memory.id);
        }
        (indexes, ids)
    }

    fn filter(user: &str) -> RecallFilter {
        RecallFilter {
            user_id: user.into(),
            ..RecallFilter::default()
        }
    }

    #[test]
    fn min_importance_bucket_matches_ceiling_formula() {
        assert_eq!(min_importance_bucket(0.4), 4);
        assert_eq!(min_importance_bucket(0.45), 5);
        assert_eq!(min_importance_bucket(0.0), 0);
        assert_eq!(min_importance_bucket(1.0), 9);
    }

    #[test]
    fn unique_token_query_ranks_the_match_first() {
        let (indexes, ids) = seeded(&[
            ("u1", "s1", "weekly groceries list", 0.5, 1),
            ("u1", "s1", "I learned about memory decay", 0.5, 1),
            ("u1", "s1", "meeting notes from standup", 0.5, 1),
        ]);
        let mut query = filter("u1");
        query.query = Some("decay".into());

        let hits = plan(&indexes, &query, Utc::now()).expect("plan");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, ids[1]);
    }

    #[test]
    fn importance_filter_returns_ordered_survivors() {
        let (indexes, ids) = seeded(&[
            ("u1", "s1", "low importance note", 0.2, 1),
            ("u1", "s1", "medium importance note", 0.5, 1),
            ("u1", "s1", "high importance note", 0.9, 1),
        ]);
        let mut query = filter("u1");
        query.min_importance = Some(0.4);

        let hits = plan(&indexes, &query, Utc::now()).expect("plan");
        let got: Vec<Uuid> = hits.iter().map(|hit| hit.id).collect();
        assert_eq!(got, vec![ids[2], ids[1]]);
    }

    #[test]
    fn other_users_sessions_never_leak() {
        let (indexes, _) = seeded(&[("owner", "shared-session", "secret plans", 0.9, 1)]);
        let mut query = filter("intruder");
        query.session_id = Some("shared-session".into());

        let hits = plan(&indexes, &query, Utc::now()).expect("plan");
        assert!(hits.is_empty());
    }

    #[test]
    fn narrow_date_range_seeds_from_time_index() {
        let (indexes, ids) = seeded(&[
            ("u1", "s1", "old entry", 0.5, 24 * 30),
            ("u1", "s1", "recent entry", 0.5, 2),
        ]);
        let now = Utc::now();
        let mut query = filter("u1");
        query.date_from = Some(now - Duration::days(1));
        query.date_to = Some(now);

        let hits = plan(&indexes, &query, now).expect("plan");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, ids[1]);
    }

    #[test]
    fn zero_usable_terms_is_a_no_op_filter() {
        let (indexes, _) = seeded(&[("u1", "s1", "anything at all", 0.5, 1)]);
        let mut query = filter("u1");
        // Tokenizes to nothing: stop words and one-char tokens only.
        query.query = Some("the a of".into());

        let hits = plan(&indexes, &query, Utc::now()).expect("plan");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn keywords_are_conjunctive() {
        let (indexes, ids) = seeded(&[
            ("u1", "s1", "rust ownership rules", 0.5, 1),
            ("u1", "s1", "rust async pitfalls", 0.5, 1),
        ]);
        let mut query = filter("u1");
        query.keywords = vec!["rust".into(), "async".into()];

        let hits = plan(&indexes, &query, Utc::now()).expect("plan");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, ids[1]);
    }

    #[test]
    fn ties_break_on_recency_then_id() {
        let (indexes, ids) = seeded(&[
            ("u1", "s1", "first note", 0.5, 5),
            ("u1", "s1", "second note", 0.5, 1),
        ]);
        let hits = plan(&indexes, &filter("u1"), Utc::now()).expect("plan");
        assert_eq!(hits[0].id, ids[1], "newer memory outranks older at equal importance");
    }

    #[test]
    fn access_count_nudges_score_upward() {
        let score_untouched = base_score(0.5, 1000, 0);
        let score_touched = base_score(0.5, 1000, 5);
        assert!(score_touched > score_untouched);
    }

    #[test]
    fn invalid_filters_are_rejected() {
        let indexes = Indexes::default();
        let mut query = filter("");
        assert!(plan(&indexes, &query, Utc::now()).is_err());

        query = filter("u1");
        query.min_importance = Some(2.0);
        assert!(plan(&indexes, &query, Utc::now()).is_err());

        query = filter("u1");
        let now = Utc::now();
        query.date_from = Some(now);
        query.date_to = Some(now - Duration::hours(1));
        assert!(plan(&indexes, &query, Utc::now()).is_err());
    }
}
