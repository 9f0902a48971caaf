//! Text analysis shared by the inverted index, the query planner, and the
//! summarizer.  All three must tokenize identically or postings and query
//! terms drift apart.

use std::collections::HashMap;

/// Common English stop words excluded from the term index.  Filtering these
/// keeps posting lists for high-frequency glue words from dominating both
/// index size and relevance scores.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "for", "from", "had",
    "has", "have", "he", "her", "his", "how", "i", "if", "in", "into", "is", "it", "its", "my",
    "no", "not", "now", "of", "on", "or", "our", "out", "she", "so", "than", "that", "the",
    "their", "them", "then", "they", "this", "to", "was", "we", "were", "what", "when", "who",
    "will", "with", "you", "your",
];

fn is_stop_word(term: &str) -> bool {
    STOP_WORDS.binary_search(&term).is_ok()
}

/// Produce index terms: lowercase, split on non-alphanumeric boundaries,
/// drop tokens shorter than two characters and stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| token.chars().count() >= 2)
        .map(|token| token.to_lowercase())
        .filter(|token| !is_stop_word(token))
        .collect()
}

/// Term frequencies for one document.
pub fn term_frequencies(text: &str) -> HashMap<String, u32> {
    let mut frequencies = HashMap::new();
    for term in tokenize(text) {
        *frequencies.entry(term).or_insert(0) += 1;
    }
    frequencies
}

#[cfg(test)]
mod tests {
    use super::{STOP_WORDS, term_frequencies, tokenize};

    #[test]
    fn stop_word_table_is_sorted_for_binary_search() {
        let mut sorted = STOP_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOP_WORDS);
    }

    #[test]
    fn drops_stop_words_and_short_tokens() {
        let terms = tokenize("I learned about the memory decay");
        assert_eq!(terms, vec!["learned", "about", "memory", "decay"]);
    }

    #[test]
    fn lowercases_and_splits_on_punctuation() {
        let terms = tokenize("Rust-lang: ownership&borrowing!");
        assert_eq!(terms, vec!["rust", "lang", "ownership", "borrowing"]);
    }

    #[test]
    fn handles_unicode_words() {
        let terms = tokenize("café société 東京");
        assert_eq!(terms, vec!["café", "société", "東京"]);
    }

    #[test]
    fn counts_repeated_terms() {
        let tf = term_frequencies("pizza pizza rust");
        assert_eq!(tf.get("pizza"), Some(&2));
        assert_eq!(tf.get("rust"), Some(&1));
    }
}
