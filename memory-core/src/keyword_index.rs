//! In-process keyword index: BM25 scoring over an inverted index, plus
//! reciprocal rank fusion with a vector-search rank list.
//!
//! Pure CPU work once postings are built — no suspension points. Guarded by
//! a single lock because adds/removes/searches are infrequent relative to
//! the vector and graph round trips they sit alongside.

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

const K1: f32 = 1.2;
const B: f32 = 0.75;
const RRF_K: f32 = 60.0;
const BOOTSTRAP_MAX: usize = 5000;
const BOOTSTRAP_BATCH: usize = 100;

#[derive(Debug, Clone, Default)]
struct Posting {
    term_freq: HashMap<String, u32>,
    doc_len: u32,
}

#[derive(Default)]
struct Index {
    /// term -> (doc id -> tf), kept denormalized for O(1) df lookup.
    postings: HashMap<String, HashMap<Uuid, u32>>,
    docs: HashMap<Uuid, Posting>,
    total_len: u64,
}

/// Tokenize: lowercase, replace anything outside
/// `[word, . - : /]` with a space, split on whitespace, trim leading/
/// trailing `. - :` from each token. Preserves IPs, versions, `host:port`.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let normalized: String = lower
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '.' | '-' | ':' | '/') { c } else { ' ' })
        .collect();
    normalized
        .split_whitespace()
        .map(|tok| tok.trim_matches(|c| matches!(c, '.' | '-' | ':')).to_string())
        .filter(|tok| !tok.is_empty())
        .collect()
}

pub struct KeywordIndex {
    inner: RwLock<Index>,
}

impl Default for KeywordIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Index::default()) }
    }

    /// Idempotent: re-adding an id first removes its prior postings.
    pub fn add(&self, id: Uuid, text: &str) {
        self.remove(id);
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        let mut term_freq: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *term_freq.entry(token.clone()).or_insert(0) += 1;
        }
        for (term, tf) in &term_freq {
            inner.postings.entry(term.clone()).or_default().insert(id, *tf);
        }
        inner.total_len += tokens.len() as u64;
        inner.docs.insert(id, Posting { term_freq, doc_len: tokens.len() as u32 });
    }

    pub fn remove(&self, id: Uuid) {
        let mut inner = self.inner.write();
        if let Some(posting) = inner.docs.remove(&id) {
            inner.total_len -= posting.doc_len as u64;
            for term in posting.term_freq.keys() {
                if let Some(doc_map) = inner.postings.get_mut(term) {
                    doc_map.remove(&id);
                    if doc_map.is_empty() {
                        inner.postings.remove(term);
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// BM25 search, k1=1.2, b=0.75. Returns `(id, score)` sorted descending.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(Uuid, f32)> {
        let inner = self.inner.read();
        let n = inner.docs.len();
        if n == 0 {
            return Vec::new();
        }
        let avg_doc_len = inner.total_len as f32 / n as f32;
        let query_terms = tokenize(query);

        let mut scores: HashMap<Uuid, f32> = HashMap::new();
        for term in &query_terms {
            let Some(doc_map) = inner.postings.get(term) else { continue };
            let df = doc_map.len() as f32;
            let idf = ((n as f32 - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (&id, &tf) in doc_map {
                let doc_len = inner.docs.get(&id).map(|p| p.doc_len as f32).unwrap_or(avg_doc_len);
                let tf = tf as f32;
                let denom = tf + K1 * (1.0 - B + B * doc_len / avg_doc_len);
                let norm_tf = tf * (K1 + 1.0) / denom;
                *scores.entry(id).or_insert(0.0) += idf * norm_tf;
            }
        }

        let mut ranked: Vec<(Uuid, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);
        ranked
    }

    /// Bootstrap up to 5000 live texts from an iterator of `(id, text)`
    /// batches of 100. Each batch failure is swallowed by the
    /// caller supplying the iterator — this method itself cannot fail.
    pub fn bootstrap(&self, entries: impl IntoIterator<Item = (Uuid, String)>) -> usize {
        let mut added = 0;
        for chunk in &entries.into_iter().take(BOOTSTRAP_MAX).chunks(BOOTSTRAP_BATCH) {
            for (id, text) in chunk {
                self.add(id, &text);
                added += 1;
            }
        }
        added
    }
}

/// Minimal chunking helper so `bootstrap` doesn't need an itertools
/// dependency for a single call site.
trait ChunkedExt: Iterator + Sized {
    fn chunks(self, size: usize) -> ChunkIter<Self> {
        ChunkIter { iter: self, size }
    }
}
impl<I: Iterator> ChunkedExt for I {}

struct ChunkIter<I> {
    iter: I,
    size: usize,
}

impl<I: Iterator> Iterator for ChunkIter<I> {
    type Item = Vec<I::Item>;
    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = Vec::with_capacity(self.size);
        for _ in 0..self.size {
            match self.iter.next() {
                Some(item) => chunk.push(item),
                None => break,
            }
        }
        if chunk.is_empty() { None } else { Some(chunk) }
    }
}

/// Reciprocal rank fusion (k=60) over a vector-search rank list and a BM25
/// rank list. Result order is by fused score descending, restricted to ids
/// present in `vector_ranked` (only the vector list carries full cell data
/// for hydration downstream).
pub fn reciprocal_rank_fusion(vector_ranked: &[Uuid], bm25_ranked: &[Uuid]) -> Vec<(Uuid, f32)> {
    let bm25_rank: HashMap<Uuid, usize> =
        bm25_ranked.iter().enumerate().map(|(rank, &id)| (id, rank)).collect();

    let mut fused: Vec<(Uuid, f32)> = vector_ranked
        .iter()
        .enumerate()
        .map(|(rank, &id)| {
            let mut score = 1.0 / (RRF_K + rank as f32 + 1.0);
            if let Some(&bm25_rank) = bm25_rank.get(&id) {
                score += 1.0 / (RRF_K + bm25_rank as f32 + 1.0);
            }
            (id, score)
        })
        .collect();

    fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_preserves_ips_versions_and_host_port() {
        let tokens = tokenize("connect to 10.0.0.5:8080 running v1.2.3!");
        assert!(tokens.contains(&"10.0.0.5:8080".to_string()));
        assert!(tokens.contains(&"v1.2.3".to_string()));
    }

    #[test]
    fn tokenize_trims_leading_trailing_punctuation() {
        let tokens = tokenize("Hello, world.");
        assert_eq!(tokens, vec!["hello", "world"]);
    }

    #[test]
    fn add_is_idempotent_on_reinsert() {
        let index = KeywordIndex::new();
        let id = Uuid::new_v4();
        index.add(id, "the quick brown fox");
        index.add(id, "the quick brown fox");
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_is_total() {
        let index = KeywordIndex::new();
        let id = Uuid::new_v4();
        index.add(id, "the quick brown fox");
        index.remove(id);
        assert!(index.is_empty());
        assert!(index.search("fox", 10).is_empty());
    }

    #[test]
    fn search_ranks_exact_term_match_above_unrelated_doc() {
        let index = KeywordIndex::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.add(a, "rust ownership and borrowing rules");
        index.add(b, "a recipe for chocolate cake");
        let results = index.search("rust ownership", 10);
        assert_eq!(results.first().map(|(id, _)| *id), Some(a));
    }

    #[test]
    fn rrf_prefers_items_ranked_high_in_both_lists() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let vector_ranked = vec![a, b, c];
        let bm25_ranked = vec![b, a, c];
        let fused = reciprocal_rank_fusion(&vector_ranked, &bm25_ranked);
        assert!(fused[0].0 == a || fused[0].0 == b);
    }

    #[test]
    fn rrf_only_returns_ids_present_in_vector_list() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let vector_ranked = vec![a];
        let bm25_ranked = vec![a, b];
        let fused = reciprocal_rank_fusion(&vector_ranked, &bm25_ranked);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].0, a);
    }
}
