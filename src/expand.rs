//! Query expansion: rewrites a raw search term into an FTS query, optionally
//! widening nouns and verbs with embedding-nearest neighbors under a
//! proximity operator.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ndarray::Array1;
use once_cell::sync::Lazy;
use rust_stemmers::{Algorithm, Stemmer};
use tracing::debug;

use crate::error::{RecorderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOfSpeech {
    Noun,
    Verb,
    Other,
}

/// Part-of-speech tagging seam; only nouns and verbs are expanded.
pub trait PosTagger: Send + Sync {
    fn tag(&self, token: &str) -> PartOfSpeech;
}

/// Embedding-neighbor seam: the `k` nearest words to `word`.
pub trait NeighborLookup: Send + Sync {
    fn neighbors(&self, word: &str, k: usize) -> Vec<String>;
}

/// Rewrites search terms. Pure with respect to index state.
pub struct QueryExpander {
    tagger: Box<dyn PosTagger>,
    lookup: Box<dyn NeighborLookup>,
}

impl QueryExpander {
    pub fn new(tagger: Box<dyn PosTagger>, lookup: Box<dyn NeighborLookup>) -> Self {
        Self { tagger, lookup }
    }

    /// Expander that never widens terms (no embedding model loaded).
    pub fn disabled() -> Self {
        struct NoNeighbors;
        impl NeighborLookup for NoNeighbors {
            fn neighbors(&self, _word: &str, _k: usize) -> Vec<String> {
                Vec::new()
            }
        }
        Self::new(Box::new(HeuristicTagger::new()), Box::new(NoNeighbors))
    }

    /// Applies the expansion contract: a run of leading `>` characters (or
    /// `expand_by`, whichever is larger) sets the budget `k`; with `k > 0`
    /// every noun/verb token becomes a disjunction of itself and its `k`
    /// nearest neighbors. Groups are left implicitly conjoined; FTS5's NEAR
    /// operator only accepts bare phrases, so no proximity constraint is
    /// applied to expanded queries.
    pub fn expand(&self, term: &str, expand_by: usize) -> String {
        let stripped = term.chars().take_while(|c| *c == '>').count();
        let term: String = term.chars().skip(stripped).collect();
        let k = expand_by.max(stripped);
        if k == 0 || term.trim().is_empty() {
            return term;
        }
        debug!("expanding query by {}", k);

        let mut rewritten = String::new();
        for token in split_words(&term) {
            match token {
                Word::Separator(s) => rewritten.push_str(s),
                Word::Token(w) => {
                    let tag = self.tagger.tag(w);
                    if tag == PartOfSpeech::Noun || tag == PartOfSpeech::Verb {
                        let neighbors = self.lookup.neighbors(w, k);
                        if neighbors.is_empty() {
                            rewritten.push_str(w);
                        } else {
                            rewritten.push('(');
                            rewritten.push_str(w);
                            for n in neighbors {
                                rewritten.push_str(" OR ");
                                rewritten.push_str(&n);
                            }
                            rewritten.push(')');
                        }
                    } else {
                        rewritten.push_str(w);
                    }
                }
            }
        }
        rewritten
    }
}

enum Word<'a> {
    Token(&'a str),
    Separator(&'a str),
}

fn split_words(s: &str) -> Vec<Word<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_word: Option<bool> = None;
    for (i, ch) in s.char_indices() {
        let word = ch.is_alphanumeric();
        match in_word {
            Some(prev) if prev != word => {
                out.push(if prev {
                    Word::Token(&s[start..i])
                } else {
                    Word::Separator(&s[start..i])
                });
                start = i;
                in_word = Some(word);
            }
            Some(_) => {}
            None => in_word = Some(word),
        }
    }
    if start < s.len() {
        out.push(if in_word == Some(true) {
            Word::Token(&s[start..])
        } else {
            Word::Separator(&s[start..])
        });
    }
    out
}

static CLOSED_CLASS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "a", "an", "the", "and", "or", "but", "if", "then", "of", "to", "in", "on", "at", "by",
        "for", "with", "from", "into", "over", "under", "is", "are", "was", "were", "be", "been",
        "am", "it", "its", "this", "that", "these", "those", "he", "she", "they", "we", "you",
        "i", "my", "your", "his", "her", "their", "our", "not", "no", "so", "as", "up", "down",
        "out", "about",
    ]
});

const VERB_SUFFIXES: &[&str] = &["ing", "ed", "ify", "ize", "ise", "ate"];

/// Suffix-rule tagger: closed-class words are never expanded, verb-looking
/// suffixes tag as verbs, and remaining content words default to nouns so
/// every content word is eligible for expansion.
pub struct HeuristicTagger {
    stemmer: Stemmer,
}

impl HeuristicTagger {
    pub fn new() -> Self {
        Self {
            stemmer: Stemmer::create(Algorithm::English),
        }
    }
}

impl Default for HeuristicTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl PosTagger for HeuristicTagger {
    fn tag(&self, token: &str) -> PartOfSpeech {
        let lower = token.to_lowercase();
        if lower.chars().any(|c| c.is_ascii_digit()) {
            return PartOfSpeech::Other;
        }
        if CLOSED_CLASS.contains(&lower.as_str()) {
            return PartOfSpeech::Other;
        }
        if lower.len() > 4 && VERB_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            return PartOfSpeech::Verb;
        }
        // Single-letter stems carry no signal worth widening.
        if self.stemmer.stem(&lower).len() < 2 {
            return PartOfSpeech::Other;
        }
        PartOfSpeech::Noun
    }
}

/// Word-embedding table loaded from a word2vec-style text file
/// (`word v1 v2 .. vn` per line), queried by cosine similarity.
pub struct WordEmbeddings {
    vectors: HashMap<String, Array1<f32>>,
}

impl WordEmbeddings {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut vectors = HashMap::new();
        let mut dim: Option<usize> = None;
        for line in reader.lines() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let Some(word) = parts.next() else { continue };
            let values: Vec<f32> = parts.filter_map(|v| v.parse().ok()).collect();
            if values.is_empty() {
                // Header line of word2vec text format ("<count> <dim>").
                continue;
            }
            match dim {
                None => dim = Some(values.len()),
                Some(d) if d != values.len() => {
                    return Err(RecorderError::Config(format!(
                        "embedding dimension mismatch for '{}'",
                        word
                    )))
                }
                Some(_) => {}
            }
            vectors.insert(word.to_lowercase(), Array1::from(values));
        }
        Ok(Self { vectors })
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    fn cosine(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
        let denom = a.dot(a).sqrt() * b.dot(b).sqrt();
        if denom == 0.0 {
            return 0.0;
        }
        a.dot(b) / denom
    }
}

impl NeighborLookup for WordEmbeddings {
    fn neighbors(&self, word: &str, k: usize) -> Vec<String> {
        let lower = word.to_lowercase();
        let Some(target) = self.vectors.get(&lower) else {
            return Vec::new();
        };
        let mut scored: Vec<(&String, f32)> = self
            .vectors
            .iter()
            .filter(|(w, _)| **w != lower)
            .map(|(w, v)| (w, Self::cosine(target, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(k).map(|(w, _)| w.clone()).collect()
    }
}
