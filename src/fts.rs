//! Inverted full-text index with BM25 ranking.
//!
//! Tokenization splits on non-alphanumeric boundaries, lowercases, and
//! optionally filters stopwords and applies Porter stemming. The query
//! dialect supports plain terms, `"phrases"`, required `+term` and excluded
//! `-term` items. Persistence is the `FTSI` binary format; the legacy JSON
//! format is still accepted for read. A corrupt artifact is treated as an
//! empty index; scheduling the rebuild is the caller's job.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::FtsConfig;
use crate::error::{ParqueError, Result, StorageErrorKind};

const MAGIC: &[u8; 4] = b"FTSI";
const FORMAT_VERSION: u16 = 1;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

/// One token produced by the analyzer, with its 0-based position and
/// character offsets in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub position: u32,
    pub start: usize,
    pub end: usize,
}

/// Tokenize one field of text under the given configuration.
pub fn tokenize(text: &str, config: &FtsConfig) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut position = 0u32;

    let mut start = None;
    for (idx, ch) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
        if ch.is_alphanumeric() {
            if start.is_none() {
                start = Some(idx);
            }
            continue;
        }
        let Some(begin) = start.take() else { continue };
        let raw = &text[begin..idx];
        let lowered = raw.to_lowercase();

        if config.filter_stopwords && STOPWORDS.contains(&lowered.as_str()) {
            // Stopwords consume a position so phrases stay aligned with the
            // source text.
            position += 1;
            continue;
        }

        let stemmed = if config.stem {
            porter_stem(&lowered)
        } else {
            lowered
        };

        if stemmed.len() < config.min_word_length || stemmed.len() > config.max_word_length {
            position += 1;
            continue;
        }

        tokens.push(Token {
            text: stemmed,
            position,
            start: begin,
            end: idx,
        });
        position += 1;
    }
    tokens
}

/// A reduced Porter stemmer (steps 1a, 1b and the common 2–4 suffixes),
/// enough to conflate plurals and regular verb forms.
pub fn porter_stem(word: &str) -> String {
    let mut w = word.to_string();
    if w.len() <= 2 {
        return w;
    }

    // Step 1a: plurals.
    if let Some(stripped) = w.strip_suffix("sses") {
        w = format!("{stripped}ss");
    } else if let Some(stripped) = w.strip_suffix("ies") {
        w = format!("{stripped}i");
    } else if w.ends_with('s') && !w.ends_with("ss") {
        w.truncate(w.len() - 1);
    }

    // Step 1b: -ed / -ing.
    for suffix in ["ing", "ed"] {
        if let Some(stripped) = w.strip_suffix(suffix) {
            if stripped.chars().any(is_vowel) {
                w = stripped.to_string();
                if w.ends_with("at") || w.ends_with("bl") || w.ends_with("iz") {
                    w.push('e');
                }
            }
            break;
        }
    }

    // Common derivational suffixes (steps 2–4, abbreviated).
    for (suffix, replacement) in [
        ("ational", "ate"),
        ("ization", "ize"),
        ("fulness", "ful"),
        ("ousness", "ous"),
        ("iveness", "ive"),
        ("biliti", "ble"),
        ("entli", "ent"),
        ("ation", "ate"),
        ("alism", "al"),
        ("aliti", "al"),
        ("iviti", "ive"),
        ("ment", ""),
        ("ness", ""),
    ] {
        if let Some(stripped) = w.strip_suffix(suffix) {
            if stripped.len() >= 2 {
                w = format!("{stripped}{replacement}");
            }
            break;
        }
    }
    w
}

fn is_vowel(ch: char) -> bool {
    matches!(ch, 'a' | 'e' | 'i' | 'o' | 'u')
}

/// One postings entry: where a term occurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub doc: u32,
    pub field: u16,
    pub frequency: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positions: Vec<u32>,
}

/// Per-document length statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocStats {
    pub id: String,
    /// field index -> token count
    pub field_lengths: HashMap<u16, u32>,
    pub total_length: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FtsStats {
    pub documents: usize,
    pub terms: usize,
    pub avg_doc_length: f64,
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub score: f64,
}

/// The inverted index for one namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FtsIndex {
    /// Interned field names, indexed by postings
    fields: Vec<String>,

    /// Document table; postings reference documents by index
    docs: Vec<DocStats>,

    /// doc_id -> index into `docs`
    #[serde(skip)]
    doc_lookup: HashMap<String, u32>,

    /// term -> postings, sorted by (doc, field)
    terms: HashMap<String, Vec<Posting>>,
}

impl FtsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index (or re-index) a document's text fields.
    pub fn index_document(&mut self, doc_id: &str, fields: &[(&str, &str)], config: &FtsConfig) {
        self.remove_document(doc_id);

        let doc_idx = self.docs.len() as u32;
        let mut stats = DocStats {
            id: doc_id.to_string(),
            ..Default::default()
        };

        for (field_name, text) in fields {
            let field_idx = self.intern_field(field_name);
            let tokens = tokenize(text, config);
            stats.field_lengths.insert(field_idx, tokens.len() as u32);
            stats.total_length += tokens.len() as u32;

            let mut per_term: HashMap<String, Vec<u32>> = HashMap::new();
            for token in tokens {
                per_term.entry(token.text).or_default().push(token.position);
            }
            for (term, positions) in per_term {
                self.terms.entry(term).or_default().push(Posting {
                    doc: doc_idx,
                    field: field_idx,
                    frequency: positions.len() as u32,
                    positions: if config.positions { positions } else { Vec::new() },
                });
            }
        }

        self.doc_lookup.insert(doc_id.to_string(), doc_idx);
        self.docs.push(stats);
    }

    /// Remove a document's postings. Document slots are tombstoned (zero
    /// lengths) rather than shifted so posting doc indexes stay stable.
    pub fn remove_document(&mut self, doc_id: &str) {
        let Some(doc_idx) = self.doc_lookup.remove(doc_id) else {
            return;
        };
        for postings in self.terms.values_mut() {
            postings.retain(|p| p.doc != doc_idx);
        }
        self.terms.retain(|_, postings| !postings.is_empty());
        if let Some(doc) = self.docs.get_mut(doc_idx as usize) {
            doc.field_lengths.clear();
            doc.total_length = 0;
            doc.id.clear();
        }
    }

    fn intern_field(&mut self, name: &str) -> u16 {
        if let Some(idx) = self.fields.iter().position(|f| f == name) {
            return idx as u16;
        }
        self.fields.push(name.to_string());
        (self.fields.len() - 1) as u16
    }

    fn document_count(&self) -> usize {
        self.doc_lookup.len()
    }

    fn avg_doc_length(&self) -> f64 {
        let count = self.document_count();
        if count == 0 {
            return 0.0;
        }
        let total: u64 = self.docs.iter().map(|d| d.total_length as u64).sum();
        total as f64 / count as f64
    }

    /// Documents containing the term, by doc index.
    fn docs_with_term(&self, term: &str) -> HashSet<u32> {
        self.terms
            .get(term)
            .map(|postings| postings.iter().map(|p| p.doc).collect())
            .unwrap_or_default()
    }

    /// Documents containing the phrase: all words at consecutive positions
    /// within a single field.
    fn docs_with_phrase(&self, words: &[String]) -> HashSet<u32> {
        let mut result = HashSet::new();
        if words.is_empty() {
            return result;
        }
        let Some(first) = self.terms.get(&words[0]) else {
            return result;
        };

        'posting: for posting in first {
            for start in &posting.positions {
                let mut found = true;
                for (offset, word) in words.iter().enumerate().skip(1) {
                    let next_pos = start + offset as u32;
                    let ok = self.terms.get(word).is_some_and(|postings| {
                        postings.iter().any(|p| {
                            p.doc == posting.doc
                                && p.field == posting.field
                                && p.positions.contains(&next_pos)
                        })
                    });
                    if !ok {
                        found = false;
                        break;
                    }
                }
                if found {
                    result.insert(posting.doc);
                    continue 'posting;
                }
            }
        }
        result
    }

    /// BM25 search. Returns hits ranked by descending score, ties by doc id.
    pub fn search(&self, query: &str, limit: usize, config: &FtsConfig) -> Result<Vec<SearchHit>> {
        let parsed = FtsQuery::parse(query, config)?;
        let candidates = self.matching_docs_parsed(&parsed);

        let n = self.document_count() as f64;
        let avg_len = self.avg_doc_length().max(1.0);
        let scoring_terms = parsed.scoring_terms();

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter_map(|doc_idx| {
                let doc = self.docs.get(doc_idx as usize)?;
                let mut score = 0.0;
                for term in &scoring_terms {
                    let Some(postings) = self.terms.get(term) else {
                        continue;
                    };
                    let df = postings
                        .iter()
                        .map(|p| p.doc)
                        .collect::<HashSet<_>>()
                        .len() as f64;
                    let tf: f64 = postings
                        .iter()
                        .filter(|p| p.doc == doc_idx)
                        .map(|p| p.frequency as f64)
                        .sum();
                    if tf == 0.0 {
                        continue;
                    }
                    let idf = (((n - df + 0.5) / (df + 0.5)) + 1.0).ln();
                    let len_norm = 1.0 - config.b + config.b * (doc.total_length as f64 / avg_len);
                    score += idf * (tf * (config.k1 + 1.0)) / (tf + config.k1 * len_norm);
                }
                Some(SearchHit {
                    doc_id: doc.id.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Document ids matching the query, unranked. Used by the query
    /// executor to evaluate `$text` predicates.
    pub fn matching_doc_ids(&self, query: &str, config: &FtsConfig) -> Result<HashSet<String>> {
        let parsed = FtsQuery::parse(query, config)?;
        Ok(self
            .matching_docs_parsed(&parsed)
            .into_iter()
            .filter_map(|idx| self.docs.get(idx as usize))
            .filter(|doc| !doc.id.is_empty())
            .map(|doc| doc.id.clone())
            .collect())
    }

    fn matching_docs_parsed(&self, query: &FtsQuery) -> HashSet<u32> {
        let item_docs = |item: &QueryItem| match item {
            QueryItem::Term(term) => self.docs_with_term(term),
            QueryItem::Phrase(words) => self.docs_with_phrase(words),
        };

        let mut candidates: Option<HashSet<u32>> = None;

        // Required items intersect.
        for item in &query.required {
            let docs = item_docs(item);
            candidates = Some(match candidates {
                None => docs,
                Some(current) => current.intersection(&docs).copied().collect(),
            });
        }

        // Plain terms union (only when nothing is required).
        let mut candidates = match candidates {
            Some(c) => c,
            None => {
                let mut union = HashSet::new();
                for item in &query.plain {
                    union.extend(item_docs(item));
                }
                union
            }
        };

        // Excluded items remove matches.
        for item in &query.excluded {
            for doc in item_docs(item) {
                candidates.remove(&doc);
            }
        }
        candidates
    }

    pub fn stats(&self) -> FtsStats {
        FtsStats {
            documents: self.document_count(),
            terms: self.terms.len(),
            avg_doc_length: self.avg_doc_length(),
        }
    }

    /// Serialize to the `FTSI` binary format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());

        write_u16(&mut out, self.fields.len() as u16);
        for field in &self.fields {
            write_str(&mut out, field);
        }

        write_u32(&mut out, self.docs.len() as u32);
        for doc in &self.docs {
            write_str(&mut out, &doc.id);
            write_u32(&mut out, doc.total_length);
            write_u16(&mut out, doc.field_lengths.len() as u16);
            let mut lengths: Vec<_> = doc.field_lengths.iter().collect();
            lengths.sort();
            for (field, length) in lengths {
                write_u16(&mut out, *field);
                write_u32(&mut out, *length);
            }
        }

        write_u32(&mut out, self.terms.len() as u32);
        let mut terms: Vec<_> = self.terms.iter().collect();
        terms.sort_by(|a, b| a.0.cmp(b.0));
        for (term, postings) in terms {
            write_str(&mut out, term);
            write_u32(&mut out, postings.len() as u32);
            for posting in postings {
                write_u32(&mut out, posting.doc);
                write_u16(&mut out, posting.field);
                write_u32(&mut out, posting.frequency);
                write_u32(&mut out, posting.positions.len() as u32);
                for pos in &posting.positions {
                    write_u32(&mut out, *pos);
                }
            }
        }
        out
    }

    /// Parse a persisted index. `FTSI` binary is tried first; anything else
    /// is treated as the legacy JSON format.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() >= 6 && &data[0..4] == MAGIC {
            return Self::from_binary(data);
        }
        // Legacy JSON format.
        let mut index: FtsIndex =
            serde_json::from_slice(data).map_err(|e| ParqueError::Storage {
                kind: StorageErrorKind::Corrupted,
                detail: format!("fts index: not FTSI and not legacy JSON: {e}"),
            })?;
        index.rebuild_lookup();
        Ok(index)
    }

    /// Lenient load: a corrupt artifact yields an empty index plus a flag
    /// telling the caller to schedule a rebuild.
    pub fn load_or_empty(data: &[u8]) -> (Self, bool) {
        match Self::from_bytes(data) {
            Ok(index) => (index, false),
            Err(e) => {
                tracing::warn!("treating full-text index as empty: {e}");
                (Self::new(), true)
            }
        }
    }

    fn from_binary(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(&data[4..]);
        let version = reader.u16()?;
        if version != FORMAT_VERSION {
            return Err(ParqueError::Storage {
                kind: StorageErrorKind::Corrupted,
                detail: format!("fts index: unsupported version {version}"),
            });
        }

        let field_count = reader.u16()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(reader.string()?);
        }

        let doc_count = reader.u32()? as usize;
        let mut docs = Vec::with_capacity(doc_count);
        for _ in 0..doc_count {
            let id = reader.string()?;
            let total_length = reader.u32()?;
            let length_count = reader.u16()? as usize;
            let mut field_lengths = HashMap::with_capacity(length_count);
            for _ in 0..length_count {
                let field = reader.u16()?;
                let length = reader.u32()?;
                field_lengths.insert(field, length);
            }
            docs.push(DocStats {
                id,
                field_lengths,
                total_length,
            });
        }

        let term_count = reader.u32()? as usize;
        let mut terms = HashMap::with_capacity(term_count);
        for _ in 0..term_count {
            let term = reader.string()?;
            let posting_count = reader.u32()? as usize;
            let mut postings = Vec::with_capacity(posting_count);
            for _ in 0..posting_count {
                let doc = reader.u32()?;
                let field = reader.u16()?;
                let frequency = reader.u32()?;
                let position_count = reader.u32()? as usize;
                let mut positions = Vec::with_capacity(position_count);
                for _ in 0..position_count {
                    positions.push(reader.u32()?);
                }
                postings.push(Posting {
                    doc,
                    field,
                    frequency,
                    positions,
                });
            }
            terms.insert(term, postings);
        }

        let mut index = Self {
            fields,
            docs,
            doc_lookup: HashMap::new(),
            terms,
        };
        index.rebuild_lookup();
        Ok(index)
    }

    fn rebuild_lookup(&mut self) {
        self.doc_lookup = self
            .docs
            .iter()
            .enumerate()
            .filter(|(_, doc)| !doc.id.is_empty())
            .map(|(idx, doc)| (doc.id.clone(), idx as u32))
            .collect();
    }
}

fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn write_str(out: &mut Vec<u8>, value: &str) {
    write_u16(out, value.len() as u16);
    out.extend_from_slice(value.as_bytes());
}

struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.offset + len > self.data.len() {
            return Err(ParqueError::Storage {
                kind: StorageErrorKind::Corrupted,
                detail: "fts index: truncated".to_string(),
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ParqueError::Storage {
            kind: StorageErrorKind::Corrupted,
            detail: "fts index: invalid utf-8".to_string(),
        })
    }
}

/// Parsed query: plain terms score, `+` items must match, `-` items exclude.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FtsQuery {
    pub plain: Vec<QueryItem>,
    pub required: Vec<QueryItem>,
    pub excluded: Vec<QueryItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryItem {
    Term(String),
    Phrase(Vec<String>),
}

impl FtsQuery {
    pub fn parse(input: &str, config: &FtsConfig) -> Result<Self> {
        let mut query = Self::default();
        let mut chars = input.chars().peekable();

        while let Some(&ch) = chars.peek() {
            if ch.is_whitespace() {
                chars.next();
                continue;
            }

            let bucket = match ch {
                '+' => {
                    chars.next();
                    Bucket::Required
                }
                '-' => {
                    chars.next();
                    Bucket::Excluded
                }
                _ => Bucket::Plain,
            };

            let item = if chars.peek() == Some(&'"') {
                chars.next();
                let mut phrase = String::new();
                for ch in chars.by_ref() {
                    if ch == '"' {
                        break;
                    }
                    phrase.push(ch);
                }
                let words: Vec<String> = tokenize(&phrase, config)
                    .into_iter()
                    .map(|t| t.text)
                    .collect();
                if words.is_empty() {
                    continue;
                }
                QueryItem::Phrase(words)
            } else {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                let mut tokens = tokenize(&word, config);
                if tokens.is_empty() {
                    continue;
                }
                QueryItem::Term(tokens.remove(0).text)
            };

            match bucket {
                Bucket::Plain => query.plain.push(item),
                Bucket::Required => query.required.push(item),
                Bucket::Excluded => query.excluded.push(item),
            }
        }

        if query.plain.is_empty() && query.required.is_empty() {
            return Err(ParqueError::query(
                crate::error::QueryErrorKind::InvalidFilter,
                "text query has no matchable terms",
            ));
        }
        Ok(query)
    }

    /// Terms contributing to the BM25 score (plain + required).
    fn scoring_terms(&self) -> Vec<String> {
        self.plain
            .iter()
            .chain(self.required.iter())
            .flat_map(|item| match item {
                QueryItem::Term(term) => vec![term.clone()],
                QueryItem::Phrase(words) => words.clone(),
            })
            .collect()
    }
}

enum Bucket {
    Plain,
    Required,
    Excluded,
}
