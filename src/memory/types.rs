//! Memory entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Opaque handle of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespace tag for entries. Names are normalised to upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection(String);

impl Collection {
    pub const CODE: &'static str = "CODE";
    pub const KNOWLEDGE: &'static str = "KNOWLEDGE";
    pub const BUSINESS: &'static str = "BUSINESS";

    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_uppercase())
    }

    pub fn code() -> Self {
        Self::new(Self::CODE)
    }

    pub fn knowledge() -> Self {
        Self::new(Self::KNOWLEDGE)
    }

    pub fn business() -> Self {
        Self::new(Self::BUSINESS)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entry metadata. Ordered so that serialisation is deterministic.
pub type Metadata = BTreeMap<String, Value>;

/// A stored piece of content with its embedding. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: MemoryId,
    pub content: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub collection: Collection,
    pub created_at: DateTime<Utc>,
}

impl MemoryEntry {
    pub fn new(
        content: impl Into<String>,
        vector: Vec<f32>,
        metadata: Metadata,
        collection: Collection,
    ) -> Self {
        Self {
            id: MemoryId::new(),
            content: content.into(),
            vector,
            metadata,
            collection,
            created_at: Utc::now(),
        }
    }
}

/// Metadata equality filter applied during search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryFilter {
    /// Every key must be present with exactly this value
    pub equals: BTreeMap<String, Value>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f32,
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Rank candidate entries against a query vector.
///
/// Ordered by descending score; ties broken by newest first, then id, so the
/// ranking is stable for identical inputs.
pub fn rank_entries<'a, I>(
    candidates: I,
    vector: &[f32],
    top_k: usize,
    filter: &MemoryFilter,
) -> Vec<ScoredEntry>
where
    I: IntoIterator<Item = &'a MemoryEntry>,
{
    let mut scored: Vec<ScoredEntry> = candidates
        .into_iter()
        .filter(|entry| filter.matches(&entry.metadata))
        .map(|entry| ScoredEntry {
            score: cosine_similarity(&entry.vector, vector),
            entry: entry.clone(),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.entry.created_at.cmp(&a.entry.created_at))
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_collection_normalised() {
        assert_eq!(Collection::new(" code "), Collection::code());
        assert_eq!(Collection::business().to_string(), "BUSINESS");
    }

    #[test]
    fn test_filter_matches() {
        let mut metadata = Metadata::new();
        metadata.insert("lang".into(), json!("rust"));
        metadata.insert("stars".into(), json!(5));

        assert!(MemoryFilter::new().matches(&metadata));
        assert!(MemoryFilter::new().with_eq("lang", "rust").matches(&metadata));
        assert!(!MemoryFilter::new().with_eq("lang", "go").matches(&metadata));
        assert!(!MemoryFilter::new().with_eq("owner", "x").matches(&metadata));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_rank_entries_orders_and_truncates() {
        let near = MemoryEntry::new("near", vec![1.0, 0.1], Metadata::new(), Collection::code());
        let far = MemoryEntry::new("far", vec![0.0, 1.0], Metadata::new(), Collection::code());
        let mid = MemoryEntry::new("mid", vec![1.0, 1.0], Metadata::new(), Collection::code());
        let entries = vec![far, near, mid];

        let ranked = rank_entries(&entries, &[1.0, 0.0], 2, &MemoryFilter::new());
        let contents: Vec<&str> = ranked.iter().map(|s| s.entry.content.as_str()).collect();
        assert_eq!(contents, vec!["near", "mid"]);
        assert!(ranked[0].score >= ranked[1].score);
    }
}
