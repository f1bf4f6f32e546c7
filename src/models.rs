//! Core data models shared by the knowledge base and the conflict detector.
//!
//! KB types ([`Chunk`], [`Envelope`], [`QueryHit`], [`KbStatus`]) are persisted
//! or returned over the wire as JSON. Detection types ([`Requirement`],
//! [`ConflictPair`], [`RunMetadata`]) live only for one run and its report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Free-form chunk metadata.
pub type Meta = Map<String, Value>;

/// A unit of text stored in a project knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub text: String,
    #[serde(default)]
    pub meta: Meta,
}

impl Chunk {
    pub fn new(id: i64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            meta: Meta::new(),
        }
    }

    /// Stable identity taken from `meta.requirement_id`, `meta.req_id`, or
    /// `meta.requirement`, first one present wins.
    pub fn stable_identity(&self) -> Option<String> {
        ["requirement_id", "req_id", "requirement"]
            .iter()
            .find_map(|key| match self.meta.get(*key) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            })
    }
}

/// Versioned metadata persisted next to a vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u64,
    pub chunks: Vec<Chunk>,
    pub last_updated: DateTime<Utc>,
    pub total_chunks: usize,
}

impl Envelope {
    pub fn new(version: u64, chunks: Vec<Chunk>) -> Self {
        let total_chunks = chunks.len();
        Self {
            version,
            chunks,
            last_updated: Utc::now(),
            total_chunks,
        }
    }
}

/// On-disk metadata shapes. Older stores wrote a bare chunk list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MetaFile {
    Enveloped(Envelope),
    Legacy(Vec<Chunk>),
}

impl MetaFile {
    /// Canonicalize into an [`Envelope`]. Legacy lists become version 1,
    /// stamped with `fallback_time` since they never recorded one.
    pub fn into_envelope(self, fallback_time: DateTime<Utc>) -> Envelope {
        match self {
            MetaFile::Enveloped(mut env) => {
                env.total_chunks = env.chunks.len();
                env
            }
            MetaFile::Legacy(chunks) => Envelope {
                version: 1,
                total_chunks: chunks.len(),
                chunks,
                last_updated: fallback_time,
            },
        }
    }
}

/// A retrieval result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryHit {
    pub id: i64,
    pub text: String,
    pub meta: Meta,
    pub score: f32,
}

/// Snapshot of a project knowledge base. Never an error by itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KbStatus {
    pub exists: bool,
    pub version: u64,
    pub last_built_at: Option<String>,
    pub total_chunks: usize,
    pub error: Option<String>,
}

/// An input document for KB build/update requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub meta: Meta,
}

/// A requirement as submitted for conflict detection. Numeric ids are
/// accepted and kept in their decimal form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementInput {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub text: String,
}

pub(crate) fn string_or_number<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// A requirement inside one detection run.
#[derive(Debug, Clone, Serialize)]
pub struct Requirement {
    pub req_id: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    /// `-1` marks noise.
    pub cluster_id: i32,
    pub tags: Vec<String>,
}

/// Model-reported certainty of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// Case-insensitive; anything unrecognized is `Medium`.
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "high" => Confidence::High,
            "low" => Confidence::Low,
            _ => Confidence::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }

    /// Severity used when conflicts are stored downstream.
    pub fn severity(&self) -> &'static str {
        self.as_str()
    }
}

/// A conflict between two requirements reported by the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictPair {
    pub req_a_id: String,
    pub req_b_id: String,
    pub req_a_text: String,
    pub req_b_text: String,
    pub reason: String,
    pub confidence: Confidence,
    pub cluster_id: i32,
    pub timestamp: DateTime<Utc>,
}

/// Per-run counters reported alongside conflicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub total_requirements: usize,
    pub clusters_found: usize,
    pub noise_points: usize,
    pub conflicts_found: usize,
    pub timestamp: DateTime<Utc>,
}
