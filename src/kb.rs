//! Project-level knowledge-base operations.
//!
//! [`KnowledgeBase`] resolves a project's files under `kb.base_dir` and
//! delegates to [`VectorStore`]. It also owns retrieval gating
//! ([`KnowledgeBase::needs_rag`]) and the context message built from hits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::config::{Config, KbConfig, RagConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::KbError;
use crate::llm::LlmClient;
use crate::models::{Chunk, Document, KbStatus, QueryHit};
use crate::store::{project_paths, ProjectPaths, VectorStore};

/// Which optional backends this process can use, computed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub embeddings: bool,
    pub llm: bool,
}

impl Capabilities {
    pub fn detect(embedder: &dyn EmbeddingProvider, llm: &dyn LlmClient) -> Self {
        Self {
            embeddings: embedder.is_available(),
            llm: llm.is_available(),
        }
    }

    pub fn require_embeddings(&self) -> Result<()> {
        if self.embeddings {
            Ok(())
        } else {
            Err(KbError::embeddings_unavailable().into())
        }
    }

    pub fn require_llm(&self) -> Result<()> {
        if self.llm {
            Ok(())
        } else {
            Err(KbError::llm_unavailable().into())
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub project_id: String,
    pub total_chunks: usize,
    pub version: u64,
    pub index_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub added_chunks: usize,
    pub skipped_chunks: usize,
    pub total_chunks: usize,
    pub version: u64,
}

/// Turn request documents into chunks: `id` is the position, `meta` is the
/// document's meta plus `type` (default `"document"`).
pub fn documents_to_chunks(docs: Vec<Document>) -> Result<Vec<Chunk>> {
    docs.into_iter()
        .enumerate()
        .map(|(i, doc)| {
            if doc.content.trim().is_empty() {
                return Err(KbError::BadInput(format!("document {} has empty content", i)).into());
            }
            let mut meta = doc.meta;
            meta.insert(
                "type".to_string(),
                serde_json::Value::String(doc.doc_type.unwrap_or_else(|| "document".to_string())),
            );
            Ok(Chunk {
                id: i as i64,
                text: doc.content,
                meta,
            })
        })
        .collect()
}

/// Numbered system message listing retrieved chunks, or `""` for no hits.
pub fn rag_context_message(hits: &[QueryHit]) -> String {
    if hits.is_empty() {
        return String::new();
    }
    let mut lines =
        vec!["Use the following retrieved context when helpful (do not fabricate answers):\n".to_string()];
    for (i, hit) in hits.iter().enumerate() {
        lines.push(format!("{}. {} (score: {:.4})", i + 1, hit.text, hit.score));
    }
    lines.push("\nIf the context does not contain the answer, say so explicitly.".to_string());
    lines.join("\n")
}

pub struct KnowledgeBase {
    kb: KbConfig,
    rag: RagConfig,
    store: VectorStore,
}

impl KnowledgeBase {
    pub fn new(config: &Config, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            kb: config.kb.clone(),
            rag: config.rag.clone(),
            store: VectorStore::new(embedder),
        }
    }

    pub fn paths(&self, project_id: &str) -> Result<ProjectPaths> {
        project_paths(&self.kb.base_dir, project_id)
    }

    fn require_embeddings(&self) -> Result<()> {
        if self.store.embedder().is_available() {
            Ok(())
        } else {
            Err(KbError::embeddings_unavailable().into())
        }
    }

    /// Build (or rebuild) a project's KB from documents. Version resets to 1.
    pub async fn build_project(&self, project_id: &str, docs: Vec<Document>) -> Result<BuildSummary> {
        if docs.is_empty() {
            return Err(KbError::BadInput("no documents provided".into()).into());
        }
        self.require_embeddings()?;
        let paths = self.paths(project_id)?;
        let chunks = documents_to_chunks(docs)?;
        let kb = self.store.build_project(&paths, chunks).await?;
        Ok(BuildSummary {
            project_id: project_id.to_string(),
            total_chunks: kb.envelope.total_chunks,
            version: kb.version(),
            index_path: paths.index,
        })
    }

    /// Add documents to an existing KB. Never creates one; a project with only
    /// one of its two files is `Inconsistent` rather than `NotFound`.
    pub async fn incremental_update(
        &self,
        project_id: &str,
        docs: Vec<Document>,
    ) -> Result<UpdateSummary> {
        if docs.is_empty() {
            return Err(KbError::BadInput("no documents provided".into()).into());
        }
        let paths = self.paths(project_id)?;
        if !paths.exists() && !paths.is_partial() {
            return Err(KbError::not_found_kb(project_id).into());
        }
        self.require_embeddings()?;
        let chunks = documents_to_chunks(docs)?;
        let out = self.store.incremental_add(&paths, chunks).await?;
        Ok(UpdateSummary {
            added_chunks: out.added,
            skipped_chunks: out.skipped,
            total_chunks: out.kb.envelope.total_chunks,
            version: out.version,
        })
    }

    /// `top_k` defaults to `kb.default_top_k` and must be in `1..=kb.max_top_k`.
    pub async fn query_project(
        &self,
        project_id: &str,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<QueryHit>> {
        if query.trim().is_empty() {
            return Err(KbError::BadInput("query must not be empty".into()).into());
        }
        let top_k = top_k.unwrap_or(self.kb.default_top_k);
        if top_k == 0 || top_k > self.kb.max_top_k {
            return Err(KbError::BadInput(format!(
                "top_k must be between 1 and {}",
                self.kb.max_top_k
            ))
            .into());
        }
        let paths = self.paths(project_id)?;
        if !paths.exists() {
            return Err(KbError::not_found_kb(project_id).into());
        }
        self.require_embeddings()?;
        let kb = VectorStore::load(&paths)?;
        let hits = self.store.query(query, &kb, top_k).await?;
        tracing::debug!(project_id, top_k, hits = hits.len(), "kb query");
        Ok(hits)
    }

    /// Never fails; an invalid project id is reported in `error`.
    pub fn project_status(&self, project_id: &str) -> KbStatus {
        match self.paths(project_id) {
            Ok(paths) => VectorStore::status(&paths),
            Err(e) => KbStatus {
                error: Some(e.to_string()),
                ..KbStatus::default()
            },
        }
    }

    /// Keyword match first, then whether the project's best hit clears
    /// `rag.sim_threshold`. Any failure means no retrieval.
    pub async fn needs_rag(&self, project_id: &str, query: &str) -> bool {
        if !self.rag.enabled {
            return false;
        }
        let q = query.to_lowercase();
        let keyword_hit = self
            .rag
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .any(|k| !k.is_empty() && q.contains(&k));
        if keyword_hit {
            return true;
        }

        match self.query_project(project_id, query, Some(1)).await {
            Ok(hits) => hits
                .first()
                .map_or(false, |h| h.score >= self.rag.sim_threshold),
            Err(e) => {
                tracing::debug!(project_id, error = %e, "retrieval gate check failed");
                false
            }
        }
    }

    /// Context message from the top `rag.top_k` hits. `None` when retrieval
    /// fails or finds nothing.
    pub async fn rag_context(&self, project_id: &str, query: &str) -> Option<String> {
        let top_k = self.rag.top_k.clamp(1, self.kb.max_top_k);
        match self.query_project(project_id, query, Some(top_k)).await {
            Ok(hits) if !hits.is_empty() => Some(rag_context_message(&hits)),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(project_id, error = %e, "retrieval failed");
                None
            }
        }
    }
}
