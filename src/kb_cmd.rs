//! `reqh kb` subcommands.
//!
//! Document files are JSON arrays of `{content, type?, meta?}` objects, the
//! same shape `POST /kb/build` accepts.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::kb::KnowledgeBase;
use crate::models::Document;

fn open_kb(config: &Config) -> Result<KnowledgeBase> {
    let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
    Ok(KnowledgeBase::new(config, embedder))
}

/// Read a document list from a JSON file.
pub fn read_documents(path: &Path) -> Result<Vec<Document>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read documents file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse documents file: {}", path.display()))
}

pub async fn run_kb_build(config: &Config, project_id: &str, docs_path: &Path) -> Result<()> {
    let docs = read_documents(docs_path)?;
    let summary = open_kb(config)?.build_project(project_id, docs).await?;

    println!("kb build");
    println!("  project:      {}", summary.project_id);
    println!("  total chunks: {}", summary.total_chunks);
    println!("  version:      {}", summary.version);
    println!("  index:        {}", summary.index_path.display());
    Ok(())
}

pub async fn run_kb_add(config: &Config, project_id: &str, docs_path: &Path) -> Result<()> {
    let docs = read_documents(docs_path)?;
    let summary = open_kb(config)?.incremental_update(project_id, docs).await?;

    println!("kb add");
    println!("  added:        {}", summary.added_chunks);
    println!("  skipped:      {}", summary.skipped_chunks);
    println!("  total chunks: {}", summary.total_chunks);
    println!("  version:      {}", summary.version);
    Ok(())
}

pub async fn run_kb_query(
    config: &Config,
    project_id: &str,
    query: &str,
    top_k: Option<usize>,
) -> Result<()> {
    let hits = open_kb(config)?
        .query_project(project_id, query, top_k)
        .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.4}] {}", i + 1, hit.score, hit.text);
        println!("    id: {}", hit.id);
        if let Some(kind) = hit.meta.get("type").and_then(|v| v.as_str()) {
            println!("    type: {}", kind);
        }
        println!();
    }
    Ok(())
}

/// Status never fails; problems are printed as `error:`.
pub fn run_kb_status(config: &Config, project_id: &str) -> Result<()> {
    let kb = open_kb(config)?;
    let status = kb.project_status(project_id);

    println!("kb status");
    println!("  project:      {}", project_id);
    println!("  exists:       {}", status.exists);
    println!("  version:      {}", status.version);
    println!("  total chunks: {}", status.total_chunks);
    if let Some(at) = &status.last_built_at {
        println!("  last built:   {}", at);
    }
    if let Some(err) = &status.error {
        println!("  error:        {}", err);
    }
    Ok(())
}
