//! `reqh detect`: run conflict detection over a requirements file.
//!
//! The input is either a JSON array of `{id, text}` objects or a text file
//! with one requirement per line. Text files get `REQ_0000`-style ids.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::conflict::{export_report, format_summary, with_default_ids, ConflictDetector, DetectionOptions};
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::kb::Capabilities;
use crate::llm::{create_llm, LlmClient};
use crate::models::RequirementInput;
use crate::progress::ProgressMode;

/// Command-line overrides applied on top of `[conflicts]`.
#[derive(Debug, Clone, Default)]
pub struct DetectArgs {
    pub min_cluster_size: Option<usize>,
    pub max_batch: Option<usize>,
    pub similarity_threshold: Option<f32>,
    pub tags: bool,
    /// Export directory; `[conflicts].output_dir` when unset.
    pub out: Option<PathBuf>,
    pub json: bool,
}

/// Parse requirements from file content. A leading `[` means JSON.
pub fn parse_requirements(content: &str) -> Result<Vec<RequirementInput>> {
    if content.trim_start().starts_with('[') {
        let reqs: Vec<RequirementInput> =
            serde_json::from_str(content).context("Failed to parse requirements JSON")?;
        return Ok(reqs);
    }
    Ok(with_default_ids(
        content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string),
    ))
}

pub fn read_requirements(path: &Path) -> Result<Vec<RequirementInput>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read requirements file: {}", path.display()))?;
    parse_requirements(&content)
}

fn options_for(config: &Config, args: &DetectArgs) -> DetectionOptions {
    let mut options = DetectionOptions::from_config(&config.conflicts);
    if let Some(v) = args.min_cluster_size {
        options.min_cluster_size = v;
    }
    if let Some(v) = args.max_batch {
        options.max_cluster_batch = v;
    }
    if let Some(v) = args.similarity_threshold {
        options.similarity_threshold = v;
    }
    options.add_tags = args.tags;
    options
}

pub async fn run_detect(config: &Config, input: &Path, args: DetectArgs) -> Result<()> {
    let requirements = read_requirements(input)?;
    let options = options_for(config, &args);
    options.validate()?;

    let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
    let llm: Arc<dyn LlmClient> = Arc::from(create_llm(&config.llm)?);
    let caps = Capabilities::detect(embedder.as_ref(), llm.as_ref());
    caps.require_embeddings()?;
    caps.require_llm()?;

    let progress = if args.json {
        ProgressMode::Json
    } else {
        ProgressMode::default_for_tty()
    };
    let detector = ConflictDetector::new(embedder, llm, options);
    let report = detector.run(requirements, progress.reporter().as_ref()).await?;

    let dir = args.out.as_deref().unwrap_or(&config.conflicts.output_dir);
    let paths = export_report(&report, dir, chrono::Utc::now())?;
    tracing::info!(
        requirements = %paths.requirements.display(),
        conflicts = ?paths.conflicts,
        "exported detection report"
    );

    if args.json {
        let body = serde_json::json!({
            "conflicts": report.conflicts,
            "metadata": report.metadata,
            "llm_calls": report.llm_calls,
            "failed_batches": report.failed_batches,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        print!("{}", format_summary(&report));
    }
    Ok(())
}
