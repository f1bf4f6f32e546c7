//! Cluster-scoped conflict detection.
//!
//! A run moves through `Idle -> Embedding -> Clustering -> PerClusterCheck
//! -> Aggregated -> Completed`, or to `Failed` when embedding is impossible.
//! Only requirements that land in the same cluster are shown to the model
//! together; outliers are never checked. Within a cluster, near-duplicates
//! are pruned and the rest is sent in contiguous batches of at most
//! `max_cluster_batch`.
//!
//! A batch whose model call errors, times out, or returns unparseable text
//! counts as zero conflicts and the run continues.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cluster::{cluster, prune_near_duplicates, ClusterParams};
use crate::config::ConflictConfig;
use crate::embedding::{embed_normalized, EmbeddingProvider};
use crate::error::KbError;
use crate::llm::{CompletionRequest, LlmClient};
use crate::models::{Confidence, ConflictPair, Requirement, RequirementInput, RunMetadata};
use crate::progress::{DetectionEvent, DetectionProgress};
use crate::response::{parse_conflicts, parse_tags};

/// Categories the tagger may assign.
pub const TAG_CATEGORIES: [&str; 19] = [
    "Security",
    "Performance",
    "UI",
    "UX",
    "Database",
    "API",
    "Authentication",
    "Authorization",
    "Scalability",
    "Reliability",
    "Testing",
    "Documentation",
    "Deployment",
    "Integration",
    "Functionality",
    "Usability",
    "Accessibility",
    "Compatibility",
    "Maintainability",
];

const TAG_TEMPERATURE: f32 = 0.2;
const TAG_MAX_TOKENS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Embedding,
    Clustering,
    PerClusterCheck,
    Aggregated,
    Completed,
    Failed,
}

impl RunState {
    fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Embedding)
                | (Idle, Completed)
                | (Embedding, Clustering)
                | (Clustering, PerClusterCheck)
                | (PerClusterCheck, Aggregated)
                | (Aggregated, Completed)
                | (Embedding | Clustering, Failed)
        )
    }
}

/// Per-run tunables. Request overrides are applied on top of the config.
#[derive(Debug, Clone)]
pub struct DetectionOptions {
    pub min_cluster_size: usize,
    pub max_cluster_batch: usize,
    pub similarity_threshold: f32,
    pub noise_ratio: f32,
    pub reassign_threshold: f32,
    pub temperature: f32,
    pub max_tokens: u32,
    pub add_tags: bool,
    pub tag_sample_size: usize,
}

impl DetectionOptions {
    pub fn from_config(config: &ConflictConfig) -> Self {
        Self {
            min_cluster_size: config.min_cluster_size,
            max_cluster_batch: config.max_cluster_batch,
            similarity_threshold: config.similarity_threshold,
            noise_ratio: config.noise_ratio,
            reassign_threshold: config.reassign_threshold,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            add_tags: false,
            tag_sample_size: config.tag_sample_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_cluster_size < 2 {
            return Err(KbError::BadInput("min_cluster_size must be >= 2".into()).into());
        }
        if self.max_cluster_batch < 2 {
            return Err(KbError::BadInput("max_batch_size must be >= 2".into()).into());
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(
                KbError::BadInput("similarity_threshold must be in [0.0, 1.0]".into()).into(),
            );
        }
        Ok(())
    }

    fn cluster_params(&self) -> ClusterParams {
        ClusterParams {
            min_cluster_size: self.min_cluster_size,
            min_samples: 1,
            noise_ratio: self.noise_ratio,
            reassign_threshold: self.reassign_threshold,
        }
    }
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self::from_config(&ConflictConfig::default())
    }
}

/// Everything one run produced.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub requirements: Vec<Requirement>,
    pub conflicts: Vec<ConflictPair>,
    pub metadata: RunMetadata,
    pub llm_calls: usize,
    pub failed_batches: usize,
    pub state: RunState,
}

/// Assign `REQ_0000`, `REQ_0001`, ... to bare texts.
pub fn with_default_ids<I, S>(texts: I) -> Vec<RequirementInput>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    texts
        .into_iter()
        .enumerate()
        .map(|(i, text)| RequirementInput {
            id: format!("REQ_{:04}", i),
            text: text.into(),
        })
        .collect()
}

/// Numbered enumeration prompt for one batch.
pub fn build_conflict_prompt(batch: &[&Requirement]) -> String {
    let listing = batch
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. [{}] {}", i + 1, r.req_id, r.text))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are analyzing requirements for logical conflicts.

Requirements to analyze:
{listing}

Task: Identify any pairs of requirements that CANNOT both be true or would create a logical contradiction.

Return your analysis as a JSON array. For each conflict found, include:
- req_a: ID of first requirement (e.g., "REQ_0001")
- req_b: ID of second requirement
- reason: Brief explanation of the conflict
- confidence: "high", "medium", or "low"

If no conflicts exist, return an empty array: []

Response format:
[
  {{"req_a": "REQ_0001", "req_b": "REQ_0003", "reason": "...", "confidence": "high"}},
  ...
]

JSON output only:"#
    )
}

fn build_tag_prompt(text: &str) -> String {
    format!(
        "Classify this software requirement into relevant categories.\n\n\
         Requirement: \"{}\"\n\n\
         Return 1-3 tags from: {}\n\n\
         Response format (comma-separated): Security, Performance, API",
        text,
        TAG_CATEGORIES.join(", ")
    )
}

pub struct ConflictDetector {
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmClient>,
    options: DetectionOptions,
}

impl ConflictDetector {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmClient>,
        options: DetectionOptions,
    ) -> Self {
        Self {
            embedder,
            llm,
            options,
        }
    }

    pub fn options(&self) -> &DetectionOptions {
        &self.options
    }

    /// Run the pipeline. Errors only when embedding fails; model failures
    /// are absorbed per batch.
    pub async fn run(
        &self,
        inputs: Vec<RequirementInput>,
        progress: &dyn DetectionProgress,
    ) -> Result<DetectionReport> {
        self.options.validate()?;
        let mut state = RunState::Idle;
        let total_inputs = inputs.len();

        let mut requirements: Vec<Requirement> = inputs
            .into_iter()
            .filter(|r| !r.text.trim().is_empty())
            .map(|r| Requirement {
                req_id: r.id,
                text: r.text,
                embedding: Vec::new(),
                cluster_id: -1,
                tags: Vec::new(),
            })
            .collect();

        if requirements.len() < 2 {
            tracing::info!(
                usable = requirements.len(),
                "fewer than two usable requirements; nothing to compare"
            );
            advance(&mut state, RunState::Completed);
            let noise = requirements.len();
            return Ok(DetectionReport {
                requirements,
                conflicts: Vec::new(),
                metadata: run_metadata(total_inputs, 0, noise, 0),
                llm_calls: 0,
                failed_batches: 0,
                state,
            });
        }

        advance(&mut state, RunState::Embedding);
        progress.report(DetectionEvent::Embedding {
            total: requirements.len(),
        });
        let texts: Vec<String> = requirements.iter().map(|r| r.text.clone()).collect();
        let embeddings = match embed_normalized(self.embedder.as_ref(), &texts).await {
            Ok(e) => e,
            Err(e) => {
                advance(&mut state, RunState::Failed);
                tracing::error!(error = %format!("{:#}", e), "embedding failed; aborting run");
                return Err(e.context("conflict detection: embedding failed"));
            }
        };

        advance(&mut state, RunState::Clustering);
        progress.report(DetectionEvent::Clustering {
            total: requirements.len(),
        });
        let outcome = cluster(&embeddings, &self.options.cluster_params());
        for ((req, emb), label) in requirements
            .iter_mut()
            .zip(embeddings.iter())
            .zip(outcome.labels.iter())
        {
            req.embedding = emb.clone();
            req.cluster_id = *label;
        }
        let noise_points = outcome.noise_points();
        tracing::info!(
            clusters = outcome.clusters_found,
            noise_before = outcome.noise_before,
            reassigned = outcome.reassigned,
            noise_points,
            "clustered requirements"
        );

        advance(&mut state, RunState::PerClusterCheck);
        let groups = outcome.members();
        let mut conflicts = Vec::new();
        let mut llm_calls = 0;
        let mut failed_batches = 0;

        for (index, (cluster_id, members)) in groups.iter().enumerate() {
            if members.len() < self.options.min_cluster_size {
                tracing::debug!(cluster_id, size = members.len(), "cluster too small; skipped");
                continue;
            }
            let kept = prune_near_duplicates(
                &embeddings,
                members,
                self.options.similarity_threshold,
            );
            if kept.len() < members.len() {
                tracing::debug!(
                    cluster_id,
                    removed = members.len() - kept.len(),
                    "pruned near-duplicates"
                );
            }
            if kept.len() < 2 {
                tracing::debug!(cluster_id, "fewer than two distinct requirements; skipped");
                continue;
            }
            progress.report(DetectionEvent::Checking {
                cluster_id: *cluster_id,
                index: index + 1,
                clusters: groups.len(),
                members: kept.len(),
            });

            let batch_reqs: Vec<&Requirement> = kept.iter().map(|&i| &requirements[i]).collect();
            let batches: Vec<&[&Requirement]> =
                batch_reqs.chunks(self.options.max_cluster_batch).collect();
            for (b, batch) in batches.iter().enumerate() {
                if batch.len() < 2 {
                    continue;
                }
                if batches.len() > 1 {
                    progress.report(DetectionEvent::Batch {
                        cluster_id: *cluster_id,
                        batch: b + 1,
                        batches: batches.len(),
                    });
                }
                llm_calls += 1;
                match self.check_batch(batch, *cluster_id).await {
                    Ok(found) => {
                        tracing::debug!(cluster_id, batch = b + 1, found = found.len(), "batch checked");
                        conflicts.extend(found);
                    }
                    Err(e) => {
                        failed_batches += 1;
                        tracing::warn!(
                            cluster_id,
                            batch = b + 1,
                            error = %format!("{:#}", e),
                            "batch check failed; counting zero conflicts"
                        );
                    }
                }
            }
        }

        advance(&mut state, RunState::Aggregated);
        progress.report(DetectionEvent::Aggregated {
            conflicts: conflicts.len(),
        });

        if self.options.add_tags {
            self.tag_requirements(&mut requirements, progress).await;
        }

        advance(&mut state, RunState::Completed);
        tracing::info!(
            conflicts = conflicts.len(),
            clusters = outcome.clusters_found,
            llm_calls,
            failed_batches,
            "conflict detection complete"
        );

        let metadata = run_metadata(
            total_inputs,
            outcome.clusters_found,
            noise_points,
            conflicts.len(),
        );
        Ok(DetectionReport {
            requirements,
            conflicts,
            metadata,
            llm_calls,
            failed_batches,
            state,
        })
    }

    /// One model call for one batch. Ids are taken as the model reported
    /// them; texts resolve against the batch and stay empty when unknown.
    async fn check_batch(&self, batch: &[&Requirement], cluster_id: i32) -> Result<Vec<ConflictPair>> {
        let request = CompletionRequest::user(
            build_conflict_prompt(batch),
            self.options.max_tokens,
            self.options.temperature,
        );
        let completion = self.llm.complete(&request).await?;
        let parsed = parse_conflicts(&completion.text)?;
        if parsed.dropped > 0 || parsed.salvaged {
            tracing::debug!(
                cluster_id,
                dropped = parsed.dropped,
                salvaged = parsed.salvaged,
                "recovered partial model output"
            );
        }

        let texts: HashMap<&str, &str> = batch
            .iter()
            .map(|r| (r.req_id.as_str(), r.text.as_str()))
            .collect();
        let now = Utc::now();
        Ok(parsed
            .items
            .into_iter()
            .map(|raw| ConflictPair {
                req_a_text: texts.get(raw.req_a.as_str()).unwrap_or(&"").to_string(),
                req_b_text: texts.get(raw.req_b.as_str()).unwrap_or(&"").to_string(),
                req_a_id: raw.req_a,
                req_b_id: raw.req_b,
                reason: raw.reason,
                confidence: Confidence::parse_lenient(&raw.confidence),
                cluster_id,
                timestamp: now,
            })
            .collect())
    }

    /// Tag the first `tag_sample_size` requirements. Failures leave tags empty.
    async fn tag_requirements(&self, requirements: &mut [Requirement], progress: &dyn DetectionProgress) {
        let total = requirements.len().min(self.options.tag_sample_size);
        for (n, req) in requirements.iter_mut().take(total).enumerate() {
            progress.report(DetectionEvent::Tagging { n: n + 1, total });
            let request =
                CompletionRequest::user(build_tag_prompt(&req.text), TAG_MAX_TOKENS, TAG_TEMPERATURE);
            match self.llm.complete(&request).await {
                Ok(c) => req.tags = parse_tags(&c.text, &TAG_CATEGORIES),
                Err(e) => {
                    tracing::warn!(req_id = %req.req_id, error = %format!("{:#}", e), "tagging failed");
                }
            }
        }
    }
}

fn advance(state: &mut RunState, next: RunState) {
    debug_assert!(
        state.can_advance_to(next),
        "illegal run transition {:?} -> {:?}",
        state,
        next
    );
    tracing::debug!(from = ?state, to = ?next, "run state");
    *state = next;
}

fn run_metadata(total: usize, clusters: usize, noise: usize, conflicts: usize) -> RunMetadata {
    RunMetadata {
        total_requirements: total,
        clusters_found: clusters,
        noise_points: noise,
        conflicts_found: conflicts,
        timestamp: Utc::now(),
    }
}

// ============ Export & Summary ============

/// Files written by [`export_report`].
#[derive(Debug, Clone, Default)]
pub struct ExportPaths {
    pub conflicts: Option<PathBuf>,
    pub requirements: PathBuf,
    pub training: Option<PathBuf>,
}

#[derive(Serialize)]
struct TrainingRow<'a> {
    req1: &'a str,
    req2: &'a str,
    label: &'static str,
    reason: &'a str,
    confidence: Confidence,
}

/// Write `conflicts_<ts>.json`, `requirements_metadata_<ts>.json` and
/// `training_data_<ts>.jsonl` under `dir`. Conflict files are skipped when
/// the run found none.
pub fn export_report(report: &DetectionReport, dir: &Path, at: DateTime<Utc>) -> Result<ExportPaths> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
    let ts = at.format("%Y%m%d_%H%M%S");

    let mut paths = ExportPaths {
        requirements: dir.join(format!("requirements_metadata_{}.json", ts)),
        ..ExportPaths::default()
    };
    write_json(&paths.requirements, &report.requirements)?;

    if !report.conflicts.is_empty() {
        let conflicts_path = dir.join(format!("conflicts_{}.json", ts));
        write_json(&conflicts_path, &report.conflicts)?;
        paths.conflicts = Some(conflicts_path);

        let training_path = dir.join(format!("training_data_{}.jsonl", ts));
        let mut lines = String::new();
        for c in &report.conflicts {
            let row = TrainingRow {
                req1: &c.req_a_text,
                req2: &c.req_b_text,
                label: "contradiction",
                reason: &c.reason,
                confidence: c.confidence,
            };
            lines.push_str(&serde_json::to_string(&row)?);
            lines.push('\n');
        }
        std::fs::write(&training_path, lines)
            .with_context(|| format!("Failed to write {}", training_path.display()))?;
        paths.training = Some(training_path);
    }
    Ok(paths)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{}...", head)
    }
}

/// Plain-text run summary for the CLI.
pub fn format_summary(report: &DetectionReport) -> String {
    let mut out = String::new();
    out.push_str("CONFLICT DETECTION SUMMARY\n");
    out.push_str(&format!(
        "  requirements: {}\n  clusters:     {}\n  noise:        {}\n  conflicts:    {}\n",
        report.metadata.total_requirements,
        report.metadata.clusters_found,
        report.metadata.noise_points,
        report.metadata.conflicts_found,
    ));
    if report.failed_batches > 0 {
        out.push_str(&format!(
            "  failed batches: {} of {}\n",
            report.failed_batches, report.llm_calls
        ));
    }
    if report.conflicts.is_empty() {
        return out;
    }

    let mut by_cluster: BTreeMap<i32, usize> = BTreeMap::new();
    let mut by_confidence: BTreeMap<Confidence, usize> = BTreeMap::new();
    for c in &report.conflicts {
        *by_cluster.entry(c.cluster_id).or_default() += 1;
        *by_confidence.entry(c.confidence).or_default() += 1;
    }
    out.push_str("\nConflicts by cluster:\n");
    for (cluster_id, n) in &by_cluster {
        out.push_str(&format!("  cluster {}: {}\n", cluster_id, n));
    }
    out.push_str("\nConfidence:\n");
    for (conf, n) in &by_confidence {
        out.push_str(&format!("  {}: {}\n", conf.as_str(), n));
    }
    out.push_str("\nSample conflicts:\n");
    for (i, c) in report.conflicts.iter().take(3).enumerate() {
        out.push_str(&format!(
            "\n{}. {} <-> {} ({})\n   A: {}\n   B: {}\n   Reason: {}\n",
            i + 1,
            c.req_a_id,
            c.req_b_id,
            c.confidence.as_str(),
            truncate_chars(&c.req_a_text, 80),
            truncate_chars(&c.req_b_text, 80),
            c.reason
        ));
    }
    out
}
