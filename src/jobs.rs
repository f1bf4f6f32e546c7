//! Background job tracking.
//!
//! Long operations (async KB builds, conflict detection runs) execute as
//! spawned tasks and are polled by id. [`JobTracker`] is the seam: the server
//! only needs atomic create / read-modify-write / get / remove per job id.
//! [`InMemoryJobTracker`] is the single-process backing; its lock is held for
//! one map operation at a time, never across the job's work. Finished jobs
//! are kept for a retention window and swept when new jobs are created.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::{ConflictPair, RunMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Build,
    Conflicts,
}

/// Build jobs go `queued -> building -> completed | failed`; conflict jobs go
/// `pending -> running -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Building,
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Building => "building",
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub kind: JobKind,
    pub project_id: String,
    pub status: JobStatus,
    pub progress: Option<String>,
    /// Build outcome (`total_chunks`, `index_path`).
    pub result: Option<serde_json::Value>,
    pub conflicts: Option<Vec<ConflictPair>>,
    pub metadata: Option<RunMetadata>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn build(job_id: String, project_id: &str) -> Self {
        Self::new(job_id, JobKind::Build, project_id, JobStatus::Queued)
    }

    pub fn conflicts(job_id: String, project_id: &str) -> Self {
        Self::new(job_id, JobKind::Conflicts, project_id, JobStatus::Pending)
    }

    fn new(job_id: String, kind: JobKind, project_id: &str, status: JobStatus) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            kind,
            project_id: project_id.to_string(),
            status,
            progress: None,
            result: None,
            conflicts: None,
            metadata: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Terminal failure. Clears progress.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.progress = None;
    }
}

pub trait JobTracker: Send + Sync {
    fn create(&self, record: JobRecord);
    /// Apply `f` to the record atomically. Returns `false` for unknown ids.
    fn update(&self, job_id: &str, f: &mut dyn FnMut(&mut JobRecord)) -> bool;
    fn get(&self, job_id: &str) -> Option<JobRecord>;
    fn remove(&self, job_id: &str) -> Option<JobRecord>;
}

/// How long a completed or failed job stays pollable by default.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(3600);

pub struct InMemoryJobTracker {
    jobs: RwLock<HashMap<String, JobRecord>>,
    retention: chrono::Duration,
}

impl Default for InMemoryJobTracker {
    fn default() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }
}

impl InMemoryJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Drop terminal jobs last touched at least one retention window before
    /// `now`. Jobs still in flight are never removed. Returns the count.
    pub fn sweep_finished(&self, now: DateTime<Utc>) -> usize {
        sweep(&mut self.jobs.write(), now, self.retention)
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobTracker for InMemoryJobTracker {
    fn create(&self, record: JobRecord) {
        let mut jobs = self.jobs.write();
        let swept = sweep(&mut jobs, Utc::now(), self.retention);
        if swept > 0 {
            tracing::debug!(swept, remaining = jobs.len(), "expired finished jobs");
        }
        jobs.insert(record.job_id.clone(), record);
    }

    fn update(&self, job_id: &str, f: &mut dyn FnMut(&mut JobRecord)) -> bool {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(job_id) {
            Some(record) => {
                f(record);
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().get(job_id).cloned()
    }

    fn remove(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.write().remove(job_id)
    }
}

fn sweep(jobs: &mut HashMap<String, JobRecord>, now: DateTime<Utc>, retention: chrono::Duration) -> usize {
    let before = jobs.len();
    jobs.retain(|_, r| !r.status.is_terminal() || now - r.updated_at < retention);
    before - jobs.len()
}

// ============ Job IDs ============

fn random_hex(len: usize) -> String {
    let mut hex = uuid::Uuid::new_v4().simple().to_string();
    hex.truncate(len);
    hex
}

/// `job_<12 hex>`.
pub fn build_job_id() -> String {
    format!("job_{}", random_hex(12))
}

/// `<numeric project id>_<YYYYmmdd_HHMMSS>_<4 hex>`. The suffix keeps two
/// runs started in the same second apart.
pub fn conflict_job_id(project_id: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        numeric_project_id(project_id),
        now.format("%Y%m%d_%H%M%S"),
        random_hex(4)
    )
}

/// Integer form of a project id for consumers that store it as a number.
///
/// Decimal ids map to themselves. Anything else is folded into 31 bits via
/// SHA-256; distinct ids can collide and nothing detects it.
pub fn numeric_project_id(project_id: &str) -> i64 {
    if let Ok(n) = project_id.trim().parse::<i64>() {
        return n;
    }
    let digest = Sha256::digest(project_id.as_bytes());
    let folded = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff;
    i64::from(folded)
}
