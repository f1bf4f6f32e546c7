//! Conflict-detection progress reporting.
//!
//! A detection run reports each stage (embedding, clustering, per-cluster
//! checks, aggregation, tagging) through [`DetectionProgress`]. The CLI
//! writes to **stderr** so stdout stays parseable; the server writes the
//! current stage into the job record so pollers can see it.

use std::io::Write;
use std::sync::Arc;

use crate::jobs::JobTracker;

/// A single progress event for a detection run.
#[derive(Clone, Debug)]
pub enum DetectionEvent {
    Embedding {
        total: usize,
    },
    Clustering {
        total: usize,
    },
    /// Starting cluster `index` of `clusters` (1-based).
    Checking {
        cluster_id: i32,
        index: usize,
        clusters: usize,
        members: usize,
    },
    Batch {
        cluster_id: i32,
        batch: usize,
        batches: usize,
    },
    Aggregated {
        conflicts: usize,
    },
    Tagging {
        n: usize,
        total: usize,
    },
}

impl DetectionEvent {
    fn phase(&self) -> &'static str {
        match self {
            DetectionEvent::Embedding { .. } => "embedding",
            DetectionEvent::Clustering { .. } => "clustering",
            DetectionEvent::Checking { .. } => "checking",
            DetectionEvent::Batch { .. } => "batch",
            DetectionEvent::Aggregated { .. } => "aggregated",
            DetectionEvent::Tagging { .. } => "tagging",
        }
    }

    /// One-line description, also used as the job `progress` field.
    pub fn describe(&self) -> String {
        match self {
            DetectionEvent::Embedding { total } => {
                format!("Embedding {} requirements", format_number(*total as u64))
            }
            DetectionEvent::Clustering { total } => {
                format!("Clustering {} requirements", format_number(*total as u64))
            }
            DetectionEvent::Checking {
                cluster_id,
                index,
                clusters,
                members,
            } => format!(
                "Checking cluster {} ({}/{}, {} requirements)",
                cluster_id, index, clusters, members
            ),
            DetectionEvent::Batch {
                cluster_id,
                batch,
                batches,
            } => format!("Cluster {} batch {}/{}", cluster_id, batch, batches),
            DetectionEvent::Aggregated { conflicts } => {
                format!("Aggregated {} conflicts", format_number(*conflicts as u64))
            }
            DetectionEvent::Tagging { n, total } => format!("Tagging {} / {}", n, total),
        }
    }
}

pub trait DetectionProgress: Send + Sync {
    fn report(&self, event: DetectionEvent);
}

/// Human-friendly progress on stderr: "detect  checking  Checking cluster 2 (3/5, 12 requirements)".
pub struct StderrProgress;

impl DetectionProgress for StderrProgress {
    fn report(&self, event: DetectionEvent) {
        let line = format!("detect  {}  {}\n", event.phase(), event.describe());
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl DetectionProgress for JsonProgress {
    fn report(&self, event: DetectionEvent) {
        let mut obj = serde_json::json!({
            "event": "progress",
            "phase": event.phase(),
            "message": event.describe(),
        });
        match &event {
            DetectionEvent::Embedding { total } | DetectionEvent::Clustering { total } => {
                obj["total"] = (*total).into();
            }
            DetectionEvent::Checking {
                cluster_id,
                index,
                clusters,
                ..
            } => {
                obj["cluster_id"] = (*cluster_id).into();
                obj["n"] = (*index).into();
                obj["total"] = (*clusters).into();
            }
            DetectionEvent::Batch {
                cluster_id,
                batch,
                batches,
            } => {
                obj["cluster_id"] = (*cluster_id).into();
                obj["n"] = (*batch).into();
                obj["total"] = (*batches).into();
            }
            DetectionEvent::Aggregated { conflicts } => {
                obj["conflicts"] = (*conflicts).into();
            }
            DetectionEvent::Tagging { n, total } => {
                obj["n"] = (*n).into();
                obj["total"] = (*total).into();
            }
        }
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl DetectionProgress for NoProgress {
    fn report(&self, _event: DetectionEvent) {}
}

/// Writes each event's description into a tracked job's `progress` field.
pub struct JobProgress {
    tracker: Arc<dyn JobTracker>,
    job_id: String,
}

impl JobProgress {
    pub fn new(tracker: Arc<dyn JobTracker>, job_id: impl Into<String>) -> Self {
        Self {
            tracker,
            job_id: job_id.into(),
        }
    }
}

impl DetectionProgress for JobProgress {
    fn report(&self, event: DetectionEvent) {
        let message = event.describe();
        self.tracker
            .update(&self.job_id, &mut |r| r.progress = Some(message.clone()));
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn DetectionProgress> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobTracker, JobRecord};

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn describe_checking() {
        let e = DetectionEvent::Checking {
            cluster_id: 2,
            index: 3,
            clusters: 5,
            members: 12,
        };
        assert_eq!(e.describe(), "Checking cluster 2 (3/5, 12 requirements)");
        assert_eq!(e.phase(), "checking");
    }

    #[test]
    fn job_sink_writes_progress() {
        let tracker: Arc<dyn JobTracker> = Arc::new(InMemoryJobTracker::new());
        tracker.create(JobRecord::conflicts("j1".into(), "1"));
        let sink = JobProgress::new(tracker.clone(), "j1");
        sink.report(DetectionEvent::Embedding { total: 1500 });
        assert_eq!(
            tracker.get("j1").unwrap().progress.as_deref(),
            Some("Embedding 1,500 requirements")
        );
    }
}
