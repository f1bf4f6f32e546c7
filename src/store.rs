//! Per-project vector index store.
//!
//! A project knowledge base is a pair of files under
//! `{base_dir}/{project_id}/`:
//!
//! | File | Content |
//! |------|---------|
//! | `faiss_index.bin` | [`FlatIndex`] binary (see [`crate::index`]) |
//! | `faiss_meta.pkl` | JSON [`Envelope`], or a legacy bare chunk list |
//!
//! Both files exist together or the KB is absent; a lone file is reported as
//! inconsistent, never treated as a missing KB. Writers go through
//! [`VectorStore::incremental_add`] or [`VectorStore::build_project`], which
//! hold the project's lock from the dedup snapshot to the last rename. Locks
//! are keyed on the resolved project directory, so ids that differ only in
//! surrounding whitespace share one lock.
//! Readers ([`VectorStore::load`], [`VectorStore::status`]) take no lock; they
//! may see a slightly stale pair but never a half-written file.
//!
//! # Incremental add
//!
//! 1. Acquire the project lock.
//! 2. No KB on disk → build from scratch (version 1). Only one of the two
//!    files on disk → `Inconsistent`.
//! 3. Drop incoming chunks whose stable identity (`meta.requirement_id`,
//!    `meta.req_id`, `meta.requirement`) or SHA-256 text hash is already
//!    present, in the KB or earlier in the same batch.
//! 4. Nothing left → return the KB untouched, version unchanged.
//! 5. Embed survivors, append, renumber ids from `max(id) + 1`, bump version.
//! 6. Persist last: both files are staged and fsynced before either rename.
//!    Any earlier failure leaves the files as they were.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::embedding::{embed_normalized, embed_query, EmbeddingProvider};
use crate::error::KbError;
use crate::index::{commit_temp, discard_temp, stage_temp, FlatIndex};
use crate::locks::ProjectLocks;
use crate::models::{Chunk, Envelope, KbStatus, MetaFile, QueryHit};

pub const INDEX_FILE: &str = "faiss_index.bin";
pub const META_FILE: &str = "faiss_meta.pkl";

/// On-disk locations of one project's KB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub dir: PathBuf,
    pub index: PathBuf,
    pub meta: PathBuf,
}

impl ProjectPaths {
    pub fn exists(&self) -> bool {
        self.index.exists() && self.meta.exists()
    }

    /// Exactly one of the two files is present.
    pub fn is_partial(&self) -> bool {
        self.index.exists() != self.meta.exists()
    }

    /// Key for the per-project write lock.
    fn lock_key(&self) -> String {
        self.dir.to_string_lossy().into_owned()
    }

    fn partial_error(&self) -> KbError {
        let (present, missing) = if self.index.exists() {
            (INDEX_FILE, META_FILE)
        } else {
            (META_FILE, INDEX_FILE)
        };
        KbError::Inconsistent(format!(
            "{} has {} but no {}",
            self.dir.display(),
            present,
            missing
        ))
    }
}

/// Resolve `{base_dir}/{project_id}/{faiss_index.bin,faiss_meta.pkl}`.
///
/// Project ids are single path components; separators and `..` are rejected.
pub fn project_paths(base_dir: &Path, project_id: &str) -> Result<ProjectPaths> {
    let id = project_id.trim();
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(KbError::BadInput(format!("invalid project_id: {:?}", project_id)).into());
    }
    let dir = base_dir.join(id);
    Ok(ProjectPaths {
        index: dir.join(INDEX_FILE),
        meta: dir.join(META_FILE),
        dir,
    })
}

/// SHA-256 hex digest of chunk text, used for exact-duplicate detection.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// An index and its metadata, loaded or built together.
#[derive(Debug, Clone)]
pub struct LoadedKb {
    pub index: FlatIndex,
    pub envelope: Envelope,
}

impl LoadedKb {
    pub fn chunks(&self) -> &[Chunk] {
        &self.envelope.chunks
    }

    pub fn version(&self) -> u64 {
        self.envelope.version
    }

    /// `total_chunks == len(chunks) == ntotal`.
    pub fn is_consistent(&self) -> bool {
        self.envelope.total_chunks == self.envelope.chunks.len()
            && self.envelope.chunks.len() == self.index.ntotal()
    }
}

/// Result of [`VectorStore::incremental_add`].
#[derive(Debug, Clone)]
pub struct IncrementalOutcome {
    pub kb: LoadedKb,
    pub added: usize,
    pub skipped: usize,
    pub version: u64,
}

pub struct VectorStore {
    embedder: Arc<dyn EmbeddingProvider>,
    locks: ProjectLocks,
}

impl VectorStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            embedder,
            locks: ProjectLocks::new(),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Embed all chunks into a fresh index, envelope at version 1. Nothing
    /// is written to disk.
    pub async fn build(&self, chunks: Vec<Chunk>) -> Result<LoadedKb> {
        if chunks.is_empty() {
            return Err(KbError::BadInput("cannot build a knowledge base from zero chunks".into()).into());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_normalized(self.embedder.as_ref(), &texts).await?;

        let mut index = FlatIndex::new(self.embedder.dims());
        index.add(&vectors)?;

        Ok(LoadedKb {
            index,
            envelope: Envelope::new(1, chunks),
        })
    }

    /// Build and persist, replacing any existing KB for the project.
    pub async fn build_project(&self, paths: &ProjectPaths, chunks: Vec<Chunk>) -> Result<LoadedKb> {
        let _guard = self.locks.acquire(&paths.lock_key()).await;
        let kb = self.build(chunks).await?;
        persist(paths, &kb)?;
        tracing::info!(
            dir = %paths.dir.display(),
            total_chunks = kb.envelope.total_chunks,
            "knowledge base built"
        );
        Ok(kb)
    }

    /// Load both artifacts. `NotFound` when either file is missing.
    // A lone file also reads as NotFound here: queries against it behave like
    // a missing KB, while status and incremental adds surface the mismatch.
    pub fn load(paths: &ProjectPaths) -> Result<LoadedKb> {
        if !paths.exists() {
            return Err(KbError::NotFound(format!(
                "knowledge base not found at {}",
                paths.dir.display()
            ))
            .into());
        }
        let index = FlatIndex::load(&paths.index)?;
        let envelope = read_envelope(&paths.meta)?;
        let kb = LoadedKb { index, envelope };
        if !kb.is_consistent() {
            tracing::warn!(
                dir = %paths.dir.display(),
                ntotal = kb.index.ntotal(),
                chunks = kb.envelope.chunks.len(),
                "index and metadata disagree; stale positions will be skipped"
            );
        }
        Ok(kb)
    }

    /// Deduplicated, versioned append. See the module docs for the steps.
    pub async fn incremental_add(
        &self,
        paths: &ProjectPaths,
        new_chunks: Vec<Chunk>,
    ) -> Result<IncrementalOutcome> {
        let _guard = self.locks.acquire(&paths.lock_key()).await;

        if paths.is_partial() {
            return Err(paths.partial_error().into());
        }
        if !paths.exists() {
            let kb = self.build(new_chunks).await?;
            persist(paths, &kb)?;
            let added = kb.envelope.total_chunks;
            tracing::info!(dir = %paths.dir.display(), added, "no existing knowledge base; built version 1");
            return Ok(IncrementalOutcome {
                kb,
                added,
                skipped: 0,
                version: 1,
            });
        }

        let mut kb = Self::load(paths)?;
        if !kb.is_consistent() {
            return Err(KbError::Inconsistent(format!(
                "index holds {} vectors but metadata lists {} chunks",
                kb.index.ntotal(),
                kb.envelope.chunks.len()
            ))
            .into());
        }
        if kb.index.dim() != self.embedder.dims() {
            return Err(KbError::Inconsistent(format!(
                "index dimension {} does not match embedder {} ({} dims)",
                kb.index.dim(),
                self.embedder.model_name(),
                self.embedder.dims()
            ))
            .into());
        }

        let total_in = new_chunks.len();
        let fresh = filter_new_chunks(kb.chunks(), new_chunks);
        let skipped = total_in - fresh.len();

        if fresh.is_empty() {
            tracing::info!(
                dir = %paths.dir.display(),
                skipped,
                version = kb.version(),
                "nothing new to add"
            );
            let version = kb.version();
            return Ok(IncrementalOutcome {
                kb,
                added: 0,
                skipped,
                version,
            });
        }

        let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_normalized(self.embedder.as_ref(), &texts).await?;

        let mut next_id = kb.chunks().iter().map(|c| c.id).max().map_or(0, |m| m + 1);
        let renumbered: Vec<Chunk> = fresh
            .into_iter()
            .map(|mut c| {
                c.id = next_id;
                next_id += 1;
                c
            })
            .collect();

        kb.index.add(&vectors)?;
        let added = renumbered.len();
        let mut chunks = std::mem::take(&mut kb.envelope.chunks);
        chunks.extend(renumbered);
        kb.envelope = Envelope::new(kb.envelope.version + 1, chunks);

        persist(paths, &kb)?;

        tracing::info!(
            dir = %paths.dir.display(),
            added,
            skipped,
            version = kb.version(),
            total_chunks = kb.envelope.total_chunks,
            "incremental add complete"
        );
        let version = kb.version();
        Ok(IncrementalOutcome {
            kb,
            added,
            skipped,
            version,
        })
    }

    /// Never fails. Read problems land in `error` with `exists = false`.
    pub fn status(paths: &ProjectPaths) -> KbStatus {
        if paths.is_partial() {
            return KbStatus {
                error: Some(paths.partial_error().to_string()),
                ..KbStatus::default()
            };
        }
        if !paths.exists() {
            return KbStatus::default();
        }
        let envelope = match read_envelope(&paths.meta) {
            Ok(env) => env,
            Err(e) => {
                return KbStatus {
                    error: Some(format!("{:#}", e)),
                    ..KbStatus::default()
                }
            }
        };
        let error = match read_index_count(&paths.index) {
            Ok(n) if n == envelope.chunks.len() => None,
            Ok(n) => Some(format!(
                "index holds {} vectors but metadata lists {} chunks",
                n,
                envelope.chunks.len()
            )),
            Err(e) => Some(format!("{:#}", e)),
        };
        KbStatus {
            exists: true,
            version: envelope.version,
            last_built_at: Some(envelope.last_updated.to_rfc3339()),
            total_chunks: envelope.total_chunks,
            error,
        }
    }

    /// Top-`k` chunks by cosine similarity. Index positions with no matching
    /// chunk are skipped.
    pub async fn query(&self, text: &str, kb: &LoadedKb, top_k: usize) -> Result<Vec<QueryHit>> {
        let q = embed_query(self.embedder.as_ref(), text).await?;
        let chunks = kb.chunks();
        Ok(kb
            .index
            .search(&q, top_k)
            .into_iter()
            .filter_map(|(pos, score)| {
                chunks.get(pos).map(|c| QueryHit {
                    id: c.id,
                    text: c.text.clone(),
                    meta: c.meta.clone(),
                    score,
                })
            })
            .collect())
    }
}

/// Keep chunks not already present by identity or text hash. Accepted chunks
/// join the lookup sets, so repeats inside `incoming` are dropped too.
fn filter_new_chunks(existing: &[Chunk], incoming: Vec<Chunk>) -> Vec<Chunk> {
    let mut identities: HashSet<String> =
        existing.iter().filter_map(|c| c.stable_identity()).collect();
    let mut hashes: HashSet<String> = existing.iter().map(|c| text_hash(&c.text)).collect();

    incoming
        .into_iter()
        .filter(|c| {
            let identity = c.stable_identity();
            let hash = text_hash(&c.text);
            if identity.as_ref().is_some_and(|i| identities.contains(i)) || hashes.contains(&hash)
            {
                return false;
            }
            if let Some(i) = identity {
                identities.insert(i);
            }
            hashes.insert(hash);
            true
        })
        .collect()
}

/// Stage both files, then rename index and metadata. A failure while staging
/// leaves the live pair untouched and removes the staged files.
fn persist(paths: &ProjectPaths, kb: &LoadedKb) -> Result<()> {
    let meta_bytes = serde_json::to_vec(&kb.envelope).context("serialize metadata envelope")?;
    let index_bytes = kb.index.to_bytes();

    let index_temp = stage_temp(&paths.index, &index_bytes)?;
    let meta_temp = match stage_temp(&paths.meta, &meta_bytes) {
        Ok(t) => t,
        Err(e) => {
            discard_temp(&index_temp);
            return Err(e);
        }
    };

    if let Err(e) = commit_temp(&index_temp, &paths.index) {
        discard_temp(&index_temp);
        discard_temp(&meta_temp);
        return Err(e);
    }
    if let Err(e) = commit_temp(&meta_temp, &paths.meta) {
        discard_temp(&meta_temp);
        return Err(e);
    }
    Ok(())
}

fn read_envelope(path: &Path) -> Result<Envelope> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read metadata file: {}", path.display()))?;
    let file: MetaFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("Invalid metadata file: {}", path.display()))?;
    let fallback: DateTime<Utc> = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(file.into_envelope(fallback))
}

fn read_index_count(path: &Path) -> Result<usize> {
    Ok(FlatIndex::load(path)?.ntotal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> VectorStore {
        VectorStore::new(Arc::new(HashProvider::new(64)))
    }

    fn chunk(id: i64, text: &str) -> Chunk {
        Chunk::new(id, text)
    }

    #[test]
    fn project_paths_layout() {
        let p = project_paths(Path::new("/kb"), "proj_1").unwrap();
        assert_eq!(p.index, PathBuf::from("/kb/proj_1/faiss_index.bin"));
        assert_eq!(p.meta, PathBuf::from("/kb/proj_1/faiss_meta.pkl"));
        assert!(project_paths(Path::new("/kb"), "../etc").is_err());
        assert!(project_paths(Path::new("/kb"), "").is_err());
    }

    #[tokio::test]
    async fn build_rejects_empty() {
        let err = store().build(vec![]).await.unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(KbError::BadInput(_))));
    }

    #[tokio::test]
    async fn build_then_status() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "p").unwrap();
        let s = store();
        let kb = s
            .build_project(&paths, vec![chunk(0, "Users must log in with email")])
            .await
            .unwrap();
        assert_eq!(kb.version(), 1);
        assert!(kb.is_consistent());

        let status = VectorStore::status(&paths);
        assert!(status.exists);
        assert_eq!(status.version, 1);
        assert_eq!(status.total_chunks, 1);
        assert!(status.error.is_none());
        assert!(status.last_built_at.is_some());
    }

    #[tokio::test]
    async fn identical_text_is_skipped_and_version_kept() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "p").unwrap();
        let s = store();
        s.build_project(&paths, vec![chunk(0, "Users must log in with email")])
            .await
            .unwrap();

        let out = s
            .incremental_add(&paths, vec![chunk(0, "Users must log in with email")])
            .await
            .unwrap();
        assert_eq!(out.added, 0);
        assert_eq!(out.skipped, 1);
        assert_eq!(out.version, 1);
        assert_eq!(VectorStore::status(&paths).version, 1);
    }

    #[tokio::test]
    async fn add_renumbers_and_bumps_version() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "p").unwrap();
        let s = store();
        s.build_project(&paths, vec![chunk(0, "alpha"), chunk(7, "beta")])
            .await
            .unwrap();

        let out = s
            .incremental_add(&paths, vec![chunk(0, "gamma"), chunk(1, "delta")])
            .await
            .unwrap();
        assert_eq!(out.added, 2);
        assert_eq!(out.version, 2);
        let ids: Vec<i64> = out.kb.chunks().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 7, 8, 9]);
        assert!(out.kb.is_consistent());

        let reloaded = VectorStore::load(&paths).unwrap();
        assert_eq!(reloaded.index.ntotal(), 4);
        assert_eq!(reloaded.version(), 2);
    }

    #[tokio::test]
    async fn stable_identity_dedups_changed_text() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "p").unwrap();
        let s = store();
        let mut first = chunk(0, "Original wording");
        first.meta.insert("requirement_id".into(), json!("REQ-1"));
        s.build_project(&paths, vec![first]).await.unwrap();

        let mut reworded = chunk(0, "Reworded requirement");
        reworded.meta.insert("requirement_id".into(), json!("REQ-1"));
        let out = s.incremental_add(&paths, vec![reworded]).await.unwrap();
        assert_eq!(out.added, 0);
        assert_eq!(out.skipped, 1);
    }

    #[tokio::test]
    async fn duplicates_within_batch_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "p").unwrap();
        let s = store();
        s.build_project(&paths, vec![chunk(0, "alpha")]).await.unwrap();
        let out = s
            .incremental_add(&paths, vec![chunk(0, "beta"), chunk(1, "beta")])
            .await
            .unwrap();
        assert_eq!(out.added, 1);
        assert_eq!(out.skipped, 1);
    }

    #[tokio::test]
    async fn add_without_kb_builds_version_one() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "fresh").unwrap();
        let out = store()
            .incremental_add(&paths, vec![chunk(0, "alpha")])
            .await
            .unwrap();
        assert_eq!(out.version, 1);
        assert_eq!(out.skipped, 0);
        assert!(paths.exists());
    }

    #[tokio::test]
    async fn legacy_metadata_is_read_and_upgraded() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "old").unwrap();
        let s = store();
        let kb = s.build(vec![chunk(0, "alpha")]).await.unwrap();
        kb.index.save(&paths.index).unwrap();
        let legacy = json!([{"id": 0, "text": "alpha", "meta": {}}]);
        std::fs::write(&paths.meta, serde_json::to_vec(&legacy).unwrap()).unwrap();

        let status = VectorStore::status(&paths);
        assert!(status.exists);
        assert_eq!(status.version, 1);

        let out = s.incremental_add(&paths, vec![chunk(0, "beta")]).await.unwrap();
        assert_eq!(out.version, 2);
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&paths.meta).unwrap()).unwrap();
        assert_eq!(raw["version"], 2);
        assert_eq!(raw["total_chunks"], 2);
    }

    #[test]
    fn load_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "none").unwrap();
        let err = VectorStore::load(&paths).unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(KbError::NotFound(_))));
        assert!(!VectorStore::status(&paths).exists);
    }

    #[test]
    fn status_reports_corrupt_metadata() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "bad").unwrap();
        std::fs::create_dir_all(&paths.dir).unwrap();
        FlatIndex::new(4).save(&paths.index).unwrap();
        std::fs::write(&paths.meta, b"not json").unwrap();
        let status = VectorStore::status(&paths);
        assert!(!status.exists);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn query_is_deterministic_and_skips_stale_positions() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "q").unwrap();
        let s = store();
        let mut kb = s
            .build_project(
                &paths,
                vec![
                    chunk(0, "passwords are hashed with argon2"),
                    chunk(1, "the dashboard shows revenue"),
                ],
            )
            .await
            .unwrap();

        let a = s.query("hashed passwords", &kb, 5).await.unwrap();
        let b = s.query("hashed passwords", &kb, 5).await.unwrap();
        let ids_a: Vec<i64> = a.iter().map(|h| h.id).collect();
        let ids_b: Vec<i64> = b.iter().map(|h| h.id).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a[0].id, 0);
        assert!(a[0].score >= a[1].score);

        kb.envelope.chunks.truncate(1);
        let hits = s.query("revenue dashboard", &kb, 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn failed_metadata_stage_leaves_pair_untouched() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "p").unwrap();
        let s = store();
        s.build_project(&paths, vec![chunk(0, "alpha")]).await.unwrap();
        let index_before = std::fs::read(&paths.index).unwrap();
        let meta_before = std::fs::read(&paths.meta).unwrap();

        // A directory squatting on the metadata temp name makes staging fail.
        std::fs::create_dir(paths.dir.join("faiss_meta.pkl.tmp")).unwrap();
        assert!(s.incremental_add(&paths, vec![chunk(0, "beta")]).await.is_err());

        assert_eq!(std::fs::read(&paths.index).unwrap(), index_before);
        assert_eq!(std::fs::read(&paths.meta).unwrap(), meta_before);
        assert!(!paths.dir.join("faiss_index.bin.tmp").exists());
        let status = VectorStore::status(&paths);
        assert!(status.error.is_none(), "{:?}", status.error);
        assert_eq!(status.total_chunks, 1);
        assert_eq!(status.version, 1);
    }

    #[tokio::test]
    async fn lone_file_is_reported_and_not_rebuilt() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "p").unwrap();
        let s = store();
        s.build_project(&paths, vec![chunk(0, "alpha")]).await.unwrap();
        std::fs::remove_file(&paths.index).unwrap();
        assert!(paths.is_partial());

        let status = VectorStore::status(&paths);
        assert!(!status.exists);
        assert!(status.error.as_deref().unwrap().contains("no faiss_index.bin"));

        let err = s.incremental_add(&paths, vec![chunk(0, "beta")]).await.unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(KbError::Inconsistent(_))));
        assert!(!paths.index.exists());

        let err = VectorStore::load(&paths).unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(KbError::NotFound(_))));
    }

    #[tokio::test]
    async fn padded_id_resolves_to_same_lock_key() {
        let tmp = TempDir::new().unwrap();
        let plain = project_paths(tmp.path(), "p").unwrap();
        let padded = project_paths(tmp.path(), "  p ").unwrap();
        assert_eq!(plain.lock_key(), padded.lock_key());

        let s = store();
        s.build_project(&plain, vec![chunk(0, "alpha")]).await.unwrap();
        s.incremental_add(&padded, vec![chunk(0, "beta")]).await.unwrap();
        assert_eq!(s.locks.len(), 1);
        assert_eq!(VectorStore::status(&plain).total_chunks, 2);
    }

    #[tokio::test]
    async fn failed_embedding_leaves_files_untouched() {
        let tmp = TempDir::new().unwrap();
        let paths = project_paths(tmp.path(), "p").unwrap();
        store()
            .build_project(&paths, vec![chunk(0, "alpha")])
            .await
            .unwrap();
        let before = std::fs::read(&paths.meta).unwrap();

        let disabled = VectorStore::new(Arc::new(crate::embedding::DisabledProvider));
        assert!(disabled
            .incremental_add(&paths, vec![chunk(0, "beta")])
            .await
            .is_err());
        assert_eq!(std::fs::read(&paths.meta).unwrap(), before);
    }
}
