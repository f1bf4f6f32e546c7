//! Flat inner-product vector index and its binary file format.
//!
//! Vectors are stored unit-normalized, so the inner product used for search
//! is cosine similarity. The index is append-only: there is no removal API.
//!
//! File format (little-endian):
//!
//! ```text
//! Magic:     "RQVX" (4 bytes)
//! Version:   u16
//! Dimension: u32
//! Count:     u64
//! Vectors:   Count × Dimension × f32
//! ```
//!
//! [`write_atomic`] writes one file through a fsynced sibling temp file and a
//! rename. Callers that replace several files together use [`stage_temp`] for
//! each one first and [`commit_temp`] only once every stage succeeded.

use std::cmp::Ordering;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::embedding::{blob_to_vec, dot, l2_normalize, vec_to_blob};
use crate::error::KbError;

pub const INDEX_MAGIC: [u8; 4] = *b"RQVX";
pub const INDEX_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 8;

/// Exact nearest-neighbor index over unit vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored vectors.
    pub fn ntotal(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn vector(&self, pos: usize) -> Option<&[f32]> {
        let start = pos.checked_mul(self.dim)?;
        self.data.get(start..start + self.dim)
    }

    /// Append vectors, renormalizing each. Fails without modifying the index
    /// if any vector has the wrong dimensionality.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dim) {
            return Err(KbError::BadInput(format!(
                "vector dimension {} does not match index dimension {}",
                bad.len(),
                self.dim
            ))
            .into());
        }
        self.data.reserve(vectors.len() * self.dim);
        for v in vectors {
            let mut v = v.clone();
            l2_normalize(&mut v);
            self.data.extend_from_slice(&v);
        }
        Ok(())
    }

    /// Top-`k` positions by descending inner product. Ties go to the lower
    /// position so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if self.dim == 0 || query.len() != self.dim || k == 0 {
            return Vec::new();
        }
        let mut query = query.to_vec();
        l2_normalize(&mut query);

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(pos, v)| (pos, dot(&query, v)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(&INDEX_MAGIC);
        bytes.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dim as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.ntotal() as u64).to_le_bytes());
        bytes.extend_from_slice(&vec_to_blob(&self.data));
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            bail!("index file truncated: {} bytes", bytes.len());
        }
        if bytes[0..4] != INDEX_MAGIC {
            bail!("not an index file (bad magic)");
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != INDEX_VERSION {
            bail!("unsupported index version {}", version);
        }
        let dim = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        if dim == 0 {
            bail!("index dimension is zero");
        }
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[10..18]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        let expected = count
            .checked_mul(dim)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| anyhow::anyhow!("index header overflows"))?;
        let body = &bytes[HEADER_LEN..];
        if body.len() != expected {
            bail!(
                "index body is {} bytes, header promises {} ({} × {})",
                body.len(),
                expected,
                count,
                dim
            );
        }

        Ok(Self {
            dim,
            data: blob_to_vec(body),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read index file: {}", path.display()))?;
        Self::from_bytes(&bytes).with_context(|| format!("Invalid index file: {}", path.display()))
    }
}

/// Replace `path` with `bytes` via temp file, fsync, and rename. Readers see
/// either the old file or the new one, never a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp = stage_temp(path, bytes)?;
    commit_temp(&temp, path)
}

/// Write `bytes` to `{path}.tmp` and fsync it. The destination is untouched;
/// a failed stage removes whatever it managed to create.
pub fn stage_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let parent = parent_dir(path);
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let temp_path = temp_path_for(path);
    let mut file = File::create(&temp_path)
        .with_context(|| format!("create temp file {}", temp_path.display()))?;
    let written = file
        .write_all(bytes)
        .with_context(|| format!("write temp file {}", temp_path.display()))
        .and_then(|_| file.sync_all().context("fsync temp file"));
    drop(file);
    if let Err(e) = written {
        discard_temp(&temp_path);
        return Err(e);
    }
    Ok(temp_path)
}

/// Rename a staged temp file over `path` and fsync the directory.
pub fn commit_temp(temp: &Path, path: &Path) -> Result<()> {
    std::fs::rename(temp, path)
        .with_context(|| format!("rename temp file to {}", path.display()))?;
    sync_dir(parent_dir(path))
}

/// Best-effort removal of a staged file that will not be committed.
pub fn discard_temp(temp: &Path) {
    if let Err(e) = std::fs::remove_file(temp) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %temp.display(), error = %e, "could not remove temp file");
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}
