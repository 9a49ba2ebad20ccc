//! Network file systems, volumes, and the per-call mount table.

use chrono::{DateTime, Utc};
use es_types::{PlatformError, SweepResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountKind {
    NetworkFileSystem,
    Volume,
}

/// A host directory exposed to a function at a container path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub kind: MountKind,
    pub container_path: PathBuf,
    pub host_path: PathBuf,
}

impl Mount {
    /// Flush a volume so its contents survive the call. No-op for file systems,
    /// which are shared live.
    pub fn commit(&self) -> SweepResult<()> {
        if self.kind != MountKind::Volume {
            return Ok(());
        }
        let commit_err = |e: std::io::Error| PlatformError::VolumeCommit {
            volume: self.name.clone(),
            message: e.to_string(),
        };
        fs::File::open(&self.host_path)
            .and_then(|dir| dir.sync_all())
            .map_err(commit_err)?;
        debug!("Committed volume {}", self.name);
        Ok(())
    }
}

/// Shared file system visible to every function it is mounted into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFileSystem {
    name: String,
    host_root: PathBuf,
}

impl NetworkFileSystem {
    /// A file system that belongs to one run.
    pub fn ephemeral<P: AsRef<Path>>(data_root: P, run_id: &str) -> SweepResult<Self> {
        let name = format!("nfs-{run_id}");
        let host_root = data_root.as_ref().join("nfs").join(&name);
        fs::create_dir_all(&host_root)?;
        Ok(Self { name, host_root })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    pub fn mount_at<P: Into<PathBuf>>(&self, container_path: P) -> Mount {
        Mount {
            name: self.name.clone(),
            kind: MountKind::NetworkFileSystem,
            container_path: container_path.into(),
            host_path: self.host_root.clone(),
        }
    }
}

/// Durable volume for artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    name: String,
    host_root: PathBuf,
}

impl Volume {
    /// A persisted volume named `<prefix>-<unix timestamp>`.
    pub fn persisted<P: AsRef<Path>>(data_root: P, prefix: &str, created_at: DateTime<Utc>) -> SweepResult<Self> {
        Self::named(data_root, format!("{prefix}-{}", created_at.timestamp()))
    }

    pub fn named<P: AsRef<Path>>(data_root: P, name: String) -> SweepResult<Self> {
        let host_root = data_root.as_ref().join("volumes").join(&name);
        fs::create_dir_all(&host_root)?;
        Ok(Self { name, host_root })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    pub fn mount_at<P: Into<PathBuf>>(&self, container_path: P) -> Mount {
        Mount {
            name: self.name.clone(),
            kind: MountKind::Volume,
            container_path: container_path.into(),
            host_path: self.host_root.clone(),
        }
    }
}

/// Resolves container paths to host paths for one function call.
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
    commits: AtomicUsize,
}

impl MountTable {
    pub fn new(mounts: Vec<Mount>) -> Self {
        Self {
            mounts,
            commits: AtomicUsize::new(0),
        }
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn has_volumes(&self) -> bool {
        self.mounts.iter().any(|m| m.kind == MountKind::Volume)
    }

    /// Map `container_path` onto the host, using the most specific mount.
    pub fn resolve<P: AsRef<Path>>(&self, container_path: P) -> SweepResult<PathBuf> {
        let path = container_path.as_ref();
        let mount = self
            .mounts
            .iter()
            .filter(|m| path.starts_with(&m.container_path))
            .max_by_key(|m| m.container_path.components().count())
            .ok_or_else(|| PlatformError::MountNotFound {
                path: path.display().to_string(),
            })?;

        let relative = path
            .strip_prefix(&mount.container_path)
            .map_err(|e| es_types::internal_error!("{e}"))?;
        Ok(mount.host_path.join(relative))
    }

    pub fn commit_volumes(&self) -> SweepResult<()> {
        for mount in &self.mounts {
            mount.commit()?;
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Successful [`MountTable::commit_volumes`] calls so far.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }
}
