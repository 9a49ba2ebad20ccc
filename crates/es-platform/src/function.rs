//! Per-function platform settings.

use es_types::{GpuKind, PlatformError, SweepResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::mounts::Mount;

/// How a remote function is scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,

    /// GPU attached to each container (`None` = CPU only).
    pub gpu: Option<GpuKind>,

    /// Hard ceiling on one call's run time.
    pub timeout_secs: u64,

    /// Commit attached volumes periodically while the call runs, not only at
    /// the end.
    pub allow_background_volume_commits: bool,

    /// Maximum number of concurrent calls (`None` = unbounded).
    pub concurrency_limit: Option<usize>,

    pub mounts: Vec<Mount>,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gpu: None,
            timeout_secs: 300,
            allow_background_volume_commits: false,
            concurrency_limit: None,
            mounts: Vec::new(),
        }
    }

    pub fn with_gpu(mut self, gpu: GpuKind) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_background_commits(mut self, enabled: bool) -> Self {
        self.allow_background_volume_commits = enabled;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> SweepResult<()> {
        let invalid = |message: &str| PlatformError::InvalidFunction {
            function: self.name.clone(),
            message: message.to_string(),
        };

        if self.timeout_secs == 0 {
            return Err(invalid("timeout must be positive").into());
        }
        if self.concurrency_limit == Some(0) {
            return Err(invalid("concurrency limit must be at least 1").into());
        }
        let mut seen = HashSet::new();
        for mount in &self.mounts {
            if !mount.container_path.is_absolute() {
                return Err(invalid("mount paths must be absolute").into());
            }
            if !seen.insert(&mount.container_path) {
                return Err(invalid("two mounts share a container path").into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounts::{MountKind, Volume};
    use std::path::PathBuf;

    fn mount(path: &str) -> Mount {
        Mount {
            name: "m".into(),
            kind: MountKind::NetworkFileSystem,
            container_path: PathBuf::from(path),
            host_path: PathBuf::from("/tmp/m"),
        }
    }

    #[test]
    fn builder_sets_worker_settings() {
        let dir = tempfile::tempdir().unwrap();
        let volume = Volume::named(dir.path(), "v".into()).unwrap();
        let spec = FunctionSpec::new("run_worker")
            .with_gpu(GpuKind::A10g)
            .with_timeout_secs(15000)
            .with_background_commits(true)
            .with_concurrency_limit(4)
            .with_mount(mount("/root/cache"))
            .with_mount(volume.mount_at("/vol"));

        spec.validate().unwrap();
        assert_eq!(spec.gpu, Some(GpuKind::A10g));
        assert_eq!(spec.timeout(), Duration::from_secs(15000));
        assert_eq!(spec.concurrency_limit, Some(4));
        assert_eq!(spec.mounts.len(), 2);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let spec = FunctionSpec::new("f").with_concurrency_limit(0);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let spec = FunctionSpec::new("f").with_timeout_secs(0);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn duplicate_mount_paths_rejected() {
        let spec = FunctionSpec::new("f")
            .with_mount(mount("/root/cache"))
            .with_mount(mount("/root/cache"));
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("share a container path"));
    }

    #[test]
    fn relative_mount_rejected() {
        let spec = FunctionSpec::new("f").with_mount(mount("cache"));
        assert!(spec.validate().is_err());
    }
}
