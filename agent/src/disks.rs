//! Per-VM copy-on-write overlay disks.
//!
//! Overlays live at `<cache>/disks/<vm_id>.qcow2` and reference a cached
//! base image as their backing file.

use std::future::Future;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::AgentError;

/// Overlay disk operations, abstracted so the engine can be exercised
/// without a qemu toolchain on the test host.
pub trait OverlayStore: Send + Sync + 'static {
    /// Create a qcow2 overlay for `vm_id` backed by `base`, sized to
    /// `size_gib`. Idempotent when an identical overlay already exists;
    /// any other pre-existing file is a conflict.
    fn create_overlay(
        &self,
        vm_id: &str,
        base: &Path,
        size_gib: u32,
    ) -> impl Future<Output = Result<PathBuf, AgentError>> + Send;

    /// Remove the overlay. A missing file is not an error.
    fn delete_overlay(&self, vm_id: &str) -> impl Future<Output = Result<(), AgentError>> + Send;

    fn overlay_path(&self, vm_id: &str) -> PathBuf;
}

/// Production overlay store shelling out to `qemu-img`.
pub struct QemuImgProvisioner {
    disks_dir: PathBuf,
}

impl QemuImgProvisioner {
    pub fn new(image_cache: impl AsRef<Path>) -> Self {
        Self {
            disks_dir: image_cache.as_ref().join("disks"),
        }
    }

    /// `qemu-img info` on an existing file, for the idempotency check.
    async fn overlay_matches(
        &self,
        path: &Path,
        base: &Path,
        size_gib: u32,
    ) -> Result<bool, AgentError> {
        let output = tokio::process::Command::new("qemu-img")
            .args(["info", "--output=json"])
            .arg(path)
            .output()
            .await
            .map_err(|e| AgentError::Storage(format!("qemu-img info: {e}")))?;
        if !output.status.success() {
            return Ok(false);
        }
        let info: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| AgentError::Storage(format!("qemu-img info output: {e}")))?;

        let backing = info
            .get("backing-filename")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let virtual_size = info
            .get("virtual-size")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        Ok(backing == base.to_string_lossy() && virtual_size == u64::from(size_gib) << 30)
    }
}

impl OverlayStore for QemuImgProvisioner {
    async fn create_overlay(
        &self,
        vm_id: &str,
        base: &Path,
        size_gib: u32,
    ) -> Result<PathBuf, AgentError> {
        let path = self.overlay_path(vm_id);
        tokio::fs::create_dir_all(&self.disks_dir).await?;

        if tokio::fs::try_exists(&path).await? {
            if self.overlay_matches(&path, base, size_gib).await? {
                info!(vm_id, path = %path.display(), "overlay already present");
                return Ok(path);
            }
            return Err(AgentError::Conflict(format!(
                "overlay {} already exists with different parameters",
                path.display()
            )));
        }

        let output = tokio::process::Command::new("qemu-img")
            .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
            .arg(base)
            .arg(&path)
            .arg(format!("{size_gib}G"))
            .output()
            .await
            .map_err(|e| AgentError::Storage(format!("qemu-img create: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Storage(format!(
                "qemu-img create {}: {}",
                path.display(),
                stderr.trim()
            )));
        }

        info!(
            vm_id,
            path = %path.display(),
            base = %base.display(),
            size_gib,
            "overlay created"
        );
        Ok(path)
    }

    async fn delete_overlay(&self, vm_id: &str) -> Result<(), AgentError> {
        let path = self.overlay_path(vm_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(vm_id, path = %path.display(), "overlay removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(vm_id, path = %path.display(), error = %e, "overlay removal failed");
                Err(e.into())
            }
        }
    }

    fn overlay_path(&self, vm_id: &str) -> PathBuf {
        self.disks_dir.join(format!("{vm_id}.qcow2"))
    }
}
