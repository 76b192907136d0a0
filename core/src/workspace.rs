//! Per-user workspace management and the sandboxed filesystem backend.
//!
//! Every path handed to [`SandboxedFs`] is resolved (tilde expansion,
//! `..` components, symlinks) and the result must land inside the user's
//! workspace root; anything else fails with
//! [`WorkspaceErr::PathEscape`]. Writes are additionally checked against
//! the workspace quota before any bytes hit the disk.

// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::error::WorkspaceErr;

#[derive(Debug, Clone, Copy)]
pub struct WorkspaceQuota {
    pub max_size_bytes: u64,
    pub max_files: u64,
    pub max_file_size_bytes: u64,
}

impl Default for WorkspaceQuota {
    fn default() -> Self {
        Self {
            max_size_bytes: 1024 * 1024 * 1024,
            max_files: 10_000,
            max_file_size_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub user_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub file_count: u64,
    pub created: bool,
}

/// Replace path separators, `..`, and anything outside
/// `[A-Za-z0-9_-]` with `_`. Empty results map to `anonymous`.
pub fn sanitize_user_id(user_id: &str) -> String {
    let replaced = user_id.replace(['/', '\\'], "_").replace("..", "_");
    let safe: String = replaced
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "anonymous".to_string()
    } else {
        safe
    }
}

/// Manages user workspaces with isolation and quotas.
pub struct WorkspaceManager {
    base_path: PathBuf,
    default_quota: WorkspaceQuota,
    user_quotas: Mutex<HashMap<String, WorkspaceQuota>>,
}

impl WorkspaceManager {
    pub fn new(base_path: impl Into<PathBuf>, default_quota: Option<WorkspaceQuota>) -> Self {
        Self {
            base_path: base_path.into(),
            default_quota: default_quota.unwrap_or_default(),
            user_quotas: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace_path(&self, user_id: &str) -> PathBuf {
        self.base_path.join(sanitize_user_id(user_id))
    }

    /// Idempotent: returns info for an existing workspace, creates it
    /// otherwise.
    pub fn create_workspace(&self, user_id: &str) -> Result<WorkspaceInfo> {
        let path = self.workspace_path(user_id);
        if path.exists() {
            return self.workspace_info(user_id);
        }
        std::fs::create_dir_all(&path)?;
        info!("created workspace for user {user_id}: {}", path.display());
        Ok(WorkspaceInfo {
            user_id: user_id.to_string(),
            path,
            size_bytes: 0,
            file_count: 0,
            created: true,
        })
    }

    /// Size and file count are computed on demand by walking the tree.
    pub fn workspace_info(&self, user_id: &str) -> Result<WorkspaceInfo> {
        let path = self.workspace_path(user_id);
        if !path.exists() {
            return Ok(WorkspaceInfo {
                user_id: user_id.to_string(),
                path,
                size_bytes: 0,
                file_count: 0,
                created: false,
            });
        }
        let (size_bytes, file_count) = walk_usage(&path);
        Ok(WorkspaceInfo {
            user_id: user_id.to_string(),
            path,
            size_bytes,
            file_count,
            created: true,
        })
    }

    pub fn delete_workspace(&self, user_id: &str) -> Result<bool> {
        let path = self.workspace_path(user_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&path)?;
        info!("deleted workspace for user {user_id}");
        Ok(true)
    }

    pub fn set_quota(&self, user_id: &str, quota: WorkspaceQuota) {
        self.user_quotas
            .lock()
            .unwrap()
            .insert(user_id.to_string(), quota);
    }

    pub fn quota(&self, user_id: &str) -> WorkspaceQuota {
        self.user_quotas
            .lock()
            .unwrap()
            .get(user_id)
            .copied()
            .unwrap_or(self.default_quota)
    }

    /// Checks a prospective write of `payload_len` bytes against the
    /// user's quota without touching the disk.
    pub fn check_quota(&self, user_id: &str, payload_len: u64) -> Result<()> {
        let quota = self.quota(user_id);
        if payload_len > quota.max_file_size_bytes {
            return Err(WorkspaceErr::QuotaExceeded {
                user: user_id.to_string(),
                detail: format!(
                    "file size {payload_len} > max file size {}",
                    quota.max_file_size_bytes
                ),
            }
            .into());
        }
        let info = self.workspace_info(user_id)?;
        if info.size_bytes + payload_len > quota.max_size_bytes {
            return Err(WorkspaceErr::QuotaExceeded {
                user: user_id.to_string(),
                detail: format!(
                    "size {} + {payload_len} > max {}",
                    info.size_bytes, quota.max_size_bytes
                ),
            }
            .into());
        }
        if info.file_count >= quota.max_files {
            return Err(WorkspaceErr::QuotaExceeded {
                user: user_id.to_string(),
                detail: format!("file count {} >= max {}", info.file_count, quota.max_files),
            }
            .into());
        }
        Ok(())
    }

    /// Resolve `path` inside the user's workspace, failing with
    /// [`WorkspaceErr::PathEscape`] when the normalized, symlink-resolved
    /// target is not a descendant of the root.
    pub fn resolve_path(&self, user_id: &str, path: impl AsRef<Path>) -> Result<PathBuf> {
        let root = self.workspace_path(user_id);
        let canonical_root = root
            .canonicalize()
            .map_err(|_| WorkspaceErr::PathEscape(path.as_ref().display().to_string()))?;
        resolve_within(&canonical_root, path.as_ref())
            .ok_or_else(|| WorkspaceErr::PathEscape(path.as_ref().display().to_string()).into())
    }

    pub fn validate_path(&self, user_id: &str, path: impl AsRef<Path>) -> bool {
        self.resolve_path(user_id, path).is_ok()
    }

    /// Remove workspaces whose mtime is older than `max_age_days`.
    /// Returns the number of workspaces removed.
    pub fn cleanup_old_workspaces(&self, max_age_days: u64) -> Result<u64> {
        if !self.base_path.exists() {
            return Ok(0);
        }
        let max_age = std::time::Duration::from_secs(max_age_days * 24 * 60 * 60);
        let now = SystemTime::now();
        let mut cleaned = 0;
        for entry in std::fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .is_some_and(|age| age > max_age);
            if stale {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {
                        cleaned += 1;
                        info!("cleaned up old workspace: {}", path.display());
                    }
                    Err(e) => warn!("failed to clean workspace {}: {e}", path.display()),
                }
            }
        }
        Ok(cleaned)
    }
}

/// Expand `~`, apply `..`, follow symlinks, then require the result to be
/// a descendant of `canonical_root`. Non-existent suffixes are resolved
/// lexically below the deepest existing (canonicalized) ancestor so a
/// symlinked parent cannot smuggle a write outside the root.
fn resolve_within(canonical_root: &Path, input: &Path) -> Option<PathBuf> {
    let expanded = expand_tilde(input);
    let candidate = if expanded.is_absolute() {
        expanded
    } else {
        canonical_root.join(expanded)
    };

    // Find the deepest existing ancestor and canonicalize it.
    let mut existing = candidate.clone();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(resolved) => {
                let mut result = resolved;
                for component in remainder.iter().rev() {
                    if component == ".." {
                        if !result.pop() {
                            return None;
                        }
                    } else if component != "." {
                        result.push(component);
                    }
                }
                if result.starts_with(canonical_root) {
                    return Some(result);
                }
                return None;
            }
            Err(_) => {
                let name = existing.file_name()?.to_os_string();
                remainder.push(name);
                existing = existing.parent()?.to_path_buf();
            }
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

fn walk_usage(path: &Path) -> (u64, u64) {
    let mut size_bytes = 0;
    let mut file_count = 0;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                size_bytes += meta.len();
                file_count += 1;
            }
        }
    }
    (size_bytes, file_count)
}

/// Filesystem backend that restricts every operation to one user's
/// workspace.
pub struct SandboxedFs {
    manager: Arc<WorkspaceManager>,
    user_id: String,
    check_quota: bool,
}

impl SandboxedFs {
    /// Creating the backend also creates the workspace if needed.
    pub fn new(manager: Arc<WorkspaceManager>, user_id: &str, check_quota: bool) -> Result<Self> {
        manager.create_workspace(user_id)?;
        Ok(Self {
            manager,
            user_id: user_id.to_string(),
            check_quota,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn workspace_path(&self) -> PathBuf {
        self.manager.workspace_path(&self.user_id)
    }

    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.manager.resolve_path(&self.user_id, path)
    }

    fn check_write(&self, payload_len: u64) -> Result<()> {
        if !self.check_quota {
            return Ok(());
        }
        self.manager.check_quota(&self.user_id, payload_len)
    }

    pub fn read_file(&self, path: impl AsRef<Path>) -> Result<String> {
        let resolved = self.resolve(path)?;
        Ok(std::fs::read_to_string(resolved)?)
    }

    pub fn read_file_bytes(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let resolved = self.resolve(path)?;
        Ok(std::fs::read(resolved)?)
    }

    pub fn write_file(&self, path: impl AsRef<Path>, content: &str) -> Result<PathBuf> {
        self.write_file_bytes(path, content.as_bytes())
    }

    pub fn write_file_bytes(&self, path: impl AsRef<Path>, content: &[u8]) -> Result<PathBuf> {
        let resolved = self.resolve(&path)?;
        self.check_write(content.len() as u64)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&resolved, content)?;
        debug!("wrote file: {}", resolved.display());
        Ok(resolved)
    }

    /// Returns whether a file was deleted. Directories are rejected.
    pub fn delete_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        let resolved = self.resolve(&path)?;
        if !resolved.exists() {
            return Ok(false);
        }
        if resolved.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::IsADirectory,
                format!("cannot delete directory with delete_file: {}", resolved.display()),
            )
            .into());
        }
        std::fs::remove_file(&resolved)?;
        debug!("deleted file: {}", resolved.display());
        Ok(true)
    }

    /// Escaping paths answer `false` instead of erroring.
    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn is_file(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).map(|p| p.is_dir()).unwrap_or(false)
    }

    pub fn list_dir(&self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let resolved = self.resolve(path)?;
        if !resolved.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("not a directory: {}", resolved.display()),
            )
            .into());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(resolved)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    pub fn mkdir(&self, path: impl AsRef<Path>, parents: bool) -> Result<PathBuf> {
        let resolved = self.resolve(path)?;
        if parents {
            std::fs::create_dir_all(&resolved)?;
        } else if !resolved.exists() {
            std::fs::create_dir(&resolved)?;
        }
        Ok(resolved)
    }

    pub fn rmdir(&self, path: impl AsRef<Path>, recursive: bool) -> Result<bool> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Ok(false);
        }
        if !resolved.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("not a directory: {}", resolved.display()),
            )
            .into());
        }
        if recursive {
            std::fs::remove_dir_all(&resolved)?;
        } else {
            std::fs::remove_dir(&resolved)?;
        }
        Ok(true)
    }

    /// Path relative to the workspace root, for display.
    pub fn get_relative_path(&self, absolute: &Path) -> Result<String> {
        let root = self
            .workspace_path()
            .canonicalize()
            .unwrap_or_else(|_| self.workspace_path());
        absolute
            .strip_prefix(&root)
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|_| WorkspaceErr::PathEscape(absolute.display().to_string()).into())
    }
}
