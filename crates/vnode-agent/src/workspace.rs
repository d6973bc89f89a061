use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
};

use crate::command;
use crate::error::{EnvError, EnvResult};

const WORKSPACE_DIR: &str = "blockchain";
const STAGING_PREFIX: &str = ".blockchain.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneOutcome {
    Created,
    AlreadyPresent,
}

pub fn workspace_dir(base_path: &Path) -> PathBuf {
    base_path.join(WORKSPACE_DIR)
}

/// Materializes `template` as the environment workspace under `base_path`.
///
/// Idempotent: an existing workspace is left untouched. Each call copies into
/// its own staging directory and renames the finished tree into place, so an
/// interrupted or concurrent copy never looks like a finished workspace.
pub async fn clone_template(base_path: &Path, template: &Path) -> EnvResult<CloneOutcome> {
    let dest = workspace_dir(base_path);
    if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        return Ok(CloneOutcome::AlreadyPresent);
    }

    match tokio::fs::metadata(template).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return Err(EnvError::TemplateMissing(template.to_path_buf())),
    }

    let copy_failure = |detail: String| EnvError::CopyFailure {
        dest: dest.clone(),
        detail,
    };

    tokio::fs::create_dir_all(base_path)
        .await
        .map_err(|e| copy_failure(format!("create {}: {e}", base_path.display())))?;

    // Removed on drop, including whatever a failed copy left behind.
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(base_path)
        .map_err(|e| copy_failure(format!("create staging dir: {e}")))?;
    let staged = staging.path().join(WORKSPACE_DIR);

    let args = [OsStr::new("-a"), template.as_os_str(), staged.as_os_str()];
    let out = command::run("cp", args)
        .await
        .map_err(|e| copy_failure(format!("run cp: {e}")))?;
    if !out.success() {
        return Err(copy_failure(format!("cp {}", out.describe())));
    }

    if let Err(e) = tokio::fs::rename(&staged, &dest).await {
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            // Another clone finished first; its tree wins.
            return Ok(CloneOutcome::AlreadyPresent);
        }
        return Err(copy_failure(format!("move workspace into place: {e}")));
    }

    Ok(CloneOutcome::Created)
}

async fn check_ldd_missing(path: &Path) -> Vec<String> {
    // ldd absent, or the file is not a dynamic executable: nothing to check.
    let Ok(out) = command::run("ldd", [path.as_os_str()]).await else {
        return Vec::new();
    };
    // Output format varies; any "not found" line is an unresolved library.
    out.stdout
        .lines()
        .filter(|l| l.contains("not found"))
        .map(|l| l.trim().to_string())
        .collect()
}

/// Confirms the node executable is present and runnable.
pub async fn validate_binary(workspace: &Path, binary: &Path) -> EnvResult<PathBuf> {
    let path = workspace.join(binary);
    let meta = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => m,
        _ => return Err(EnvError::BinaryMissing(path)),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = meta.permissions();
        if perms.mode() & 0o111 != 0o111 {
            perms.set_mode(perms.mode() | 0o755);
            tokio::fs::set_permissions(&path, perms).await?;
            tracing::debug!(path = %path.display(), "set execute bits on node binary");
        }
    }
    #[cfg(not(unix))]
    let _ = meta;

    let missing = check_ldd_missing(&path).await;
    if !missing.is_empty() {
        return Err(EnvError::LinkageError { path, missing });
    }
    Ok(path)
}

fn dir_size_blocking(path: &Path) -> io::Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.path().symlink_metadata()?;
        if meta.is_dir() {
            total = total.saturating_add(dir_size_blocking(&entry.path())?);
        } else {
            total = total.saturating_add(meta.len());
        }
    }
    Ok(total)
}

/// Apparent size of a directory tree in bytes; symlinks are not followed.
pub async fn dir_size(path: &Path) -> io::Result<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || dir_size_blocking(&path))
        .await
        .map_err(io::Error::other)?
}
