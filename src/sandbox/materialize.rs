//! Writes a request's code directory on the host.
//!
//! Layout: `main.py`, `params.json` and the emitter helper. The directory
//! is mounted read-only into the instance and removed when the returned
//! [`CodeDir`] is dropped.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use super::isolation::{ENTRYPOINT, PARAMS_FILE};
use super::request::ExecutionRequest;
use crate::protocol::{EMITTER_FILENAME, EMITTER_SOURCE};

pub struct CodeDir {
    dir: TempDir,
}

impl CodeDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

pub fn materialize(work_dir: &Path, request: &ExecutionRequest) -> Result<CodeDir> {
    fs::create_dir_all(work_dir)
        .with_context(|| format!("Failed to create work dir {}", work_dir.display()))?;

    let dir = tempfile::Builder::new()
        .prefix(&format!("req-{}-", request.id()))
        .tempdir_in(work_dir)
        .context("Failed to create code directory")?;

    let params = serde_json::to_string_pretty(request.parameters())?;
    for (name, contents) in [
        (ENTRYPOINT, request.code()),
        (PARAMS_FILE, params.as_str()),
        (EMITTER_FILENAME, EMITTER_SOURCE),
    ] {
        let path = dir.path().join(name);
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        set_mode(&path, 0o644)?;
    }

    // The instance user is unprivileged and must be able to traverse it.
    set_mode(dir.path(), 0o755)?;

    Ok(CodeDir { dir })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
