//! XDG Base Directory compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. Application env var (SIGNAL_SANDBOX_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::cleanup::CLEANUP_LOG_FILENAME;
use crate::concurrency::sweep_lock::SWEEP_LOCK_FILENAME;

const APP_DIR: &str = "signal-sandbox";

/// Resolved directory paths for the whole application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// State directory: cleanup log, reaper lock
    pub state_dir: PathBuf,

    /// Cache directory: per-request code directories
    pub cache_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "SIGNAL_SANDBOX_CONFIG_DIR", || {
            strategy.config_dir().join(APP_DIR)
        });

        let state_dir = env_or(&env_fn, "SIGNAL_SANDBOX_STATE_DIR", || {
            // state_dir() is None on platforms without XDG_STATE_HOME
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join(APP_DIR)
        });

        let cache_dir = env_or(&env_fn, "SIGNAL_SANDBOX_CACHE_DIR", || {
            strategy.cache_dir().join(APP_DIR)
        });

        Ok(Self {
            config_dir,
            state_dir,
            cache_dir,
        })
    }

    /// All three directories under one root (tests, ad-hoc runs).
    pub fn under(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            state_dir: root.join("state"),
            cache_dir: root.join("cache"),
        }
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Cleanup log: state_dir/cleanup.jsonl
    pub fn cleanup_log(&self) -> PathBuf {
        self.state_dir.join(CLEANUP_LOG_FILENAME)
    }

    /// Reaper lock: state_dir/reaper.lock
    pub fn sweep_lock(&self) -> PathBuf {
        self.state_dir.join(SWEEP_LOCK_FILENAME)
    }

    /// Parent of per-request code directories: cache_dir/work
    pub fn work_dir(&self) -> PathBuf {
        self.cache_dir.join("work")
    }

    /// Create all directories with mode 0700.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.state_dir, &self.cache_dir] {
            create_dir_with_mode(dir)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join(APP_DIR),
                state_dir: home.join(".local").join("state").join(APP_DIR),
                cache_dir: home.join(".cache").join(APP_DIR),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .map(|v| shellexpand::tilde(v.trim()).into_owned())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

/// Create a directory with mode 0700 per XDG spec.
fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_are_xdg_compliant() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();
        assert!(paths.config_dir.ends_with(APP_DIR), "{:?}", paths.config_dir);
        assert!(paths.state_dir.ends_with(APP_DIR), "{:?}", paths.state_dir);
        assert!(paths.cache_dir.ends_with(APP_DIR), "{:?}", paths.cache_dir);
    }

    #[test]
    fn env_vars_override_xdg() {
        let env = HashMap::from([
            ("SIGNAL_SANDBOX_CONFIG_DIR", "/custom/config"),
            ("SIGNAL_SANDBOX_STATE_DIR", "/custom/state"),
            ("SIGNAL_SANDBOX_CACHE_DIR", "/custom/cache"),
        ]);
        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
        assert_eq!(paths.cache_dir, PathBuf::from("/custom/cache"));
    }

    #[test]
    fn relative_and_empty_overrides_are_ignored() {
        let env = HashMap::from([
            ("SIGNAL_SANDBOX_CONFIG_DIR", "relative/path"),
            ("SIGNAL_SANDBOX_STATE_DIR", ""),
        ]);
        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.ends_with(APP_DIR));
    }

    #[test]
    fn accessors_and_dir_modes() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::under(tmp.path());
        assert!(paths.config_file().ends_with("config/config.toml"));
        assert!(paths.cleanup_log().ends_with("state/cleanup.jsonl"));
        assert!(paths.sweep_lock().ends_with("state/reaper.lock"));
        assert!(paths.work_dir().ends_with("cache/work"));

        paths.ensure_dirs().unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.state_dir)
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
