use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ContourError, Result};

pub const USER_DIR_ENV: &str = "CONTOUR_USER_DIR";
pub const GLOBAL_CONFIG_ENV: &str = "CONTOUR_GLOBAL_CONFIG";

/// On-disk locations shared by the engine, the CLI and the artifact fetcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContourPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub logs_dir: PathBuf,
    pub models_dir: PathBuf,
}

impl ContourPaths {
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_path: root.join("config.json"),
            logs_dir: root.join("logs"),
            models_dir: root.join("models"),
            root,
        }
    }
}

/// Resolves the user directory, mirroring the IDE's own settings layout:
///
/// - `$CONTOUR_USER_DIR` when set and non-empty,
/// - Windows: `%APPDATA%\Contour`,
/// - macOS: `~/Library/Contour`,
/// - elsewhere: `$XDG_CONFIG_HOME/Contour`, falling back to `~/.config/Contour`.
///
/// `config.json`, `logs/` and `models/` live directly under that directory.
pub fn resolve_paths() -> Result<ContourPaths> {
    let override_dir = std::env::var(USER_DIR_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);
    resolve_paths_with(override_dir)
}

/// Like [`resolve_paths`], with `user_dir` taking the place of the
/// environment override.
pub fn resolve_paths_with(user_dir: Option<PathBuf>) -> Result<ContourPaths> {
    if let Some(dir) = user_dir {
        return Ok(ContourPaths::from_root(dir));
    }
    let base = platform_base()
        .ok_or_else(|| ContourError::InvalidConfig("failed to resolve config dir".to_string()))?;
    Ok(ContourPaths::from_root(base.join("Contour")))
}

#[cfg(target_os = "macos")]
fn platform_base() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join("Library"))
}

#[cfg(not(target_os = "macos"))]
fn platform_base() -> Option<PathBuf> {
    dirs::config_dir()
}

/// Global config file, honoring `$CONTOUR_GLOBAL_CONFIG`.
pub fn resolve_global_config_path(paths: &ContourPaths) -> PathBuf {
    match std::env::var(GLOBAL_CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => paths.config_path.clone(),
    }
}

/// True when `path` resolves to a location inside `root`.
pub fn is_within_root(path: &Path, root: &Path) -> bool {
    let candidate = if path.exists() {
        path.canonicalize().ok()
    } else if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        std::env::current_dir().ok().map(|cwd| cwd.join(path))
    };
    let Some(candidate) = candidate else {
        return false;
    };
    let root = if root.exists() {
        root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
    } else {
        root.to_path_buf()
    };
    let candidate = normalize_for_compare(candidate);
    let root = normalize_for_compare(root);
    candidate != root && candidate.starts_with(root)
}

fn normalize_for_compare(path: PathBuf) -> PathBuf {
    #[cfg(windows)]
    {
        // canonicalize() adds the verbatim prefix (\\?\); plain paths lack it.
        let mut text = path.to_string_lossy().replace('/', "\\");
        if let Some(rest) = text.strip_prefix(r"\\?\UNC\") {
            text = format!(r"\\{}", rest);
        } else if let Some(rest) = text.strip_prefix(r"\\?\") {
            text = rest.to_string();
        }
        PathBuf::from(text.to_ascii_lowercase())
    }

    #[cfg(not(windows))]
    {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_dir_lays_out_children() {
        let paths = resolve_paths_with(Some(PathBuf::from("/opt/contour-user"))).expect("paths");
        assert_eq!(paths.models_dir, PathBuf::from("/opt/contour-user/models"));
        assert_eq!(paths.logs_dir, PathBuf::from("/opt/contour-user/logs"));
        assert_eq!(
            paths.config_path,
            PathBuf::from("/opt/contour-user/config.json")
        );
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn default_root_sits_under_library() {
        let paths = resolve_paths_with(None).expect("paths");
        let home = dirs::home_dir().expect("home");
        assert_eq!(paths.root, home.join("Library").join("Contour"));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn default_root_sits_under_the_platform_config_dir() {
        let paths = resolve_paths_with(None).expect("paths");
        let base = dirs::config_dir().expect("config dir");
        assert_eq!(paths.root, base.join("Contour"));
        assert_eq!(paths.models_dir, base.join("Contour").join("models"));
    }

    #[test]
    fn root_containment_rejects_escapes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let models = temp.path().join("models");
        std::fs::create_dir_all(&models).expect("models");
        let inside = models.join("tiny.gguf");
        std::fs::write(&inside, b"gguf").expect("write");
        let outside = temp.path().join("secret.gguf");
        std::fs::write(&outside, b"gguf").expect("write");

        assert!(is_within_root(&inside, &models));
        assert!(!is_within_root(&outside, &models));
        assert!(!is_within_root(&models.join("..").join("secret.gguf"), &models));
        assert!(!is_within_root(&models, &models));
    }

    #[cfg(windows)]
    #[test]
    fn root_compare_handles_verbatim_prefix_mismatch() {
        let root = PathBuf::from(r"\\?\C:\Users\dev\Contour\models");
        let candidate = PathBuf::from(r"C:\Users\dev\Contour\models\tiny.gguf");
        assert!(is_within_root(&candidate, &root));
    }
}
