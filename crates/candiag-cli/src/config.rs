//! Configuration file lookup for candiag

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candiag::DiagConfig;

/// `$XDG_CONFIG_HOME/candiag/config.toml` or the platform equivalent
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("candiag").join("config.toml"))
}

/// Load an explicit config file, else the default one when it exists, else
/// built-in defaults
pub fn load(path: Option<&Path>) -> Result<DiagConfig> {
    if let Some(path) = path {
        return DiagConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()));
    }
    match default_config_path() {
        Some(path) if path.exists() => DiagConfig::load(&path)
            .with_context(|| format!("Failed to load config file: {}", path.display())),
        _ => Ok(DiagConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.toml");
        std::fs::write(&path, "[flash]\nblock_size = 128\n").unwrap();
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.flash.block_size, 128);
    }

    #[test]
    fn test_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pool]\nworkers = 0\n").unwrap();
        assert!(load(Some(&path)).is_err());
    }
}
