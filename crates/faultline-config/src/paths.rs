//! Where configuration files are looked for.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

const PROJECT_FILE: &str = "faultline.toml";
const LOCAL_FILE: &str = "faultline.local.toml";

/// Locates the optional configuration layers of a harness run.
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("dev", "Faultline", "faultline"),
        }
    }

    /// `~/.config/faultline/config.toml` on Linux.
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .ok_or_else(|| ConfigError::XdgError("no home directory to search".to_string()))
    }

    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(PROJECT_FILE)
    }

    /// Per-checkout overrides, kept out of version control.
    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(LOCAL_FILE)
    }

    /// The user, project and local files that exist, lowest precedence
    /// first. A missing home directory only drops the user layer.
    pub fn layers(&self, project_dir: impl AsRef<Path>) -> Vec<PathBuf> {
        let project_dir = project_dir.as_ref();
        self.user_config_file()
            .ok()
            .into_iter()
            .chain([
                Self::project_config_file(project_dir),
                Self::local_config_file(project_dir),
            ])
            .filter(|path| path.is_file())
            .collect()
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn user_file_lives_under_faultline() {
        // Discovery needs a home directory; skip the check without one.
        if let Ok(file) = Paths::new().user_config_file() {
            assert!(file.to_string_lossy().contains("faultline"));
            assert!(file.ends_with("config.toml"));
        }
    }

    #[test]
    fn layers_skip_missing_files_and_keep_order() {
        let dir = tempdir().expect("Failed to create temp dir");
        let paths = Paths::new();
        let project = dir.path();

        let none: Vec<_> = paths
            .layers(project)
            .into_iter()
            .filter(|p| p.starts_with(project))
            .collect();
        assert!(none.is_empty());

        fs::write(project.join(LOCAL_FILE), "").expect("Failed to write local config");
        fs::write(project.join(PROJECT_FILE), "").expect("Failed to write project config");
        let found: Vec<_> = paths
            .layers(project)
            .into_iter()
            .filter(|p| p.starts_with(project))
            .collect();
        assert_eq!(
            found,
            vec![project.join(PROJECT_FILE), project.join(LOCAL_FILE)]
        );
    }
}
