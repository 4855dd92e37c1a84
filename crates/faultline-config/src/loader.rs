//! Configuration loader with multi-source merging

use crate::{ConfigError, HarnessConfig, Paths};
use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Keys whose environment values are comma-separated lists.
const LIST_KEYS: [&str; 2] = ["network.virtual_addrs", "network.real_addrs"];

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    explicit_file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "FAULTLINE".to_string(),
            explicit_file: None,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "FAULTLINE")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Layer a specific file over the project files. Unlike the discovered
    /// files it must exist and parse.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.explicit_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<HarnessConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = HarnessConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2-4. User, project and local files, whichever exist
        for file in Paths::new().layers(&self.project_dir) {
            debug!(path = %file.display(), "layering config file");
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Explicit file (--config)
        if let Some(path) = &self.explicit_file {
            let contents = read_checked(path)?;
            builder = builder.add_source(config::File::from_str(
                &contents,
                config::FileFormat::Toml,
            ));
        }

        // 6. Environment variables (FAULTLINE__RUN__SEED=7)
        let mut environment = config::Environment::with_prefix(&self.env_prefix)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .try_parsing(true);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }
        builder = builder.add_source(environment);

        // Build and deserialize
        let config = builder.build().context("Failed to build configuration")?;

        let mut harness_config: HarnessConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Resolve relative paths
        harness_config.resolve_paths(&self.project_dir);

        Ok(harness_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads a config file and checks that it is well-formed TOML.
fn read_checked(path: &Path) -> Result<String, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<toml::Table>(&contents).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mode;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = ConfigLoader::new()
            .with_project_dir(temp_dir.path())
            .with_env_prefix("FAULTLINE_TEST_DEFAULTS")
            .load()
            .expect("Failed to load config");

        assert_eq!(config.run.mode, Mode::Random);
        assert_eq!(config.run.num_clients, 3);
        assert_eq!(config.decide.window, 10);
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[run]
mode = "visited"
seed = 42
iterations = 500

[network]
virtual_addrs = ["127.0.0.2", "127.0.0.3", "127.0.0.4"]
real_addrs = ["127.0.1.2", "127.0.1.3", "127.0.1.4"]
listen_port = 7000

[decide]
death_enabled = false
"#;
        fs::write(project_dir.join("faultline.toml"), config_content)
            .expect("Failed to write config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("FAULTLINE_TEST_PROJECT")
            .load()
            .expect("Failed to load config");

        assert_eq!(config.run.mode, Mode::Visited);
        assert_eq!(config.run.seed, 42);
        assert_eq!(config.run.iterations, 500);
        assert_eq!(config.network.num_nodes(), 3);
        assert_eq!(config.network.listen_port, 7000);
        assert!(!config.decide.death_enabled);
        // untouched keys keep their defaults
        assert_eq!(config.run.validate_every, 100);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("faultline.toml"),
            r#"
[run]
seed = 1
num_clients = 2
"#,
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("faultline.local.toml"),
            r#"
[run]
seed = 99
"#,
        )
        .expect("Failed to write local config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("FAULTLINE_TEST_LOCAL")
            .load()
            .expect("Failed to load config");

        assert_eq!(config.run.seed, 99);
        assert_eq!(config.run.num_clients, 2);
    }

    #[test]
    fn test_explicit_file_overrides_project() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(project_dir.join("faultline.toml"), "[run]\nseed = 1\n")
            .expect("Failed to write project config");
        let explicit = project_dir.join("nightly.toml");
        fs::write(&explicit, "[run]\nseed = 2\nmode = \"replay\"\n")
            .expect("Failed to write explicit config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("FAULTLINE_TEST_EXPLICIT")
            .with_file(&explicit)
            .load()
            .expect("Failed to load config");

        assert_eq!(config.run.seed, 2);
        assert_eq!(config.run.mode, Mode::Replay);
    }

    #[test]
    fn test_explicit_file_must_exist_and_parse() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let missing = temp_dir.path().join("missing.toml");
        let err = read_checked(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));

        let broken = temp_dir.path().join("broken.toml");
        fs::write(&broken, "[run\nseed = ").expect("Failed to write config");
        let err = read_checked(&broken).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    // Environment overrides use double underscores so keys with single
    // underscores survive:
    //
    // FAULTLINE__RUN__VALIDATE_EVERY=50
    // FAULTLINE__NETWORK__VIRTUAL_ADDRS=127.0.0.2,127.0.0.3
    //
    // They are not exercised here because the process environment is shared
    // across test threads.

    #[test]
    fn test_path_resolution() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();
        fs::write(
            project_dir.join("faultline.toml"),
            "[files]\ntrace = \"out/trace\"\n",
        )
        .expect("Failed to write config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("FAULTLINE_TEST_PATHS")
            .load()
            .expect("Failed to load config");

        assert!(config.files.trace.is_absolute());
        assert!(config.run.log_dir.is_absolute());
        assert!(config.files.visited.as_os_str().is_empty());
    }
}
