//! Configuration management for faultline
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the caller)
//! 2. Environment variables (FAULTLINE__SECTION__KEY)
//! 3. An explicit config file passed to the loader
//! 4. faultline.local.toml (gitignored, local overrides)
//! 5. faultline.toml (git-tracked, project config)
//! 6. ~/.config/faultline/config.toml (user defaults)
//! 7. Built-in defaults (lowest precedence)

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Nodes are numbered below this; client actors start here.
pub const MAX_NODES: usize = 1000;

/// Main harness configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub run: RunConfig,
    pub commands: CommandsConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub files: FilesConfig,
    pub decide: DecideConfig,
}

/// How decisions are made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Seeded random decisions, recorded to the trace file.
    #[default]
    Random,
    /// Decisions read back from the trace file.
    Replay,
    /// Coverage-guided decisions backed by the visited file.
    Visited,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Replay => "replay",
            Self::Visited => "visited",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub mode: Mode,
    pub seed: u64,
    /// Scheduler iterations; 0 runs until something fails.
    pub iterations: u64,
    /// Run the validator every this many iterations.
    pub validate_every: u64,
    pub num_clients: usize,
    /// Pause per message released to a node.
    pub node_settle_ms: u64,
    /// Pause per message released to a client.
    pub client_settle_ms: u64,
    /// Upper bound on the proxy wait after a successful send or connect.
    pub send_poll_ms: u64,
    /// Directory for node, client and validator output.
    pub log_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Random,
            seed: 0,
            iterations: 10_000,
            validate_every: 100,
            num_clients: 3,
            node_settle_ms: 50,
            client_settle_ms: 30,
            send_poll_ms: 1_000,
            log_dir: PathBuf::from("/tmp"),
        }
    }
}

/// Command templates. Each is an argv list joined with `#`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Accepts `{addr}` and `{o_addrs}`.
    pub node: String,
    /// Accepts `{addrs}`.
    pub client: String,
    /// Accepts `{addrs}`.
    pub validate: String,
}

impl CommandsConfig {
    pub fn node_argv(&self) -> Vec<String> {
        split_template(&self.node)
    }

    pub fn client_argv(&self) -> Vec<String> {
        split_template(&self.client)
    }

    pub fn validate_argv(&self) -> Vec<String> {
        split_template(&self.validate)
    }
}

/// Splits a `#`-separated command template into argv entries.
pub fn split_template(template: &str) -> Vec<String> {
    if template.is_empty() {
        return Vec::new();
    }
    template.split('#').map(str::to_string).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Addresses nodes believe they have; the proxy listens here.
    pub virtual_addrs: Vec<String>,
    /// Addresses nodes actually bind to.
    pub real_addrs: Vec<String>,
    pub listen_port: u16,
}

impl NetworkConfig {
    pub fn num_nodes(&self) -> usize {
        self.virtual_addrs.len()
    }

    pub fn parsed_virtual(&self) -> Result<Vec<Ipv4Addr>, ConfigError> {
        parse_addrs("virtual_addrs", &self.virtual_addrs)
    }

    pub fn parsed_real(&self) -> Result<Vec<Ipv4Addr>, ConfigError> {
        parse_addrs("real_addrs", &self.real_addrs)
    }
}

fn parse_addrs(field: &str, addrs: &[String]) -> Result<Vec<Ipv4Addr>, ConfigError> {
    addrs
        .iter()
        .map(|addr| {
            addr.trim().parse::<Ipv4Addr>().map_err(|_| {
                ConfigError::ValidationError(format!("network.{field}: {addr:?} is not an IPv4 address"))
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Node data directory; `{addr}` becomes the node's virtual address.
    pub node_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Decision trace: written in random and visited mode, read in replay.
    pub trace: PathBuf,
    /// Coverage trie, required in visited mode.
    pub visited: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecideConfig {
    /// Runnable nodes are this many times likelier to be picked than clients.
    pub node_preference: u32,
    pub death_enabled: bool,
    /// Faults are injected one time in this many.
    pub death_rate: u32,
    pub revive_rate: u32,
    pub fsync_rename_rate: u32,
    pub msg_delay_rate: u32,
    /// Share of idle picks that go to node 0.
    pub primary_percent: u32,
    pub visited_death_rate: u32,
    pub visited_primary_percent: u32,
    /// Recent actions the coverage trie conditions on.
    pub window: usize,
    /// Decisions made randomly before coverage guidance starts.
    pub visit_threshold: u64,
}

impl Default for DecideConfig {
    fn default() -> Self {
        Self {
            node_preference: 2,
            death_enabled: true,
            death_rate: 400,
            revive_rate: 30,
            fsync_rename_rate: 10,
            msg_delay_rate: 5,
            primary_percent: 94,
            visited_death_rate: 800,
            visited_primary_percent: 96,
            window: 10,
            visit_threshold: 500,
        }
    }
}

impl HarnessConfig {
    /// Resolve relative paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        for path in [
            &mut self.run.log_dir,
            &mut self.files.trace,
            &mut self.files.visited,
        ] {
            if !path.as_os_str().is_empty() && path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Checks everything the harness needs before it starts any process.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        for (name, template) in [
            ("node", &self.commands.node),
            ("client", &self.commands.client),
            ("validate", &self.commands.validate),
        ] {
            if template.is_empty() {
                return invalid(format!("commands.{name} must not be empty"));
            }
        }
        if self.storage.node_dir.is_empty() {
            return invalid("storage.node_dir must not be empty".to_string());
        }
        if self.files.trace.as_os_str().is_empty() {
            return invalid("files.trace must not be empty".to_string());
        }
        if self.run.mode == Mode::Visited && self.files.visited.as_os_str().is_empty() {
            return invalid("visited mode requires files.visited".to_string());
        }
        if self.network.listen_port == 0 {
            return invalid("network.listen_port must be nonzero".to_string());
        }
        if self.run.validate_every == 0 {
            return invalid("run.validate_every must be nonzero".to_string());
        }

        let virtual_addrs = self.network.parsed_virtual()?;
        let real_addrs = self.network.parsed_real()?;
        if virtual_addrs.is_empty() {
            return invalid("network.virtual_addrs must not be empty".to_string());
        }
        if virtual_addrs.len() != real_addrs.len() {
            return invalid(format!(
                "network.real_addrs has {} entries but network.virtual_addrs has {}",
                real_addrs.len(),
                virtual_addrs.len()
            ));
        }
        if virtual_addrs.len() >= MAX_NODES {
            return invalid(format!("at most {} nodes are supported", MAX_NODES - 1));
        }
        let virtual_set: HashSet<_> = virtual_addrs.iter().collect();
        if virtual_set.len() != virtual_addrs.len() {
            return invalid("network.virtual_addrs contains duplicates".to_string());
        }
        if real_addrs.iter().collect::<HashSet<_>>().len() != real_addrs.len() {
            return invalid("network.real_addrs contains duplicates".to_string());
        }
        if let Some(shared) = real_addrs.iter().find(|addr| virtual_set.contains(addr)) {
            return invalid(format!(
                "real address {shared} is also a virtual address"
            ));
        }

        let decide = &self.decide;
        for (name, rate) in [
            ("node_preference", decide.node_preference),
            ("death_rate", decide.death_rate),
            ("revive_rate", decide.revive_rate),
            ("fsync_rename_rate", decide.fsync_rename_rate),
            ("msg_delay_rate", decide.msg_delay_rate),
            ("visited_death_rate", decide.visited_death_rate),
        ] {
            if rate == 0 {
                return invalid(format!("decide.{name} must be nonzero"));
            }
        }
        if decide.revive_rate < 2 {
            return invalid("decide.revive_rate must be at least 2".to_string());
        }
        if decide.primary_percent > 100 || decide.visited_primary_percent > 100 {
            return invalid("primary percentages must be at most 100".to_string());
        }
        if decide.window < 2 {
            return invalid("decide.window must be at least 2".to_string());
        }
        Ok(())
    }
}
