//! Harness run command.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, ValueEnum};
use faultline_config::{ConfigLoader, HarnessConfig, Mode};

use crate::style::{print_error, print_hint, print_labeled, print_spacer};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Random,
    Replay,
    Visited,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Random => Mode::Random,
            ModeArg::Replay => Mode::Replay,
            ModeArg::Visited => Mode::Visited,
        }
    }
}

/// Flags layered over the loaded configuration. Anything left unset keeps
/// the value from files and environment.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Configuration file layered over the project files.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Decision mode.
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Seed for random and visited modes.
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Scheduler iterations to run.
    #[arg(short = 'n', long)]
    pub iterations: Option<u64>,

    /// Run the validator every N iterations.
    #[arg(long)]
    pub validate_every: Option<u64>,

    /// Number of client processes.
    #[arg(long)]
    pub num_clients: Option<usize>,

    /// Node command template (arguments separated by '#').
    #[arg(long)]
    pub node_cmd: Option<String>,

    /// Client command template (arguments separated by '#').
    #[arg(long)]
    pub client_cmd: Option<String>,

    /// Validate command template (arguments separated by '#').
    #[arg(long)]
    pub validate_cmd: Option<String>,

    /// Comma-separated addresses the nodes believe they have.
    #[arg(long, value_delimiter = ',')]
    pub virtual_addrs: Option<Vec<String>>,

    /// Comma-separated addresses the nodes actually bind.
    #[arg(long, value_delimiter = ',')]
    pub real_addrs: Option<Vec<String>>,

    /// Port every node listens on.
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Per-node data directory template ('{addr}' expands to the virtual address).
    #[arg(long)]
    pub node_dir: Option<String>,

    /// Decision trace file (written in random and visited modes, read in replay).
    #[arg(long)]
    pub trace: Option<PathBuf>,

    /// Coverage file for visited mode.
    #[arg(long)]
    pub visited: Option<PathBuf>,

    /// Directory for actor and validator output.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Pause after each message released to a node, in milliseconds.
    #[arg(long)]
    pub node_settle_ms: Option<u64>,

    /// Pause after each message released to a client, in milliseconds.
    #[arg(long)]
    pub client_settle_ms: Option<u64>,

    /// Bound on the proxy poll after a send, in milliseconds.
    #[arg(long)]
    pub send_poll_ms: Option<u64>,

    /// Weight of nodes over clients when scheduling.
    #[arg(long)]
    pub node_preference: Option<u32>,

    /// Never kill nodes.
    #[arg(long)]
    pub no_death: bool,

    /// A node dies at a network call, write or fsync with chance 1/N.
    #[arg(long)]
    pub death_rate: Option<u32>,

    /// A dead node revives with chance 1/N when scheduled.
    #[arg(long)]
    pub revive_rate: Option<u32>,

    /// Pending renames commit on fsync with chance 1/N.
    #[arg(long)]
    pub fsync_rename_rate: Option<u32>,

    /// A queued message is held back with chance 1/N.
    #[arg(long)]
    pub msg_delay_rate: Option<u32>,

    /// Share (out of 100) of idle tie-breaks that go to node 0.
    #[arg(long)]
    pub primary_percent: Option<u32>,

    /// Decision window of visited mode.
    #[arg(long)]
    pub window: Option<usize>,

    /// Decisions made randomly before visited mode starts following coverage.
    #[arg(long)]
    pub visit_threshold: Option<u64>,
}

impl RunArgs {
    pub fn apply(&self, config: &mut HarnessConfig) {
        if let Some(mode) = self.mode {
            config.run.mode = mode.into();
        }
        if let Some(seed) = self.seed {
            config.run.seed = seed;
        }
        if let Some(iterations) = self.iterations {
            config.run.iterations = iterations;
        }
        if let Some(every) = self.validate_every {
            config.run.validate_every = every;
        }
        if let Some(num_clients) = self.num_clients {
            config.run.num_clients = num_clients;
        }
        if let Some(cmd) = &self.node_cmd {
            config.commands.node.clone_from(cmd);
        }
        if let Some(cmd) = &self.client_cmd {
            config.commands.client.clone_from(cmd);
        }
        if let Some(cmd) = &self.validate_cmd {
            config.commands.validate.clone_from(cmd);
        }
        if let Some(addrs) = &self.virtual_addrs {
            config.network.virtual_addrs.clone_from(addrs);
        }
        if let Some(addrs) = &self.real_addrs {
            config.network.real_addrs.clone_from(addrs);
        }
        if let Some(port) = self.listen_port {
            config.network.listen_port = port;
        }
        if let Some(dir) = &self.node_dir {
            config.storage.node_dir.clone_from(dir);
        }
        if let Some(trace) = &self.trace {
            config.files.trace.clone_from(trace);
        }
        if let Some(visited) = &self.visited {
            config.files.visited.clone_from(visited);
        }
        if let Some(dir) = &self.log_dir {
            config.run.log_dir.clone_from(dir);
        }
        if let Some(ms) = self.node_settle_ms {
            config.run.node_settle_ms = ms;
        }
        if let Some(ms) = self.client_settle_ms {
            config.run.client_settle_ms = ms;
        }
        if let Some(ms) = self.send_poll_ms {
            config.run.send_poll_ms = ms;
        }
        self.apply_decide(config);
    }

    fn apply_decide(&self, config: &mut HarnessConfig) {
        let decide = &mut config.decide;
        if self.no_death {
            decide.death_enabled = false;
        }
        let rates = [
            (self.node_preference, &mut decide.node_preference),
            (self.death_rate, &mut decide.death_rate),
            (self.revive_rate, &mut decide.revive_rate),
            (self.fsync_rename_rate, &mut decide.fsync_rename_rate),
            (self.msg_delay_rate, &mut decide.msg_delay_rate),
            (self.primary_percent, &mut decide.primary_percent),
        ];
        for (flag, field) in rates {
            if let Some(value) = flag {
                *field = value;
            }
        }
        if let Some(window) = self.window {
            decide.window = window;
        }
        if let Some(threshold) = self.visit_threshold {
            decide.visit_threshold = threshold;
        }
    }
}

/// Loads the layered configuration with the flag overrides on top.
pub fn load(args: &RunArgs) -> Result<HarnessConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load()?;
    args.apply(&mut config);
    Ok(config)
}

/// Returns the process exit code.
pub fn run(args: &RunArgs) -> i32 {
    let config = match load(args) {
        Ok(config) => config,
        Err(e) => {
            print_error(&format!("Failed to load configuration: {e:#}"));
            print_hint("Pass --config <file> or create faultline.toml in this directory");
            return faultline::EXIT_BAD_CONFIG;
        }
    };

    print_labeled("Mode", config.run.mode.as_str());
    print_labeled("Seed", &config.run.seed.to_string());
    print_labeled("Nodes", &config.network.num_nodes().to_string());
    print_labeled("Clients", &config.run.num_clients.to_string());
    print_labeled("Iterations", &config.run.iterations.to_string());
    print_spacer();

    let code = faultline::run(&config);
    if code != 0 {
        print_error(&format!("Harness exited with code {code}"));
    }
    code
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn flags_override_loaded_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[run]\nseed = 3\niterations = 50\n\n[network]\nlisten_port = 7000\n"
        )
        .unwrap();

        let args = RunArgs {
            config: Some(file.path().to_path_buf()),
            mode: Some(ModeArg::Replay),
            seed: Some(9),
            virtual_addrs: Some(vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]),
            no_death: true,
            revive_rate: Some(4),
            send_poll_ms: Some(25),
            ..RunArgs::default()
        };
        let config = load(&args).unwrap();

        assert_eq!(config.run.mode, Mode::Replay);
        assert_eq!(config.run.seed, 9);
        assert_eq!(config.run.iterations, 50);
        assert_eq!(config.network.listen_port, 7000);
        assert_eq!(config.network.virtual_addrs.len(), 2);
        assert!(!config.decide.death_enabled);
        assert_eq!(config.decide.revive_rate, 4);
        assert_eq!(config.run.send_poll_ms, 25);
    }

    #[test]
    fn visit_threshold_help_describes_random_warmup() {
        let command = RunArgs::augment_args(clap::Command::new("run"));
        let arg = command
            .get_arguments()
            .find(|arg| arg.get_id() == "visit_threshold")
            .unwrap();
        let help = arg.get_help().unwrap().to_string();
        assert!(help.contains("randomly before"), "{help}");
    }

    #[test]
    fn missing_config_file_exits_with_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            config: Some(dir.path().join("absent.toml")),
            ..RunArgs::default()
        };
        assert_eq!(run(&args), faultline::EXIT_BAD_CONFIG);
    }
}
