//! Configuration inspection command.

use std::path::Path;

use anyhow::{Context, Result};
use faultline_config::{ConfigLoader, HarnessConfig};

use crate::style::colors::SemanticStyle;
use crate::style::print_info_table;

/// Show the resolved configuration.
pub fn show(file: Option<&Path>, format: &str) -> Result<()> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = file {
        loader = loader.with_file(path);
    }
    let config = loader.load().context("Failed to load configuration")?;

    match format {
        "toml" => {
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{toml_str}");
        }
        _ => print_text(&config),
    }

    if let Err(e) = config.validate() {
        println!("{} {}", "Invalid:".warning(), e);
    }
    Ok(())
}

fn print_text(config: &HarnessConfig) {
    let run = &config.run;
    println!("{}", "Run".header());
    print_info_table(&[
        ("Mode", run.mode.as_str()),
        ("Seed", &run.seed.to_string()),
        ("Iterations", &run.iterations.to_string()),
        ("Validate every", &run.validate_every.to_string()),
        ("Clients", &run.num_clients.to_string()),
        ("Log directory", &run.log_dir.display().to_string()),
    ]);

    println!("{}", "Commands".header());
    print_info_table(&[
        ("Node", &config.commands.node),
        ("Client", &config.commands.client),
        ("Validate", &config.commands.validate),
    ]);

    println!("{}", "Network".header());
    print_info_table(&[
        ("Virtual", &config.network.virtual_addrs.join(", ")),
        ("Real", &config.network.real_addrs.join(", ")),
        ("Listen port", &config.network.listen_port.to_string()),
        ("Node directory", &config.storage.node_dir),
    ]);

    let decide = &config.decide;
    println!("{}", "Decisions".header());
    print_info_table(&[
        ("Trace", &config.files.trace.display().to_string()),
        ("Coverage", &config.files.visited.display().to_string()),
        ("Node preference", &decide.node_preference.to_string()),
        ("Deaths", &decide.death_enabled.to_string()),
        ("Death rate", &format!("1/{}", decide.death_rate)),
        ("Revive rate", &format!("1/{}", decide.revive_rate)),
        ("Fsync/rename failure", &format!("1/{}", decide.fsync_rename_rate)),
        ("Message delay", &format!("1/{}", decide.msg_delay_rate)),
        ("Primary percent", &decide.primary_percent.to_string()),
        ("Window", &decide.window.to_string()),
        ("Visit threshold", &decide.visit_threshold.to_string()),
    ]);
}
