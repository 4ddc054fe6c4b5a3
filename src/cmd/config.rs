//! Configuration view and validation commands: `progeny config`.

use anyhow::Result;
use std::path::Path;

use progeny::config::ProgenyToml;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Progeny Configuration");
            println!("=====================");
            println!();

            let mut toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ProgenyToml::load(config_path)?
            } else {
                println!("No progeny.toml found at {}", config_path.display());
                println!("Using default configuration.");
                ProgenyToml::default()
            };
            toml.apply_env_overrides(|key| std::env::var(key).ok())?;
            println!();

            println!("[server]");
            println!("  host = \"{}\"", toml.server.host);
            println!("  port = {}", toml.server.port);
            println!("  public_host = \"{}\"", toml.server.public_host);
            println!();
            println!("[ports]");
            println!("  min = {}", toml.ports.min);
            println!("  max = {}", toml.ports.max);
            println!("  skip_bound = {}", toml.ports.skip_bound);
            println!();
            println!("[cleaning]");
            match (toml.cleaning.interval_secs, toml.cleaning.timeout_secs) {
                (Some(interval), Some(timeout)) => {
                    println!("  interval_secs = {}", interval);
                    println!("  timeout_secs = {}", timeout);
                }
                _ => println!("  {}", console::style("scheduled cleaning disabled").dim()),
            }
            println!("  grace_period_secs = {}", toml.cleaning.grace_period_secs);
            println!("  cleanup_on_shutdown = {}", toml.cleaning.cleanup_on_shutdown);
            println!();
            println!("[tool]");
            println!("  command = \"{}\"", toml.tool_cmd());
            if let Some(dir) = &toml.tool.recipe_dir {
                println!("  recipe_dir = \"{}\"", dir.display());
            }
            println!("  recipe_exclude = \"{}\"", toml.tool.recipe_exclude);
            println!("  startup_grace_ms = {}", toml.tool.startup_grace_ms);
            println!("  launch_timeout_secs = {}", toml.tool.launch_timeout_secs);
            if let Some(dir) = &toml.tool.log_dir {
                println!("  log_dir = \"{}\"", dir.display());
            }
            println!();
            if let Some(dir) = &toml.prebaked.dir {
                println!("[prebaked]");
                println!("  dir = \"{}\"", dir.display());
                println!();
            }
            println!("[registry]");
            println!("  path = \"{}\"", toml.registry.path.display());
            println!();

            if !config_path.exists() {
                println!("Run 'progeny config init' to create a progeny.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No progeny.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ProgenyToml::load(config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("progeny.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ProgenyToml::default().save(config_path)?;

            println!("Created progeny.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [ports] min, max for the session port range");
            println!("  - [cleaning] interval_secs, timeout_secs to reap idle sessions");
            println!("  - [tool] command, recipe_dir for how instances are launched");
            println!();
        }
    }

    Ok(())
}
