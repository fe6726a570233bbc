use std::path::Path;

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::{Config, DEFAULT_CONFIG_TEMPLATE};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(config_path, &format),
        ConfigCommands::Path => show_path(config_path),
        ConfigCommands::Init { force } => init_config(config_path, force),
    }
}

fn show_config(config_path: Option<&Path>, format: &str) -> Result<()> {
    let config = Config::load(config_path)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn show_path(config_path: Option<&Path>) -> Result<()> {
    let path = Config::config_path(config_path)?;
    let state = if path.exists() { "" } else { " (not created)" };
    println!("{}{}", path.display(), state);
    Ok(())
}

fn init_config(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = Config::config_path(config_path)?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    match config_path {
        None => Config::default().paths.ensure_config_dir()?,
        Some(_) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    Ok(())
}
