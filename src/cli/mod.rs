pub mod config;
#[cfg(target_os = "linux")]
pub mod run;
#[cfg(target_os = "linux")]
pub mod selftest;
pub mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pkgjail")]
#[command(author, version, about = "Run package build commands in rootless containers")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "PKGJAIL_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one command in a fresh build sandbox
    #[cfg(target_os = "linux")]
    Run(run::RunArgs),

    /// Show host support and effective configuration
    Status,

    /// Run smoke tests against a real sandbox
    #[cfg(target_os = "linux")]
    Test,

    /// Configuration management
    Config(config::ConfigArgs),
}
