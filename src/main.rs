use anyhow::Result;
use clap::Parser;

use pkgjail::cli::{self, Cli, Commands};
use pkgjail::config::Config;

fn main() -> Result<()> {
    // argv[0] dispatch: when re-exec'd as "pkgjail-init" or "pkgjail-exec",
    // enter the helper before Tokio or Clap start. Helpers never return.
    #[cfg(target_os = "linux")]
    if let Some(arg0) = std::env::args_os().next() {
        pkgjail::sandbox::helper::dispatch(&arg0.to_string_lossy());
    }

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let log_level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);
    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli, config))?;

    // A blocked stdin reader would otherwise hold up runtime shutdown.
    std::process::exit(code)
}

async fn async_main(cli: Cli, config: Config) -> Result<i32> {
    match cli.command {
        #[cfg(target_os = "linux")]
        Commands::Run(args) => cli::run::run(args, &config).await,
        Commands::Status => cli::status::run(cli.config.as_deref()).map(|()| 0),
        #[cfg(target_os = "linux")]
        Commands::Test => cli::selftest::run(&config).await.map(|()| 0),
        Commands::Config(args) => cli::config::run(args, cli.config.as_deref()).map(|()| 0),
    }
}
