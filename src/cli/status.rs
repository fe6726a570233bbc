use std::path::Path;

use anyhow::Result;

use crate::config::Config;

pub fn run(config_path: Option<&Path>) -> Result<()> {
    let config = Config::load(config_path)?;

    #[cfg(target_os = "linux")]
    {
        let caps = crate::sandbox::detect_capabilities();
        println!("Host Support:");
        for line in caps.status_lines() {
            println!("{}", line);
        }
        println!();
    }
    #[cfg(not(target_os = "linux"))]
    {
        println!("Host Support:");
        println!("  Platform:  unsupported             --");
        println!();
    }

    println!("Configuration:");
    println!("  Config:      {}", Config::config_path(config_path)?.display());
    println!("  Kill after:  {}ms", config.sandbox.kill_timeout_ms);
    println!("  Cache dir:   {}", config.system_cache_dir().display());
    println!("  Socket dir:  {}", config.socket_dir().display());
    match config.helper_path() {
        Ok(helper) => println!("  Helper:      {}", helper.display()),
        Err(e) => println!("  Helper:      unavailable ({e})"),
    }
    match config.state_root() {
        Some(root) => println!("  State root:  {}", root.display()),
        None => println!("  State root:  {}", std::env::temp_dir().display()),
    }

    Ok(())
}
