mod cli;
mod display;
mod error;

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use clap::Parser;
use cli::{Cli, RunCommand};
use epidata::config::Config;
use error::EpidataCliResult;
use log::debug;

const DEFAULT_LOGGING_LEVEL: &str = "warn";

#[tokio::main]
async fn main() -> EpidataCliResult<()> {
    // Set RUST_LOG to `DEFAULT_LOGGING_LEVEL` if not set
    let _ =
        std::env::var("RUST_LOG").map_err(|_| std::env::set_var("RUST_LOG", DEFAULT_LOGGING_LEVEL));
    pretty_env_logger::init_timed();
    let args = Cli::parse();
    debug!("args: {args:?}");
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let config = read_config_from_toml(&config_path)?;
    debug!("config: {config:?}");

    if let Some(command) = args.command {
        command.run(config).await?;
    }
    Ok(())
}

fn default_config_path() -> EpidataCliResult<PathBuf> {
    // macOS: ~/Library/Application Support/epidata/config.toml
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow!("No config directory on this platform"))?
        .join("epidata")
        .join("config.toml"))
}

/// Missing file means defaults, anything else that fails is an error.
fn read_config_from_toml(path: &Path) -> EpidataCliResult<Config> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Error reading config file {path:?}"))
            .into()),
    }
}
