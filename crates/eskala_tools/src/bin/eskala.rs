#![forbid(unsafe_code)]

use std::sync::Arc;

use clap::Parser;
use eskala_os::attribution::InMemoryUserDirectory;
use eskala_os::clock::SystemClock;
use eskala_os::config::EskalaConfig;
use eskala_os::logging::init_logging;
use eskala_os::runtime::EskalaRuntime;
use eskala_tools::config_cli::{actor_from_args, execute_config_command, Cli};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let cli = Cli::parse();
    let config = EskalaConfig::from_env().map_err(|e| e.to_string())?;
    init_logging(&config.log_filter);
    if config.store_path.is_none() {
        tracing::warn!("ESKALA_STORE_PATH is not set; changes will not outlive this process");
    }

    let actor = actor_from_args(cli.actor_id, cli.actor_name.clone())?;
    // The CLI has no user table; attribution relies on names recorded with each change.
    let runtime = EskalaRuntime::from_config(
        config,
        Arc::new(SystemClock),
        Arc::new(InMemoryUserDirectory::new()),
    )
    .map_err(|e| e.to_string())?;

    let output = execute_config_command(&runtime, &cli.command, actor, cli.json)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
