use anyhow::Result;
use clap::Parser;
use log::info;

mod config;
mod db;
mod logging;
mod matrix;
mod meshtastic;
mod plugins;
mod prefix;
mod queue;
mod relay;

use crate::config::Config;
use crate::plugins::PluginSet;
use crate::relay::Relay;

#[derive(Parser)]
#[command(name = "mmrelay")]
#[command(about = "A relay bridging Meshtastic mesh networks with Matrix chat rooms")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    logfile: Option<String>,

    /// Write a sample configuration file and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate the configuration file and exit
    #[arg(long)]
    check_config: bool,

    /// Install a systemd user service unit and exit
    #[arg(long)]
    install_service: bool,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.generate_config {
        if std::path::Path::new(&cli.config).exists() {
            anyhow::bail!("refusing to overwrite existing config file {}", cli.config);
        }
        Config::create_default(&cli.config).await?;
        println!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    if cli.check_config {
        let config = Config::load(&cli.config).await?;
        config.validate()?;
        println!("Configuration file {} is valid", cli.config);
        return Ok(());
    }

    if cli.install_service {
        let unit_path = install_service()?;
        println!("Service unit written to {}", unit_path);
        println!("Enable it with: systemctl --user enable --now mmrelay.service");
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    let cli_level = match cli.verbose {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    };
    logging::init(&config.logging, cli_level, cli.logfile.as_deref())?;

    info!("Starting MMRelay v{}", env!("CARGO_PKG_VERSION"));
    Relay::run(config, PluginSet::empty()).await
}

/// Write a systemd user unit that runs the relay with the current binary.
fn install_service() -> Result<String> {
    let exe = std::env::current_exe()?;
    let unit = format!(
        "[Unit]\n\
         Description=MMRelay - Meshtastic Matrix relay\n\
         After=network-online.target\n\n\
         [Service]\n\
         ExecStart={} --config %h/.config/mmrelay/config.yaml\n\
         Restart=on-failure\n\
         RestartSec=10\n\n\
         [Install]\n\
         WantedBy=default.target\n",
        exe.display()
    );
    let base = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("cannot determine user config directory"))?;
    let unit_dir = base.join("systemd").join("user");
    std::fs::create_dir_all(&unit_dir)?;
    let unit_path = unit_dir.join("mmrelay.service");
    std::fs::write(&unit_path, unit)?;
    Ok(unit_path.display().to_string())
}
