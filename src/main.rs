//! testdeps CLI - manage shared test dependency containers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use testdeps::broker::SharedResource;
use testdeps::config::{self, Config};
use testdeps::provisioner::DockerProvisioner;
use testdeps::registry;
use testdeps::{logging, ResourceKind};

#[derive(Parser)]
#[command(name = "testdeps")]
#[command(about = "Manage shared external dependencies for integration tests", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to $TESTDEPS_CONFIG, then ./testdeps.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or reattach to) reusable instances so test runs find them warm
    Up {
        /// Kinds to start (search, document, relational). Defaults to all.
        #[arg(value_parser = parse_kind)]
        kinds: Vec<ResourceKind>,
    },

    /// Remove the named containers
    Down {
        #[arg(value_parser = parse_kind)]
        kinds: Vec<ResourceKind>,
    },

    /// Show the state of each kind's container or external endpoint
    Status {
        #[arg(value_parser = parse_kind)]
        kinds: Vec<ResourceKind>,
    },

    /// Validate configuration and print the effective settings
    Validate,
}

fn parse_kind(value: &str) -> Result<ResourceKind, String> {
    ResourceKind::parse(value).ok_or_else(|| {
        format!(
            "unknown kind {:?} (expected search, document or relational)",
            value
        )
    })
}

fn selected(kinds: Vec<ResourceKind>) -> Vec<ResourceKind> {
    if kinds.is_empty() {
        ResourceKind::BUILTIN.to_vec()
    } else {
        kinds
    }
}

fn load(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = config::load_config(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            config::apply_env(&mut config);
            Ok(config)
        }
        None => config::load_from_env(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Validate = cli.command {
        return validate_config(cli.config.as_ref());
    }

    let config = load(cli.config.as_ref())?;
    logging::init(cli.verbose || config.settings.debug);

    match cli.command {
        Commands::Up { kinds } => up(config, selected(kinds)).await,
        Commands::Down { kinds } => down(&config, selected(kinds)).await,
        Commands::Status { kinds } => status(&config, selected(kinds)).await,
        Commands::Validate => Ok(()),
    }
}

async fn up(mut config: Config, kinds: Vec<ResourceKind>) -> Result<()> {
    if !config.settings.reuse_across_runs {
        warn!("reuse_across_runs is disabled; enabling it so instances outlive this command");
        config.settings.reuse_across_runs = true;
    }
    if registry::configure(config).is_err() {
        anyhow::bail!("configuration was already installed");
    }

    let mut failed = false;
    for kind in kinds {
        let Some(broker) = registry::broker(kind) else {
            continue;
        };
        match broker.acquire_any(&[]).await {
            Ok(_) => {
                let endpoint = broker.endpoint().await.unwrap_or_default();
                println!("{:<12} ready      {}", kind, endpoint);
                broker.release().await;
            }
            Err(e) => {
                eprintln!("{:<12} failed     {}", kind, e);
                failed = true;
            }
        }
        broker.shutdown().await;
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn down(config: &Config, kinds: Vec<ResourceKind>) -> Result<()> {
    for kind in kinds {
        let resource = config.resource(kind);
        if resource.use_external {
            println!("{:<12} external   (nothing to remove)", kind);
            continue;
        }
        let provisioner = DockerProvisioner::new(config.settings.clone(), resource)?;
        let removed = provisioner
            .remove()
            .await
            .with_context(|| format!("Failed to remove {}", provisioner.container_name()))?;
        if removed {
            info!("Removed {}", provisioner.container_name());
            println!("{:<12} removed    {}", kind, provisioner.container_name());
        } else {
            println!("{:<12} absent     {}", kind, provisioner.container_name());
        }
    }
    Ok(())
}

async fn status(config: &Config, kinds: Vec<ResourceKind>) -> Result<()> {
    for kind in kinds {
        let resource = config.resource(kind);
        if resource.use_external {
            println!("{:<12} external   {}", kind, resource.external_url);
            continue;
        }
        let provisioner = DockerProvisioner::new(config.settings.clone(), resource)?;
        match provisioner.status().await? {
            Some(status) => println!(
                "{:<12} {:<10} {} {}",
                kind,
                status.state,
                status.name,
                status.address.unwrap_or_default()
            ),
            None => println!("{:<12} absent     {}", kind, provisioner.container_name()),
        }
    }
    Ok(())
}

fn validate_config(path: Option<&PathBuf>) -> Result<()> {
    match load(path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Reuse across runs: {}", config.settings.reuse_across_runs);
            println!("  Startup timeout: {}s", config.settings.startup_timeout_secs);
            println!("  Stop timeout: {}s", config.settings.stop_timeout_secs);
            println!("  Debug: {}", config.settings.debug);

            println!();
            println!("Resources:");
            for kind in ResourceKind::BUILTIN {
                let resource = config.resource(kind);
                if resource.use_external {
                    println!("  {}: external {}", kind, resource.external_url);
                } else {
                    println!(
                        "  {}: {} as {} (port {})",
                        kind, resource.image, resource.container_name, resource.port
                    );
                }
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}
