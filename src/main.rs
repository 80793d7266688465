use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slidegate::config::SlidegateConfig;
use slidegate::throttle::{ConnectionMeta, RateSpec};

/// Sliding-window throttle checks against a shared history store.
#[derive(Parser, Debug)]
#[command(name = "slidegate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured scopes and their quotas
    Scopes,

    /// Run throttle checks for one caller and print each decision as JSON
    Check {
        /// Scope to check against
        #[arg(short, long)]
        scope: String,

        /// Authenticated principal id
        #[arg(long)]
        principal: Option<String>,

        /// Address of the directly connected peer
        #[arg(long)]
        remote_addr: Option<String>,

        /// Raw X-Forwarded-For header value
        #[arg(long)]
        forwarded_for: Option<String>,

        /// Number of consecutive checks to run
        #[arg(short = 'n', long, default_value_t = 1)]
        repeat: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => SlidegateConfig::from_file(path)?,
        None => SlidegateConfig::default(),
    };
    info!(
        backend = ?config.store.backend,
        scopes = config.throttle.rates.len(),
        consistency = ?config.throttle.consistency,
        "Configuration loaded"
    );

    match cli.command {
        Command::Scopes => {
            for (scope, rate) in config.throttle.rates.iter() {
                match RateSpec::parse(rate)? {
                    Some(spec) => println!(
                        "{}\t{} requests per {}s",
                        scope,
                        spec.count(),
                        spec.window().seconds()
                    ),
                    None => println!("{}\tunthrottled", scope),
                }
            }
        }
        Command::Check {
            scope,
            principal,
            remote_addr,
            forwarded_for,
            repeat,
        } => {
            let store = config.open_store().await?;
            let throttle = config.throttle(&scope, store)?;
            let meta = ConnectionMeta {
                remote_addr,
                forwarded_for,
                principal,
            };

            for _ in 0..repeat {
                let decision = throttle.check(&meta).await?;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
