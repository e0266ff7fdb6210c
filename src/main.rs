//! TigerTunes relay server binary.
//!
//! See the `tigertunes_server` library for the core functionality.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;
use tigertunes_server::{app, Config};

/// mimalloc handles the many small, short-lived chunk buffers better than
/// the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "tigertunes-server")]
#[command(about = "Low-latency audio and playback-event relay for TigerTunes clients", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay
    Start(StartArgs),
    /// Print the effective configuration
    Config,
}

/// Flags that override the loaded configuration.
#[derive(Args, Debug, Default)]
struct StartArgs {
    /// Interface to bind both listeners to
    #[arg(long)]
    host: Option<String>,
    /// Audio stream port
    #[arg(long)]
    audio_port: Option<u16>,
    /// Metadata stream port
    #[arg(long)]
    metadata_port: Option<u16>,
    /// Path to the audio producer executable
    #[arg(long)]
    producer: Option<PathBuf>,
    /// Path to the transformer executable
    #[arg(long)]
    transformer: Option<PathBuf>,
    /// Directory handed to the producer as --config_dir
    #[arg(long)]
    producer_config_dir: Option<PathBuf>,
    /// Seconds to wait for the producer to authenticate
    #[arg(long)]
    ready_timeout: Option<u64>,
}

impl StartArgs {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.audio_port {
            config.audio_port = port;
        }
        if let Some(port) = self.metadata_port {
            config.metadata_port = port;
        }
        if let Some(path) = self.producer {
            config.producer_path = path;
        }
        if let Some(path) = self.transformer {
            config.transformer_path = path;
        }
        if let Some(dir) = self.producer_config_dir {
            config.producer_config_dir = dir;
        }
        if let Some(secs) = self.ready_timeout {
            config.ready_timeout_secs = secs;
        }
    }
}

fn init_logging() {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    // TIGERTUNES_LOG_FILE sends logs to a file instead of stderr
    if let Ok(path) = std::env::var("TIGERTUNES_LOG_FILE") {
        match std::fs::File::create(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Failed to create log file at {path:?}: {e}; logging to stderr"),
        }
    }
    builder.init();

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => {
            let mut config = Config::load()?;
            args.apply(&mut config);
            log::info!("TigerTunes relay v{} starting", env!("CARGO_PKG_VERSION"));
            app::run(config).await?;
        }
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_flags_override_config() {
        let cli = Cli::try_parse_from([
            "tigertunes-server",
            "start",
            "--audio-port",
            "6001",
            "--producer",
            "/opt/bin/producer",
            "--ready-timeout",
            "30",
        ])
        .unwrap();

        let Commands::Start(args) = cli.command else {
            panic!("expected start command");
        };
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.audio_port, 6001);
        assert_eq!(config.producer_path, PathBuf::from("/opt/bin/producer"));
        assert_eq!(config.ready_timeout_secs, 30);
        assert_eq!(config.metadata_port, Config::default().metadata_port);
    }

    #[test]
    fn test_config_subcommand_parses() {
        let cli = Cli::try_parse_from(["tigertunes-server", "config"]).unwrap();
        assert!(matches!(cli.command, Commands::Config));
    }
}
