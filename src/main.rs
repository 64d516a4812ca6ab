mod config;
mod core;
#[allow(dead_code)]
mod store;
mod sync;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = PathBuf::from("config.toml");

    // Handle CLI arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("hydra-sync {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("hydra-sync {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: hydra-sync [COMMAND]\n");
                println!("Commands:");
                println!("  sync-once    Run a single sync pass and exit");
                println!("\nOptions:");
                println!("  -h, --help       Print help");
                println!("  -V, --version    Print version");
                return Ok(());
            }
            "sync-once" => {
                let config = config::AppConfig::load(&config_path)?;
                let outcome = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()?
                    .block_on(crate::core::sync_once(config))?;
                match outcome {
                    sync::SyncOutcome::Completed { sessions } => {
                        println!("Synced {} session(s)", sessions);
                    }
                    sync::SyncOutcome::NoPendingWork => {
                        println!("Nothing to sync");
                    }
                    sync::SyncOutcome::AlreadyRunning => {
                        println!("Sync already in flight");
                    }
                    sync::SyncOutcome::TransmissionFailed { reason } => {
                        eprintln!("Sync failed: {}", reason);
                        std::process::exit(1);
                    }
                }
                return Ok(());
            }
            other => {
                eprintln!("Unknown command: {}", other);
                eprintln!("Run 'hydra-sync --help' for usage.");
                std::process::exit(2);
            }
        }
    }

    let config = config::AppConfig::load(&config_path)?;

    // Run async
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(crate::core::run(config))
}
