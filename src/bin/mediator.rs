//! The mediator server binary.
//!
//! Runs the accept loop and a minimal operator REPL on stdin:
//!
//! ```text
//! status       list clients and their connections
//! shutdown     graceful teardown, connector last
//! close        force-close every socket immediately
//! quick_close  graceful teardown, then force-close the remainder
//! help         this text
//! ```
//!
//! Exit code is 0 on clean termination and 1 on an unhandled error.

use clap::Parser;
use screenlink::{JsonStore, Mediator, MediatorConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Remote-screen-sharing mediator - pairs peers and relays their streams
#[derive(Parser, Debug)]
#[command(name = "mediator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "2125")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path of the JSON credential store
    #[arg(short, long)]
    store: Option<String>,

    /// Worker refresh interval in milliseconds
    #[arg(long, default_value = "2000")]
    refresh_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("could not install the log subscriber");
        return ExitCode::from(1);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("mediator failed: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => {
            info!("loading config from {path:?}");
            MediatorConfig::from_file(path)?
        }
        None => MediatorConfig {
            bind_address: args.bind.parse()?,
            port: args.port,
            refresh_interval_ms: args.refresh_ms,
            ..Default::default()
        },
    };
    let store_path = args.store.unwrap_or_else(|| config.store_path.clone());
    let store = JsonStore::open(&store_path)?;

    let mediator = Mediator::new(config, Arc::new(store))?;
    let addr = mediator.start().await?;
    info!("mediator ready on {addr}");

    // Ctrl-C is a graceful shutdown, same as the `shutdown` command.
    let signal_handle = mediator.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupt received, shutting down");
        signal_handle.shutdown().await;
    });

    repl(&mediator).await;
    info!("mediator stopped");
    Ok(())
}

/// The operator REPL. Returns once the mediator is meant to exit.
async fn repl(mediator: &Mediator) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = wait_stopped(mediator) => return,
        };
        let command = match line {
            Ok(Some(line)) => line.trim().to_string(),
            // stdin closed: keep serving until a signal stops us.
            Ok(None) => {
                wait_stopped(mediator).await;
                return;
            }
            Err(e) => {
                error!("operator input failed: {e}");
                return;
            }
        };
        match command.as_str() {
            "status" => {
                let lines = mediator.status_lines();
                if lines.is_empty() {
                    println!("no clients connected");
                } else {
                    for line in lines {
                        println!("{line}");
                    }
                }
            }
            "shutdown" => {
                mediator.shutdown().await;
                return;
            }
            "close" => {
                mediator.close();
                return;
            }
            "quick_close" => {
                mediator.quick_close().await;
                return;
            }
            "help" => {
                println!("status       list clients and their connections");
                println!("shutdown     graceful teardown, connector last");
                println!("close        force-close every socket immediately");
                println!("quick_close  graceful teardown, then force-close the remainder");
                println!("help         this text");
            }
            "" => {}
            other => println!("unknown command {other:?}; try help"),
        }
    }
}

/// Resolves once the mediator has stopped running.
async fn wait_stopped(mediator: &Mediator) {
    while mediator.is_running() {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}
