//! Vigil: an HTTP server with a managed lifecycle.
//!
//! This is the application entry point. It parses flags, loads configuration,
//! initializes tracing, and then either stops a running instance through its
//! PID file, detaches into the background, or serves the demo router until a
//! signal stops it.
//!
//! Remote stop and daemonization rely on unix signals and process groups, so
//! the binary is unix-only.

#![cfg_attr(not(unix), allow(dead_code, unused_imports))]

#[cfg(unix)]
mod routes;

use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vigil::access_log::FormattedAccessLog;
use vigil::config::{default_config_file, AppConfig, DEFAULT_ENV, DEFAULT_LOG_FILTER};
use vigil::{LifecycleManager, Server};

#[cfg(not(unix))]
fn main() {
    eprintln!("vigil: this platform is not supported (unix required)");
    std::process::exit(1);
}

/// Vigil: HTTP server with PID-file guard, graceful drain and remote stop
#[derive(Parser, Debug)]
#[command(name = "vigil", version, about)]
struct Args {
    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    addr: Option<String>,

    /// PID file path, overrides the config file
    #[arg(long)]
    pid: Option<PathBuf>,

    /// Path to configuration file (default: <executable>.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment section of the config file to apply
    #[arg(short, long, default_value = DEFAULT_ENV)]
    env: String,

    /// Run the server in the background
    #[arg(short, long)]
    daemon: bool,

    /// Stop the server recorded in the PID file and exit
    #[arg(long, conflicts_with_all = ["daemon", "restart"])]
    stop: bool,

    /// Stop the running server, then start a new one in the background
    #[arg(long)]
    restart: bool,

    /// Log level filter (e.g., "vigil=debug,hyper=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[cfg(unix)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Explicit config files must load; the implicit default is optional
    let mut config = match &args.config {
        Some(path) => AppConfig::load(path, &args.env)?,
        None => {
            let path = default_config_file();
            if path.exists() {
                AppConfig::load(&path, &args.env)?
            } else {
                AppConfig::defaults(&args.env)
            }
        }
    };
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(pid) = args.pid {
        config.server.pid_file = pid;
    }

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.is_json() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!(env = %config.env, addr = %config.server.addr, "Loaded configuration");

    if args.stop || args.restart {
        stop_running(&config).await;
        if args.stop {
            return Ok(());
        }
    }

    if args.daemon || args.restart {
        let pid = vigil::daemon::daemonize()?;
        println!("Server started in background, PID {}", pid);
        return Ok(());
    }

    let manager = LifecycleManager::new();
    manager.start()?;

    let access_log = Arc::new(FormattedAccessLog::stdout(&config.access_log));
    let server = Server::builder(config.server.clone())
        .manager(&manager)
        .access_log(access_log.clone())
        .build();

    server.on_stop(move || {
        access_log.flush()?;
        Ok(())
    });

    let app = routes::create_router(&config);
    tracing::info!("Starting server at {}", config.server.addr);

    server.serve(app).await?;
    manager.stop();

    Ok(())
}

/// Stop the instance recorded in the PID file. Exits the process on failure.
#[cfg(unix)]
async fn stop_running(config: &AppConfig) {
    use vigil::remote::{force_kill, stop_remote, RemoteStopError};

    println!("Stopping server...");

    match stop_remote(&config.server.pid_file).await {
        Ok(_) => println!("Server stopped!"),
        Err(RemoteStopError::Timeout { pid, waited }) if std::io::stdin().is_terminal() => {
            eprintln!("Server (PID {}) did not stop within {:?}.", pid, waited);
            if !confirm("Force kill? [y/N] ") {
                std::process::exit(1);
            }
            if let Err(e) = force_kill(pid) {
                eprintln!("{}", e);
                std::process::exit(1);
            }
            // A killed server cannot remove its own PID file
            let stale = vigil::PidFile::with_pid(&config.server.pid_file, pid);
            if let Err(e) = stale.release() {
                eprintln!("{}", e);
                std::process::exit(1);
            }
            println!("Server killed!");
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{}", prompt);
    if std::io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
        Err(_) => false,
    }
}
