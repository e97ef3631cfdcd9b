//! Storage Harness - exercise local storage quota and persistence
//!
//! Fills a record store with random data up to a target, measures and
//! clears it, and serves a small set of static resources through a cache
//! interceptor.

mod cache;
mod config;
mod harness;
mod interceptor;
mod ipc;
mod net;
mod quota;
mod records;
mod storage_root;
mod usage;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::env;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::HarnessConfig;
use harness::{cleanup_stale_writes, run_startup_checks, Harness};
use interceptor::WorkerState;
use ipc::{process_command, IpcServer, Response};
use usage::to_mib;

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run IPC server mode (default)
    Serve,
    /// Any command the IPC protocol accepts, run once
    Once(ipc::Command),
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Storage Harness - Exercise local storage quota and persistence

USAGE:
    storage-harness                      # Run IPC server (default)
    storage-harness serve
    storage-harness populate [MiB]
    storage-harness remove [MiB]
    storage-harness usage [MiB]
    storage-harness persist
    storage-harness is-persistent
    storage-harness notification
    storage-harness estimate
    storage-harness fetch <path> [method]
    storage-harness help

COMMANDS:
    serve          Install the interceptor and wait for commands on the socket
    populate       Append random 10 MiB records until usage reaches the target
    remove         Delete every record
    usage          Print usage against the target
    persist        Request persistent storage
    is-persistent  Print whether storage is persistent
    notification   Request notification permission
    estimate       Print quota and usage of the storage root
    fetch          Fetch a resource through the cache interceptor
    help           Show this help message

ENVIRONMENT:
    HARNESS_ROOT           Storage root directory
    HARNESS_ORIGIN         Origin static resources are fetched from
    HARNESS_TARGET_MIB     Default target (12288)
    HARNESS_QUOTA_MIB      Fixed quota; free disk space when unset
    HARNESS_CACHE          Cache backend: disk or memory
    HARNESS_CACHE_NAME     Cache name (storage-testing)
    HARNESS_MANIFEST       Comma-separated resources cached at install
    HARNESS_NOTIFICATIONS  Notification answer: granted, default or denied
    HARNESS_SOCKET         IPC socket path
    RUST_LOG               Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_target(arg: Option<&String>) -> Result<Option<u64>> {
    arg.map(|value| {
        value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("Target must be a whole number of MiB, got '{}'", value))
    })
    .transpose()
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Serve);
    }

    let command = match args[1].as_str() {
        "serve" => return Ok(Command::Serve),
        "help" | "--help" | "-h" => return Ok(Command::Help),
        "populate" => ipc::Command::Populate {
            target_mib: parse_target(args.get(2))?,
        },
        "remove" => ipc::Command::Remove {
            target_mib: parse_target(args.get(2))?,
        },
        "usage" => ipc::Command::Usage {
            target_mib: parse_target(args.get(2))?,
        },
        "persist" => ipc::Command::Persist,
        "is-persistent" => ipc::Command::IsPersistent,
        "notification" => ipc::Command::Notification,
        "estimate" => ipc::Command::Estimate,
        "fetch" => {
            let path = args
                .get(2)
                .ok_or_else(|| anyhow!("Usage: storage-harness fetch <path> [method]"))?;
            ipc::Command::Fetch {
                path: path.clone(),
                method: args.get(3).cloned(),
            }
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            return Ok(Command::Help);
        }
    };
    Ok(Command::Once(command))
}

/// Print a one-shot result; errors become the process result
fn print_response(response: Response) -> Result<()> {
    match response {
        Response::Error { error } => return Err(anyhow!(error)),
        Response::Usage {
            usage_bytes,
            target_bytes,
        } => println!("Usage at {}/{} MiB", to_mib(usage_bytes), to_mib(target_bytes)),
        Response::Populated {
            initial_bytes,
            final_bytes,
            records_added,
        } => println!(
            "Populated {} -> {} MiB ({} records added)",
            to_mib(initial_bytes),
            to_mib(final_bytes),
            records_added
        ),
        Response::Removed {
            before_bytes,
            after_bytes,
        } => println!(
            "Removed {} -> {} MiB",
            to_mib(before_bytes),
            to_mib(after_bytes)
        ),
        Response::Persistence { persistent } => {
            println!("{}", if persistent { "Persistent" } else { "Temporary" })
        }
        Response::Notification { permission } => println!("Notification permission: {}", permission),
        Response::Estimate {
            quota_bytes,
            usage_bytes,
        } => println!("Quota/Usage: {}/{} MiB", to_mib(quota_bytes), to_mib(usage_bytes)),
        Response::Fetched {
            status,
            headers,
            body,
        } => {
            println!("HTTP {}", status);
            for (name, value) in headers {
                println!("{}: {}", name, value);
            }
            let body = BASE64.decode(body)?;
            println!();
            println!("{}", String::from_utf8_lossy(&body));
        }
        Response::Passthrough => println!("Not intercepted"),
        Response::Status {
            worker_state,
            clients,
            ..
        } => println!("Interceptor {} with {} clients", worker_state, clients),
    }
    Ok(())
}

async fn serve(harness: Arc<Harness>, config: &HarnessConfig) -> Result<()> {
    info!(root = %config.storage_root.display(), "Starting storage harness in IPC server mode");

    cleanup_stale_writes(config).await;
    run_startup_checks(harness.quota.as_ref()).await;

    // A failed install leaves the interceptor redundant; usage commands still work
    if harness.interceptor.install().await.is_ok() {
        if let Err(e) = harness.interceptor.activate().await {
            warn!(error = %e, "Interceptor activation failed");
        }
    }
    if harness.interceptor.state() != WorkerState::Activated {
        warn!(state = %harness.interceptor.state(), "Serving without an active interceptor");
    }

    let mut ipc_server = IpcServer::new(Arc::clone(&harness), &config.socket_path);
    if let Err(e) = ipc_server.start().await {
        error!(error = %e, "Failed to start IPC server");
        return Err(e);
    }
    let ipc_server = Arc::new(ipc_server);

    info!(socket_path = %ipc_server.socket_path().display(), "Harness ready. Waiting for commands...");

    let running = Arc::clone(&ipc_server);
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = running.run().await {
            error!(error = %e, "IPC server error");
        }
    });

    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal");
    ipc_handle.abort();
    ipc_server.stop().await?;

    info!("Shutdown complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config = HarnessConfig::from_env()?;
    let harness = Arc::new(Harness::from_config(&config)?);

    match command {
        Command::Serve => serve(harness, &config).await,
        Command::Once(command) => {
            let (response, event) = process_command(command, &harness).await;
            let printed = print_response(response);
            if let Some(event) = event {
                event.settled().await;
            }
            printed
        }
        Command::Help => Ok(()),
    }
}
