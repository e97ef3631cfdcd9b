//! IPC Server - Unix socket server for the harness UI
//!
//! Every connection is a client of the interceptor. Commands are dispatched
//! to the shared [`Harness`].

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Method;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::harness::Harness;
use crate::interceptor::{FetchEvent, FetchOutcome, WorkerState};
use crate::ipc::protocol::{parse_command, serialize_response, Command, Response, PROTOCOL_VERSION};
use crate::net::Request;
use crate::usage::MIB;

/// IPC Server that listens for commands from the UI
pub struct IpcServer {
    harness: Arc<Harness>,
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(harness: Arc<Harness>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            harness,
            socket_path: socket_path.into(),
            listener: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale socket file
    pub async fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path).context("Failed to bind Unix socket")?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let harness = Arc::clone(&self.harness);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, harness).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Stop the IPC server and clean up
    pub async fn stop(&self) -> Result<()> {
        let clients = self.harness.interceptor.clients();
        if !clients.is_empty() {
            info!(clients = clients.len(), "Closing with clients still connected");
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("IPC server stopped");
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(stream: UnixStream, harness: Arc<Harness>) -> Result<()> {
    let clients = Arc::clone(harness.interceptor.clients());
    let client = clients.register();
    debug!(
        client = %client,
        controlled = clients.is_controlled(client),
        count = clients.len(),
        "New connection"
    );

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    // Newline-delimited JSON
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!(client = %client, "Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                debug!(command = %trimmed, "Received command");

                let (response, event) = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => process_command(command, &harness).await,
                    Err(e) => {
                        warn!(error = %e, command = %trimmed, "Failed to parse command");
                        let response = Response::Error {
                            error: format!("Invalid command: {}", e),
                        };
                        (response, None)
                    }
                };

                let written = match serialize_response(&response) {
                    Ok(json) => writer.write_all(&json).await,
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                        Ok(())
                    }
                };

                // Background revalidation outlives the reply, not the connection
                if let Some(event) = event {
                    debug!(pending = event.pending_count(), "Waiting for background work");
                    event.settled().await;
                }

                if let Err(e) = written {
                    error!(error = %e, "Failed to write response");
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    clients.unregister(client);
    debug!(client = %client, count = clients.len(), "Connection ended");

    Ok(())
}

fn mib_to_bytes(target_mib: Option<u64>) -> Result<Option<u64>, Response> {
    match target_mib {
        None => Ok(None),
        Some(0) => Err(Response::Error {
            error: "Target must be greater than zero".to_string(),
        }),
        Some(mib) => mib.checked_mul(MIB).map(Some).ok_or_else(|| Response::Error {
            error: format!("Target is too large: {} MiB", mib),
        }),
    }
}

/// Process a command and return a response.
///
/// For a fetch, the event is returned too; its background work must be
/// awaited once the response is delivered.
pub async fn process_command(
    command: Command,
    harness: &Harness,
) -> (Response, Option<FetchEvent>) {
    let response = match command {
        Command::Populate { target_mib } => {
            let target = match mib_to_bytes(target_mib) {
                Ok(target) => harness.target(target),
                Err(response) => return (response, None),
            };
            info!(target_bytes = target, "Processing populate command");

            match harness.usage.populate(target).await {
                Ok(report) => Response::Populated {
                    initial_bytes: report.initial_bytes,
                    final_bytes: report.final_bytes,
                    records_added: report.records_added,
                },
                Err(e) => Response::Error {
                    error: format!("Populate failed: {}", e),
                },
            }
        }

        Command::Remove { target_mib } => {
            let target = match mib_to_bytes(target_mib) {
                Ok(target) => harness.target(target),
                Err(response) => return (response, None),
            };
            info!("Processing remove command");

            match harness.usage.remove(target).await {
                Ok(report) => Response::Removed {
                    before_bytes: report.before_bytes,
                    after_bytes: report.after_bytes,
                },
                Err(e) => Response::Error {
                    error: format!("Remove failed: {}", e),
                },
            }
        }

        Command::Usage { target_mib } => {
            let target = match mib_to_bytes(target_mib) {
                Ok(target) => harness.target(target),
                Err(response) => return (response, None),
            };

            match harness.usage.get_usage().await {
                Ok(usage_bytes) => Response::Usage {
                    usage_bytes,
                    target_bytes: target,
                },
                Err(e) => Response::Error {
                    error: format!("Usage query failed: {}", e),
                },
            }
        }

        Command::Persist => match harness.quota.persist().await {
            Ok(persistent) => Response::Persistence { persistent },
            Err(e) => Response::Error {
                error: format!("Persistence request failed: {}", e),
            },
        },

        Command::IsPersistent => match harness.quota.persisted().await {
            Ok(persistent) => Response::Persistence { persistent },
            Err(e) => Response::Error {
                error: format!("Persistence query failed: {}", e),
            },
        },

        Command::Notification => match harness.permissions.request_permission().await {
            Ok(permission) => {
                info!(permission = %permission, "Notification permission");
                Response::Notification { permission }
            }
            Err(e) => Response::Error {
                error: format!("Permission request failed: {}", e),
            },
        },

        Command::Estimate => match harness.quota.estimate().await {
            Ok(estimate) => Response::Estimate {
                quota_bytes: estimate.quota_bytes,
                usage_bytes: estimate.usage_bytes,
            },
            Err(e) => Response::Error {
                error: format!("Estimate failed: {}", e),
            },
        },

        Command::Fetch { path, method } => return process_fetch(&path, method, harness).await,

        Command::GetStatus => {
            debug!("Processing getStatus command");

            let state = harness.interceptor.state();
            Response::Status {
                version: PROTOCOL_VERSION,
                healthy: state != WorkerState::Redundant,
                worker_state: state.to_string(),
                clients: harness.interceptor.clients().len(),
                usage_bytes: harness.usage.get_usage().await.ok(),
            }
        }
    };

    (response, None)
}

async fn process_fetch(
    path: &str,
    method: Option<String>,
    harness: &Harness,
) -> (Response, Option<FetchEvent>) {
    let method = match method {
        None => Method::GET,
        Some(m) => match Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                let response = Response::Error {
                    error: format!("Invalid method '{}'", m),
                };
                return (response, None);
            }
        },
    };

    let url = match harness.interceptor.resolve(path) {
        Ok(url) => url,
        Err(e) => {
            return (
                Response::Error {
                    error: e.to_string(),
                },
                None,
            )
        }
    };

    let event = FetchEvent::new(Request::new(method, url));
    let response = match harness.interceptor.handle_fetch(&event).await {
        Ok(FetchOutcome::Respond(response)) => Response::Fetched {
            status: response.status,
            headers: response.headers,
            body: BASE64.encode(&response.body),
        },
        Ok(FetchOutcome::Passthrough) => Response::Passthrough,
        Err(e) => Response::Error {
            error: format!("Fetch failed: {}", e),
        },
    };

    (response, Some(event))
}
