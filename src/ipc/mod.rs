//! IPC server for the harness UI

pub mod protocol;
pub mod server;

pub use protocol::{Command, Response};
pub use server::{process_command, IpcServer};
