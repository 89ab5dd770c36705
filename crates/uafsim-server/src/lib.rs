//! TCP front end and rehearsal tooling for the uafsim chunk registry.
//!
//! This crate provides:
//! - Protocol: wire codec for `COMMAND[:PAYLOAD]` frames and their replies
//! - Dispatcher: maps each decoded request to one registry operation
//! - Server: thread-per-connection TCP listener with a shared registry
//! - Client: blocking one-frame-one-reply client
//! - Scenarios: scripted rehearsal sets with expected replies and reports
//! - Structured logging: JSONL events for connections and commands

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod scenario;
pub mod server;
pub mod structured_log;

pub use client::{Client, ClientError};
pub use config::ServerConfig;
pub use dispatcher::{Dispatch, Dispatcher};
pub use protocol::{AllocRequest, Command, ProtocolError, Request, Response};
pub use scenario::{RehearsalReport, ScenarioError, ScenarioReport, ScenarioRunner, ScenarioSet};
pub use server::{Server, ServerError, ServerHandle};
pub use structured_log::{LogEmitter, LogEntry, LogLevel, SharedLog};
