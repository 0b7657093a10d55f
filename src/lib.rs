//! metrics-ingest: a minimal real-time metrics ingestion endpoint.
//!
//! Clients hold WebSocket connections open and push telemetry messages.
//! Each message is appended as one JSON line, stamped with its receipt
//! time, to a shared log file.
//!
//! - `websocket`: upgrade handshake, frame codec and framed channel
//! - `append_log`: line log safe across threads and processes
//! - `record`: JSON shaping of received messages
//! - `server`: accept loop and per-connection tasks
//! - `config`: CLI, environment and TOML configuration

pub mod append_log;
pub mod config;
pub mod record;
pub mod server;
pub mod websocket;
