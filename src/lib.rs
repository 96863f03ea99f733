//! rspeed - a network speed-test server
//!
//! This library provides the server side of a throughput test together with
//! a small client. Clients measure download speed by reading an endless
//! stream of pattern data and upload speed by sending data the server counts
//! and discards.
//!
//! # Features
//!
//! - Unbounded download streams with cooperative cancellation
//! - Upload sink that always reports the bytes it received
//! - Latency ping, server discovery and client IP detection
//! - Graceful shutdown of in-flight calls
//! - Asynchronous I/O using tokio

pub mod client;
pub mod config;
pub mod context;
pub mod discovery;
pub mod download;
pub mod error;
pub mod pattern;
pub mod protocol;
pub mod server;
pub mod service;
pub mod stream;
pub mod upload;

pub use client::{Client, TransferReport};
pub use config::Config;
pub use context::Context;
pub use error::{Code, Error, Result, Status};
pub use server::Server;
pub use service::SpeedTestService;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
