//! Procbridge - an HTTP front end that runs one worker process per request
//!
//! This library provides a bridge that:
//! - Accepts HTTP requests and describes each one to a fresh worker process
//!   through CGI-style environment variables
//! - Captures the worker's stdout and stderr separately and concurrently
//! - Decodes stdout as a single JSON document and returns it as the response
//! - Maps start failures, non-zero exits, undecodable output and timeouts to
//!   structured JSON errors
//! - Terminates the worker when the client disconnects or the deadline passes

pub mod config;
pub mod context;
pub mod decode;
pub mod environment;
pub mod error;
pub mod handler;
pub mod server;
pub mod worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
