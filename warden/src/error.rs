//! Typed errors for the boundaries that need one: configuration, listener binding, and the
//! hot-restart RPC wire. Everything else bubbles up as `anyhow::Error` and is handled by the top
//! of main (fatal) or logged-and-dropped (transient), per policy.

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	Read {
		path: String,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config as JSON or YAML: {0}")]
	Parse(String),
}

/// A bind race lost to another process surfaces as an `io::Error` from `ListenSocket::bind`
/// (`EADDRINUSE`), wrapped here rather than given its own variant - caught per-worker, logged,
/// and resolved via the unified self-SIGTERM exit path rather than propagated.
#[derive(Error, Debug)]
pub enum ListenError {
	#[error("failed to bind {addr}: {source}")]
	Bind {
		addr: SocketAddr,
		#[source]
		source: std::io::Error,
	},
}

/// Never propagated across a dispatcher boundary - only logged and counted.
#[derive(Error, Debug)]
pub enum RpcError {
	#[error("I/O error talking to parent: {0}")]
	Io(#[from] std::io::Error),
	#[error("failed to decode RPC body: {0}")]
	Decode(#[from] serde_json::Error),
	#[error("parent process is gone")]
	ParentGone,
	#[error("no file descriptor was passed with the reply")]
	MissingFd,
}
