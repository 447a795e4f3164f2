// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::env;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;

pub static APPLICATION_START_TIME: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);

type LogHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

fn default_filter() -> String {
	env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
}

/// Installs the global tracing subscriber. Returns a guard that must be held for the
/// lifetime of the process; dropping it flushes any buffered log lines.
pub fn setup_logging() -> tracing_appender::non_blocking::WorkerGuard {
	Lazy::force(&APPLICATION_START_TIME);
	let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
	let filter = EnvFilter::try_new(default_filter()).unwrap_or_else(|_| EnvFilter::new("info"));
	let (filter, handle) = reload::Layer::new(filter);
	let _ = LOG_HANDLE.set(handle);
	tracing_subscriber::registry()
		.with(filter)
		.with(
			tracing_subscriber::fmt::layer()
				.with_writer(non_blocking)
				.with_ansi(false),
		)
		.init();
	guard
}

#[derive(Error, Debug)]
pub enum Error {
	#[error("parse failure: {0}")]
	InvalidFilter(#[from] ParseError),
	#[error("reload failure: {0}")]
	Reload(#[from] reload::Error),
	#[error("logging is not initialized")]
	Uninitialized,
}

/// Mirrors the admin `/logging` endpoint contract: report the currently active filter.
pub fn get_current_loglevel() -> Result<String, Error> {
	let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
	Ok(handle.with_current(|f| f.to_string())?)
}

/// Mirrors the admin `/logging` endpoint contract: replace (or extend) the active filter.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
	let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
	let new_directive = if reset {
		if level.is_empty() {
			default_filter()
		} else {
			format!("{},{}", default_filter(), level)
		}
	} else {
		let current = handle.with_current(|f| f.to_string())?;
		format!("{current},{level}")
	};
	let new_filter = EnvFilter::try_new(&new_directive)?;
	handle.reload(new_filter)?;
	Ok(())
}
