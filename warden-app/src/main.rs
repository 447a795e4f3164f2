//! `warden` binary entry point: parses the CLI options surface (config path, admin address
//! override, restart epoch, concurrency, flags directory) then drives `ServerInstance` through
//! bootstrap and `run`. Failure policy: any error surfacing from bootstrap or run is logged
//! critical and the process exits 1; a clean return from `run` exits 0.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use warden::config::{Config, FlagsPath};
use warden::server::{RestartPaths, ServerInstance};
use warden_core::telemetry;
use warden_core::version::BuildInfo;

/// Options surface used by the core: config path, admin address override, restart epoch,
/// concurrency (default 1), plus the server-flags directory.
#[derive(Parser, Debug)]
#[command(name = "warden", about = "Supervisory core of a multi-threaded L4/L7 proxy", long_about = None)]
#[command(disable_version_flag = true)]
struct Options {
	/// Path to the JSON or YAML configuration file.
	#[arg(long, value_name = "path")]
	config: Option<PathBuf>,

	/// Epoch of this process in a hot-restart chain. 0 means "no parent".
	#[arg(long, default_value_t = 0)]
	restart_epoch: u32,

	/// Overrides the configured worker thread count.
	#[arg(long, value_name = "n")]
	concurrency: Option<usize>,

	/// Overrides the configured admin listener address.
	#[arg(long, value_name = "addr")]
	admin_address: Option<SocketAddr>,

	/// Directory holding ephemeral server flag files (e.g. `drain`).
	#[arg(long, value_name = "dir", default_value = "/tmp/warden-flags")]
	flags_path: PathBuf,

	/// Directory holding hot-restart rendezvous sockets shared between epochs.
	#[arg(long, value_name = "dir", default_value = "/tmp/warden-restart")]
	restart_dir: PathBuf,

	/// Print build version information and exit.
	#[arg(long = "version")]
	version: bool,
}

fn main() -> anyhow::Result<()> {
	let _log_flush = telemetry::setup_logging();

	let opts = Options::parse();
	if opts.version {
		println!("{}", BuildInfo::new());
		return Ok(());
	}

	std::fs::create_dir_all(&opts.flags_path).ok();
	std::fs::create_dir_all(&opts.restart_dir).ok();

	let config = match &opts.config {
		Some(path) => Config::load(path, opts.restart_epoch, opts.concurrency)?,
		None => Config::from_raw(Default::default(), opts.restart_epoch, opts.concurrency),
	};
	let config = match opts.admin_address {
		Some(addr) => Config { admin_address: addr, ..config },
		None => config,
	};

	let flags_path = FlagsPath(opts.flags_path);
	let restart_paths = RestartPaths { base_dir: opts.restart_dir };

	match ServerInstance::bootstrap(config, flags_path, restart_paths).and_then(ServerInstance::run) {
		Ok(()) => Ok(()),
		Err(e) => {
			error!(error = %e, "fatal error, exiting");
			std::process::exit(1);
		},
	}
}
