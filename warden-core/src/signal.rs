// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use tokio::sync::mpsc;

/// The unified shutdown path: SIGTERM and the admin `/quitquitquit` route (and, internally, a
/// worker that lost a bind race) all resolve to the same `ShutdownTrigger::shutdown_now`, so
/// there is exactly one way the process winds down.
pub struct Shutdown {
	shutdown_tx: mpsc::Sender<()>,
	shutdown_rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
		Shutdown {
			shutdown_tx,
			shutdown_rx,
		}
	}

	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			shutdown_tx: self.shutdown_tx.clone(),
		}
	}

	/// Completes once SIGTERM arrives or a trigger fires, whichever is first.
	pub async fn wait(mut self) {
		imp::wait_for_sigterm_or_trigger(&mut self.shutdown_rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.shutdown_tx.send(()).await;
	}
}

#[cfg(unix)]
mod imp {
	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait_for_sigterm_or_trigger(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
			_ = receiver.recv() => { info!("received explicit shutdown signal") }
		};
	}

	async fn watch_signal(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received signal {name}, starting shutdown");
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait_for_sigterm_or_trigger(receiver: &mut Receiver<()>) {
		// No POSIX signals on this platform; only the explicit trigger can shut us down.
		receiver.recv().await;
		info!("received explicit shutdown signal");
	}
}

/// Installs the SIGUSR1 log-rotate hook: each delivery invokes `reopen`, which the
/// caller wires to its access-log subsystem's reopen routine, and the task runs for the life of
/// the process.
#[cfg(unix)]
pub fn spawn_sigusr1_log_rotate_handler<F>(mut reopen: F)
where
	F: FnMut() + Send + 'static,
{
	use tokio::signal::unix::{SignalKind, signal};
	use tracing::info;

	tokio::spawn(async move {
		let mut sig = match signal(SignalKind::user_defined1()) {
			Ok(s) => s,
			Err(e) => {
				tracing::warn!("failed to register SIGUSR1 handler: {e}");
				return;
			},
		};
		loop {
			sig.recv().await;
			info!("received SIGUSR1, reopening access logs");
			reopen();
		}
	});
}

#[cfg(not(unix))]
pub fn spawn_sigusr1_log_rotate_handler<F>(_reopen: F)
where
	F: FnMut() + Send + 'static,
{
}

/// SIGHUP is explicitly ignored: hot restart is the only supported config-reload
/// mechanism. We still register a handler rather than leaving the OS default in place, so the
/// decision to ignore it is visible and doesn't silently terminate the process on some platforms'
/// default disposition.
#[cfg(unix)]
pub fn spawn_sighup_ignore_handler() {
	use tokio::signal::unix::{SignalKind, signal};
	use tracing::info;

	tokio::spawn(async move {
		let mut sig = match signal(SignalKind::hangup()) {
			Ok(s) => s,
			Err(e) => {
				tracing::warn!("failed to register SIGHUP handler: {e}");
				return;
			},
		};
		loop {
			sig.recv().await;
			info!("received SIGHUP, ignoring (hot restart is the supported reload path)");
		}
	});
}

#[cfg(not(unix))]
pub fn spawn_sighup_ignore_handler() {}
