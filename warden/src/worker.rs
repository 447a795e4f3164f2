//! `Worker`: owns one OS thread, one dispatcher, one `ConnectionHandler`, and a registration in
//! the guard dog. Construction on the main thread reserves the thread identity;
//! `initialize_configuration` is what actually spawns the OS thread and wires up listeners.

use std::sync::Arc;
use std::sync::mpsc as std_mpsc;

use tracing::info;
use warden_core::drain::DrainManager;
use warden_core::watchdog::GuardDog;

use crate::config::Config;
use crate::connection_handler::ConnectionHandlerHandle;
use crate::dispatcher::{Dispatcher, ExitTrigger};
use crate::listener::SocketMap;
use crate::stats::Stats;

/// Raised when a worker thread's setup loses a bind race for a freshly-bound (not inherited)
/// listener. Carries no socket address because the failure surfaces after sockets have already
/// been handed to the worker as an opaque map - callers only need to know *that* a worker failed
/// to come up, to drive the unified shutdown path.
#[derive(Debug, thiserror::Error)]
#[error("worker lost a listener bind race or failed to start")]
pub struct CreateListenerException;

enum WorkerState {
	/// Constructed but no OS thread exists yet - only the thread-local slot is reserved.
	Constructed,
	Running {
		exit: ExitTrigger,
		join: std::thread::JoinHandle<()>,
	},
	Joined,
}

pub struct Worker {
	index: usize,
	state: WorkerState,
}

/// Carries only `Send` data across the ready channel - notably not `DispatcherHandle`, which
/// wraps an `mpsc::UnboundedSender<BoxedTask>` over `!Send` futures (so `post`/`post_fn` can
/// carry the `!Send` `Rc<RefCell<_>>`-based `ConnectionHandlerHandle`, per the dispatcher's own
/// doc comment) and is therefore itself `!Send`. `std::thread::Builder::spawn` requires its
/// closure to be `Send + 'static`, so nothing `!Send` may cross this channel; the worker's
/// dispatcher handle never needs to leave the thread that owns it anyway.
type ReadyMsg = Result<ExitTrigger, CreateListenerException>;

impl Worker {
	/// Constructed on the main thread - no OS thread yet, so thread-local slots register early.
	pub fn new(index: usize) -> Self {
		Worker {
			index,
			state: WorkerState::Constructed,
		}
	}

	pub fn index(&self) -> usize {
		self.index
	}

	/// Spawns the OS thread and runs its entry point to completion of setup: creates a WatchDog,
	/// starts its touch timer, registers every listener, then blocks the
	/// thread running the dispatcher. Returns once the thread is up and listeners are armed, or
	/// `CreateListenerException` if duplicating/binding a listener's socket failed.
	pub fn initialize_configuration(&mut self, config: Arc<Config>, socket_map: SocketMap, guard_dog: Arc<GuardDog>, drain: DrainManager, stats: Arc<Stats>) -> Result<(), CreateListenerException> {
		let index = self.index;
		let (ready_tx, ready_rx) = std_mpsc::channel::<ReadyMsg>();

		let join = std::thread::Builder::new()
			.name(format!("worker-{index}"))
			.spawn(move || {
				let dispatcher = match Dispatcher::new() {
					Ok(d) => d,
					Err(e) => {
						tracing::error!(error = %e, "failed to build worker runtime");
						let _ = ready_tx.send(Err(CreateListenerException));
						return;
					},
				};
				let handle = dispatcher.handle();
				let exit = dispatcher.exit_trigger();

				let watchdog = guard_dog.create_watch_dog(std::thread::current().id(), format!("worker-{index}"));
				let connection_handler = ConnectionHandlerHandle::new(drain);

				// Duplicating each shared `ListenSocket` for this thread is the one fallible step
				// in worker start-up (a lost bind race surfaces as an I/O error here) - it is done
				// synchronously, under `enter()`, before the worker reports itself ready, so a
				// `CreateListenerException` is known before any caller could observe a half-armed
				// worker.
				let duplicated = match duplicate_listeners(&config, &socket_map, &dispatcher) {
					Ok(d) => d,
					Err(e) => {
						let _ = ready_tx.send(Err(e));
						guard_dog.stop_watching(&watchdog);
						return;
					},
				};
				let _ = ready_tx.send(Ok(exit));

				// `add_listener` spawns via `spawn_local`, which needs an active `LocalSet` - that
				// only exists once `dispatcher.run()` starts below, so registration is posted
				// rather than done inline. It still runs on the very first turn of the loop,
				// before any connection can arrive on a listener nobody has armed yet.
				for (lc, tokio_listener) in duplicated {
					let connection_handler = connection_handler.clone();
					handle.post_fn(move || connection_handler.add_listener(lc, tokio_listener));
				}

				let watchdog_for_timer = watchdog.clone();
				let connection_handler_for_timer = connection_handler.clone();
				let miss_interval = config.watchdog.miss_margin / 2;
				handle.post(async move {
					let mut ticker = tokio::time::interval(if miss_interval.is_zero() {
						std::time::Duration::from_millis(500)
					} else {
						miss_interval
					});
					let mut last_reported: i64 = 0;
					loop {
						ticker.tick().await;
						watchdog_for_timer.touch();
						// Spreads closes over time by polling each live connection rather than
						// traversing a central drain set.
						connection_handler_for_timer.poll_drain();
						let current = connection_handler_for_timer.num_connections() as i64;
						stats.adjust_num_connections(current - last_reported);
						last_reported = current;
					}
				});

				info!(worker = index, "worker thread running");
				dispatcher.run();
				guard_dog.stop_watching(&watchdog);
				info!(worker = index, "worker thread exited");
			})
			.expect("failed to spawn worker thread");

		match ready_rx.recv() {
			Ok(Ok(exit)) => {
				self.state = WorkerState::Running { exit, join };
				Ok(())
			},
			Ok(Err(e)) => {
				let _ = join.join();
				Err(e)
			},
			Err(_) => {
				let _ = join.join();
				Err(CreateListenerException)
			},
		}
	}

	/// Posts a loop-exit task; the caller must still `join()` separately.
	pub fn exit(&self) {
		if let WorkerState::Running { exit, .. } = &self.state {
			exit.exit();
		}
	}

	pub fn join(&mut self) {
		if let WorkerState::Running { join, .. } = std::mem::replace(&mut self.state, WorkerState::Joined) {
			let _ = join.join();
		}
	}
}

/// Duplicates each configured listener's shared socket for this worker thread. A listener with
/// no entry in `socket_map` is a UDS-style per-worker listener, out of scope for this core. Runs
/// under `dispatcher.enter()` so `TcpListener::from_std` sees a valid reactor context despite
/// running before `LocalSet` starts.
fn duplicate_listeners(config: &Arc<Config>, socket_map: &SocketMap, dispatcher: &Dispatcher) -> Result<Vec<(Arc<crate::config::ListenerConfig>, tokio::net::TcpListener)>, CreateListenerException> {
	let _guard = dispatcher.enter();
	let mut out = Vec::new();
	for lc in &config.listeners {
		let Some(socket) = socket_map.get(lc) else {
			continue;
		};
		let tokio_listener = socket.duplicate_for_worker().map_err(|e| {
			tracing::warn!(listener = lc.name, error = %e, "failed to duplicate listen socket for worker");
			CreateListenerException
		})?;
		out.push((lc.clone(), tokio_listener));
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use warden_core::watchdog::{GuardDog, GuardDogConfig, NoopMetrics};

	use super::*;
	use crate::config::{Config, FilterChainFactory, ListenerConfig, NullFilterChainFactory, WatchdogMargins};
	use crate::stats::Stats;

	fn guard_dog() -> Arc<GuardDog> {
		GuardDog::new(
			GuardDogConfig {
				miss_margin: Duration::from_secs(5),
				megamiss_margin: Duration::from_secs(10),
				kill_timeout: Duration::ZERO,
				multikill_timeout: Duration::ZERO,
			},
			Arc::new(NoopMetrics),
		)
	}

	fn empty_config() -> Arc<Config> {
		Arc::new(Config {
			concurrency: 1,
			admin_address: "127.0.0.1:0".parse().unwrap(),
			listeners: Vec::new(),
			drain_timeout: Duration::from_secs(60),
			parent_shutdown_time: Duration::from_secs(60),
			stats_flush_interval: Duration::from_secs(5),
			watchdog: WatchdogMargins {
				miss_margin: Duration::from_secs(1),
				megamiss_margin: Duration::from_secs(2),
				kill_timeout: Duration::ZERO,
				multikill_timeout: Duration::ZERO,
			},
			restart_epoch: 0,
		})
	}

	/// An empty config brings a worker up with zero listeners, and `exit` followed by `join`
	/// tears it down cleanly.
	#[test]
	fn empty_config_worker_starts_and_exits_cleanly() {
		let mut worker = Worker::new(0);
		let result = worker.initialize_configuration(
			empty_config(),
			SocketMap::new(),
			guard_dog(),
			DrainManager::new(Duration::from_secs(60)),
			Arc::new(Stats::new()),
		);
		assert!(result.is_ok());
		worker.exit();
		worker.join();
	}

	/// A listener whose shared socket's underlying fd has already gone bad (the bind-race case,
	/// simulated here by closing the fd out from under the `ListenSocket` rather than by racing a
	/// second process) surfaces as `CreateListenerException` rather than panicking or hanging the
	/// worker thread.
	#[test]
	fn broken_listener_socket_surfaces_as_create_listener_exception() {
		let factory: Arc<dyn FilterChainFactory> = Arc::new(NullFilterChainFactory);
		let lc = Arc::new(ListenerConfig {
			name: "a".into(),
			bind_address: "127.0.0.1:0".parse().unwrap(),
			bind_to_port: true,
			use_original_dst: false,
			filter_chain_factory: factory,
		});
		let sock = crate::listener::ListenSocket::bind(lc.bind_address).unwrap();

		use std::os::fd::AsRawFd;
		let raw = sock.as_raw_fd();
		// SAFETY: closes the fd out from under `sock` on purpose, so the next duplicate attempt
		// observes EBADF; nothing else in this test touches `raw` again.
		unsafe {
			libc::close(raw);
		}

		let mut socket_map = SocketMap::new();
		socket_map.insert(&lc, sock);

		let config = Arc::new(Config {
			concurrency: 1,
			admin_address: "127.0.0.1:0".parse().unwrap(),
			listeners: vec![lc],
			drain_timeout: Duration::from_secs(60),
			parent_shutdown_time: Duration::from_secs(60),
			stats_flush_interval: Duration::from_secs(5),
			watchdog: WatchdogMargins {
				miss_margin: Duration::from_secs(1),
				megamiss_margin: Duration::from_secs(2),
				kill_timeout: Duration::ZERO,
				multikill_timeout: Duration::ZERO,
			},
			restart_epoch: 0,
		});

		let mut worker = Worker::new(1);
		let result = worker.initialize_configuration(config, socket_map, guard_dog(), DrainManager::new(Duration::from_secs(60)), Arc::new(Stats::new()));
		assert!(result.is_err());
	}
}
