//! `ServerInstance`: the phased lifecycle orchestrator. Composes everything else in this crate -
//! config, socket map, workers, guard dog, drain manager, hot-restart RPC, admin HTTP - and owns
//! the main thread's own dispatcher, run the same way a worker's is.
//!
//! Bootstrap is split from `run` so a caller (tests, or `warden-app`'s `main`) can inspect the
//! constructed instance - its resolved admin address, its shutdown trigger - before handing it
//! off to the blocking run loop.

use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};
use warden_core::drain::DrainManager;
use warden_core::init_manager::InitManager;
use warden_core::signal::{Shutdown, ShutdownTrigger, spawn_sighup_ignore_handler, spawn_sigusr1_log_rotate_handler};
use warden_core::version::BuildInfo;
use warden_core::watchdog::{GuardDog, GuardDogConfig};

use crate::admin::AdminServer;
use crate::config::{Config, FlagsPath, ListenerConfig};
use crate::dispatcher::Dispatcher;
use crate::hot_restart::{HotRestart, HotRestartContext, HotRestartListener};
use crate::listener::{ListenSocket, SocketMap};
use crate::stats::{LogSink, Stats, StatsWatchdogMetrics};
use crate::worker::Worker;

/// Everything a fresh instance needs to locate its predecessor/successor across a hot restart:
/// the directory holding the `warden-restart-<epoch>.sock` rendezvous points.
#[derive(Clone)]
pub struct RestartPaths {
	pub base_dir: PathBuf,
}

pub struct ServerInstance {
	config: Arc<Config>,
	flags_path: FlagsPath,
	dispatcher: Dispatcher,
	drain: DrainManager,
	hot_restart: Arc<HotRestart>,
	hot_restart_listener: Option<HotRestartListener>,
	stats: Arc<Stats>,
	guard_dog: Arc<GuardDog>,
	/// Shared so the `init_manager` barrier's `'static` completion callback (which cannot borrow
	/// `self`) can populate it, and `run`'s post-loop cleanup can read it back without going
	/// through that closure at all.
	workers: Arc<std::sync::Mutex<Vec<Worker>>>,
	socket_map: SocketMap,
	shutdown: Shutdown,
	build_info: BuildInfo,
	original_start_time_unix_secs: u64,
	restart_paths: RestartPaths,
}

impl ServerInstance {
	/// Phase 1 (preamble) and Phase 2 (wiring), up to but not including starting workers or
	/// entering the run loop. Synchronous and fallible: a configuration, bind, or hot-restart
	/// handshake error here is the "fatal at init, exit 1" path.
	pub fn bootstrap(config: Config, flags_path: FlagsPath, restart_paths: RestartPaths) -> anyhow::Result<Self> {
		let config = Arc::new(config);
		let build_info = BuildInfo::new();
		let stats = Arc::new(Stats::new());
		stats.set_server_version(build_info.version_stat()?);

		let hot_restart = Arc::new(HotRestart::connect(config.restart_epoch, &restart_paths.base_dir));
		let drain = DrainManager::new(config.drain_timeout);

		let original_start_time_unix_secs = if hot_restart.has_parent() {
			match hot_restart.shutdown_parent_admin() {
				Ok(Some(started)) => unix_secs_of(started),
				Ok(None) => unix_now(),
				Err(e) => {
					warn!(error = %e, "failed to hand off parent's admin listener, continuing with a fresh start time");
					unix_now()
				},
			}
		} else {
			unix_now()
		};

		if flags_path.health_check_fails_from_start() {
			info!("server flags: drain flag present at start-up, health check fails from the beginning");
			drain.start_drain_sequence();
		}

		let socket_map = bind_or_inherit_listeners(&config, &hot_restart);

		let workers = Arc::new(std::sync::Mutex::new((0..config.concurrency).map(Worker::new).collect::<Vec<_>>()));

		let guard_dog = GuardDog::new(
			GuardDogConfig {
				miss_margin: config.watchdog.miss_margin,
				megamiss_margin: config.watchdog.megamiss_margin,
				kill_timeout: config.watchdog.kill_timeout,
				multikill_timeout: config.watchdog.multikill_timeout,
			},
			Arc::new(StatsWatchdogMetrics::new(stats.clone())),
		);

		let hot_restart_listener = HotRestartListener::bind(config.restart_epoch, &restart_paths.base_dir).ok();
		if hot_restart_listener.is_none() {
			warn!("failed to bind this process's own hot-restart rendezvous socket; a future successor will not be able to inherit from us");
		}

		let dispatcher = Dispatcher::new()?;

		Ok(ServerInstance {
			config,
			flags_path,
			dispatcher,
			drain,
			hot_restart,
			hot_restart_listener,
			stats,
			guard_dog,
			workers,
			socket_map,
			shutdown: Shutdown::new(),
			build_info,
			original_start_time_unix_secs,
			restart_paths,
		})
	}

	/// A trigger equivalent to SIGTERM/`/quitquitquit` - usable by a caller (or a test) before
	/// `run` takes ownership of `self`.
	pub fn shutdown_trigger(&self) -> ShutdownTrigger {
		self.shutdown.trigger()
	}

	pub fn admin_address(&self) -> SocketAddr {
		self.config.admin_address
	}

	/// Phase 2 (remaining steps), Phase 3, and Phase 4. Consumes `self`: the main dispatcher owns
	/// everything from here and there is no instance left to return to once it exits.
	pub fn run(mut self) -> anyhow::Result<()> {
		let handle = self.dispatcher.handle();
		let exit = self.dispatcher.exit_trigger();
		let shutdown_trigger = self.shutdown.trigger();

		// Everything below either spawns a tokio task directly or constructs a tokio type; since
		// `self.dispatcher`'s `LocalSet` doesn't exist until `run()` a few lines down, we need an
		// entered runtime context for the spawns to register against, and then let them actually
		// execute once the loop starts.
		{
			let _guard = self.dispatcher.enter();

			let ctx: Arc<dyn HotRestartContext> = Arc::new(ServerHotRestartContext {
				config: self.config.clone(),
				socket_map: self.socket_map.clone(),
				stats: self.stats.clone(),
				drain: self.drain.clone(),
				shutdown_trigger: shutdown_trigger.clone(),
				version: self.build_info.to_string(),
				original_start_time_unix_secs: self.original_start_time_unix_secs,
			});
			if let Some(listener) = self.hot_restart_listener.take() {
				listener.spawn(ctx);
			}

			spawn_sigusr1_log_rotate_handler(|| {});
			spawn_sighup_ignore_handler();

			// Admin connections drain gracefully (finish the in-flight request, then close) once
			// shutdown starts, rather than being cut off mid-response the instant the dispatcher
			// exits - the trigger is held by the shutdown task below and fired there.
			let (admin_drain_trigger, admin_drain_watcher) = warden_core::graceful::new();

			let admin_shutdown_trigger = shutdown_trigger.clone();
			let admin_flags_path = self.flags_path.clone();
			let admin_stats = self.stats.clone();
			let admin_addr = self.config.admin_address;
			handle.post(async move {
				match AdminServer::bind(admin_addr, admin_flags_path, admin_shutdown_trigger, admin_stats).await {
					Ok(admin) => {
						info!(addr = %admin_addr, "admin listener bound");
						admin.spawn(admin_drain_watcher);
					},
					Err(e) => warn!(error = %e, %admin_addr, "failed to bind admin listener"),
				}
			});

			let hot_restart_for_shutdown = self.hot_restart.clone();
			let shutdown = std::mem::replace(&mut self.shutdown, Shutdown::new());
			let exit_for_shutdown = exit.clone();
			const ADMIN_DRAIN_GRACE: Duration = Duration::from_secs(5);
			handle.post(async move {
				shutdown.wait().await;
				if let Err(e) = hot_restart_for_shutdown.terminate_parent() {
					warn!(error = %e, "failed to notify parent of termination");
				}
				if tokio::time::timeout(ADMIN_DRAIN_GRACE, admin_drain_trigger.start_drain_and_wait(warden_core::graceful::DrainMode::Graceful))
					.await
					.is_err()
				{
					warn!("admin listener did not drain within the grace period, closing anyway");
				}
				exit_for_shutdown.exit();
			});

			let flush_stats = self.stats.clone();
			let flush_hot_restart = self.hot_restart.clone();
			let flush_interval = self.config.stats_flush_interval;
			handle.post(async move {
				let mut ticker = tokio::time::interval(if flush_interval.is_zero() { Duration::from_secs(5) } else { flush_interval });
				loop {
					ticker.tick().await;
					if let Ok(Some((mem, conns))) = flush_hot_restart.get_parent_stats() {
						info!(parent_memory_allocated = mem, parent_num_connections = conns, "parent stats");
					}
					flush_stats.flush(&LogSink);
				}
			});

			let init_manager = InitManager::new();
			let config = self.config.clone();
			let socket_map = self.socket_map.clone();
			let guard_dog = self.guard_dog.clone();
			let drain_for_workers = self.drain.clone();
			let stats_for_workers = self.stats.clone();
			let hot_restart_for_workers = self.hot_restart.clone();
			let drain_for_parent_shutdown = self.drain.clone();
			let parent_shutdown_time = self.config.parent_shutdown_time;
			let exit_for_workers = exit.clone();
			// `init_manager.initialize`'s `done` must be `'static`, so it cannot hold a borrow of
			// `self` - `self.workers` is already a shared `Arc<Mutex<_>>` slot, so the closure just
			// clones the `Arc` and locks it, and `run`'s post-loop cleanup locks the same slot
			// directly rather than going back through a moved-out closure capture.
			let workers_slot = self.workers.clone();
			init_manager.initialize(move || {
				let mut workers = workers_slot.lock().unwrap();
				let all_ok = start_workers(&mut workers, &config, &socket_map, &guard_dog, &drain_for_workers, &stats_for_workers, &exit_for_workers);
				if all_ok {
					if let Err(e) = hot_restart_for_workers.drain_parent_listeners() {
						warn!(error = %e, "failed to tell parent to drain its listeners");
					}
					let terminate_hot_restart = hot_restart_for_workers.clone();
					drain_for_parent_shutdown.start_parent_shutdown_sequence(parent_shutdown_time, move || {
						if let Err(e) = terminate_hot_restart.terminate_parent() {
							warn!(error = %e, "failed to terminate parent after parent-shutdown timer");
						}
					});
				}
			});
		}

		let watchdog = self.guard_dog.create_watch_dog(std::thread::current().id(), "main".to_string());
		let watchdog_for_timer = watchdog.clone();
		handle.post(async move {
			let mut ticker = tokio::time::interval(Duration::from_millis(500));
			loop {
				ticker.tick().await;
				watchdog_for_timer.touch();
			}
		});

		info!("main dispatcher running");
		self.dispatcher.run();
		self.guard_dog.stop_watching(&watchdog);

		let mut workers = self.workers.lock().unwrap();
		for worker in workers.iter_mut() {
			worker.exit();
		}
		for worker in workers.iter_mut() {
			worker.join();
		}
		drop(workers);
		self.stats.flush(&LogSink);
		info!("server instance exited");
		Ok(())
	}
}

fn bind_or_inherit_listeners(config: &Arc<Config>, hot_restart: &HotRestart) -> SocketMap {
	let mut socket_map = SocketMap::new();
	for lc in &config.listeners {
		if !lc.bind_to_port {
			continue;
		}
		let socket = bind_or_inherit_one(lc, hot_restart);
		match socket {
			Ok(socket) => socket_map.insert(lc, socket),
			Err(e) => warn!(listener = lc.name, error = %e, "failed to bind listener"),
		}
	}
	socket_map
}

fn bind_or_inherit_one(lc: &Arc<ListenerConfig>, hot_restart: &HotRestart) -> anyhow::Result<ListenSocket> {
	match hot_restart.duplicate_parent_listen_socket(lc.bind_address) {
		Ok(Some(fd)) => Ok(ListenSocket::from_inherited_fd(lc.bind_address, fd)?),
		Ok(None) => Ok(ListenSocket::bind(lc.bind_address)?),
		Err(e) => {
			warn!(listener = lc.name, error = %e, "hot-restart socket inheritance failed, binding fresh");
			Ok(ListenSocket::bind(lc.bind_address)?)
		},
	}
}

/// Phase 4: brings every worker up. Returns `false` if any worker lost a bind race - on which
/// this still attempts the remaining workers (resolved here: proceed rather than abort early)
/// and triggers the unified self-SIGTERM exit path immediately rather than waiting for the
/// caller to notice.
fn start_workers(workers: &mut [Worker], config: &Arc<Config>, socket_map: &SocketMap, guard_dog: &Arc<GuardDog>, drain: &DrainManager, stats: &Arc<Stats>, exit: &crate::dispatcher::ExitTrigger) -> bool {
	let mut all_ok = true;
	for worker in workers.iter_mut() {
		if let Err(e) = worker.initialize_configuration(config.clone(), socket_map.clone(), guard_dog.clone(), drain.clone(), stats.clone()) {
			tracing::error!(worker = worker.index(), error = %e, "worker failed to start, triggering shutdown");
			all_ok = false;
			exit.exit();
		}
	}
	all_ok
}

struct ServerHotRestartContext {
	config: Arc<Config>,
	socket_map: SocketMap,
	stats: Arc<Stats>,
	drain: DrainManager,
	shutdown_trigger: ShutdownTrigger,
	version: String,
	original_start_time_unix_secs: u64,
}

impl HotRestartContext for ServerHotRestartContext {
	fn duplicate_listen_socket(&self, addr: SocketAddr) -> Option<OwnedFd> {
		let lc = self.config.listeners.iter().find(|lc| lc.bind_address == addr)?;
		let socket = self.socket_map.get(lc)?;
		socket.duplicate_fd().ok()
	}

	fn parent_stats(&self) -> (i64, i64) {
		(self.stats.memory_allocated(), self.stats.num_connections())
	}

	fn drain_listeners(&self) {
		// Stopping new accepts on every worker's listener would need a handle threaded through
		// from `run` into this context; starting the probabilistic drain ramp on existing
		// connections is the part this core owns outright, so that's what's implemented here.
		self.drain.start_drain_sequence();
	}

	fn terminate(&self) {
		futures::executor::block_on(self.shutdown_trigger.shutdown_now());
	}

	fn shutdown_admin(&self) -> u64 {
		info!("parent admin shutdown requested by successor");
		self.original_start_time_unix_secs
	}

	fn version(&self) -> String {
		self.version.clone()
	}
}

fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn unix_secs_of(instant: Instant) -> u64 {
	let elapsed = instant.elapsed();
	unix_now().saturating_sub(elapsed.as_secs())
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::config::RawConfig;

	fn flags_path(dir: &Path) -> FlagsPath {
		FlagsPath(dir.to_path_buf())
	}

	#[test]
	fn bootstrap_with_empty_config_binds_admin_and_no_listeners() {
		let dir = tempfile::tempdir().unwrap();
		let raw = RawConfig {
			concurrency: 2,
			admin_address: "127.0.0.1:0".parse().unwrap(),
			..Default::default()
		};
		let config = Config::from_raw(raw, 0, None);
		let instance = ServerInstance::bootstrap(
			config,
			flags_path(dir.path()),
			RestartPaths { base_dir: dir.path().to_path_buf() },
		)
		.unwrap();
		assert_eq!(instance.workers.lock().unwrap().len(), 2);
		assert!(instance.socket_map.is_empty());
	}

	#[test]
	fn shutdown_trigger_stops_the_run_loop() {
		let dir = tempfile::tempdir().unwrap();
		let raw = RawConfig {
			concurrency: 1,
			admin_address: "127.0.0.1:0".parse().unwrap(),
			..Default::default()
		};
		let config = Config::from_raw(raw, 0, None);
		let instance = ServerInstance::bootstrap(
			config,
			flags_path(dir.path()),
			RestartPaths { base_dir: dir.path().to_path_buf() },
		)
		.unwrap();
		let trigger = instance.shutdown_trigger();
		let join = std::thread::spawn(move || instance.run());

		std::thread::sleep(Duration::from_millis(50));
		futures::executor::block_on(trigger.shutdown_now());

		let result = join.join().expect("run thread panicked");
		assert!(result.is_ok());
	}
}
