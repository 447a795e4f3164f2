//! The liveness watchdog: each guarded event loop owns a [`WatchDog`] it
//! touches from inside the loop on a recurring timer; a single [`GuardDog`] background thread
//! polls every registered watchdog and aborts the process if one (or, for `multikill`, several
//! at once) goes unresponsive for too long, so a core dump captures the stuck thread.
//!
//! The guard dog intentionally runs on a plain OS thread rather than inside any tokio runtime:
//! if a worker's runtime itself deadlocks, the thing watching for that must not share its fate.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use tracing::{error, warn};

/// Ambient stats hook: publishes `watchdog_miss` / `watchdog_mega_miss` as stats counters. The
/// counter *type* is in scope; the wire format of whatever backs it is not, so this stays a
/// narrow trait rather than a concrete stats-store dependency.
pub trait WatchdogMetrics: Send + Sync {
	fn incr_miss(&self, thread_name: &str);
	fn incr_mega_miss(&self, thread_name: &str);
}

pub struct NoopMetrics;
impl WatchdogMetrics for NoopMetrics {
	fn incr_miss(&self, _thread_name: &str) {}
	fn incr_mega_miss(&self, _thread_name: &str) {}
}

/// Per-thread liveness record. Only the owning thread calls [`WatchDog::touch`]; the guard dog
/// thread only reads `last_touch_millis`.
pub struct WatchDog {
	thread_id: ThreadId,
	thread_name: String,
	start: Instant,
	last_touch_millis: AtomicU64,
	miss_latched: AtomicBool,
	mega_miss_latched: AtomicBool,
}

impl WatchDog {
	fn new(thread_id: ThreadId, thread_name: String) -> Self {
		let now = Instant::now();
		WatchDog {
			thread_id,
			thread_name,
			start: now,
			last_touch_millis: AtomicU64::new(0),
			miss_latched: AtomicBool::new(false),
			mega_miss_latched: AtomicBool::new(false),
		}
	}

	pub fn thread_id(&self) -> ThreadId {
		self.thread_id
	}

	/// Monotonic-time write signalling "I am alive". Wall-clock jumps must never false-fire this,
	/// which is why we measure offsets from an `Instant` taken at registration rather than
	/// `SystemTime`.
	pub fn touch(&self) {
		let elapsed = self.start.elapsed().as_millis() as u64;
		self.last_touch_millis.store(elapsed, Ordering::Release);
	}

	fn last_touch(&self) -> Instant {
		self.start + Duration::from_millis(self.last_touch_millis.load(Ordering::Acquire))
	}
}

struct Registration {
	watchdog: Arc<WatchDog>,
}

pub struct GuardDogConfig {
	pub miss_margin: Duration,
	pub megamiss_margin: Duration,
	pub kill_timeout: Duration,
	pub multikill_timeout: Duration,
}

/// Background thread polling all registered [`WatchDog`]s.
pub struct GuardDog {
	registrations: Arc<Mutex<Vec<Registration>>>,
	config: GuardDogConfig,
	metrics: Arc<dyn WatchdogMetrics>,
	stop: Arc<AtomicBool>,
	handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl GuardDog {
	pub fn new(config: GuardDogConfig, metrics: Arc<dyn WatchdogMetrics>) -> Arc<Self> {
		let dog = Arc::new(GuardDog {
			registrations: Arc::new(Mutex::new(Vec::new())),
			config,
			metrics,
			stop: Arc::new(AtomicBool::new(false)),
			handle: Mutex::new(None),
		});
		dog.clone().spawn();
		dog
	}

	fn spawn(self: Arc<Self>) {
		let period = std::cmp::min(self.config.miss_margin, self.config.megamiss_margin) / 2;
		let handle = std::thread::Builder::new()
			.name("guard-dog".to_string())
			.spawn(move || {
				while !self.stop.load(Ordering::Acquire) {
					self.tick();
					std::thread::sleep(period);
				}
			})
			.expect("failed to spawn guard dog thread");
		*self.handle.lock().unwrap() = Some(handle);
	}

	fn tick(&self) {
		// Snapshot the registration list under the lock, then process outside it.
		let snapshot: Vec<Arc<WatchDog>> = self
			.registrations
			.lock()
			.unwrap()
			.iter()
			.map(|r| r.watchdog.clone())
			.collect();

		let now = Instant::now();
		let mut multikill_breaches = 0usize;
		for wd in &snapshot {
			let since = now.saturating_duration_since(wd.last_touch());

			if since > self.config.miss_margin {
				if !wd.miss_latched.swap(true, Ordering::AcqRel) {
					warn!(thread = wd.thread_name, ?since, "watchdog miss");
					self.metrics.incr_miss(&wd.thread_name);
				}
			} else {
				wd.miss_latched.store(false, Ordering::Release);
			}

			if since > self.config.megamiss_margin {
				if !wd.mega_miss_latched.swap(true, Ordering::AcqRel) {
					warn!(thread = wd.thread_name, ?since, "watchdog mega-miss");
					self.metrics.incr_mega_miss(&wd.thread_name);
				}
			} else {
				wd.mega_miss_latched.store(false, Ordering::Release);
			}

			if !self.config.kill_timeout.is_zero() && since > self.config.kill_timeout {
				error!(thread = wd.thread_name, ?since, "watchdog kill timeout exceeded, aborting");
				std::process::abort();
			}

			if since > self.config.multikill_timeout {
				multikill_breaches += 1;
			}
		}

		// A lone stuck thread may just be a slow filter; a process-wide hang is a deadlock.
		if !self.config.multikill_timeout.is_zero() && multikill_breaches >= 2 {
			error!(
				count = multikill_breaches,
				"multiple watchdogs exceeded multikill timeout simultaneously, aborting"
			);
			std::process::abort();
		}
	}

	pub fn create_watch_dog(&self, thread_id: ThreadId, thread_name: impl Into<String>) -> Arc<WatchDog> {
		let wd = Arc::new(WatchDog::new(thread_id, thread_name.into()));
		wd.touch();
		self
			.registrations
			.lock()
			.unwrap()
			.push(Registration { watchdog: wd.clone() });
		wd
	}

	pub fn stop_watching(&self, wd: &Arc<WatchDog>) {
		self
			.registrations
			.lock()
			.unwrap()
			.retain(|r| !Arc::ptr_eq(&r.watchdog, wd));
	}
}

impl Drop for GuardDog {
	fn drop(&mut self) {
		self.stop.store(true, Ordering::Release);
		if let Some(h) = self.handle.lock().unwrap().take() {
			let _ = h.join();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	#[derive(Default)]
	struct CountingMetrics {
		miss: AtomicUsize,
		mega_miss: AtomicUsize,
	}

	impl WatchdogMetrics for CountingMetrics {
		fn incr_miss(&self, _thread_name: &str) {
			self.miss.fetch_add(1, Ordering::SeqCst);
		}
		fn incr_mega_miss(&self, _thread_name: &str) {
			self.mega_miss.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[test]
	fn touch_within_margin_increments_nothing() {
		let metrics = Arc::new(CountingMetrics::default());
		let dog = GuardDog::new(
			GuardDogConfig {
				miss_margin: Duration::from_secs(5),
				megamiss_margin: Duration::from_secs(10),
				kill_timeout: Duration::ZERO,
				multikill_timeout: Duration::ZERO,
			},
			metrics.clone(),
		);
		let wd = dog.create_watch_dog(std::thread::current().id(), "main");
		wd.touch();
		dog.tick();
		assert_eq!(metrics.miss.load(Ordering::SeqCst), 0);
		assert_eq!(metrics.mega_miss.load(Ordering::SeqCst), 0);
		dog.stop_watching(&wd);
	}

	#[test]
	fn miss_counter_increments_once_per_transition() {
		let metrics = Arc::new(CountingMetrics::default());
		let dog = GuardDog::new(
			GuardDogConfig {
				miss_margin: Duration::from_millis(1),
				megamiss_margin: Duration::from_secs(10),
				kill_timeout: Duration::ZERO,
				multikill_timeout: Duration::ZERO,
			},
			metrics.clone(),
		);
		let wd = dog.create_watch_dog(std::thread::current().id(), "stuck");
		std::thread::sleep(Duration::from_millis(5));
		dog.tick();
		dog.tick();
		dog.tick();
		assert_eq!(metrics.miss.load(Ordering::SeqCst), 1, "debounced to one transition");
		wd.touch();
		dog.tick();
		std::thread::sleep(Duration::from_millis(5));
		dog.tick();
		assert_eq!(metrics.miss.load(Ordering::SeqCst), 2, "re-latches after recovery");
		dog.stop_watching(&wd);
	}
}
