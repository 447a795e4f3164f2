//! The probabilistic drain gate (distinct from [`crate::graceful`], which is
//! the generic "wait for all watchers to release" primitive used for HTTP connection shutdown).
//!
//! `DrainManager::drain_close` is polled per-connection by a `ConnectionHandler` considering a
//! graceful close. Before `start_drain_sequence` it always returns `false`; afterwards it returns
//! `true` with a probability that ramps linearly from 0 to 1 over `drain_timeout`, so a large
//! population of connections closes itself over time without any central traversal.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Notify;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainStatus {
	NotDraining,
	Draining,
}

struct State {
	start: Option<Instant>,
	parent_shutdown_started: bool,
}

/// Handle shared between the main dispatcher (which starts the sequence) and every worker's
/// `ConnectionHandler` (which polls it). Cheap to clone; internal state is reference-counted.
#[derive(Clone)]
pub struct DrainManager {
	inner: std::sync::Arc<Mutex<State>>,
	timeout: Duration,
	parent_shutdown_notify: std::sync::Arc<Notify>,
}

impl DrainManager {
	pub fn new(timeout: Duration) -> Self {
		DrainManager {
			inner: std::sync::Arc::new(Mutex::new(State {
				start: None,
				parent_shutdown_started: false,
			})),
			timeout,
			parent_shutdown_notify: std::sync::Arc::new(Notify::new()),
		}
	}

	pub fn status(&self) -> DrainStatus {
		if self.inner.lock().unwrap().start.is_some() {
			DrainStatus::Draining
		} else {
			DrainStatus::NotDraining
		}
	}

	/// Idempotent: only the first call records `T0`.
	pub fn start_drain_sequence(&self) {
		let mut state = self.inner.lock().unwrap();
		if state.start.is_none() {
			info!(timeout=?self.timeout, "starting drain sequence");
			state.start = Some(Instant::now());
		}
	}

	/// `true` with probability `min(1, (now - T0) / D)`; always `false` before `T0` is set.
	pub fn drain_close(&self) -> bool {
		let Some(start) = self.inner.lock().unwrap().start else {
			return false;
		};
		let p = drain_probability(start, self.timeout, Instant::now());
		rand::rng().random_bool(p)
	}

	/// Only meaningful on the successor process during a hot restart: schedule a one-shot timer
	/// that, once it fires, tells the hot-restart subsystem to terminate the parent. Idempotent.
	pub fn start_parent_shutdown_sequence<F>(&self, parent_shutdown_time: Duration, terminate_parent: F)
	where
		F: FnOnce() + Send + 'static,
	{
		{
			let mut state = self.inner.lock().unwrap();
			if state.parent_shutdown_started {
				return;
			}
			state.parent_shutdown_started = true;
		}
		let notify = self.parent_shutdown_notify.clone();
		tokio::spawn(async move {
			tokio::select! {
				_ = tokio::time::sleep(parent_shutdown_time) => {
					terminate_parent();
				}
				_ = notify.notified() => {}
			}
		});
	}

	#[cfg(test)]
	pub fn cancel_parent_shutdown_for_test(&self) {
		self.parent_shutdown_notify.notify_one();
	}
}

fn drain_probability(start: Instant, timeout: Duration, now: Instant) -> f64 {
	if timeout.is_zero() {
		return 1.0;
	}
	let elapsed = now.saturating_duration_since(start).as_secs_f64();
	(elapsed / timeout.as_secs_f64()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use test_case::test_case;

	use super::*;

	#[test_case(0, 0.0; "at start, never drains")]
	#[test_case(150, 0.25; "quarter through the ramp")]
	#[test_case(300, 0.5; "halfway through the ramp")]
	#[test_case(450, 0.75; "three quarters through the ramp")]
	#[test_case(600, 1.0; "at the timeout, always drains")]
	#[test_case(900, 1.0; "past the timeout, clamped to always drains")]
	fn ramp_matches_min_one_elapsed_over_timeout(elapsed_secs: u64, expected: f64) {
		let start = Instant::now();
		let timeout = Duration::from_secs(600);
		let p = drain_probability(start, timeout, start + Duration::from_secs(elapsed_secs));
		assert!((p - expected).abs() < 1e-9, "elapsed={elapsed_secs}s expected={expected} got={p}");
	}

	#[test]
	fn false_before_drain_starts() {
		let dm = DrainManager::new(Duration::from_secs(60));
		assert_eq!(dm.status(), DrainStatus::NotDraining);
		for _ in 0..1000 {
			assert!(!dm.drain_close());
		}
	}

	#[test]
	fn start_drain_sequence_is_idempotent() {
		let dm = DrainManager::new(Duration::from_secs(60));
		dm.start_drain_sequence();
		let first = dm.inner.lock().unwrap().start.unwrap();
		std::thread::sleep(Duration::from_millis(5));
		dm.start_drain_sequence();
		let second = dm.inner.lock().unwrap().start.unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn ramp_is_roughly_linear() {
		// D=600s, polling at t=300 should yield ~50% true over a large sample (spec scenario 3).
		let start = Instant::now();
		let timeout = Duration::from_secs(600);
		let p = drain_probability(start, timeout, start + Duration::from_secs(300));
		assert!((p - 0.5).abs() < 0.01);

		let p_done = drain_probability(start, timeout, start + Duration::from_secs(900));
		assert_eq!(p_done, 1.0);

		let p_start = drain_probability(start, timeout, start);
		assert_eq!(p_start, 0.0);
	}

	#[test]
	fn drain_close_ramps_over_many_samples() {
		let dm = DrainManager::new(Duration::from_millis(0));
		dm.start_drain_sequence();
		// zero timeout -> immediately fully draining
		assert!(dm.drain_close());
	}
}
