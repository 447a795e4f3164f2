//! The async start-up barrier: converts a fan-out of [`InitTarget`]s (each upstream cluster's
//! first-round DNS/EDS resolution, in the hosted system) into a single continuation. Targets
//! have no failure channel by contract - one that cannot initialize must retry internally or
//! cause the process to exit.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
	NotInitialized,
	Initializing,
	Initialized,
}

/// Anything with an async `initialize(done)` call whose completion the barrier awaits.
pub trait InitTarget: Send + Sync {
	fn name(&self) -> &str;
	/// Must eventually invoke `done` exactly once. `done` is boxed because targets are stored as
	/// trait objects and may be implemented by arbitrary async machinery.
	fn initialize(&self, done: Box<dyn FnOnce() + Send>);
}

struct Inner {
	state: State,
	pending: HashSet<usize>,
	targets: Vec<Arc<dyn InitTarget>>,
	done: Option<Box<dyn FnOnce() + Send>>,
}

/// Not `Clone`: the manager's state machine is a single owned object whose callbacks are all
/// delivered on the main dispatcher, so there is exactly one writer.
pub struct InitManager {
	inner: Mutex<Inner>,
}

impl InitManager {
	pub fn new() -> Arc<Self> {
		Arc::new(InitManager {
			inner: Mutex::new(Inner {
				state: State::NotInitialized,
				pending: HashSet::new(),
				targets: Vec::new(),
				done: None,
			}),
		})
	}

	pub fn state(&self) -> State {
		self.inner.lock().unwrap().state
	}

	/// Only valid while `state() == NotInitialized`.
	pub fn register_target(&self, target: Arc<dyn InitTarget>) {
		let mut inner = self.inner.lock().unwrap();
		assert_eq!(
			inner.state,
			State::NotInitialized,
			"registerTarget called after initialize() - targets must all register before the barrier fires"
		);
		let idx = inner.targets.len();
		inner.targets.push(target);
		inner.pending.insert(idx);
	}

	/// Transitions NotInitialized -> Initializing (or directly to Initialized if the target set
	/// is empty, invoking `done` synchronously before returning - the "empty config" fast path).
	/// `self` must be held as an `Arc` so each target's completion callback can reach back into
	/// the manager from an arbitrary async context.
	pub fn initialize(self: &Arc<Self>, done: impl FnOnce() + Send + 'static) {
		let targets = {
			let mut inner = self.inner.lock().unwrap();
			assert_eq!(
				inner.state,
				State::NotInitialized,
				"initialize() must be called exactly once"
			);
			if inner.pending.is_empty() {
				inner.state = State::Initialized;
				info!("init manager: no registered targets, initialized immediately");
				drop(inner);
				done();
				return;
			}
			inner.state = State::Initializing;
			inner.done = Some(Box::new(done));
			inner.targets.clone()
		};

		for (idx, target) in targets.into_iter().enumerate() {
			let this = self.clone();
			let name = target.name().to_string();
			target.initialize(Box::new(move || this.target_complete(idx, &name)));
		}
	}

	fn target_complete(self: &Arc<Self>, idx: usize, name: &str) {
		let done = {
			let mut inner = self.inner.lock().unwrap();
			if !inner.pending.remove(&idx) {
				// Already removed - a target that double-calls its completion callback is a bug
				// in that target, not in the barrier; ignore the duplicate rather than panic.
				return;
			}
			info!(target = name, remaining = inner.pending.len(), "init target complete");
			if inner.pending.is_empty() {
				inner.state = State::Initialized;
				inner.done.take()
			} else {
				None
			}
		};
		if let Some(done) = done {
			done();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	struct ManualTarget {
		name: &'static str,
		cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
	}

	impl ManualTarget {
		fn new(name: &'static str) -> Arc<Self> {
			Arc::new(ManualTarget {
				name,
				cb: Mutex::new(None),
			})
		}

		fn fire(&self) {
			let cb = self.cb.lock().unwrap().take().expect("not initialized yet");
			cb();
		}
	}

	impl InitTarget for ManualTarget {
		fn name(&self) -> &str {
			self.name
		}

		fn initialize(&self, done: Box<dyn FnOnce() + Send>) {
			*self.cb.lock().unwrap() = Some(done);
		}
	}

	#[test]
	fn empty_target_set_initializes_synchronously() {
		let mgr = InitManager::new();
		let fired = Arc::new(AtomicUsize::new(0));
		let fired2 = fired.clone();
		mgr.initialize(move || {
			fired2.fetch_add(1, Ordering::SeqCst);
		});
		assert_eq!(fired.load(Ordering::SeqCst), 1);
		assert_eq!(mgr.state(), State::Initialized);
	}

	#[test]
	fn done_fires_exactly_once_after_all_targets_complete() {
		let mgr = InitManager::new();
		let a = ManualTarget::new("a");
		let b = ManualTarget::new("b");
		mgr.register_target(a.clone());
		mgr.register_target(b.clone());

		let fired = Arc::new(AtomicUsize::new(0));
		let fired2 = fired.clone();
		mgr.initialize(move || {
			fired2.fetch_add(1, Ordering::SeqCst);
		});
		assert_eq!(mgr.state(), State::Initializing);
		assert_eq!(fired.load(Ordering::SeqCst), 0);

		a.fire();
		assert_eq!(fired.load(Ordering::SeqCst), 0, "done must wait for b too");
		assert_eq!(mgr.state(), State::Initializing);

		b.fire();
		assert_eq!(fired.load(Ordering::SeqCst), 1);
		assert_eq!(mgr.state(), State::Initialized);
	}

	#[test]
	fn callback_order_is_irrelevant() {
		let mgr = InitManager::new();
		let a = ManualTarget::new("a");
		let b = ManualTarget::new("b");
		mgr.register_target(a.clone());
		mgr.register_target(b.clone());
		let fired = Arc::new(AtomicUsize::new(0));
		let fired2 = fired.clone();
		mgr.initialize(move || {
			fired2.fetch_add(1, Ordering::SeqCst);
		});

		b.fire();
		a.fire();
		assert_eq!(fired.load(Ordering::SeqCst), 1);
	}

	#[test]
	#[should_panic(expected = "registerTarget called after initialize()")]
	fn register_after_initialize_panics() {
		let mgr = InitManager::new();
		mgr.initialize(|| {});
		mgr.register_target(ManualTarget::new("late"));
	}
}
