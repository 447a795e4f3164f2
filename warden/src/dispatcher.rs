//! The dispatcher abstraction: a single-threaded event loop exposing `run`, `exit`, and `post`.
//! Built on a current-thread `tokio::runtime::Runtime` plus a `LocalSet` (so `!Send` per-thread
//! state like `ConnectionHandlerHandle` can be driven without extra synchronization) and an
//! `mpsc::UnboundedSender<BoxedTask>` for `post`.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio::task::LocalSet;

type BoxedTask = Pin<Box<dyn Future<Output = ()>>>;

/// A handle to post work onto a dispatcher from any thread. Cheap to clone.
#[derive(Clone)]
pub struct DispatcherHandle {
	tx: mpsc::UnboundedSender<BoxedTask>,
}

impl DispatcherHandle {
	/// Enqueues `fut` onto the target loop; posts to a single dispatcher execute in FIFO order.
	/// Silently dropped if the dispatcher has already exited - posting to a dead loop is not an
	/// error the caller needs to handle, matching "tasks always run to completion once posted"
	/// for anything that *was* accepted.
	pub fn post<F>(&self, fut: F)
	where
		F: Future<Output = ()> + 'static,
	{
		let _ = self.tx.send(Box::pin(fut));
	}

	/// Posts a plain closure, for callers that don't need `.await`.
	pub fn post_fn(&self, f: impl FnOnce() + 'static) {
		self.post(async move { f() });
	}
}

/// Owns the OS-thread-local runtime. Constructed on the thread it will run on; `run` blocks that
/// thread until `exit()` is called from another task posted onto this same dispatcher (or from
/// the handle, cross-thread).
pub struct Dispatcher {
	runtime: tokio::runtime::Runtime,
	local: LocalSet,
	rx: mpsc::UnboundedReceiver<BoxedTask>,
	handle: DispatcherHandle,
	exit_tx: mpsc::UnboundedSender<()>,
	exit_rx: mpsc::UnboundedReceiver<()>,
}

impl Dispatcher {
	pub fn new() -> std::io::Result<Self> {
		let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
		let (tx, rx) = mpsc::unbounded_channel();
		let (exit_tx, exit_rx) = mpsc::unbounded_channel();
		Ok(Dispatcher {
			runtime,
			local: LocalSet::new(),
			rx,
			handle: DispatcherHandle { tx },
			exit_tx,
			exit_rx,
		})
	}

	pub fn handle(&self) -> DispatcherHandle {
		self.handle.clone()
	}

	/// Enters the runtime's reactor context without running the loop - lets a caller construct
	/// Tokio I/O types (e.g. `tokio::net::TcpListener::from_std`) synchronously, before `run`'s
	/// `LocalSet` exists, while still on the thread that owns this runtime.
	pub fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
		self.runtime.enter()
	}

	/// A trigger that, when invoked, causes this dispatcher's `run` to return. Can be cloned and
	/// sent to other threads/tasks; `Worker::exit` uses it as "posts a loop-exit task".
	pub fn exit_trigger(&self) -> ExitTrigger {
		ExitTrigger(self.exit_tx.clone())
	}

	/// Runs until `ExitTrigger::exit` is called. Suspension only ever happens inside here.
	pub fn run(mut self) {
		self.runtime.block_on(self.local.run_until(async move {
			loop {
				tokio::select! {
					biased;
					Some(()) = self.exit_rx.recv() => {
						break;
					}
					Some(task) = self.rx.recv() => {
						tokio::task::spawn_local(task);
					}
					else => break,
				}
			}
		}));
	}
}

#[derive(Clone)]
pub struct ExitTrigger(mpsc::UnboundedSender<()>);

impl ExitTrigger {
	pub fn exit(&self) {
		let _ = self.0.send(());
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn posted_tasks_run_in_fifo_order_then_exit_stops_the_loop() {
		let dispatcher = Dispatcher::new().unwrap();
		let handle = dispatcher.handle();
		let exit = dispatcher.exit_trigger();
		let order = Arc::new(std::sync::Mutex::new(Vec::new()));

		for i in 0..5 {
			let order = order.clone();
			handle.post_fn(move || order.lock().unwrap().push(i));
		}
		let exit2 = exit.clone();
		handle.post_fn(move || exit2.exit());

		dispatcher.run();
		assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
	}

	#[test]
	fn exit_from_another_thread_stops_the_loop() {
		let dispatcher = Dispatcher::new().unwrap();
		let exit = dispatcher.exit_trigger();
		let ran = Arc::new(AtomicUsize::new(0));
		let ran2 = ran.clone();
		std::thread::spawn(move || {
			std::thread::sleep(std::time::Duration::from_millis(10));
			ran2.fetch_add(1, Ordering::SeqCst);
			exit.exit();
		});
		dispatcher.run();
		assert_eq!(ran.load(Ordering::SeqCst), 1);
	}
}
