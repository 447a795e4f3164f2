//! `ConnectionHandler`: lives on one Worker's dispatcher, owns the map from `ListenerConfig`
//! identity to `ActiveListener` and the live-connection slab. All methods here assume they are
//! called from the owning task/thread - external callers marshal through the dispatcher's
//! `post`, since all methods must run on the owning loop.
//!
//! Because the accept loop and the per-connection completion hook both need to mutate the same
//! slab from tasks spawned on the same current-thread runtime, the handler is shared within its
//! thread as `Rc<RefCell<_>>` and driven through `tokio::task::LocalSet` rather than `Send`
//! tasks - there is exactly one thread touching it, so a lock would only add overhead.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info, warn};

use warden_core::drain::DrainManager;

use crate::config::{ListenerConfig, ListenerKey};
use crate::connection::{Connection, ConnectionId, ConnectionSlab};

/// A Worker-side registration of a `ListenerConfig` against a `ListenSocket`: owns the accept
/// loop task and is torn down (stopping new accepts, without touching live connections) by
/// [`ConnectionHandler::close_listeners`].
struct ActiveListener {
	config: Arc<ListenerConfig>,
	accept_task: tokio::task::JoinHandle<()>,
}

pub struct ConnectionHandler {
	listeners: HashMap<ListenerKey, ActiveListener>,
	connections: ConnectionSlab,
	drain: DrainManager,
}

/// Shared handle a Worker clones into every task it spawns. Not `Send` (it wraps `Rc`) - it only
/// ever crosses task boundaries within the single thread that owns it, via `LocalSet`.
#[derive(Clone)]
pub struct ConnectionHandlerHandle(Rc<RefCell<ConnectionHandler>>);

impl ConnectionHandlerHandle {
	pub fn new(drain: DrainManager) -> Self {
		ConnectionHandlerHandle(Rc::new(RefCell::new(ConnectionHandler {
			listeners: HashMap::new(),
			connections: ConnectionSlab::new(),
			drain,
		})))
	}

	/// Arms `accept` on an already-duplicated, worker-owned `TcpListener`: every accepted
	/// connection runs the listener's filter-chain factory, is appended to the live list, and is
	/// removed from it again once its task completes (remote close, local close, or a
	/// deferred-delete on error). The duplication itself (which is where a bind
	/// race would surface) happens synchronously in `Worker::initialize_configuration`, before
	/// the worker reports itself ready - `add_listener` only runs once that has already
	/// succeeded.
	pub fn add_listener(&self, config: Arc<ListenerConfig>, tokio_listener: tokio::net::TcpListener) {
		let key = ListenerKey::of(&config);
		let factory = config.filter_chain_factory.clone();
		let name = config.name.clone();
		let this = self.clone();
		let accept_task = tokio::task::spawn_local(async move {
			loop {
				match tokio_listener.accept().await {
					Ok((stream, peer_addr)) => {
						debug!(listener = name, %peer_addr, "accepted connection");
						let _ = stream.set_nodelay(true);
						let chain = factory.build();
						let this2 = this.clone();
						let mut stream = stream;
						let id_cell: Rc<std::cell::Cell<Option<ConnectionId>>> = Rc::new(std::cell::Cell::new(None));
						let id_cell2 = id_cell.clone();
						let id = this.add_connection(peer_addr, chain, move || {
							tokio::task::spawn_local(async move {
								// The actual protocol handling lives in the hosted data plane
								// and is out of scope here; holding the stream open until the
								// peer closes is enough to exercise the accept -> register ->
								// deregister lifecycle this core owns.
								let mut buf = [0u8; 1];
								use tokio::io::AsyncReadExt;
								let _ = stream.read(&mut buf).await;
								// Set synchronously below, before this task gets its first poll
								// (no `.await` happens between `add_connection` returning and the
								// cell being written).
								if let Some(id) = id_cell2.get() {
									this2.remove_connection(id);
								}
							})
						});
						id_cell.set(Some(id));
					},
					Err(e) => {
						warn!(listener = name, error = %e, "accept failed");
						tokio::time::sleep(std::time::Duration::from_millis(10)).await;
					},
				}
			}
		});
		self.0.borrow_mut().listeners.insert(key, ActiveListener { config, accept_task });
	}

	/// Drops all `ActiveListener`s - stops accepting - but leaves live connections running until
	/// they drain or close on their own.
	pub fn close_listeners(&self) {
		let mut inner = self.0.borrow_mut();
		for (_, listener) in inner.listeners.drain() {
			listener.accept_task.abort();
			info!(listener = listener.config.name, "listener closed, no longer accepting");
		}
	}

	/// Registers an accepted connection's task. `spawn_task` must not rely on an id being
	/// available yet - the slot is reserved first and the task spawned against that reservation,
	/// never the other way around, so the slab never observes a half-built `Connection`.
	pub fn add_connection(&self, peer_addr: SocketAddr, filter_chain: crate::config::FilterChain, spawn_task: impl FnOnce() -> tokio::task::JoinHandle<()>) -> ConnectionId {
		let task = spawn_task();
		self.0.borrow_mut().connections.insert(|id| Connection {
			id,
			peer_addr,
			accepted_at: std::time::Instant::now(),
			filter_chain,
			task,
		})
	}

	pub fn remove_connection(&self, id: ConnectionId) -> bool {
		self.0.borrow_mut().connections.remove(id).is_some()
	}

	/// Closes every live connection by aborting its task. Used at shutdown, after
	/// `close_listeners` has already stopped new accepts.
	pub fn close_connections(&self) {
		for conn in self.0.borrow_mut().connections.drain_all() {
			conn.task.abort();
		}
	}

	/// `O(1)`, maintained on add/remove rather than recomputed per call.
	pub fn num_connections(&self) -> usize {
		self.0.borrow().connections.len()
	}

	pub fn num_listeners(&self) -> usize {
		self.0.borrow().listeners.len()
	}

	/// Polls the drain manager for each live connection and closes the ones it selects; called
	/// periodically while draining. Polling is cheap and spreads closes out over time naturally,
	/// without a central traversal of every live connection at once.
	pub fn poll_drain(&self) {
		let mut inner = self.0.borrow_mut();
		let drain = inner.drain.clone();
		let to_close: Vec<ConnectionId> = inner.connections.iter().filter(|_| drain.drain_close()).map(|c| c.id).collect();
		for id in to_close {
			if let Some(conn) = inner.connections.remove(id) {
				conn.task.abort();
			}
		}
	}

	pub fn listener_addresses(&self) -> Vec<SocketAddr> {
		self.0.borrow().listeners.values().map(|l| l.config.bind_address).collect()
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	fn handler() -> ConnectionHandlerHandle {
		ConnectionHandlerHandle::new(DrainManager::new(Duration::from_secs(60)))
	}

	#[tokio::test(flavor = "current_thread")]
	async fn num_connections_tracks_add_remove() {
		let local = tokio::task::LocalSet::new();
		local
			.run_until(async {
				let h = handler();
				assert_eq!(h.num_connections(), 0);
				let id = h.add_connection("127.0.0.1:1".parse().unwrap(), Default::default(), || tokio::task::spawn_local(async {}));
				assert_eq!(h.num_connections(), 1);
				h.remove_connection(id);
				assert_eq!(h.num_connections(), 0);
			})
			.await;
	}

	#[tokio::test(flavor = "current_thread")]
	async fn close_connections_empties_the_handler() {
		let local = tokio::task::LocalSet::new();
		local
			.run_until(async {
				let h = handler();
				for _ in 0..5 {
					h.add_connection("127.0.0.1:1".parse().unwrap(), Default::default(), || {
						tokio::task::spawn_local(async { std::future::pending::<()>().await })
					});
				}
				assert_eq!(h.num_connections(), 5);
				h.close_connections();
				assert_eq!(h.num_connections(), 0);
			})
			.await;
	}
}
