//! `ListenSocket`: a file descriptor bound to a given address, opened exactly once per
//! `ListenerConfig` and shared by every `Worker` thread. On Linux this relies on
//! `SO_REUSEPORT`-free sharing - a single `std::net::TcpListener` is duplicated (`try_clone`,
//! which under the hood is `dup(2)`) per worker so the kernel fans accepts out across the
//! threads that `epoll`/`accept` on the shared file description, requiring no user-space lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use crate::config::{ListenerConfig, ListenerKey};
use crate::error::ListenError;

/// Shared handle around a bound listening file descriptor. Cloning is cheap (`Arc`); the
/// underlying FD closes only when the last clone drops.
#[derive(Clone)]
pub struct ListenSocket {
	std_listener: Arc<std::net::TcpListener>,
	addr: SocketAddr,
}

impl ListenSocket {
	/// Binds a fresh socket, setting `SO_REUSEADDR` so a restarting process does not spuriously
	/// lose a race against its own just-released socket.
	pub fn bind(addr: SocketAddr) -> Result<Self, ListenError> {
		let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
		let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|source| ListenError::Bind { addr, source })?;
		socket.set_reuse_address(true).map_err(|source| ListenError::Bind { addr, source })?;
		socket.set_nonblocking(true).map_err(|source| ListenError::Bind { addr, source })?;
		socket.bind(&addr.into()).map_err(|source| ListenError::Bind { addr, source })?;
		socket.listen(1024).map_err(|source| ListenError::Bind { addr, source })?;
		Ok(ListenSocket {
			std_listener: Arc::new(socket.into()),
			addr,
		})
	}

	/// Wraps an inherited file descriptor (from `duplicateParentListenSocket` during hot restart)
	/// without rebinding. `fd` must already be a bound, listening TCP socket.
	pub fn from_inherited_fd(addr: SocketAddr, fd: std::os::fd::OwnedFd) -> Result<Self, ListenError> {
		let std_listener = std::net::TcpListener::from(fd);
		std_listener.set_nonblocking(true).map_err(|source| ListenError::Bind { addr, source })?;
		Ok(ListenSocket {
			std_listener: Arc::new(std_listener),
			addr,
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.addr
	}

	/// Produces a worker-local `tokio::net::TcpListener` view onto the shared FD. Each worker
	/// gets its own `dup`'d descriptor so closing one worker's view never affects the others -
	/// the FD itself is only released once every clone (including this one) drops.
	pub fn duplicate_for_worker(&self) -> std::io::Result<TcpListener> {
		let dup = self.std_listener.try_clone()?;
		dup.set_nonblocking(true)?;
		TcpListener::from_std(dup)
	}

	/// Raw fd, for the hot-restart RPC to pass to a successor via `SCM_RIGHTS`.
	pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
		use std::os::fd::AsRawFd;
		self.std_listener.as_raw_fd()
	}

	/// An owned duplicate of the underlying fd, for handing off via `SCM_RIGHTS` during hot
	/// restart. Distinct from `duplicate_for_worker`, which needs an active tokio reactor; this
	/// one is plain `dup(2)` and runs fine on the hot-restart listener's own OS thread.
	pub fn duplicate_fd(&self) -> std::io::Result<std::os::fd::OwnedFd> {
		Ok(self.std_listener.try_clone()?.into())
	}
}

/// Map from `ListenerConfig` identity to its shared socket, owned by `ServerInstance`. UDS
/// listeners are per-worker and excluded from this map.
#[derive(Clone, Default)]
pub struct SocketMap {
	sockets: HashMap<ListenerKey, ListenSocket>,
}

impl SocketMap {
	pub fn new() -> Self {
		SocketMap::default()
	}

	pub fn insert(&mut self, config: &Arc<ListenerConfig>, socket: ListenSocket) {
		self.sockets.insert(ListenerKey::of(config), socket);
	}

	pub fn get(&self, config: &Arc<ListenerConfig>) -> Option<&ListenSocket> {
		self.sockets.get(&ListenerKey::of(config))
	}

	pub fn len(&self) -> usize {
		self.sockets.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sockets.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bind_ephemeral_port_then_duplicate_and_read_same_addr() {
		let sock = ListenSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let addr = sock.local_addr();
		assert_eq!(addr.ip().to_string(), "127.0.0.1");
		let dup = sock.duplicate_for_worker().unwrap();
		assert_eq!(dup.local_addr().unwrap().port(), addr.port());
	}

	#[test]
	fn socket_map_round_trips_by_identity() {
		let factory: Arc<dyn crate::config::FilterChainFactory> = Arc::new(crate::config::NullFilterChainFactory);
		let lc = Arc::new(ListenerConfig {
			name: "a".into(),
			bind_address: "127.0.0.1:0".parse().unwrap(),
			bind_to_port: true,
			use_original_dst: false,
			filter_chain_factory: factory,
		});
		let sock = ListenSocket::bind(lc.bind_address).unwrap();
		let mut map = SocketMap::new();
		map.insert(&lc, sock.clone());
		assert!(map.get(&lc).is_some());
		assert_eq!(map.len(), 1);
	}
}
