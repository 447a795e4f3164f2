//! `Connection`: one accepted TCP connection, owned by exactly one Worker's `ConnectionHandler`
//! for its whole lifetime - it never migrates between workers. Storage wants the properties of
//! a doubly-linked intrusive list (O(1) removal on close); the idiomatic Rust realization of that
//! is a generational slab (`Vec<Slot>` plus a free list), which gives the same O(1) insert/remove
//! without `unsafe` pointer juggling.

use std::net::SocketAddr;
use std::time::Instant;

use tokio::task::JoinHandle;

use crate::config::FilterChain;

/// Opaque per-connection identifier, stable for the lifetime of the connection. Packs a slab
/// index and a generation counter so a stale id from an already-removed slot is rejected rather
/// than silently hitting whatever connection was reinserted at the same index. Returned by
/// [`ConnectionHandler::add_connection`] so a caller can later [`ConnectionHandler::remove`] it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConnectionId {
	index: u32,
	generation: u32,
}

pub struct Connection {
	pub id: ConnectionId,
	pub peer_addr: SocketAddr,
	pub accepted_at: Instant,
	pub filter_chain: FilterChain,
	/// The task driving this connection's I/O. Aborted on forced close; otherwise left to finish
	/// on its own and remove itself via the completion path in `ConnectionHandler`.
	pub task: JoinHandle<()>,
}

struct Slot {
	generation: u32,
	value: Option<Connection>,
}

/// A generational slab: O(1) insert via free-list pop, O(1) remove via direct index. Plays the
/// role of an intrusive list without unsafe linked-list pointer surgery.
#[derive(Default)]
pub struct ConnectionSlab {
	slots: Vec<Slot>,
	free: Vec<u32>,
	len: usize,
}

impl ConnectionSlab {
	pub fn new() -> Self {
		ConnectionSlab::default()
	}

	pub fn insert(&mut self, build: impl FnOnce(ConnectionId) -> Connection) -> ConnectionId {
		let index = self.free.pop().unwrap_or(self.slots.len() as u32);
		let generation = if (index as usize) < self.slots.len() {
			self.slots[index as usize].generation
		} else {
			self.slots.push(Slot { generation: 0, value: None });
			0
		};
		let id = ConnectionId { index, generation };
		self.slots[index as usize].value = Some(build(id));
		self.len += 1;
		id
	}

	/// Removes and returns the connection, or `None` if it was already removed or the id is
	/// stale (closing twice is a caller bug, not a panic - connections can race their own close
	/// callback).
	pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
		let slot = self.slots.get_mut(id.index as usize)?;
		if slot.generation != id.generation {
			return None;
		}
		let conn = slot.value.take()?;
		slot.generation = slot.generation.wrapping_add(1);
		self.free.push(id.index);
		self.len -= 1;
		Some(conn)
	}

	/// List size, maintained on add/remove rather than recomputed - `numConnections` stays `O(1)`.
	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn iter(&self) -> impl Iterator<Item = &Connection> {
		self.slots.iter().filter_map(|s| s.value.as_ref())
	}

	pub fn drain_all(&mut self) -> Vec<Connection> {
		let drained: Vec<Connection> = self
			.slots
			.iter_mut()
			.filter_map(|s| {
				s.generation = s.generation.wrapping_add(1);
				s.value.take()
			})
			.collect();
		self.free = (0..self.slots.len() as u32).collect();
		self.len = 0;
		drained
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;

	fn dummy_conn(id: ConnectionId) -> Connection {
		Connection {
			id,
			peer_addr: "127.0.0.1:1".parse().unwrap(),
			accepted_at: Instant::now(),
			filter_chain: FilterChain::default(),
			task: tokio::spawn(async {}),
		}
	}

	#[tokio::test]
	async fn insert_and_remove_track_len() {
		let mut slab = ConnectionSlab::new();
		let a = slab.insert(dummy_conn);
		let b = slab.insert(dummy_conn);
		assert_eq!(slab.len(), 2);
		assert!(slab.remove(a).is_some());
		assert_eq!(slab.len(), 1);
		assert!(slab.remove(a).is_none(), "double remove is a no-op, not a panic");
		assert!(slab.remove(b).is_some());
		assert!(slab.is_empty());
		tokio::time::sleep(Duration::from_millis(1)).await;
	}

	#[tokio::test]
	async fn reuses_freed_slots() {
		let mut slab = ConnectionSlab::new();
		let a = slab.insert(dummy_conn);
		slab.remove(a);
		let _b = slab.insert(dummy_conn);
		assert_eq!(slab.len(), 1);
	}
}
