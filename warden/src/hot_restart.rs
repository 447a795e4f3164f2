//! Hot-restart RPC: a Unix-domain socket, one per `restart_epoch`, connecting each process to its
//! immediate predecessor. Framing is `[u8 opcode][u32 len][len bytes JSON]`;
//! `duplicate_parent_listen_socket` additionally exchanges one file descriptor via `sendmsg`/
//! `recvmsg` with `ControlMessage::ScmRights`. This is an internal parent/child wire contract
//! between two processes of the same binary, never a public API, so JSON-over-UDS is an
//! acceptable, debuggable choice.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg};
use nix::sys::uio::IoSlice;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
	ShutdownParentAdmin = 1,
	DuplicateParentListenSocket = 2,
	GetParentStats = 3,
	DrainParentListeners = 4,
	TerminateParent = 5,
	Shutdown = 6,
	Version = 7,
}

impl Opcode {
	fn from_u8(b: u8) -> Option<Self> {
		Some(match b {
			1 => Opcode::ShutdownParentAdmin,
			2 => Opcode::DuplicateParentListenSocket,
			3 => Opcode::GetParentStats,
			4 => Opcode::DrainParentListeners,
			5 => Opcode::TerminateParent,
			6 => Opcode::Shutdown,
			7 => Opcode::Version,
			_ => return None,
		})
	}
}

#[derive(Serialize, Deserialize, Default)]
struct Empty {}

#[derive(Serialize, Deserialize)]
struct DuplicateListenSocketRequest {
	addr: String,
}

/// Sent as an ordinary framed reply before the fd itself (if any) follows in a separate
/// `sendmsg`/`recvmsg` exchange. Lets the client distinguish "this process has no listener for
/// that address" - a normal outcome when a config change between restart epochs adds a listener -
/// from a broken connection, without tearing down the shared parent stream to find out.
#[derive(Serialize, Deserialize)]
struct DuplicateListenSocketReply {
	found: bool,
}

#[derive(Serialize, Deserialize)]
struct ShutdownParentAdminReply {
	original_start_time_unix_secs: u64,
}

#[derive(Serialize, Deserialize)]
struct GetParentStatsReply {
	memory_allocated: i64,
	num_connections: i64,
}

#[derive(Serialize, Deserialize)]
struct VersionReply {
	version: String,
}

/// `base_dir/warden-restart-<epoch>.sock` is the rendezvous point for the process at that epoch;
/// a successor at `epoch + 1` dials this path to reach it.
pub fn socket_path(base_dir: &Path, epoch: u32) -> PathBuf {
	base_dir.join(format!("warden-restart-{epoch}.sock"))
}

fn write_frame(stream: &mut UnixStream, opcode: Opcode, body: &impl Serialize) -> Result<(), RpcError> {
	let json = serde_json::to_vec(body)?;
	let len = (json.len() as u32).to_be_bytes();
	stream.write_all(&[opcode as u8])?;
	stream.write_all(&len)?;
	stream.write_all(&json)?;
	Ok(())
}

fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut UnixStream) -> Result<(Opcode, T), RpcError> {
	let mut op_buf = [0u8; 1];
	stream.read_exact(&mut op_buf)?;
	let opcode = Opcode::from_u8(op_buf[0]).ok_or(RpcError::ParentGone)?;
	let mut len_buf = [0u8; 4];
	stream.read_exact(&mut len_buf)?;
	let len = u32::from_be_bytes(len_buf) as usize;
	let mut body = vec![0u8; len];
	stream.read_exact(&mut body)?;
	let value = serde_json::from_slice(&body)?;
	Ok((opcode, value))
}

/// Sends `fd` alongside a one-byte payload over `stream`'s control-message channel
/// (`SCM_RIGHTS`), the FD-passing half of `duplicate_parent_listen_socket`.
fn send_fd(stream: &UnixStream, fd: RawFd) -> Result<(), RpcError> {
	let iov = [IoSlice::new(b"f")];
	let fds = [fd];
	let cmsg = [ControlMessage::ScmRights(&fds)];
	sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None).map_err(std::io::Error::from)?;
	Ok(())
}

fn recv_fd(stream: &UnixStream) -> Result<OwnedFd, RpcError> {
	let mut buf = [0u8; 1];
	let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
	let mut iov = [std::io::IoSliceMut::new(&mut buf)];
	let msg = recvmsg::<UnixAddr>(stream.as_raw_fd(), &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()).map_err(std::io::Error::from)?;
	for cmsg in msg.cmsgs().map_err(|e| RpcError::Io(std::io::Error::other(e)))? {
		if let ControlMessageOwned::ScmRights(fds) = cmsg {
			if let Some(&fd) = fds.first() {
				use std::os::fd::FromRawFd;
				return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
			}
		}
	}
	Err(RpcError::MissingFd)
}

/// Client-side handle onto the predecessor process at `restart_epoch - 1`. `None` (epoch 0, or a
/// failed connect) means there is no parent to talk to - every operation below then becomes a
/// no-op, letting `ServerInstance` call them unconditionally.
pub struct HotRestart {
	parent: Option<Mutex<UnixStream>>,
}

impl HotRestart {
	/// Dials the parent's rendezvous socket for `restart_epoch`. `restart_epoch == 0` never has a
	/// parent by definition.
	pub fn connect(restart_epoch: u32, base_dir: &Path) -> Self {
		if restart_epoch == 0 {
			return HotRestart { parent: None };
		}
		let path = socket_path(base_dir, restart_epoch - 1);
		match UnixStream::connect(&path) {
			Ok(stream) => HotRestart {
				parent: Some(Mutex::new(stream)),
			},
			Err(_) => HotRestart { parent: None },
		}
	}

	pub fn has_parent(&self) -> bool {
		self.parent.is_some()
	}

	fn roundtrip<Req: Serialize, Reply: for<'de> Deserialize<'de>>(&self, opcode: Opcode, req: &Req) -> Result<Option<Reply>, RpcError> {
		let Some(lock) = &self.parent else {
			return Ok(None);
		};
		let mut stream = lock.lock().unwrap();
		write_frame(&mut stream, opcode, req)?;
		let (_, reply) = read_frame(&mut stream)?;
		Ok(Some(reply))
	}

	/// Tells the parent to shut its admin listener down, returning its `original_start_time` so
	/// uptime stays monotonic across the restart.
	pub fn shutdown_parent_admin(&self) -> Result<Option<Instant>, RpcError> {
		let reply: Option<ShutdownParentAdminReply> = self.roundtrip(Opcode::ShutdownParentAdmin, &Empty::default())?;
		Ok(reply.map(|r| Instant::now() - std::time::Duration::from_secs(unix_now().saturating_sub(r.original_start_time_unix_secs))))
	}

	/// Asks the parent to duplicate its bound socket for `addr` and pass the FD over. `None` means
	/// there is no parent (the caller must bind fresh); the parent may also legitimately have no
	/// such listener, which its responder reports via an explicit `found: false` reply frame
	/// rather than by closing the connection - this is the same persistent stream every other
	/// hot-restart call reuses for the rest of this process's life, so it must survive a "not
	/// found" outcome.
	pub fn duplicate_parent_listen_socket(&self, addr: SocketAddr) -> Result<Option<OwnedFd>, RpcError> {
		let Some(lock) = &self.parent else {
			return Ok(None);
		};
		let mut stream = lock.lock().unwrap();
		write_frame(&mut stream, Opcode::DuplicateParentListenSocket, &DuplicateListenSocketRequest { addr: addr.to_string() })?;
		let (_, reply): (Opcode, DuplicateListenSocketReply) = read_frame(&mut stream)?;
		if !reply.found {
			return Ok(None);
		}
		Ok(Some(recv_fd(&stream)?))
	}

	pub fn get_parent_stats(&self) -> Result<Option<(i64, i64)>, RpcError> {
		let reply: Option<GetParentStatsReply> = self.roundtrip(Opcode::GetParentStats, &Empty::default())?;
		Ok(reply.map(|r| (r.memory_allocated, r.num_connections)))
	}

	pub fn drain_parent_listeners(&self) -> Result<(), RpcError> {
		let _: Option<Empty> = self.roundtrip(Opcode::DrainParentListeners, &Empty::default())?;
		Ok(())
	}

	pub fn terminate_parent(&self) -> Result<(), RpcError> {
		let _: Option<Empty> = self.roundtrip(Opcode::TerminateParent, &Empty::default())?;
		Ok(())
	}

	pub fn parent_version(&self) -> Result<Option<String>, RpcError> {
		let reply: Option<VersionReply> = self.roundtrip(Opcode::Version, &Empty::default())?;
		Ok(reply.map(|r| r.version))
	}
}

fn unix_now() -> u64 {
	std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// What a process must answer on behalf of its eventual successor - the same operations it
/// issues to its own parent, served symmetrically. Implemented by `server.rs` against the live
/// socket map, stats, and drain manager; kept as a narrow trait so the wire plumbing here doesn't
/// need to know about any of those types directly.
pub trait HotRestartContext: Send + Sync {
	/// Duplicates the listening socket bound to `addr`, or `None` if this process has no such
	/// listener.
	fn duplicate_listen_socket(&self, addr: SocketAddr) -> Option<OwnedFd>;
	fn parent_stats(&self) -> (i64, i64);
	fn drain_listeners(&self);
	/// Requests this process terminate - the end of its own parent-shutdown timer.
	fn terminate(&self);
	/// Shuts this process's admin listener down and reports its original start time so the
	/// requesting child's uptime stays monotonic across the restart.
	fn shutdown_admin(&self) -> u64;
	fn version(&self) -> String;
}

/// Server-side rendezvous point this process offers its eventual successor. Bound once during
/// Phase 1; a later epoch's [`HotRestart::connect`] dials this path. Requests are served on a
/// dedicated OS thread (the same pattern as the guard dog's background thread) since the wire
/// framing is blocking I/O and restart traffic is rare enough that it never needs to be async.
pub struct HotRestartListener {
	listener: UnixListener,
}

impl HotRestartListener {
	pub fn bind(restart_epoch: u32, base_dir: &Path) -> std::io::Result<Self> {
		let path = socket_path(base_dir, restart_epoch);
		let _ = std::fs::remove_file(&path);
		Ok(HotRestartListener {
			listener: UnixListener::bind(&path)?,
		})
	}

	/// Spawns the accept loop; returns immediately, the loop runs for the life of the process.
	pub fn spawn(self, ctx: Arc<dyn HotRestartContext>) {
		std::thread::Builder::new()
			.name("hot-restart-listener".to_string())
			.spawn(move || {
				for conn in self.listener.incoming() {
					match conn {
						Ok(stream) => {
							let ctx = ctx.clone();
							std::thread::spawn(move || {
								if let Err(e) = serve_one(stream, ctx.as_ref()) {
									tracing::warn!(error = %e, "hot-restart request failed");
								}
							});
						},
						Err(e) => tracing::warn!(error = %e, "hot-restart accept failed"),
					}
				}
			})
			.expect("failed to spawn hot-restart listener thread");
	}
}

fn serve_one(mut stream: UnixStream, ctx: &dyn HotRestartContext) -> Result<(), RpcError> {
	loop {
		let opcode = {
			let mut op_buf = [0u8; 1];
			match stream.read_exact(&mut op_buf) {
				Ok(()) => (),
				Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
				Err(e) => return Err(e.into()),
			}
			let mut len_buf = [0u8; 4];
			stream.read_exact(&mut len_buf)?;
			let len = u32::from_be_bytes(len_buf) as usize;
			let mut body = vec![0u8; len];
			stream.read_exact(&mut body)?;
			(Opcode::from_u8(op_buf[0]).ok_or(RpcError::ParentGone)?, body)
		};
		match opcode.0 {
			Opcode::ShutdownParentAdmin => {
				let original_start_time_unix_secs = ctx.shutdown_admin();
				write_frame(&mut stream, Opcode::ShutdownParentAdmin, &ShutdownParentAdminReply { original_start_time_unix_secs })?;
			},
			Opcode::DuplicateParentListenSocket => {
				let req: DuplicateListenSocketRequest = serde_json::from_slice(&opcode.1)?;
				let addr: SocketAddr = req.addr.parse().map_err(|_| RpcError::MissingFd)?;
				let fd = ctx.duplicate_listen_socket(addr);
				// Reported via an ordinary framed reply, not by closing the stream - a config
				// change between restart epochs legitimately adding a listener this parent never
				// had must not poison every later hot-restart call on this same persistent
				// connection (stats flush, drain notify, terminate notify).
				write_frame(&mut stream, Opcode::DuplicateParentListenSocket, &DuplicateListenSocketReply { found: fd.is_some() })?;
				if let Some(fd) = fd {
					send_fd(&stream, fd.as_raw_fd())?;
				}
			},
			Opcode::GetParentStats => {
				let (memory_allocated, num_connections) = ctx.parent_stats();
				write_frame(&mut stream, Opcode::GetParentStats, &GetParentStatsReply { memory_allocated, num_connections })?;
			},
			Opcode::DrainParentListeners => {
				ctx.drain_listeners();
				write_frame(&mut stream, Opcode::DrainParentListeners, &Empty::default())?;
			},
			Opcode::TerminateParent => {
				ctx.terminate();
				write_frame(&mut stream, Opcode::TerminateParent, &Empty::default())?;
			},
			Opcode::Shutdown => {
				write_frame(&mut stream, Opcode::Shutdown, &Empty::default())?;
			},
			Opcode::Version => {
				write_frame(&mut stream, Opcode::Version, &VersionReply { version: ctx.version() })?;
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn no_parent_at_epoch_zero_makes_every_operation_a_noop() {
		let dir = tempfile::tempdir().unwrap();
		let hr = HotRestart::connect(0, dir.path());
		assert!(!hr.has_parent());
		assert!(hr.get_parent_stats().unwrap().is_none());
		assert!(hr.drain_parent_listeners().is_ok());
	}

	#[test]
	fn connect_to_missing_socket_path_degrades_to_no_parent() {
		let dir = tempfile::tempdir().unwrap();
		let hr = HotRestart::connect(1, dir.path());
		assert!(!hr.has_parent());
	}

	#[test]
	fn frame_round_trips_over_a_real_socket_pair() {
		let (mut a, mut b) = UnixStream::pair().unwrap();
		write_frame(&mut a, Opcode::Version, &VersionReply { version: "1.2.3".to_string() }).unwrap();
		let (opcode, reply): (Opcode, VersionReply) = read_frame(&mut b).unwrap();
		assert_eq!(opcode, Opcode::Version);
		assert_eq!(reply.version, "1.2.3");
	}

	#[test]
	fn fd_passing_hands_over_a_working_descriptor() {
		let (a, b) = UnixStream::pair().unwrap();
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let expected_port = listener.local_addr().unwrap().port();
		send_fd(&a, listener.as_raw_fd()).unwrap();
		let received = recv_fd(&b).unwrap();
		let received_listener = std::net::TcpListener::from(received);
		assert_eq!(received_listener.local_addr().unwrap().port(), expected_port);
	}
}
