//! The minimal admin HTTP surface: business logic behind each route is a one-line call into the
//! core; the HTTP plumbing itself follows a raw-hyper bind-and-serve pattern, simplified to a
//! single plaintext listener since TLS/virtual-host routing is out of scope here.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tracing::{info, warn};
use warden_core::graceful::DrainWatcher;
use warden_core::signal::ShutdownTrigger;
use warden_core::version::BuildInfo;

use crate::config::FlagsPath;
use crate::stats::Stats;

type Body = Full<Bytes>;

struct AdminState {
	flags_path: FlagsPath,
	shutdown_trigger: ShutdownTrigger,
	stats: Arc<Stats>,
	build_info: BuildInfo,
}

/// Owns the bound admin socket until [`AdminServer::spawn`] hands each connection off to its own
/// task. Kept separate from bind so `ServerInstance` can read the resolved local address (e.g.
/// after binding to port 0 in tests) before serving starts.
pub struct AdminServer {
	listener: TcpListener,
	state: Arc<AdminState>,
}

impl AdminServer {
	pub async fn bind(addr: SocketAddr, flags_path: FlagsPath, shutdown_trigger: ShutdownTrigger, stats: Arc<Stats>) -> std::io::Result<Self> {
		let listener = TcpListener::bind(addr).await?;
		Ok(AdminServer {
			listener,
			state: Arc::new(AdminState {
				flags_path,
				shutdown_trigger,
				stats,
				build_info: BuildInfo::new(),
			}),
		})
	}

	pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
		self.listener.local_addr()
	}

	/// Accepts connections until `drain` signals, each wrapped so in-flight requests finish
	/// before the task returns. Realized as an ordinary hyper accept loop rather than going
	/// through `ConnectionHandler`, since admin traffic never touches the data-plane connection
	/// slab.
	pub fn spawn(self, drain: DrainWatcher) {
		let state = self.state;
		tokio::spawn(async move {
			loop {
				let (stream, peer) = match self.listener.accept().await {
					Ok(pair) => pair,
					Err(e) => {
						warn!(error = %e, "admin accept failed");
						continue;
					},
				};
				let _ = stream.set_nodelay(true);
				let state = state.clone();
				let drain = drain.clone();
				tokio::spawn(async move {
					let io = TokioIo::new(stream);
					let service = hyper::service::service_fn(move |req| {
						let state = state.clone();
						async move { Ok::<_, Infallible>(route(&state, req).await) }
					});
					let conn = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new()).serve_connection(io, service);
					if let Err(e) = drain.wrap_connection(conn).await {
						warn!(error = ?e, %peer, "admin connection error");
					}
				});
			}
		});
	}
}

async fn route(state: &AdminState, req: Request<Incoming>) -> Response<Body> {
	match (req.method(), req.uri().path()) {
		(&hyper::Method::POST, "/healthcheck/fail") => handle_healthcheck_fail(state),
		(&hyper::Method::GET, "/hot_restart_version") => text_response(StatusCode::OK, state.build_info.to_string()),
		(&hyper::Method::GET, "/stats") => text_response(StatusCode::OK, state.stats.render()),
		(&hyper::Method::POST, "/quitquitquit") => handle_quitquitquit(state).await,
		_ => text_response(StatusCode::NOT_FOUND, "no such admin route\n".to_string()),
	}
}

fn handle_healthcheck_fail(state: &AdminState) -> Response<Body> {
	let flag = state.flags_path.0.join("drain");
	match std::fs::write(&flag, b"") {
		Ok(()) => {
			info!("admin: forced health-check failure via /healthcheck/fail");
			text_response(StatusCode::OK, "OK\n".to_string())
		},
		Err(e) => {
			warn!(error = %e, "failed to write drain flag file");
			text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n"))
		},
	}
}

async fn handle_quitquitquit(state: &AdminState) -> Response<Body> {
	info!("admin: /quitquitquit invoked, starting shutdown");
	state.shutdown_trigger.shutdown_now().await;
	text_response(StatusCode::OK, "OK\n".to_string())
}

fn text_response(status: StatusCode, body: String) -> Response<Body> {
	Response::builder().status(status).header(hyper::header::CONTENT_TYPE, "text/plain").body(Full::new(Bytes::from(body))).expect("static response is well-formed")
}

#[cfg(test)]
mod tests {
	use warden_core::signal::Shutdown;

	use super::*;

	#[tokio::test]
	async fn healthcheck_fail_writes_drain_flag() {
		let dir = tempfile::tempdir().unwrap();
		let shutdown = Shutdown::new();
		let state = AdminState {
			flags_path: FlagsPath(dir.path().to_path_buf()),
			shutdown_trigger: shutdown.trigger(),
			stats: Arc::new(Stats::new()),
			build_info: BuildInfo::new(),
		};
		let resp = handle_healthcheck_fail(&state);
		assert_eq!(resp.status(), StatusCode::OK);
		assert!(dir.path().join("drain").exists());
	}

	#[tokio::test]
	async fn stats_route_renders_registered_metric_names() {
		let stats = Arc::new(Stats::new());
		stats.set_num_connections(3);
		let text = stats.render();
		assert!(text.contains("num_connections"));
	}
}
