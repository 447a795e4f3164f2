//! The configuration surface: full JSON-schema validation stays a collaborator's problem, but
//! everything downstream (listener binding, worker count, watchdog margins, drain/parent-shutdown
//! timing) depends on a real, typed struct, so that part is built here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Anything that can turn an accepted connection into a runnable pipeline. The actual filter
/// logic (HTTP routing, upstream load balancing, rate limiting) is explicitly out of scope here
/// - this is the narrow seam a hosted data plane plugs into.
pub trait FilterChainFactory: Send + Sync {
	/// Human-readable name, used in logs and the admin config dump.
	fn name(&self) -> &str;
	fn build(&self) -> FilterChain;
}

/// Opaque marker returned by a [`FilterChainFactory`]. A real data plane would hang protocol
/// state off this; the supervisory core only needs to know one exists per accepted connection.
#[derive(Debug, Default)]
pub struct FilterChain {
	pub name: String,
}

/// A factory that builds an empty filter chain, used when a listener declares no behavior of its
/// own (e.g. a bare TCP echo/health listener) and by tests.
pub struct NullFilterChainFactory;

impl FilterChainFactory for NullFilterChainFactory {
	fn name(&self) -> &str {
		"null"
	}
	fn build(&self) -> FilterChain {
		FilterChain {
			name: "null".to_string(),
		}
	}
}

/// Immutable per-address listener description. Identity is the `Arc` pointer, not
/// the bind address - two listeners on the same address are distinct entries.
pub struct ListenerConfig {
	pub name: String,
	pub bind_address: SocketAddr,
	pub bind_to_port: bool,
	pub use_original_dst: bool,
	pub filter_chain_factory: Arc<dyn FilterChainFactory>,
}

impl std::fmt::Debug for ListenerConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ListenerConfig")
			.field("name", &self.name)
			.field("bind_address", &self.bind_address)
			.field("bind_to_port", &self.bind_to_port)
			.field("use_original_dst", &self.use_original_dst)
			.finish()
	}
}

/// Identity key for `ListenerConfig` - compared by identity, not address. Wraps the `Arc`
/// pointer address so it can key a `HashMap` without requiring `Hash`/`Eq` on the listener
/// contents themselves.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ListenerKey(usize);

impl ListenerKey {
	pub fn of(cfg: &Arc<ListenerConfig>) -> Self {
		ListenerKey(Arc::as_ptr(cfg) as usize)
	}
}

/// Parsed top-level document. Schema validation beyond "deserializes and has the fields below"
/// is out of scope here; the struct itself is in scope because every phase of `ServerInstance`
/// depends on it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RawConfig {
	pub concurrency: usize,
	pub admin_address: SocketAddr,
	pub listeners: Vec<RawListener>,
	pub drain_timeout_secs: u64,
	pub parent_shutdown_time_secs: u64,
	pub stats_flush_interval_secs: u64,
	pub watchdog_miss_margin_secs: u64,
	pub watchdog_megamiss_margin_secs: u64,
	pub watchdog_kill_timeout_secs: u64,
	pub watchdog_multikill_timeout_secs: u64,
}

impl Default for RawConfig {
	fn default() -> Self {
		RawConfig {
			concurrency: 1,
			admin_address: "127.0.0.1:9901".parse().unwrap(),
			listeners: Vec::new(),
			drain_timeout_secs: 600,
			parent_shutdown_time_secs: 900,
			stats_flush_interval_secs: 5,
			watchdog_miss_margin_secs: 1,
			watchdog_megamiss_margin_secs: 2,
			watchdog_kill_timeout_secs: 0,
			watchdog_multikill_timeout_secs: 0,
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawListener {
	pub name: String,
	pub bind_address: SocketAddr,
	#[serde(default = "default_true")]
	pub bind_to_port: bool,
	#[serde(default)]
	pub use_original_dst: bool,
}

fn default_true() -> bool {
	true
}

/// The fully resolved runtime configuration, built from [`RawConfig`] plus CLI overrides and the
/// concrete `FilterChainFactory`s the embedding binary supplies per listener name.
#[derive(Clone)]
pub struct Config {
	pub concurrency: usize,
	pub admin_address: SocketAddr,
	pub listeners: Vec<Arc<ListenerConfig>>,
	pub drain_timeout: Duration,
	pub parent_shutdown_time: Duration,
	pub stats_flush_interval: Duration,
	pub watchdog: WatchdogMargins,
	pub restart_epoch: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct WatchdogMargins {
	pub miss_margin: Duration,
	pub megamiss_margin: Duration,
	pub kill_timeout: Duration,
	pub multikill_timeout: Duration,
}

impl Config {
	/// Loads and parses `path` as JSON, falling back to YAML as a convenience format. Every
	/// listener is given the null filter chain; a real binary overrides individual listeners via
	/// [`Config::with_filter_chain`].
	pub fn load(path: &Path, restart_epoch: u32, concurrency_override: Option<usize>) -> Result<Self, ConfigError> {
		let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.display().to_string(),
			source,
		})?;
		let raw: RawConfig = serde_json::from_str(&contents)
			.or_else(|json_err| serde_yaml::from_str(&contents).map_err(|yaml_err| {
				ConfigError::Parse(format!("as JSON: {json_err}; as YAML: {yaml_err}"))
			}))?;
		Ok(Self::from_raw(raw, restart_epoch, concurrency_override))
	}

	pub fn from_raw(raw: RawConfig, restart_epoch: u32, concurrency_override: Option<usize>) -> Self {
		let listeners = raw
			.listeners
			.iter()
			.map(|l| {
				Arc::new(ListenerConfig {
					name: l.name.clone(),
					bind_address: l.bind_address,
					bind_to_port: l.bind_to_port,
					use_original_dst: l.use_original_dst,
					filter_chain_factory: Arc::new(NullFilterChainFactory),
				})
			})
			.collect();
		Config {
			concurrency: concurrency_override.unwrap_or(raw.concurrency).max(1),
			admin_address: raw.admin_address,
			listeners,
			drain_timeout: Duration::from_secs(raw.drain_timeout_secs),
			parent_shutdown_time: Duration::from_secs(raw.parent_shutdown_time_secs),
			stats_flush_interval: Duration::from_secs(raw.stats_flush_interval_secs),
			watchdog: WatchdogMargins {
				miss_margin: Duration::from_secs(raw.watchdog_miss_margin_secs),
				megamiss_margin: Duration::from_secs(raw.watchdog_megamiss_margin_secs),
				kill_timeout: Duration::from_secs(raw.watchdog_kill_timeout_secs),
				multikill_timeout: Duration::from_secs(raw.watchdog_multikill_timeout_secs),
			},
			restart_epoch,
		}
	}

	/// Replaces the filter-chain factory for every listener whose name is a key in `factories`.
	/// Used by the embedding binary to wire its actual protocol handling in; the core never
	/// constructs a non-null factory itself.
	pub fn with_filter_chains(mut self, mut factories: HashMap<String, Arc<dyn FilterChainFactory>>) -> Self {
		self.listeners = self
			.listeners
			.into_iter()
			.map(|lc| match factories.remove(&lc.name) {
				Some(factory) => Arc::new(ListenerConfig {
					name: lc.name.clone(),
					bind_address: lc.bind_address,
					bind_to_port: lc.bind_to_port,
					use_original_dst: lc.use_original_dst,
					filter_chain_factory: factory,
				}),
				None => lc,
			})
			.collect();
		self
	}
}

/// Directory holding the ephemeral server flag files. Only `drain` is consulted at start-up
/// today; the type stays generic so the embedding binary can probe other flags through the same
/// path without threading a bare `PathBuf` around.
#[derive(Clone, Debug)]
pub struct FlagsPath(pub PathBuf);

impl FlagsPath {
	/// `true` if `$flagsPath/drain` exists - health-check begins failing from start.
	pub fn health_check_fails_from_start(&self) -> bool {
		self.0.join("drain").exists()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_raw_config_has_sane_fallbacks() {
		let raw = RawConfig::default();
		assert_eq!(raw.concurrency, 1);
		assert!(raw.listeners.is_empty());
	}

	#[test]
	fn listener_key_distinguishes_same_address_distinct_arcs() {
		let factory: Arc<dyn FilterChainFactory> = Arc::new(NullFilterChainFactory);
		let a = Arc::new(ListenerConfig {
			name: "a".into(),
			bind_address: "127.0.0.1:9000".parse().unwrap(),
			bind_to_port: true,
			use_original_dst: false,
			filter_chain_factory: factory.clone(),
		});
		let b = Arc::new(ListenerConfig {
			name: "a".into(),
			bind_address: "127.0.0.1:9000".parse().unwrap(),
			bind_to_port: true,
			use_original_dst: false,
			filter_chain_factory: factory,
		});
		assert_ne!(ListenerKey::of(&a), ListenerKey::of(&b));
		assert_eq!(ListenerKey::of(&a), ListenerKey::of(&a));
	}

	#[test]
	fn health_check_fails_only_when_drain_flag_present() {
		let dir = tempfile::tempdir().unwrap();
		let flags = FlagsPath(dir.path().to_path_buf());
		assert!(!flags.health_check_fails_from_start());
		std::fs::write(dir.path().join("drain"), b"").unwrap();
		assert!(flags.health_check_fails_from_start());
	}

	#[test]
	fn json_or_yaml_both_parse() {
		let dir = tempfile::tempdir().unwrap();
		let json_path = dir.path().join("c.json");
		std::fs::write(&json_path, r#"{"concurrency": 3}"#).unwrap();
		let cfg = Config::load(&json_path, 0, None).unwrap();
		assert_eq!(cfg.concurrency, 3);

		let yaml_path = dir.path().join("c.yaml");
		std::fs::write(&yaml_path, "concurrency: 4\n").unwrap();
		let cfg = Config::load(&yaml_path, 0, None).unwrap();
		assert_eq!(cfg.concurrency, 4);
	}

	#[test]
	fn concurrency_override_wins_and_is_at_least_one() {
		let raw = RawConfig {
			concurrency: 5,
			..Default::default()
		};
		let cfg = Config::from_raw(raw.clone(), 0, Some(2));
		assert_eq!(cfg.concurrency, 2);
		let cfg = Config::from_raw(raw, 0, Some(0));
		assert_eq!(cfg.concurrency, 1);
	}
}
