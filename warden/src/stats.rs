//! Process-wide stats registry: the sink *wire format* stays out of scope, but the `StatsSink`
//! trait boundary and a real `prometheus-client` registry are in scope, since the stats-flush
//! timer in `server.rs` needs something real to call every tick.
//!
//! `prometheus_client::Counter::get` returns a cumulative total, not a delta, so `flush` tracks
//! each counter's last-seen value itself and reports only the difference.

use std::collections::HashMap;
use std::sync::Mutex;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::info;
use warden_core::watchdog::WatchdogMetrics;

/// Where flushed counters/gauges go. The only shipped implementation is [`LogSink`]; a
/// statsd/TCP sink is an external collaborator's problem, out of scope here.
pub trait StatsSink: Send + Sync {
	fn flush_counter(&self, name: &str, delta: u64);
	fn flush_gauge(&self, name: &str, value: i64);
}

/// Writes every flushed value as a `tracing` event. Debuggable, not performant - exactly the
/// role a "sink" plays in this core: the wire format is someone else's problem.
pub struct LogSink;

impl StatsSink for LogSink {
	fn flush_counter(&self, name: &str, delta: u64) {
		info!(counter = name, delta, "stats flush");
	}

	fn flush_gauge(&self, name: &str, value: i64) {
		info!(gauge = name, value, "stats flush");
	}
}

/// The process-wide metric set. Counters/gauges are registered once at construction; `flush`
/// latches each counter's delta since the last flush (`prometheus_client`'s `Counter::get` is
/// cumulative, so the delta is computed locally) and reports each gauge's current value.
pub struct Stats {
	registry: Registry,
	server_version: Gauge,
	watchdog_miss: Counter,
	watchdog_mega_miss: Counter,
	num_connections: Gauge,
	memory_allocated: Gauge,
	last_counter_values: Mutex<HashMap<&'static str, u64>>,
}

impl Stats {
	pub fn new() -> Self {
		let mut registry = Registry::default();
		let server_version = Gauge::default();
		let watchdog_miss = Counter::default();
		let watchdog_mega_miss = Counter::default();
		let num_connections = Gauge::default();
		let memory_allocated = Gauge::default();

		registry.register("server_version", "Build SHA fingerprint", server_version.clone());
		registry.register("watchdog_miss", "Watchdog miss transitions", watchdog_miss.clone());
		registry.register("watchdog_mega_miss", "Watchdog mega-miss transitions", watchdog_mega_miss.clone());
		registry.register("num_connections", "Live connections across all workers", num_connections.clone());
		registry.register("memory_allocated", "Reported allocator usage", memory_allocated.clone());

		Stats {
			registry,
			server_version,
			watchdog_miss,
			watchdog_mega_miss,
			num_connections,
			memory_allocated,
			last_counter_values: Mutex::new(HashMap::new()),
		}
	}

	pub fn set_server_version(&self, value: u32) {
		self.server_version.set(value as i64);
	}

	pub fn set_num_connections(&self, value: i64) {
		self.num_connections.set(value);
	}

	/// Applies a signed delta to the shared connection-count gauge. Each worker reports only the
	/// change since its own last tick (not an absolute value), since `num_connections` aggregates
	/// across every worker's independently-ticking `ConnectionHandler`.
	pub fn adjust_num_connections(&self, delta: i64) {
		if delta > 0 {
			self.num_connections.inc_by(delta);
		} else if delta < 0 {
			self.num_connections.dec_by(-delta);
		}
	}

	pub fn set_memory_allocated(&self, value: i64) {
		self.memory_allocated.set(value);
	}

	/// Current aggregate connection count across all workers, for the hot-restart `getParentStats`
	/// reply.
	pub fn num_connections(&self) -> i64 {
		self.num_connections.get()
	}

	/// Current reported allocator usage, for the same reply.
	pub fn memory_allocated(&self) -> i64 {
		self.memory_allocated.get()
	}

	/// Renders the registry in Prometheus text exposition format, for the admin `/stats` route.
	pub fn render(&self) -> String {
		let mut buf = String::new();
		let _ = encode(&mut buf, &self.registry);
		buf
	}

	/// Publishes every counter's delta since the last flush and every gauge's current value to
	/// `sink`, then re-arms nothing itself - the caller owns the timer.
	pub fn flush(&self, sink: &dyn StatsSink) {
		self.flush_counter_delta(sink, "watchdog_miss", self.watchdog_miss.get());
		self.flush_counter_delta(sink, "watchdog_mega_miss", self.watchdog_mega_miss.get());
		sink.flush_gauge("server_version", self.server_version.get());
		sink.flush_gauge("num_connections", self.num_connections.get());
		sink.flush_gauge("memory_allocated", self.memory_allocated.get());
	}

	fn flush_counter_delta(&self, sink: &dyn StatsSink, name: &'static str, current: u64) {
		let mut last = self.last_counter_values.lock().unwrap();
		let previous = *last.get(name).unwrap_or(&0);
		let delta = current.saturating_sub(previous);
		last.insert(name, current);
		if delta > 0 {
			sink.flush_counter(name, delta);
		}
	}
}

impl Default for Stats {
	fn default() -> Self {
		Stats::new()
	}
}

/// Bridges the guard dog's narrow [`WatchdogMetrics`] contract onto the shared [`Stats`]
/// registry, so "watchdog_miss"/"watchdog_mega_miss" land as real counters rather than only log
/// lines.
pub struct StatsWatchdogMetrics {
	stats: std::sync::Arc<Stats>,
}

impl StatsWatchdogMetrics {
	pub fn new(stats: std::sync::Arc<Stats>) -> Self {
		StatsWatchdogMetrics { stats }
	}
}

impl WatchdogMetrics for StatsWatchdogMetrics {
	fn incr_miss(&self, _thread_name: &str) {
		self.stats.watchdog_miss.inc();
	}

	fn incr_mega_miss(&self, _thread_name: &str) {
		self.stats.watchdog_mega_miss.inc();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct RecordingSink {
		counters: Mutex<Vec<(String, u64)>>,
		gauges: Mutex<Vec<(String, i64)>>,
	}

	impl RecordingSink {
		fn new() -> Self {
			RecordingSink {
				counters: Mutex::new(Vec::new()),
				gauges: Mutex::new(Vec::new()),
			}
		}
	}

	impl StatsSink for RecordingSink {
		fn flush_counter(&self, name: &str, delta: u64) {
			self.counters.lock().unwrap().push((name.to_string(), delta));
		}

		fn flush_gauge(&self, name: &str, value: i64) {
			self.gauges.lock().unwrap().push((name.to_string(), value));
		}
	}

	#[test]
	fn flush_reports_counter_delta_not_cumulative_total() {
		let stats = Stats::new();
		let metrics = StatsWatchdogMetrics::new(std::sync::Arc::new(Stats::new()));
		let _ = &metrics; // separate instance; real wiring shares one Arc<Stats>

		stats.watchdog_miss.inc();
		stats.watchdog_miss.inc();
		let sink = RecordingSink::new();
		stats.flush(&sink);
		assert_eq!(sink.counters.lock().unwrap().iter().find(|(n, _)| n == "watchdog_miss").unwrap().1, 2);

		stats.watchdog_miss.inc();
		stats.flush(&sink);
		assert_eq!(sink.counters.lock().unwrap().iter().filter(|(n, _)| n == "watchdog_miss").last().unwrap().1, 1);
	}

	#[test]
	fn gauges_report_current_value_every_flush() {
		let stats = Stats::new();
		stats.set_num_connections(5);
		let sink = RecordingSink::new();
		stats.flush(&sink);
		assert_eq!(sink.gauges.lock().unwrap().iter().find(|(n, _)| n == "num_connections").unwrap().1, 5);
	}

	#[test]
	fn render_includes_registered_metric_names() {
		let stats = Stats::new();
		stats.set_server_version(42);
		let text = stats.render();
		assert!(text.contains("server_version"));
	}
}
