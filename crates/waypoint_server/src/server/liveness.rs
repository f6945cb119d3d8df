#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::{DEFAULT_LIVENESS_PERIOD, DEFAULT_MAX_MISSED_PROBES};
use crate::server::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
	pub period: Duration,
	/// Unanswered probe rounds before termination (at least 1).
	pub max_missed_probes: u32,
}

impl Default for LivenessConfig {
	fn default() -> Self {
		Self {
			period: DEFAULT_LIVENESS_PERIOD,
			max_missed_probes: DEFAULT_MAX_MISSED_PROBES,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
	pub probed: usize,
	pub terminated: usize,
}

/// Periodic probe-and-evict sweep over the registry.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
	registry: ConnectionRegistry,
	cfg: LivenessConfig,
}

impl LivenessMonitor {
	pub fn new(registry: ConnectionRegistry, cfg: LivenessConfig) -> Self {
		let cfg = LivenessConfig {
			max_missed_probes: cfg.max_missed_probes.max(1),
			..cfg
		};
		Self { registry, cfg }
	}

	pub fn config(&self) -> LivenessConfig {
		self.cfg
	}

	/// One round: terminate connections that missed too many probes, probe the rest.
	///
	/// Termination only signals the socket task; its close path deregisters and
	/// tears down the queue.
	pub fn sweep(&self) -> SweepReport {
		let mut report = SweepReport::default();

		self.registry.for_each(|identity, record| {
			if !record.liveness.is_alive() {
				let missed = record.liveness.record_miss();
				if missed >= self.cfg.max_missed_probes {
					info!(
						identity = %identity,
						conn_id = record.conn_id(),
						missed,
						"liveness: terminating unresponsive connection"
					);
					record.handle.terminate();
					metrics::counter!("waypoint_liveness_terminations_total").increment(1);
					report.terminated += 1;
					return;
				}
			}

			record.liveness.arm();
			if record.handle.probe().is_ok() {
				report.probed += 1;
			}
		});

		let pruned = self.registry.prune_idle_locks();
		metrics::gauge!("waypoint_registered_connections").set(self.registry.len() as f64);

		if report.terminated > 0 || pruned > 0 {
			debug!(
				probed = report.probed,
				terminated = report.terminated,
				pruned_locks = pruned,
				"liveness: sweep complete"
			);
		}

		report
	}

	/// Run `sweep` every period until the task is aborted.
	pub fn spawn(self) -> JoinHandle<()> {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(self.cfg.period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			// The first tick completes immediately.
			ticker.tick().await;

			loop {
				ticker.tick().await;
				self.sweep();
			}
		})
	}
}
