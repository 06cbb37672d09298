use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::stats::Statistics;

use super::config::{ScenarioConfig, ScenarioKind};
use super::runner::ScenarioPhase;

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TallyRow {
    pub name: String,
    pub target: String,
    pub subscribed: u64,
    pub expected: u64,
}

/// Snapshot of one finished scenario run.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioRunResult {
    pub name: String,
    pub kind: ScenarioKind,
    pub devices: usize,
    pub clients: usize,
    pub interval_millis: u64,
    pub wait_delay: u64,
    pub total: usize,
    pub sent: usize,
    pub received: u64,
    /// Pushes observed by devices.
    pub delivered: u64,
    /// Pushes devices should have observed, given their subscriptions.
    pub expected: u64,
    pub errors_count: u64,
    pub degraded: bool,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub elapsed_millis: u64,
    pub tallies: Vec<TallyRow>,
    pub phases: Vec<ScenarioPhase>,
}

impl ScenarioRunResult {
    pub(crate) fn new(
        config: &ScenarioConfig,
        stats: &mut Statistics,
        sent: usize,
        elapsed: Duration,
        phases: Vec<ScenarioPhase>,
    ) -> Self {
        let tallies = stats
            .tallies()
            .map(|((name, target), tally)| TallyRow {
                name: name.clone(),
                target: target.clone(),
                subscribed: tally.subscribed,
                expected: tally.expected,
            })
            .collect();

        ScenarioRunResult {
            name: config.name.clone(),
            kind: config.kind,
            devices: config.devices,
            clients: config.clients,
            interval_millis: config.interval_millis,
            wait_delay: config.wait_delay,
            total: config.total,
            sent,
            received: stats.received(),
            delivered: stats.delivered(),
            expected: stats.total_expected(),
            errors_count: stats.error_count(),
            degraded: stats.has_errors(),
            min: stats.get_min(),
            max: stats.get_max(),
            avg: stats.get_avg(),
            median: stats.get_median(),
            elapsed_millis: elapsed.as_millis() as u64,
            tallies,
            phases,
        }
    }
}

impl fmt::Display for ScenarioRunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({:?})", self.name, self.kind)?;
        writeln!(
            f,
            "  devices: {}  clients: {}  interval: {}ms  wait delay: {}ms",
            self.devices, self.clients, self.interval_millis, self.wait_delay
        )?;
        writeln!(
            f,
            "  sent: {}/{}  received: {}  delivered: {}/{}  errors: {}{}",
            self.sent,
            self.total,
            self.received,
            self.delivered,
            self.expected,
            self.errors_count,
            if self.degraded { " (degraded)" } else { "" }
        )?;
        write!(
            f,
            "  latency ms: min {:.2}  max {:.2}  avg {:.2}  median {:.2}  ({}ms total)",
            self.min, self.max, self.avg, self.median, self.elapsed_millis
        )
    }
}
