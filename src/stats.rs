//! Latency samples and fan-out counters for one scenario run.

use std::collections::BTreeMap;

use serde::Serialize;

/// Target used when a subscription names no explicit targets.
pub const ALL_TARGETS: &str = "all";

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub subscribed: u64,
    pub expected: u64,
}

#[derive(Debug, Default)]
pub struct Statistics {
    min: Option<f64>,
    max: Option<f64>,
    sum: f64,
    count: u64,
    values: Vec<f64>,
    tallies: BTreeMap<(String, String), Tally>,
    received: u64,
    delivered: u64,
    error_count: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, latency_ms: f64) {
        self.min = Some(self.min.map_or(latency_ms, |m| m.min(latency_ms)));
        self.max = Some(self.max.map_or(latency_ms, |m| m.max(latency_ms)));
        self.sum += latency_ms;
        self.count += 1;
        self.values.push(latency_ms);
    }

    /// One subscriber listening for `name` on each of `targets`, or on
    /// [`ALL_TARGETS`] when there are none.
    pub fn add_subscribed(&mut self, name: &str, targets: &[String]) {
        if targets.is_empty() {
            self.tally(name, ALL_TARGETS).subscribed += 1;
        } else {
            for target in targets {
                self.tally(name, target).subscribed += 1;
            }
        }
    }

    /// One publish of `name` against `target`; every current subscriber of
    /// that key should see it.
    pub fn add_expected(&mut self, name: &str, target: Option<&str>) {
        let tally = self.tally(name, target.unwrap_or(ALL_TARGETS));
        tally.expected += tally.subscribed;
    }

    fn tally(&mut self, name: &str, target: &str) -> &mut Tally {
        self.tallies
            .entry((name.to_string(), target.to_string()))
            .or_default()
    }

    pub fn get_subscribed(&self, name: &str, target: Option<&str>) -> u64 {
        self.lookup(name, target).subscribed
    }

    pub fn get_expected(&self, name: &str, target: Option<&str>) -> u64 {
        self.lookup(name, target).expected
    }

    fn lookup(&self, name: &str, target: Option<&str>) -> Tally {
        self.tallies
            .get(&(name.to_string(), target.unwrap_or(ALL_TARGETS).to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn total_expected(&self) -> u64 {
        self.tallies.values().map(|t| t.expected).sum()
    }

    pub fn tallies(&self) -> impl Iterator<Item = (&(String, String), &Tally)> {
        self.tallies.iter()
    }

    pub fn add_received(&mut self) {
        self.received += 1;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn add_delivered(&mut self) {
        self.delivered += 1;
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn add_error(&mut self) {
        self.error_count += 1;
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn get_min(&self) -> f64 {
        self.min.unwrap_or(0.0)
    }

    pub fn get_max(&self) -> f64 {
        self.max.unwrap_or(0.0)
    }

    pub fn get_avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Sorts the samples in place and returns the midpoint.
    ///
    /// Even lengths average the two central samples. Odd lengths take the
    /// sample at `(len + 1) / 2`, the upper-middle one, so `[10, 20, 30]`
    /// gives `30`. Recorded baselines depend on this rule.
    pub fn get_median(&mut self) -> f64 {
        let len = self.values.len();
        if len == 0 {
            return 0.0;
        }

        self.values.sort_by(f64::total_cmp);

        if len % 2 == 0 {
            let half = len / 2;
            (self.values[half - 1] + self.values[half]) / 2.0
        } else {
            self.values[((len + 1) / 2).min(len - 1)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_statistics_report_zeroes() {
        let mut stats = Statistics::new();

        assert_eq!(stats.get_min(), 0.0);
        assert_eq!(stats.get_max(), 0.0);
        assert_eq!(stats.get_avg(), 0.0);
        assert_eq!(stats.get_median(), 0.0);
    }

    #[test]
    fn running_min_max_avg() {
        let mut stats = Statistics::new();
        for v in [5.0, 1.0, 9.0, 3.0] {
            stats.add(v);
        }

        assert_eq!(stats.get_min(), 1.0);
        assert_eq!(stats.get_max(), 9.0);
        assert_eq!(stats.get_avg(), 4.5);
        assert_eq!(stats.count(), 4);
    }

    #[test]
    fn odd_median_takes_upper_middle() {
        let mut stats = Statistics::new();
        for v in [30.0, 10.0, 20.0] {
            stats.add(v);
        }

        assert_eq!(stats.get_median(), 30.0);
    }

    #[test]
    fn even_median_averages_center() {
        let mut stats = Statistics::new();
        for v in [4.0, 1.0, 3.0, 2.0] {
            stats.add(v);
        }

        assert_eq!(stats.get_median(), 2.5);
    }

    #[test]
    fn single_sample_median_is_that_sample() {
        let mut stats = Statistics::new();
        stats.add(7.0);

        assert_eq!(stats.get_median(), 7.0);
    }

    #[test]
    fn expected_counts_fan_out() {
        let mut stats = Statistics::new();
        for _ in 0..3 {
            stats.add_subscribed("foo", &[]);
        }

        stats.add_expected("foo", None);

        assert_eq!(stats.get_subscribed("foo", None), 3);
        assert_eq!(stats.get_expected("foo", None), 3);
        assert_eq!(stats.total_expected(), 3);
    }

    #[test]
    fn expected_only_counts_listening_targets() {
        let mut stats = Statistics::new();
        stats.add_subscribed("foo", &["d1".to_string(), "d2".to_string()]);
        stats.add_subscribed("foo", &["d1".to_string()]);

        stats.add_expected("foo", Some("d1"));
        stats.add_expected("foo", Some("d2"));
        stats.add_expected("foo", Some("d3"));
        stats.add_expected("bar", Some("d1"));

        assert_eq!(stats.get_expected("foo", Some("d1")), 2);
        assert_eq!(stats.get_expected("foo", Some("d2")), 1);
        assert_eq!(stats.get_expected("foo", Some("d3")), 0);
        assert_eq!(stats.total_expected(), 3);
    }

    #[test]
    fn error_flag_follows_count() {
        let mut stats = Statistics::new();
        assert!(!stats.has_errors());

        stats.add_error();
        assert!(stats.has_errors());
        assert_eq!(stats.error_count(), 1);
    }
}
