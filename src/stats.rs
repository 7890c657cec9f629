//! Performance counters, accumulated over the life of the process and
//! dumped on SIGUSR1 and at shutdown.

use std::time::Duration;

use tracing::info;

#[derive(Debug, Default)]
pub struct Stats {
    pub events_ingested: u64,
    pub events_coalesced: u64,
    pub cookies_pushed: u64,
    pub cookies_dispatched: u64,
    /// Replies whose owner handle had gone stale.
    pub cookies_stale_dropped: u64,
    /// Replies with no registered cookie.
    pub replies_unmatched: u64,
    pub cookies_timed_out: u64,
    pub clients_managed: u64,
    pub clients_unmanaged: u64,
    pub configures_applied: u64,
    pub restacks_applied: u64,
    pub flushes: u64,
    pub cycles: u64,
    pub cycle_time_total: Duration,
    pub cycle_time_min: Duration,
    pub cycle_time_max: Duration,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&mut self, elapsed: Duration) {
        if self.cycles == 0 || elapsed < self.cycle_time_min {
            self.cycle_time_min = elapsed;
        }
        self.cycles += 1;
        self.cycle_time_total += elapsed;
        if elapsed > self.cycle_time_max {
            self.cycle_time_max = elapsed;
        }
    }

    pub fn dump(&self) {
        let avg = if self.cycles > 0 {
            self.cycle_time_total / self.cycles as u32
        } else {
            Duration::ZERO
        };
        info!(
            "stats: cycles={} min={:?} avg={:?} max={:?} events={} coalesced={} flushes={}",
            self.cycles,
            self.cycle_time_min,
            avg,
            self.cycle_time_max,
            self.events_ingested,
            self.events_coalesced,
            self.flushes,
        );
        info!(
            "stats: cookies pushed={} dispatched={} stale={} unmatched={} timed_out={}",
            self.cookies_pushed,
            self.cookies_dispatched,
            self.cookies_stale_dropped,
            self.replies_unmatched,
            self.cookies_timed_out,
        );
        info!(
            "stats: managed={} unmanaged={} configures={} restacks={}",
            self.clients_managed,
            self.clients_unmanaged,
            self.configures_applied,
            self.restacks_applied,
        );
    }
}
