//! Rate-limited percent-complete reporting
//!
//! Pure observer: it never influences the transfer. At most one log line per
//! second, plus a guaranteed line when the position reaches the total.

use std::time::{Duration, Instant};

use log::info;

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Progress {
    label: &'static str,
    total: u64,
    current: u64,
    last_report: Instant,
}

impl Progress {
    pub fn new(label: &'static str) -> Self {
        Progress {
            label,
            total: 0,
            current: 0,
            last_report: Instant::now(),
        }
    }

    pub fn start(&mut self, total: u64) {
        self.total = total;
        self.current = 0;
        self.last_report = Instant::now();
        info!("{} total size {}", self.label, self.total);
    }

    pub fn update(&mut self, pos: u64) {
        self.current = pos;
        if self.last_report.elapsed() >= REPORT_INTERVAL || self.current == self.total {
            info!("{} {:.0}%", self.label, self.percent());
            self.last_report = Instant::now();
        }
    }

    fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.current as f64 / self.total as f64 * 100.0
    }
}
