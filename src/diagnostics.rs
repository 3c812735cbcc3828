use log::warn;

/// Counter for recoverable numerical hazards (NaN positions, out-of-grid
/// evaluations, interpolation range errors). Emits one log record per
/// `limit` occurrences so a pathological step cannot flood the log.
#[derive(Debug)]
pub struct DiagnosticCounter {
    label: &'static str,
    limit: u64,
    count: u64,
}

impl DiagnosticCounter {
    pub fn new(label: &'static str, limit: u64) -> Self {
        assert!(limit > 0);
        Self {
            label,
            limit,
            count: 0,
        }
    }

    pub fn record(&mut self, detail: impl FnOnce() -> String) {
        if self.count % self.limit == 0 {
            warn!("{}: {} (occurrence {})", self.label, detail(), self.count + 1);
        }
        self.count += 1;
    }

    pub fn total(&self) -> u64 {
        self.count
    }

    pub fn report(&self) {
        if self.count > 0 {
            warn!("{}: {} total occurrences", self.label, self.count);
        }
    }
}
