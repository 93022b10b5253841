//! Per-record mutual exclusion for ledger submissions.

use dashmap::DashSet;

/// Records with a transfer attempt currently in flight
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    records: DashSet<String>,
}

impl InFlightRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `record_id`; `None` if another attempt already holds it
    #[must_use]
    pub fn try_acquire(&self, record_id: &str) -> Option<InFlightGuard<'_>> {
        self.records
            .insert(record_id.to_string())
            .then(|| InFlightGuard {
                registry: self,
                record_id: record_id.to_string(),
            })
    }

    #[must_use]
    pub fn is_in_flight(&self, record_id: &str) -> bool {
        self.records.contains(record_id)
    }
}

/// Releases the record when dropped, including on early return or panic
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    registry: &'a InFlightRegistry,
    record_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.records.remove(&self.record_id);
    }
}
