//! In-memory write/replay positions shared by the in-memory stores.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{GateResult, LogPosition, PositionSource};

/// Write position counter with a simulated read replica.
///
/// Every committed store write calls [`ReplicationLog::record_write`]. A
/// synchronous log reports the replica as always caught up (single node); a
/// lagging log only replays when told to.
#[derive(Debug)]
pub struct ReplicationLog {
    written: AtomicU64,
    replayed: AtomicU64,
    follows_primary: bool,
    promoted: AtomicBool,
}

impl ReplicationLog {
    /// Replica replays every write as soon as it commits.
    pub fn synchronous() -> Self {
        Self::build(true)
    }

    /// Replica replays only via [`replay_to`](Self::replay_to) / [`replay_all`](Self::replay_all).
    pub fn lagging() -> Self {
        Self::build(false)
    }

    fn build(follows_primary: bool) -> Self {
        Self {
            written: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            follows_primary,
            promoted: AtomicBool::new(false),
        }
    }

    /// Advance the primary write position; returns the new position.
    pub fn record_write(&self) -> LogPosition {
        LogPosition(self.written.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Replay up to `position`, never past the primary and never backwards.
    pub fn replay_to(&self, position: LogPosition) {
        let ceiling = self.written.load(Ordering::SeqCst);
        self.replayed
            .fetch_max(position.0.min(ceiling), Ordering::SeqCst);
    }

    pub fn replay_all(&self) {
        self.replay_to(LogPosition(self.written.load(Ordering::SeqCst)));
    }

    /// Simulate failover: the replica stops replaying and serves as primary.
    pub fn promote_replica(&self) {
        self.promoted.store(true, Ordering::SeqCst);
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted.load(Ordering::SeqCst)
    }
}

impl Default for ReplicationLog {
    fn default() -> Self {
        Self::synchronous()
    }
}

impl PositionSource for ReplicationLog {
    fn write_position(&self) -> GateResult<LogPosition> {
        Ok(LogPosition(self.written.load(Ordering::SeqCst)))
    }

    fn replay_position(&self) -> GateResult<Option<LogPosition>> {
        if self.is_promoted() {
            return Ok(None);
        }
        let replayed = if self.follows_primary {
            self.written.load(Ordering::SeqCst)
        } else {
            self.replayed.load(Ordering::SeqCst)
        };
        Ok(Some(LogPosition(replayed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_never_passes_primary() {
        let log = ReplicationLog::lagging();
        log.record_write();
        log.replay_to(LogPosition(10));
        assert_eq!(log.replay_position().unwrap(), Some(LogPosition(1)));
    }

    #[test]
    fn test_replay_never_goes_backwards() {
        let log = ReplicationLog::lagging();
        log.record_write();
        log.record_write();
        log.replay_all();
        log.replay_to(LogPosition(1));
        assert_eq!(log.replay_position().unwrap(), Some(LogPosition(2)));
    }
}
