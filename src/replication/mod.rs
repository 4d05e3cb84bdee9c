//! # Replication-Consistency Gate
//!
//! Read-your-writes barrier between the primary store and a read-only replica.
//!
//! After a write commits, the caller captures the primary's write position and
//! calls [`ReplicationGate::wait_for_replica`]. The gate polls the replica's
//! replay position at a fixed interval, for a bounded number of polls, until
//! the replica has replayed at least that far.
//!
//! ## Outcomes
//!
//! - Replica caught up: any read issued afterwards through the replica observes
//!   the caller's write.
//! - Replica reports no replay position: it has been promoted and now serves
//!   reads as primary, so reads are trivially consistent.
//! - Poll ceiling reached: [`GateError::ReplicaLagTimeout`]. The write has
//!   already committed and is never undone; this is a staleness warning.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

mod log;
pub use log::ReplicationLog;

/// Position in the store's write-ahead stream.
///
/// Used both for "how much the primary has written" and "how much the replica
/// has replayed". Only ordering is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogPosition(pub u64);

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of primary and replica positions.
pub trait PositionSource: Send + Sync {
    /// Current write position of the primary.
    fn write_position(&self) -> GateResult<LogPosition>;

    /// Replay position of the read replica, or `None` when the replica is no
    /// longer replaying (it has become primary).
    fn replay_position(&self) -> GateResult<Option<LogPosition>>;
}

/// Blocking pause between polls. Injected so tests do not sleep.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Gate polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Maximum number of sleeps before giving up (default: 1000)
    pub max_polls: u32,
    /// Delay between polls in milliseconds (default: 100)
    pub poll_interval_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_polls: 1000,
            poll_interval_ms: 100,
        }
    }
}

impl GateConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Longest time a caller can be held by the gate.
    pub fn ceiling(&self) -> Duration {
        self.poll_interval() * self.max_polls
    }
}

/// Details of a replica that did not catch up in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaLag {
    /// Write position the caller waited for
    pub target: LogPosition,
    /// Last replay position observed
    pub replayed: LogPosition,
    /// Time spent polling
    pub waited_ms: u64,
}

impl fmt::Display for ReplicaLag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replica replayed up to {} but write is at {} after waiting {}ms",
            self.replayed, self.target, self.waited_ms
        )
    }
}

/// Replication gate errors
#[derive(Debug, Clone, Error)]
pub enum GateError {
    /// Replica did not reach the target within the poll ceiling.
    #[error("Replica lag timeout: {0}")]
    ReplicaLagTimeout(ReplicaLag),

    /// Positions could not be read from the store.
    #[error("Replication position unavailable: {0}")]
    PositionUnavailable(String),
}

pub type GateResult<T> = Result<T, GateError>;

/// How a successful wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatchUp {
    /// Replica replayed past the target after `polls` sleeps.
    Replayed { polls: u32 },
    /// Replica was promoted; no wait needed.
    Promoted,
}

/// Snapshot of primary/replica positions for health checks.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStatus {
    pub write_position: LogPosition,
    pub replay_position: Option<LogPosition>,
    pub in_sync: bool,
    pub promoted: bool,
}

/// Bounded read-your-writes barrier.
#[derive(Clone)]
pub struct ReplicationGate {
    source: Arc<dyn PositionSource>,
    sleeper: Arc<dyn Sleeper>,
    config: GateConfig,
}

impl ReplicationGate {
    pub fn new(source: Arc<dyn PositionSource>, config: GateConfig) -> Self {
        Self::with_sleeper(source, config, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(
        source: Arc<dyn PositionSource>,
        config: GateConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            source,
            sleeper,
            config,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Primary write position, captured right after a commit.
    pub fn write_position(&self) -> GateResult<LogPosition> {
        self.source.write_position()
    }

    /// Block until the replica has replayed `target`, or the ceiling is hit.
    pub fn wait_for_replica(&self, target: LogPosition) -> GateResult<CatchUp> {
        let interval = self.config.poll_interval();
        let mut replayed = LogPosition(0);

        for polls in 0..=self.config.max_polls {
            match self.source.replay_position()? {
                None => {
                    debug!(%target, "replica promoted, skipping replication wait");
                    return Ok(CatchUp::Promoted);
                }
                Some(position) if position >= target => {
                    debug!(%target, %position, polls, "replica caught up");
                    return Ok(CatchUp::Replayed { polls });
                }
                Some(position) => replayed = position,
            }

            if polls < self.config.max_polls {
                self.sleeper.sleep(interval);
            }
        }

        let lag = ReplicaLag {
            target,
            replayed,
            waited_ms: self.config.ceiling().as_millis() as u64,
        };
        warn!(%lag, "replica did not catch up before the poll ceiling");
        Err(GateError::ReplicaLagTimeout(lag))
    }

    /// Capture the current write position and wait for it.
    pub fn wait_for_current(&self) -> GateResult<CatchUp> {
        let target = self.write_position()?;
        self.wait_for_replica(target)
    }

    /// Report positions without waiting.
    pub fn status(&self) -> GateResult<ReplicationStatus> {
        let write_position = self.source.write_position()?;
        let replay_position = self.source.replay_position()?;
        Ok(ReplicationStatus {
            write_position,
            replay_position,
            in_sync: replay_position.map_or(true, |p| p >= write_position),
            promoted: replay_position.is_none(),
        })
    }
}

impl fmt::Debug for ReplicationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts sleeps and runs a hook on each one.
    struct StepSleeper<F: Fn(u32) + Send + Sync> {
        sleeps: AtomicU32,
        on_sleep: F,
    }

    impl<F: Fn(u32) + Send + Sync> StepSleeper<F> {
        fn new(on_sleep: F) -> Self {
            Self {
                sleeps: AtomicU32::new(0),
                on_sleep,
            }
        }

        fn count(&self) -> u32 {
            self.sleeps.load(Ordering::SeqCst)
        }
    }

    impl<F: Fn(u32) + Send + Sync> Sleeper for StepSleeper<F> {
        fn sleep(&self, _duration: Duration) {
            let n = self.sleeps.fetch_add(1, Ordering::SeqCst) + 1;
            (self.on_sleep)(n);
        }
    }

    fn config(max_polls: u32) -> GateConfig {
        GateConfig {
            max_polls,
            poll_interval_ms: 100,
        }
    }

    #[test]
    fn test_returns_once_replica_catches_up() {
        let log = Arc::new(ReplicationLog::lagging());
        log.record_write();
        log.record_write();
        let target = log.record_write();

        let feed = log.clone();
        let sleeper = Arc::new(StepSleeper::new(move |n| {
            if n == 3 {
                feed.replay_all();
            }
        }));
        let gate = ReplicationGate::with_sleeper(log.clone(), config(10), sleeper.clone());

        let outcome = gate.wait_for_replica(target).unwrap();
        assert_eq!(outcome, CatchUp::Replayed { polls: 3 });
        assert_eq!(sleeper.count(), 3);
    }

    #[test]
    fn test_times_out_after_bounded_polls() {
        let log = Arc::new(ReplicationLog::lagging());
        let target = log.record_write();

        let sleeper = Arc::new(StepSleeper::new(|_| {}));
        let gate = ReplicationGate::with_sleeper(log, config(5), sleeper.clone());

        match gate.wait_for_replica(target) {
            Err(GateError::ReplicaLagTimeout(lag)) => {
                assert_eq!(lag.target, target);
                assert_eq!(lag.replayed, LogPosition(0));
                assert_eq!(lag.waited_ms, 500);
            }
            other => panic!("expected lag timeout, got {:?}", other),
        }
        assert_eq!(sleeper.count(), 5);
    }

    #[test]
    fn test_promoted_replica_returns_immediately() {
        let log = Arc::new(ReplicationLog::lagging());
        let target = log.record_write();
        log.promote_replica();

        let sleeper = Arc::new(StepSleeper::new(|_| {}));
        let gate = ReplicationGate::with_sleeper(log, config(5), sleeper.clone());

        assert_eq!(gate.wait_for_replica(target).unwrap(), CatchUp::Promoted);
        assert_eq!(sleeper.count(), 0);
    }

    #[test]
    fn test_synchronous_replica_needs_no_sleep() {
        let log = Arc::new(ReplicationLog::synchronous());
        log.record_write();
        let sleeper = Arc::new(StepSleeper::new(|_| {}));
        let gate = ReplicationGate::with_sleeper(log, config(5), sleeper.clone());

        assert_eq!(
            gate.wait_for_current().unwrap(),
            CatchUp::Replayed { polls: 0 }
        );
        assert_eq!(sleeper.count(), 0);
    }

    #[test]
    fn test_status_reports_lag() {
        let log = Arc::new(ReplicationLog::lagging());
        log.record_write();
        let gate = ReplicationGate::new(log.clone(), GateConfig::default());

        let status = gate.status().unwrap();
        assert_eq!(status.write_position, LogPosition(1));
        assert_eq!(status.replay_position, Some(LogPosition(0)));
        assert!(!status.in_sync);

        log.replay_all();
        assert!(gate.status().unwrap().in_sync);
    }

    #[test]
    fn test_default_ceiling() {
        assert_eq!(GateConfig::default().ceiling(), Duration::from_secs(100));
    }
}
