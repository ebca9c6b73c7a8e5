//! Conversion of the device's rolling 32-bit tick counter into absolute time.
//!
//! The device counts in ticks of `tick_unit` log units and wraps at 2^32.
//! Records from different channels may arrive slightly out of order, so a tick
//! smaller than the previous one is either a genuine wrap or a late record.
//! The distance decides: more than half the counter range means a wrap.
//!
//! This heuristic is ambiguous for records delayed by more than half the counter
//! range; such records are reconciled best effort and never rejected.

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

/// Tick distance above which a backward step is taken to be a counter wrap.
pub const WRAP_THRESHOLD: u32 = 0x8000_0000;

/// Span of the device counter.
const COUNTER_SPAN: u64 = 1 << 32;

/// Log units (100 ns) per second.
const UNITS_PER_SECOND: u64 = 10_000_000;

/// Current wall-clock time in log units since the Unix epoch.
pub fn now_timestamp() -> u64 {
    let now = Utc::now();
    let secs = u64::try_from(now.timestamp()).unwrap_or(0);
    secs * UNITS_PER_SECOND + u64::from(now.timestamp_subsec_nanos()) / 100
}

/// Converts a log timestamp back to wall-clock time.
pub fn to_datetime(timestamp: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(timestamp / UNITS_PER_SECOND).ok()?;
    let nanos = (timestamp % UNITS_PER_SECOND) as u32 * 100;
    DateTime::from_timestamp(secs, nanos)
}

/// Per-session tick-to-timestamp converter. Must see every record, in arrival order.
#[derive(Debug, Clone)]
pub struct TimeReconciler {
    tick_unit: u64,
    base: u64,
    last_tick: u32,
}

impl TimeReconciler {
    /// Anchors the clock on the sync record: `tick` corresponds to `now`.
    pub fn synced(now: u64, tick: u32, tick_unit: u64) -> Self {
        let base = now.wrapping_sub(u64::from(tick).wrapping_mul(tick_unit));
        debug!(now, tick, tick_unit, "time base established");
        Self {
            tick_unit,
            base,
            last_tick: tick,
        }
    }

    /// Returns the absolute timestamp of the next record's `tick`.
    pub fn reconcile(&mut self, tick: u32) -> u64 {
        let span = COUNTER_SPAN.wrapping_mul(self.tick_unit);
        if tick < self.last_tick {
            let period = self.last_tick - tick;
            if period > WRAP_THRESHOLD {
                self.base = self.base.wrapping_add(span);
                debug!(last_tick = self.last_tick, tick, "tick counter overflow");
            } else {
                trace!(last_tick = self.last_tick, tick, "record out of order");
            }
        } else {
            let period = tick - self.last_tick;
            if period > WRAP_THRESHOLD {
                // late record from before the most recent wrap
                self.base = self.base.wrapping_sub(span);
                debug!(
                    last_tick = self.last_tick,
                    tick, "record out of order across counter overflow"
                );
            }
        }
        self.last_tick = tick;
        self.absolute(tick)
    }

    /// Absolute time of `tick` under the current base, without updating state.
    pub fn absolute(&self, tick: u32) -> u64 {
        self.base
            .wrapping_add(u64::from(tick).wrapping_mul(self.tick_unit))
    }

    /// The most recent tick seen.
    pub fn last_tick(&self) -> u32 {
        self.last_tick
    }

    /// Log units per device tick.
    pub fn tick_unit(&self) -> u64 {
        self.tick_unit
    }
}
