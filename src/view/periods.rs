//! Window widths offered to the viewer, from 1 ms to 1 day.
//!
//! All periods are in log units (100 ns).

const MS: u64 = 10_000;
const SECOND: u64 = 1_000 * MS;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

/// Selectable periods with their labels, shortest first.
pub const PERIODS: [(u64, &str); 27] = [
    (MS, "1 ms"),
    (2 * MS, "2 ms"),
    (5 * MS, "5 ms"),
    (10 * MS, "10 ms"),
    (20 * MS, "20 ms"),
    (50 * MS, "50 ms"),
    (100 * MS, "100 ms"),
    (200 * MS, "200 ms"),
    (500 * MS, "500 ms"),
    (SECOND, "1 s"),
    (2 * SECOND, "2 s"),
    (5 * SECOND, "5 s"),
    (10 * SECOND, "10 s"),
    (20 * SECOND, "20 s"),
    (30 * SECOND, "30 s"),
    (MINUTE, "1 min"),
    (2 * MINUTE, "2 min"),
    (5 * MINUTE, "5 min"),
    (10 * MINUTE, "10 min"),
    (20 * MINUTE, "20 min"),
    (30 * MINUTE, "30 min"),
    (HOUR, "1 hr"),
    (2 * HOUR, "2 hr"),
    (4 * HOUR, "4 hr"),
    (6 * HOUR, "6 hr"),
    (12 * HOUR, "12 hr"),
    (24 * HOUR, "1 day"),
];

/// Index of the default period (1 s).
pub const DEFAULT_PERIOD_INDEX: usize = 9;

/// Index of the shortest period covering `span`; the longest if none does.
pub fn find_period(span: u64) -> usize {
    PERIODS
        .iter()
        .position(|&(period, _)| period >= span)
        .unwrap_or(PERIODS.len() - 1)
}

/// Period at `index`, or 1 s for an index outside the table.
pub fn period_at(index: usize) -> u64 {
    PERIODS
        .get(index)
        .map_or(PERIODS[DEFAULT_PERIOD_INDEX].0, |&(period, _)| period)
}

/// Label of the shortest period covering `period`, or an empty string past 1 day.
pub fn format_period(period: u64) -> &'static str {
    PERIODS
        .iter()
        .find(|&&(p, _)| p >= period)
        .map_or("", |&(_, label)| label)
}
