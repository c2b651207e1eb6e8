//! # Aggregation Engine: trip runtimes
//!
//! Builds one [`TripSummary`] per (local service date, trip) from the non-idle
//! samples of that trip, discards implausible runtimes, then summarises the
//! remaining trips per route and departure hour or per route and date.
//!
//! Idle samples (speed exactly zero) are left out because a bus waiting at a
//! terminus keeps reporting and would stretch the apparent runtime.
//!
//! The percentile band always brackets the median. The mean can fall outside
//! it for strongly skewed groups.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::stats::{mean, median, percentile_band};
use crate::timeline::LocalClock;
use crate::GpsSample;

/// Configuration for runtime statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Trips must run strictly longer than this.
    /// Default: 5.0 minutes
    pub min_minutes: f64,

    /// Trips must run strictly shorter than this.
    /// Default: 200.0 minutes
    pub max_minutes: f64,

    /// Default: 5.0
    pub low_percentile: f64,

    /// Default: 95.0
    pub high_percentile: f64,

    /// Drop Saturday and Sunday trips before grouping by departure hour.
    /// Default: true
    pub weekdays_only_by_hour: bool,

    /// Drop Saturday and Sunday trips before grouping by date.
    /// Default: false
    pub weekdays_only_by_date: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            min_minutes: 5.0,
            max_minutes: 200.0,
            low_percentile: 5.0,
            high_percentile: 95.0,
            weekdays_only_by_hour: true,
            weekdays_only_by_date: false,
        }
    }
}

impl RuntimeConfig {
    pub fn weekdays_only(&self, grouping: RuntimeGrouping) -> bool {
        match grouping {
            RuntimeGrouping::DepartureHour => self.weekdays_only_by_hour,
            RuntimeGrouping::Date => self.weekdays_only_by_date,
        }
    }

    fn accepts(&self, runtime_minutes: f64) -> bool {
        runtime_minutes > self.min_minutes && runtime_minutes < self.max_minutes
    }
}

/// One trip on one service date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    /// Local date of the trip's samples
    pub date: NaiveDate,
    pub trip_id: String,
    pub route_id: String,
    /// Heading id of the trip's first sample
    pub direction: String,
    /// Epoch seconds of the first non-idle sample
    pub start_time: i64,
    /// Epoch seconds of the last non-idle sample
    pub end_time: i64,
    /// Local hour of `start_time`
    pub departure_hour: u32,
    pub runtime_minutes: f64,
}

/// How trips are grouped for runtime statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeGrouping {
    DepartureHour,
    Date,
}

/// Group key of a [`RuntimeStat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RuntimeKey {
    Hour(u32),
    Date(NaiveDate),
}

impl fmt::Display for RuntimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKey::Hour(h) => write!(f, "{h}"),
            RuntimeKey::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// Runtime distribution of one (route, hour) or (route, date) group, minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStat {
    pub route_id: String,
    pub key: RuntimeKey,
    pub trips: usize,
    pub mean: f64,
    pub median: f64,
    /// Lower percentile (5th by default); the mean when `trips < 2`
    pub p_low: f64,
    /// Upper percentile (95th by default); the mean when `trips < 2`
    pub p_high: f64,
}

// =============================================================================
// Trip Summaries
// =============================================================================

struct TripSpan<'a> {
    route_id: &'a str,
    direction: &'a str,
    start: i64,
    end: i64,
}

/// Build one summary per (local date, trip) from non-idle samples.
///
/// With `weekdays_only`, samples recorded on a local Saturday or Sunday are
/// ignored. Output is ordered by date, then trip id.
///
/// # Example
/// ```
/// use transit_speeds::{GpsSample, LocalClock};
/// use transit_speeds::runtimes::build_trip_summaries;
///
/// let samples = vec![
///     GpsSample::new(1_705_336_200, "26", "T1", "0", 25.0, -123.36, 48.43),
///     GpsSample::new(1_705_336_800, "26", "T1", "0", 18.0, -123.35, 48.44),
///     GpsSample::new(1_705_337_400, "26", "T1", "0", 0.0, -123.35, 48.44), // idle at terminus
/// ];
/// let trips = build_trip_summaries(&samples, &LocalClock::default(), false);
/// assert_eq!(trips.len(), 1);
/// assert_eq!(trips[0].runtime_minutes, 10.0);
/// ```
pub fn build_trip_summaries(
    samples: &[GpsSample],
    clock: &LocalClock,
    weekdays_only: bool,
) -> Vec<TripSummary> {
    let mut spans: BTreeMap<(NaiveDate, &str), TripSpan<'_>> = BTreeMap::new();

    for sample in samples.iter().filter(|s| !s.is_idle()) {
        if weekdays_only && !clock.is_weekday(sample.timestamp) {
            continue;
        }
        let Some(date) = clock.date(sample.timestamp) else {
            continue;
        };

        spans
            .entry((date, sample.trip_id.as_str()))
            .and_modify(|span| {
                if sample.timestamp < span.start {
                    span.start = sample.timestamp;
                    span.route_id = &sample.route_id;
                    span.direction = &sample.heading_id;
                }
                span.end = span.end.max(sample.timestamp);
            })
            .or_insert(TripSpan {
                route_id: &sample.route_id,
                direction: &sample.heading_id,
                start: sample.timestamp,
                end: sample.timestamp,
            });
    }

    spans
        .into_iter()
        .map(|((date, trip_id), span)| TripSummary {
            date,
            trip_id: trip_id.to_string(),
            route_id: span.route_id.to_string(),
            direction: span.direction.to_string(),
            start_time: span.start,
            end_time: span.end,
            departure_hour: clock.hour(span.start).unwrap_or_default(),
            runtime_minutes: (span.end - span.start) as f64 / 60.0,
        })
        .collect()
}

/// Keep trips with `min_minutes < runtime < max_minutes`.
pub fn filter_outliers(trips: Vec<TripSummary>, config: &RuntimeConfig) -> Vec<TripSummary> {
    let before = trips.len();
    let kept: Vec<TripSummary> = trips
        .into_iter()
        .filter(|t| config.accepts(t.runtime_minutes))
        .collect();
    debug!(
        "[Runtimes] Outlier filter kept {} of {} trips ({:.0}-{:.0} min)",
        kept.len(),
        before,
        config.min_minutes,
        config.max_minutes
    );
    kept
}

// =============================================================================
// Aggregation
// =============================================================================

/// Runtime statistics per (route, group key), ordered by route then key.
///
/// Percentiles are computed on each group's complete set of runtimes.
pub fn aggregate_runtimes(
    trips: &[TripSummary],
    grouping: RuntimeGrouping,
    config: &RuntimeConfig,
) -> Vec<RuntimeStat> {
    let mut groups: BTreeMap<(&str, RuntimeKey), Vec<f64>> = BTreeMap::new();
    for trip in trips {
        let key = match grouping {
            RuntimeGrouping::DepartureHour => RuntimeKey::Hour(trip.departure_hour),
            RuntimeGrouping::Date => RuntimeKey::Date(trip.date),
        };
        groups
            .entry((trip.route_id.as_str(), key))
            .or_default()
            .push(trip.runtime_minutes);
    }

    groups
        .into_iter()
        .filter_map(|((route, key), runtimes)| {
            let band = percentile_band(&runtimes, config.low_percentile, config.high_percentile)?;
            Some(RuntimeStat {
                route_id: route.to_string(),
                key,
                trips: runtimes.len(),
                mean: mean(&runtimes)?,
                median: median(&runtimes)?,
                p_low: band.low,
                p_high: band.high,
            })
        })
        .collect()
}

/// Full runtime pipeline: trip summaries, weekday and outlier filtering, grouping.
pub fn runtime_stats(
    samples: &[GpsSample],
    clock: &LocalClock,
    grouping: RuntimeGrouping,
    config: &RuntimeConfig,
) -> Vec<RuntimeStat> {
    let trips = build_trip_summaries(samples, clock, config.weekdays_only(grouping));
    let trip_count = trips.len();
    let trips = filter_outliers(trips, config);
    let stats = aggregate_runtimes(&trips, grouping, config);
    info!(
        "[Runtimes] {} trips ({} after outlier filter) -> {} groups by {:?}",
        trip_count,
        trips.len(),
        stats.len(),
        grouping
    );
    stats
}
