//! # Aggregation Engine: speeds
//!
//! Groups attributed samples into speed statistics. Each function returns a
//! fixed record type; groups without samples are left out, never reported as
//! zero, because zero is a real measurement for a stopped bus.
//!
//! Speeds keep full precision here. Rounding happens in [`crate::output`].

use std::collections::{BTreeMap, HashMap};

use geo::LineString;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::attribution::AttributedSample;
use crate::buffer::{Buffer, CapStyle};
use crate::projection::Projector;
use crate::stats::{centered_rolling_mean, MeanAccumulator};
use crate::timeline::LocalClock;
use crate::{GpsSample, RoadSegment, SegmentId};

const HOURS_PER_DAY: usize = 24;

// =============================================================================
// Time Windows
// =============================================================================

/// Inclusive range of local hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, hour: u32) -> bool {
        (self.start..=self.end).contains(&hour)
    }
}

impl Default for HourWindow {
    /// Morning peak, 08:00 to 10:59
    fn default() -> Self {
        Self { start: 8, end: 10 }
    }
}

/// Restricts aggregation to samples whose local hour falls in a window.
#[derive(Debug, Clone, Copy)]
pub struct TimeFilter<'c> {
    pub clock: &'c LocalClock,
    pub window: HourWindow,
}

impl TimeFilter<'_> {
    fn accepts(&self, sample: &GpsSample) -> bool {
        self.clock
            .hour(sample.timestamp)
            .map(|h| self.window.contains(h))
            .unwrap_or(false)
    }
}

// =============================================================================
// Per-Segment Speeds
// =============================================================================

/// Mean speed of one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSpeed {
    pub segment_id: SegmentId,
    pub mean_speed: f64,
    /// Always > 0
    pub count: usize,
    pub geometry: LineString<f64>,
}

/// Mean speed of one segment within one local hour.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentHourSpeed {
    pub segment_id: SegmentId,
    pub hour: u32,
    pub mean_speed: f64,
    pub count: usize,
    pub geometry: LineString<f64>,
}

/// Slowest and fastest 3-hour rolling mean speed of a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedDelta {
    pub segment_id: SegmentId,
    /// Lowest rolling mean ("Peak")
    pub peak_speed: f64,
    pub peak_hour: u32,
    /// Highest rolling mean ("Off-Peak")
    pub off_peak_speed: f64,
    pub off_peak_hour: u32,
    /// `off_peak_speed - peak_speed`
    pub speed_delta: f64,
    pub geometry: LineString<f64>,
}

fn geometry_lookup(segments: &[RoadSegment]) -> HashMap<SegmentId, &LineString<f64>> {
    let mut lookup = HashMap::with_capacity(segments.len());
    for s in segments {
        lookup.entry(s.id).or_insert(&s.geometry);
    }
    lookup
}

/// Mean speed per segment, optionally limited to a time window.
///
/// Rows without a segment are ignored. A sample attributed to several
/// overlapping segments counts once toward each of them. Output is ordered by
/// segment id.
pub fn segment_speeds(
    rows: &[AttributedSample<'_>],
    segments: &[RoadSegment],
    filter: Option<&TimeFilter<'_>>,
) -> Vec<SegmentSpeed> {
    let mut groups: BTreeMap<SegmentId, MeanAccumulator> = BTreeMap::new();
    for row in rows {
        let Some(id) = row.segment_id else { continue };
        if filter.map(|f| f.accepts(row.sample)).unwrap_or(true) {
            groups.entry(id).or_default().push(row.sample.speed);
        }
    }

    let geometries = geometry_lookup(segments);
    let stats: Vec<SegmentSpeed> = groups
        .into_iter()
        .filter_map(|(id, acc)| {
            Some(SegmentSpeed {
                segment_id: id,
                mean_speed: acc.mean()?,
                count: acc.count(),
                geometry: (*geometries.get(&id)?).clone(),
            })
        })
        .collect();

    info!(
        "[Aggregate] {} of {} segments have speed data",
        stats.len(),
        segments.len()
    );
    stats
}

fn hourly_groups(
    rows: &[AttributedSample<'_>],
    clock: &LocalClock,
) -> BTreeMap<(SegmentId, u32), MeanAccumulator> {
    let mut groups: BTreeMap<(SegmentId, u32), MeanAccumulator> = BTreeMap::new();
    for row in rows {
        let Some(id) = row.segment_id else { continue };
        if let Some(hour) = clock.hour(row.sample.timestamp) {
            groups.entry((id, hour)).or_default().push(row.sample.speed);
        }
    }
    groups
}

/// Mean speed per (segment, local hour), ordered by segment then hour.
pub fn segment_hourly_speeds(
    rows: &[AttributedSample<'_>],
    segments: &[RoadSegment],
    clock: &LocalClock,
) -> Vec<SegmentHourSpeed> {
    let geometries = geometry_lookup(segments);
    hourly_groups(rows, clock)
        .into_iter()
        .filter_map(|((id, hour), acc)| {
            Some(SegmentHourSpeed {
                segment_id: id,
                hour,
                mean_speed: acc.mean()?,
                count: acc.count(),
                geometry: (*geometries.get(&id)?).clone(),
            })
        })
        .collect()
}

/// Peak / off-peak speed difference per segment.
///
/// Per-hour means are smoothed with a centered 3-hour window
/// (`{h-1, h, h+1}` clipped to 0..=23, hours without data skipped). Among
/// hours with data, the slowest smoothed hour is the peak and the fastest the
/// off-peak; ties go to the earliest hour.
pub fn segment_speed_deltas(
    rows: &[AttributedSample<'_>],
    segments: &[RoadSegment],
    clock: &LocalClock,
) -> Vec<SpeedDelta> {
    let mut per_segment: BTreeMap<SegmentId, Vec<Option<f64>>> = BTreeMap::new();
    for ((id, hour), acc) in hourly_groups(rows, clock) {
        let series = per_segment
            .entry(id)
            .or_insert_with(|| vec![None; HOURS_PER_DAY]);
        if let Some(slot) = series.get_mut(hour as usize) {
            *slot = acc.mean();
        }
    }

    let geometries = geometry_lookup(segments);
    per_segment
        .into_iter()
        .filter_map(|(id, hourly)| {
            // Only hours that have data of their own can be reported
            let rolled: Vec<Option<f64>> = centered_rolling_mean(&hourly, 1)
                .into_iter()
                .zip(&hourly)
                .map(|(r, h)| h.and(r))
                .collect();
            let (peak_hour, peak_speed) = extreme(&rolled, |candidate, best| candidate < best)?;
            let (off_peak_hour, off_peak_speed) =
                extreme(&rolled, |candidate, best| candidate > best)?;
            Some(SpeedDelta {
                segment_id: id,
                peak_speed,
                peak_hour,
                off_peak_speed,
                off_peak_hour,
                speed_delta: off_peak_speed - peak_speed,
                geometry: (*geometries.get(&id)?).clone(),
            })
        })
        .collect()
}

/// First index whose value beats every earlier one under `better`.
fn extreme(series: &[Option<f64>], better: impl Fn(f64, f64) -> bool) -> Option<(u32, f64)> {
    let mut best: Option<(u32, f64)> = None;
    for (hour, value) in series.iter().enumerate() {
        let Some(v) = *value else { continue };
        match best {
            Some((_, b)) if !better(v, b) => {}
            _ => best = Some((hour as u32, v)),
        }
    }
    best
}

// =============================================================================
// Per-Route Speeds
// =============================================================================

/// Service level a route belongs to, for grouping route rankings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceTier {
    /// Rapid Transit Network
    Rtn,
    /// Frequent Transit Network
    Ftn,
    Local,
}

impl std::fmt::Display for ServiceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ServiceTier::Rtn => "RTN",
            ServiceTier::Ftn => "FTN",
            ServiceTier::Local => "Local",
        };
        f.write_str(label)
    }
}

/// Which routes belong to which service tier. Unlisted routes are local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Default: 70, 95, 15
    pub rtn: Vec<String>,
    /// Default: 4, 6, 26, 14, 27, 28
    pub ftn: Vec<String>,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            rtn: ["70", "95", "15"].map(String::from).to_vec(),
            ftn: ["4", "6", "26", "14", "27", "28"].map(String::from).to_vec(),
        }
    }
}

impl TierConfig {
    pub fn tier(&self, route_id: &str) -> ServiceTier {
        if self.rtn.iter().any(|r| r == route_id) {
            ServiceTier::Rtn
        } else if self.ftn.iter().any(|r| r == route_id) {
            ServiceTier::Ftn
        } else {
            ServiceTier::Local
        }
    }
}

/// Mean speed of one route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpeed {
    pub route_id: String,
    pub mean_speed: f64,
    pub count: usize,
    pub tier: ServiceTier,
}

/// Mean speed per route over samples in `window`, slowest first.
///
/// Works on raw samples: a route's speed does not depend on which segments
/// exist. Ties are ordered by route id.
pub fn route_speeds(
    samples: &[GpsSample],
    clock: &LocalClock,
    window: &HourWindow,
    tiers: &TierConfig,
) -> Vec<RouteSpeed> {
    let filter = TimeFilter {
        clock,
        window: *window,
    };
    let mut groups: BTreeMap<&str, MeanAccumulator> = BTreeMap::new();
    for sample in samples.iter().filter(|s| filter.accepts(s)) {
        groups
            .entry(sample.route_id.as_str())
            .or_default()
            .push(sample.speed);
    }

    let mut ranked: Vec<RouteSpeed> = groups
        .into_iter()
        .filter_map(|(route, acc)| {
            Some(RouteSpeed {
                route_id: route.to_string(),
                mean_speed: acc.mean()?,
                count: acc.count(),
                tier: tiers.tier(route),
            })
        })
        .collect();
    ranked.sort_by(|a, b| {
        a.mean_speed
            .total_cmp(&b.mean_speed)
            .then_with(|| a.route_id.cmp(&b.route_id))
    });
    ranked
}

// =============================================================================
// Corridor Speeds
// =============================================================================

/// A named stretch of road and the routes whose speed it reports.
#[derive(Debug, Clone, PartialEq)]
pub struct Corridor {
    pub name: String,
    /// Corridor line in the working CRS
    pub geometry: LineString<f64>,
    pub routes: Vec<String>,
}

/// Mean speed of a corridor's routes inside the corridor.
#[derive(Debug, Clone, PartialEq)]
pub struct CorridorSpeed {
    pub name: String,
    /// `None` when no sample of the corridor's routes fell inside it
    pub mean_speed: Option<f64>,
    pub count: usize,
    pub geometry: LineString<f64>,
}

/// Mean speed of each corridor's routes within a flat-cap buffer of the corridor.
///
/// `projector` converts sample coordinates into the corridors' CRS.
pub fn corridor_speeds(
    corridors: &[Corridor],
    samples: &[GpsSample],
    projector: &Projector,
    radius: f64,
) -> Vec<CorridorSpeed> {
    corridors
        .iter()
        .map(|corridor| {
            let mut acc = MeanAccumulator::default();
            if let Some(buffer) = Buffer::new(&corridor.geometry, radius, CapStyle::Flat) {
                for sample in samples
                    .iter()
                    .filter(|s| corridor.routes.iter().any(|r| *r == s.route_id))
                {
                    let p = projector.coord(geo::Coord {
                        x: sample.x,
                        y: sample.y,
                    });
                    if buffer.contains(p) {
                        acc.push(sample.speed);
                    }
                }
            }
            debug!(
                "[Aggregate] Corridor {} has {} samples",
                corridor.name,
                acc.count()
            );
            CorridorSpeed {
                name: corridor.name.clone(),
                mean_speed: acc.mean(),
                count: acc.count(),
                geometry: corridor.geometry.clone(),
            }
        })
        .collect()
}
