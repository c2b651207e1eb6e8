//! GPS timeline access and local-time helpers.
//!
//! The timeline is the source of truth for every derived statistic. This module
//! reads it through the [`TimelineStore`] trait, screens out samples that cannot
//! be used, and converts UTC epoch timestamps to the agency's local calendar.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Weekday};
use chrono_tz::Tz;
use log::{info, warn};

use crate::error::{PipelineError, Result};
use crate::{Bounds, GpsSample};

// =============================================================================
// Local Time
// =============================================================================

/// Converts epoch timestamps to wall-clock time in a fixed timezone.
///
/// # Example
/// ```
/// use transit_speeds::LocalClock;
///
/// let clock = LocalClock::from_name("America/Los_Angeles").unwrap();
/// // 2024-01-15 16:30 UTC is 08:30 PST on a Monday
/// assert_eq!(clock.hour(1_705_336_200), Some(8));
/// assert!(clock.is_weekday(1_705_336_200));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalClock {
    tz: Tz,
}

impl LocalClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Look up an IANA timezone name.
    pub fn from_name(name: &str) -> Result<Self> {
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|_| PipelineError::InvalidTimezone(name.to_string()))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Local date-time of a timestamp. `None` if the timestamp is out of range.
    pub fn local(&self, timestamp: i64) -> Option<DateTime<Tz>> {
        DateTime::from_timestamp(timestamp, 0).map(|utc| utc.with_timezone(&self.tz))
    }

    pub fn hour(&self, timestamp: i64) -> Option<u32> {
        self.local(timestamp).map(|t| t.hour())
    }

    pub fn date(&self, timestamp: i64) -> Option<NaiveDate> {
        self.local(timestamp).map(|t| t.date_naive())
    }

    /// Monday to Friday in local time.
    pub fn is_weekday(&self, timestamp: i64) -> bool {
        self.local(timestamp)
            .map(|t| !matches!(t.weekday(), Weekday::Sat | Weekday::Sun))
            .unwrap_or(false)
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new(chrono_tz::America::Los_Angeles)
    }
}

// =============================================================================
// Screening
// =============================================================================

/// Result of [`screen_samples`].
#[derive(Debug, Clone, Default)]
pub struct Screened {
    pub kept: Vec<GpsSample>,
    /// Samples outside the expected bounding box
    pub out_of_bounds: usize,
    /// Samples whose speed is NaN or infinite
    pub invalid_speed: usize,
}

impl Screened {
    pub fn dropped(&self) -> usize {
        self.out_of_bounds + self.invalid_speed
    }
}

/// Drop samples that are outside `bounds` or carry a non-finite speed.
///
/// Bad single points are routine GPS noise, so they are counted and reported
/// with one warning instead of failing the run.
pub fn screen_samples(samples: Vec<GpsSample>, bounds: &Bounds) -> Screened {
    let mut screened = Screened {
        kept: Vec::with_capacity(samples.len()),
        ..Default::default()
    };

    for sample in samples {
        if !sample.speed.is_finite() {
            screened.invalid_speed += 1;
        } else if !sample.point().is_valid() || !bounds.contains(&sample.point()) {
            screened.out_of_bounds += 1;
        } else {
            screened.kept.push(sample);
        }
    }

    if screened.dropped() > 0 {
        warn!(
            "[Timeline] Dropped {} samples ({} outside bounds, {} with invalid speed)",
            screened.dropped(),
            screened.out_of_bounds,
            screened.invalid_speed
        );
    }

    screened
}

/// Overall extent of a timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineSummary {
    pub count: usize,
    pub first: DateTime<Tz>,
    pub last: DateTime<Tz>,
}

/// Sample count and first/last local timestamp. `None` for an empty timeline.
pub fn summarize(samples: &[GpsSample], clock: &LocalClock) -> Option<TimelineSummary> {
    let first = samples.iter().map(|s| s.timestamp).min()?;
    let last = samples.iter().map(|s| s.timestamp).max()?;
    Some(TimelineSummary {
        count: samples.len(),
        first: clock.local(first)?,
        last: clock.local(last)?,
    })
}

// =============================================================================
// Storage
// =============================================================================

/// Read/write access to a GPS timeline.
pub trait TimelineStore {
    /// Every stored sample, in storage order.
    fn load(&self) -> Result<Vec<GpsSample>>;

    /// Append samples after the existing ones.
    fn append(&mut self, samples: &[GpsSample]) -> Result<()>;
}

/// Timeline kept in a CSV file with the export columns
/// `Time, Route, Trip ID, Header, Speed, x, y, Occupancy Status`.
#[derive(Debug, Clone)]
pub struct CsvTimeline {
    path: PathBuf,
}

impl CsvTimeline {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TimelineStore for CsvTimeline {
    fn load(&self) -> Result<Vec<GpsSample>> {
        if !self.path.exists() {
            return Err(PipelineError::MissingInput(format!(
                "timeline {}",
                self.path.display()
            )));
        }

        let mut reader = csv::Reader::from_path(&self.path)?;
        let samples = reader
            .deserialize()
            .collect::<std::result::Result<Vec<GpsSample>, _>>()?;

        info!(
            "[Timeline] Loaded {} samples from {}",
            samples.len(),
            self.path.display()
        );
        Ok(samples)
    }

    fn append(&mut self, samples: &[GpsSample]) -> Result<()> {
        let needs_header = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);

        for sample in samples {
            writer.serialize(sample)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// In-memory timeline, mostly useful for tests and for callers that already
/// hold samples.
#[derive(Debug, Clone, Default)]
pub struct MemoryTimeline {
    samples: Vec<GpsSample>,
}

impl MemoryTimeline {
    pub fn new(samples: Vec<GpsSample>) -> Self {
        Self { samples }
    }
}

impl TimelineStore for MemoryTimeline {
    fn load(&self) -> Result<Vec<GpsSample>> {
        Ok(self.samples.clone())
    }

    fn append(&mut self, samples: &[GpsSample]) -> Result<()> {
        self.samples.extend_from_slice(samples);
        Ok(())
    }
}
