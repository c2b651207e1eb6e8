//! # Transit Speeds
//!
//! Road-segment speed attribution for transit GPS timelines.
//!
//! This library provides:
//! - A segment builder that derives a deduplicated set of road segments covering
//!   the bus routes of interest, either by filtering a road network layer against
//!   route corridors or by resampling published route shapes
//! - A spatial attribution engine that joins GPS samples to flat-capped segment
//!   buffers through an R-tree
//! - Aggregations of attributed samples into per-segment speed statistics and of
//!   trips into runtime distributions
//! - Scheduled runtime and headway per route across historical static feeds
//! - An output adapter producing GeoJSON and CSV for external map/chart renderers
//!
//! ## Features
//!
//! - **`parallel`** - Enable parallel attribution and road filtering with rayon
//! - **`http`** - Enable downloading road layers and static GTFS feeds
//! - **`cli`** - Build the `transit-speeds` command line tool
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use geo::{coord, LineString};
//! use transit_speeds::{Crs, GpsSample, Projector};
//! use transit_speeds::aggregate::segment_speeds;
//! use transit_speeds::attribution::{attribute_samples, AttributionConfig};
//! use transit_speeds::segments::{build_from_shapes, RouteShape, SegmentConfig};
//!
//! // Route shape already in a metric CRS: 1km due east
//! let shape = RouteShape {
//!     route_id: "26".to_string(),
//!     geometry: LineString::new(vec![coord! { x: 0.0, y: 0.0 }, coord! { x: 1000.0, y: 0.0 }]),
//! };
//! let segments = build_from_shapes(&[shape], &SegmentConfig::default()).unwrap();
//! assert_eq!(segments.len(), 5); // 200m sub-segments
//!
//! // Samples recorded in the same metric CRS
//! let samples: Vec<GpsSample> = [20.0, 30.0, 40.0]
//!     .iter()
//!     .enumerate()
//!     .map(|(i, &speed)| GpsSample::new(1000 + i as i64 * 30, "26", "trip-1", "0", speed, 100.0, 5.0))
//!     .collect();
//!
//! let working = Crs::Utm { zone: 10, north: true };
//! let projector = Projector::new(working, working).unwrap();
//! let attributed = attribute_samples(&segments, &samples, &projector, &AttributionConfig::default());
//!
//! let stats = segment_speeds(&attributed, &segments, None);
//! assert_eq!(stats.len(), 1);
//! assert!((stats[0].mean_speed - 30.0).abs() < 1e-9);
//! ```

use geo::LineString;
use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{PipelineError, Result};

pub mod geo_utils;

pub mod buffer;
pub use buffer::{Buffer, CapStyle};

pub mod projection;
pub use projection::{Crs, Projector, Reproject};

pub mod timeline;
pub use timeline::{LocalClock, TimelineStore};

pub mod layers;

pub mod gtfs;

pub mod segments;
pub use segments::{DedupStrategy, RouteShape, SegmentConfig};

pub mod attribution;
pub use attribution::{AttributedSample, AttributionConfig, SegmentIndex};

pub mod stats;

pub mod aggregate;
pub use aggregate::{SegmentHourSpeed, SegmentSpeed, SpeedDelta};

pub mod runtimes;
pub use runtimes::{RuntimeConfig, RuntimeStat, TripSummary};

pub mod schedules;
pub use schedules::{ScheduleConfig, ScheduledService};

pub mod output;
pub use output::{OutputAdapter, OutputConfig};

pub mod config;
pub use config::PipelineConfig;

// HTTP module for acquiring road layers and static feeds
#[cfg(feature = "http")]
pub mod http;

// ============================================================================
// Core Types
// ============================================================================

/// Stable integer id of a road segment, assigned by final build position.
///
/// Ids are only stable within one build run.
pub type SegmentId = u32;

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use transit_speeds::GpsPoint;
/// let point = GpsPoint::new(48.4284, -123.3656); // Victoria
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Geographic bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Check whether a point lies inside the bounds (edges inclusive).
    pub fn contains(&self, point: &GpsPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }
}

impl Default for Bounds {
    /// Greater Victoria, BC - the service area the default working CRS (UTM 10N) covers.
    fn default() -> Self {
        Self {
            min_lat: 48.2,
            max_lat: 48.9,
            min_lng: -123.8,
            max_lng: -123.2,
        }
    }
}

/// A single vehicle position report.
///
/// Field names follow the timeline export columns (`Time`, `Route`, `Trip ID`,
/// `Header`, `Speed`, `x`, `y`). Samples are never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsSample {
    /// Seconds since the Unix epoch, UTC
    #[serde(rename = "Time", alias = "timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Route", alias = "route_id")]
    pub route_id: String,
    #[serde(rename = "Trip ID", alias = "trip_id")]
    pub trip_id: String,
    /// Direction / headsign key
    #[serde(rename = "Header", alias = "vehicle_heading_id")]
    pub heading_id: String,
    /// Vehicle speed (km/h)
    #[serde(rename = "Speed", alias = "speed")]
    pub speed: f64,
    /// Longitude on ingest
    pub x: f64,
    /// Latitude on ingest
    pub y: f64,
    #[serde(rename = "Occupancy Status", alias = "occupancy", default)]
    pub occupancy: Option<String>,
}

impl GpsSample {
    pub fn new(
        timestamp: i64,
        route_id: &str,
        trip_id: &str,
        heading_id: &str,
        speed: f64,
        x: f64,
        y: f64,
    ) -> Self {
        Self {
            timestamp,
            route_id: route_id.to_string(),
            trip_id: trip_id.to_string(),
            heading_id: heading_id.to_string(),
            speed,
            x,
            y,
            occupancy: None,
        }
    }

    /// Position as a GPS point (y = latitude, x = longitude).
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.y, self.x)
    }

    /// A stopped vehicle reports exactly zero.
    pub fn is_idle(&self) -> bool {
        self.speed == 0.0
    }
}

/// An oriented road segment in the working (projected, metric) CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct RoadSegment {
    pub id: SegmentId,
    pub geometry: LineString<f64>,
    /// Planar length in CRS units (metres)
    pub length_m: f64,
    /// Routes whose candidate segments this segment represents
    pub route_ids: Vec<String>,
}

impl RoadSegment {
    pub fn new(id: SegmentId, geometry: LineString<f64>, route_ids: Vec<String>) -> Self {
        let length_m = geo_utils::line_length(&geometry);
        Self { id, geometry, length_m, route_ids }
    }
}

// ============================================================================
// Tests
// ============================================================================
