//! Pipeline configuration.
//!
//! [`PipelineConfig`] bundles the per-stage configs so one YAML file can drive
//! a whole run. Every field is optional; anything left out takes its default.
//!
//! ```rust
//! use transit_speeds::PipelineConfig;
//!
//! let config = PipelineConfig::from_yaml_str(
//!     "
//! timezone: America/Vancouver
//! attribution:
//!   buffer_radius: 25
//! routes:
//!   - route: '26'
//!     trip_index: 2
//! ",
//! )
//! .unwrap();
//!
//! assert_eq!(config.attribution.buffer_radius, 25.0);
//! assert_eq!(config.segments.resample_spacing, 200.0);
//! assert_eq!(config.routes[0].trip_index, 2);
//! ```

use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::aggregate::{HourWindow, TierConfig};
use crate::attribution::AttributionConfig;
use crate::error::{PipelineError, Result};
use crate::gtfs::RouteSelection;
use crate::layers::LaneFilter;
use crate::output::OutputConfig;
use crate::projection::{Crs, Projector};
use crate::runtimes::RuntimeConfig;
use crate::schedules::ScheduleConfig;
use crate::segments::SegmentConfig;
use crate::timeline::LocalClock;
use crate::Bounds;

/// Where a run reads its inputs and writes its outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPaths {
    /// GPS timeline CSV. Default: `data/timeline.csv`
    pub timeline: PathBuf,
    /// Directory holding the extracted static feed. Default: `data/gtfs`
    pub gtfs_dir: PathBuf,
    /// Road network layer (GeoJSON). Selects road-network segment building when set.
    pub road_layer: Option<PathBuf>,
    /// Route corridor layer (GeoJSON) used to filter the road network.
    pub route_corridors: Option<PathBuf>,
    /// Property of the corridor layer holding the route id. Default: `route_short_name`
    pub corridor_route_property: String,
    /// Named corridors (GeoJSON with `name` and `routes` properties).
    pub named_corridors: Option<PathBuf>,
    /// Extracted static feed versions compared by the schedule analysis.
    pub historical_feeds: Vec<PathBuf>,
    /// Default: `output`
    pub output_dir: PathBuf,
}

impl Default for InputPaths {
    fn default() -> Self {
        Self {
            timeline: PathBuf::from("data/timeline.csv"),
            gtfs_dir: PathBuf::from("data/gtfs"),
            road_layer: None,
            route_corridors: None,
            corridor_route_property: "route_short_name".to_string(),
            named_corridors: None,
            historical_feeds: Vec::new(),
            output_dir: PathBuf::from("output"),
        }
    }
}

/// Configuration of a full pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Metric CRS all geometry work happens in. Default: EPSG:26910
    pub working_crs: Crs,
    /// IANA timezone for local hours and dates. Default: America/Los_Angeles
    pub timezone: String,
    /// Expected service area; samples outside are dropped. Default: Greater Victoria
    pub bounds: Bounds,
    pub paths: InputPaths,
    pub lanes: LaneFilter,
    pub segments: SegmentConfig,
    pub attribution: AttributionConfig,
    pub runtimes: RuntimeConfig,
    pub schedules: ScheduleConfig,
    /// Default: 8 to 10
    pub peak: HourWindow,
    pub tiers: TierConfig,
    /// Routes of interest with their representative trip index.
    pub routes: Vec<RouteSelection>,
    /// Buffer radius around named corridors. Default: 20
    pub corridor_radius: f64,
    pub output: OutputConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            working_crs: Crs::Utm {
                zone: 10,
                north: true,
            },
            timezone: "America/Los_Angeles".to_string(),
            bounds: Bounds::default(),
            paths: InputPaths::default(),
            lanes: LaneFilter::default(),
            segments: SegmentConfig::default(),
            attribution: AttributionConfig::default(),
            runtimes: RuntimeConfig::default(),
            schedules: ScheduleConfig::default(),
            peak: HourWindow::default(),
            tiers: TierConfig::default(),
            routes: Vec::new(),
            corridor_radius: 20.0,
            output: OutputConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::MissingInput(format!(
                "config {}",
                path.display()
            )));
        }
        let config = Self::from_yaml_str(&std::fs::read_to_string(path)?)?;
        info!(
            "[Config] Loaded {} ({} routes, working CRS {})",
            path.display(),
            config.routes.len(),
            config.working_crs
        );
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn clock(&self) -> Result<LocalClock> {
        LocalClock::from_name(&self.timezone)
    }

    /// Longitude/latitude input to the working CRS.
    pub fn ingest_projector(&self) -> Result<Projector> {
        Projector::new(Crs::Wgs84, self.working_crs)
    }

    /// Ids of the configured routes, in configuration order.
    pub fn route_ids(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.route.clone()).collect()
    }

    /// Path of an output file inside the output directory.
    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.paths.output_dir.join(file_name)
    }
}
