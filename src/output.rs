//! Output adapter: display projection, rounding and file writers.
//!
//! Statistics stay unrounded in the working CRS until they reach this module.
//! Here geometries are reprojected to the display CRS, numbers are rounded to
//! their display precision, and results are written as GeoJSON feature
//! collections or CSV tables. Every file is written to a temporary sibling and
//! renamed into place, so readers never see a partial file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use geo::LineString;
use geojson::{FeatureCollection, JsonObject, JsonValue};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::aggregate::{CorridorSpeed, RouteSpeed};
use crate::buffer::{Buffer, CapStyle};
use crate::error::Result;
use crate::layers::{feature, feature_collection};
use crate::projection::{Crs, Projector, Reproject};
use crate::runtimes::RuntimeStat;
use crate::schedules::ScheduledService;
use crate::{RoadSegment, SegmentHourSpeed, SegmentSpeed, SpeedDelta};

/// Geometry emitted for per-segment statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputGeometry {
    /// The segment centre line
    Line,
    /// The segment's flat-cap buffer polygon
    #[default]
    Buffer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// CRS of written geometries. Default: EPSG:4326
    pub display_crs: Crs,
    /// Decimal places of speeds. Default: 0
    pub speed_decimals: u32,
    /// Decimal places of runtimes in minutes. Default: 2
    pub runtime_decimals: u32,
    /// Default: buffer polygon
    pub geometry: OutputGeometry,
    /// Radius of buffer polygons, working CRS units. Default: 20
    pub buffer_radius: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            display_crs: Crs::Wgs84,
            speed_decimals: 0,
            runtime_decimals: 2,
            geometry: OutputGeometry::Buffer,
            buffer_radius: 20.0,
        }
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// One row of the runtime table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRow {
    pub route: String,
    pub date_or_hour: String,
    pub mean_runtime: f64,
    pub p5_runtime: f64,
    pub p95_runtime: f64,
    pub median_runtime: f64,
    pub trips: usize,
}

/// One row of the scheduled runtime table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub date: String,
    pub route: String,
    pub mean_runtime: f64,
    /// Empty when only one trip left in the analysed hour
    pub mean_headway: Option<f64>,
    pub trips: usize,
}

/// One row of the route ranking table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpeedRow {
    pub route: String,
    pub tier: String,
    pub mean_speed: f64,
    pub count: usize,
}

fn properties(value: JsonValue) -> JsonObject {
    match value {
        JsonValue::Object(map) => map,
        _ => JsonObject::new(),
    }
}

/// Converts working-CRS results into display-ready features and rows.
#[derive(Debug, Clone)]
pub struct OutputAdapter {
    config: OutputConfig,
    projector: Projector,
}

impl OutputAdapter {
    pub fn new(working_crs: Crs, config: OutputConfig) -> Result<Self> {
        let projector = Projector::new(working_crs, config.display_crs)?;
        Ok(Self { config, projector })
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    fn line(&self, line: &LineString<f64>) -> geojson::Value {
        geojson::Value::from(&line.reproject(&self.projector))
    }

    /// Segment geometry per [`OutputGeometry`]. Lines too short to buffer fall
    /// back to the line itself.
    fn segment_geometry(&self, line: &LineString<f64>) -> geojson::Value {
        match self.config.geometry {
            OutputGeometry::Line => self.line(line),
            OutputGeometry::Buffer => {
                match Buffer::new(line, self.config.buffer_radius, CapStyle::Flat) {
                    Some(buffer) => {
                        geojson::Value::from(&buffer.to_polygon().reproject(&self.projector))
                    }
                    None => self.line(line),
                }
            }
        }
    }

    fn speed(&self, value: f64) -> f64 {
        round_to(value, self.config.speed_decimals)
    }

    fn runtime(&self, value: f64) -> f64 {
        round_to(value, self.config.runtime_decimals)
    }

    /// The built segment set, always as lines.
    pub fn segments(&self, segments: &[RoadSegment]) -> FeatureCollection {
        feature_collection(
            segments
                .iter()
                .map(|s| {
                    feature(
                        self.line(&s.geometry),
                        properties(json!({
                            "segment_id": s.id,
                            "length_m": round_to(s.length_m, 1),
                            "routes": s.route_ids,
                        })),
                    )
                })
                .collect(),
        )
    }

    pub fn segment_speeds(&self, stats: &[SegmentSpeed]) -> FeatureCollection {
        feature_collection(
            stats
                .iter()
                .map(|s| {
                    feature(
                        self.segment_geometry(&s.geometry),
                        properties(json!({
                            "segment_id": s.segment_id,
                            "mean_speed": self.speed(s.mean_speed),
                            "count": s.count,
                        })),
                    )
                })
                .collect(),
        )
    }

    pub fn hourly_speeds(&self, stats: &[SegmentHourSpeed]) -> FeatureCollection {
        feature_collection(
            stats
                .iter()
                .map(|s| {
                    feature(
                        self.segment_geometry(&s.geometry),
                        properties(json!({
                            "segment_id": s.segment_id,
                            "hour": s.hour,
                            "mean_speed": self.speed(s.mean_speed),
                            "count": s.count,
                        })),
                    )
                })
                .collect(),
        )
    }

    pub fn speed_deltas(&self, deltas: &[SpeedDelta]) -> FeatureCollection {
        feature_collection(
            deltas
                .iter()
                .map(|d| {
                    feature(
                        self.segment_geometry(&d.geometry),
                        properties(json!({
                            "segment_id": d.segment_id,
                            "peak_speed": self.speed(d.peak_speed),
                            "peak_hour": d.peak_hour,
                            "off_peak_speed": self.speed(d.off_peak_speed),
                            "off_peak_hour": d.off_peak_hour,
                            "speed_delta": self.speed(d.speed_delta),
                        })),
                    )
                })
                .collect(),
        )
    }

    /// Corridors are drawn as lines; a corridor without samples carries a
    /// null speed.
    pub fn corridor_speeds(&self, corridors: &[CorridorSpeed]) -> FeatureCollection {
        feature_collection(
            corridors
                .iter()
                .map(|c| {
                    feature(
                        self.line(&c.geometry),
                        properties(json!({
                            "name": c.name,
                            "mean_speed": c.mean_speed.map(|v| self.speed(v)),
                            "count": c.count,
                        })),
                    )
                })
                .collect(),
        )
    }

    pub fn runtime_rows(&self, stats: &[RuntimeStat]) -> Vec<RuntimeRow> {
        stats
            .iter()
            .map(|s| RuntimeRow {
                route: s.route_id.clone(),
                date_or_hour: s.key.to_string(),
                mean_runtime: self.runtime(s.mean),
                p5_runtime: self.runtime(s.p_low),
                p95_runtime: self.runtime(s.p_high),
                median_runtime: self.runtime(s.median),
                trips: s.trips,
            })
            .collect()
    }

    pub fn schedule_rows(&self, services: &[ScheduledService]) -> Vec<ScheduleRow> {
        services
            .iter()
            .map(|s| ScheduleRow {
                date: s.date.format("%Y-%m-%d").to_string(),
                route: s.route_id.clone(),
                mean_runtime: self.runtime(s.mean_runtime),
                mean_headway: s.mean_headway.map(|h| self.runtime(h)),
                trips: s.trips,
            })
            .collect()
    }

    pub fn route_speed_rows(&self, speeds: &[RouteSpeed]) -> Vec<RouteSpeedRow> {
        speeds
            .iter()
            .map(|r| RouteSpeedRow {
                route: r.route_id.clone(),
                tier: r.tier.to_string(),
                mean_speed: self.speed(r.mean_speed),
                count: r.count,
            })
            .collect()
    }
}

// =============================================================================
// Writers
// =============================================================================

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Write through a temporary sibling file, then rename over `path`.
fn write_replacing<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    if let Err(e) = write(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path)?;
    debug!("[Output] Renamed {} into place", tmp.display());
    Ok(())
}

pub fn write_geojson(path: &Path, collection: &FeatureCollection) -> Result<()> {
    write_replacing(path, |tmp| {
        let mut writer = BufWriter::new(File::create(tmp)?);
        serde_json::to_writer(&mut writer, collection)?;
        writer.flush()?;
        Ok(())
    })?;
    info!(
        "[Output] Wrote {} features to {}",
        collection.features.len(),
        path.display()
    );
    Ok(())
}

/// Write serializable rows as CSV with a header line.
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    write_replacing(path, |tmp| {
        let mut writer = csv::Writer::from_path(tmp)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    })?;
    info!("[Output] Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ServiceTier;
    use crate::runtimes::RuntimeKey;
    use geo::coord;

    const UTM10: Crs = Crs::Utm { zone: 10, north: true };

    fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    fn straight_line() -> LineString<f64> {
        LineString::new(vec![
            coord! { x: 472_954.459, y: 5_363_981.443 },
            coord! { x: 473_154.459, y: 5_363_981.443 },
        ])
    }

    fn temp_output(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("transit_speeds_output_{}_{}", std::process::id(), name))
    }

    fn speed(mean: f64) -> SegmentSpeed {
        SegmentSpeed {
            segment_id: 3,
            mean_speed: mean,
            count: 4,
            geometry: straight_line(),
        }
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(27.5, 0), 28.0);
        assert_eq!(round_to(27.49, 0), 27.0);
        assert_eq!(round_to(12.3456, 2), 12.35);
        assert_eq!(round_to(-3.5, 0), -4.0);
    }

    #[test]
    fn test_line_output_is_reprojected() {
        let adapter = OutputAdapter::new(
            UTM10,
            OutputConfig {
                geometry: OutputGeometry::Line,
                ..OutputConfig::default()
            },
        )
        .unwrap();
        let fc = adapter.segment_speeds(&[speed(31.6)]);
        let Some(geojson::Value::LineString(positions)) =
            fc.features[0].geometry.as_ref().map(|g| &g.value)
        else {
            panic!("expected a line");
        };
        assert!(approx_eq(positions[0][0], -123.3656, 1e-6));
        assert!(approx_eq(positions[0][1], 48.4284, 1e-6));
        assert_eq!(fc.features[0].property("mean_speed"), Some(&json!(32.0)));
        assert_eq!(fc.features[0].property("segment_id"), Some(&json!(3)));
    }

    #[test]
    fn test_buffer_output_is_polygon() {
        let adapter = OutputAdapter::new(UTM10, OutputConfig::default()).unwrap();
        let fc = adapter.segment_speeds(&[speed(30.0)]);
        match fc.features[0].geometry.as_ref().map(|g| &g.value) {
            Some(geojson::Value::Polygon(rings)) => {
                assert_eq!(rings.len(), 1);
                assert_eq!(rings[0].first(), rings[0].last());
            }
            other => panic!("expected a polygon, got {:?}", other),
        }
    }

    #[test]
    fn test_corridor_without_samples_is_null() {
        let adapter = OutputAdapter::new(UTM10, OutputConfig::default()).unwrap();
        let fc = adapter.corridor_speeds(&[CorridorSpeed {
            name: "Douglas St".to_string(),
            mean_speed: None,
            count: 0,
            geometry: straight_line(),
        }]);
        assert_eq!(fc.features[0].property("mean_speed"), Some(&JsonValue::Null));
    }

    #[test]
    fn test_runtime_rows_round_at_boundary() {
        let adapter = OutputAdapter::new(UTM10, OutputConfig::default()).unwrap();
        let rows = adapter.runtime_rows(&[RuntimeStat {
            route_id: "26".to_string(),
            key: RuntimeKey::Hour(8),
            trips: 5,
            mean: 38.0,
            median: 34.0,
            p_low: 30.4,
            p_high: 53.6000001,
        }]);
        assert_eq!(rows[0].date_or_hour, "8");
        assert_eq!(rows[0].p5_runtime, 30.4);
        assert_eq!(rows[0].p95_runtime, 53.6);
    }

    #[test]
    fn test_schedule_rows_leave_single_trip_headway_empty() {
        let adapter = OutputAdapter::new(UTM10, OutputConfig::default()).unwrap();
        let rows = adapter.schedule_rows(&[ScheduledService {
            date: chrono::NaiveDate::from_ymd_opt(2023, 9, 4).unwrap(),
            route_id: "15".to_string(),
            mean_runtime: 27.3333333,
            mean_headway: None,
            trips: 1,
        }]);
        assert_eq!(rows[0].date, "2023-09-04");
        assert_eq!(rows[0].mean_runtime, 27.33);
        assert_eq!(rows[0].mean_headway, None);

        let path = temp_output("schedules.csv");
        write_csv(&path, &rows).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("2023-09-04,15,27.33,,1"));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_write_csv_replaces_file() {
        let path = temp_output("runtimes.csv");
        let adapter = OutputAdapter::new(UTM10, OutputConfig::default()).unwrap();
        let rows = adapter.route_speed_rows(&[RouteSpeed {
            route_id: "14".to_string(),
            mean_speed: 17.26,
            count: 12,
            tier: ServiceTier::Ftn,
        }]);
        std::fs::write(&path, "stale").unwrap();
        write_csv(&path, &rows).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("route,tier,mean_speed,count"));
        assert_eq!(lines.next(), Some("14,FTN,17.0,12"));
        assert!(!temp_path(&path).exists());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_write_geojson_reads_back() {
        let path = temp_output("segments.geojson");
        let adapter = OutputAdapter::new(UTM10, OutputConfig::default()).unwrap();
        let segment = RoadSegment::new(0, straight_line(), vec!["26".to_string()]);
        write_geojson(&path, &adapter.segments(&[segment])).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let fc: FeatureCollection = serde_json::from_str(&text).unwrap();
        assert_eq!(fc.features.len(), 1);
        assert_eq!(fc.features[0].property("length_m"), Some(&json!(200.0)));
        assert_eq!(fc.features[0].property("routes"), Some(&json!(["26"])));
        std::fs::remove_file(&path).unwrap();
    }
}
