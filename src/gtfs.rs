//! Static schedule tables: routes, trips and shapes.
//!
//! Only the columns needed to pick one representative shape per route are
//! read. Tables are looked up as `<name>.txt` (the GTFS convention) and fall
//! back to `<name>.csv`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use geo::{Coord, LineString};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::projection::{Projector, Reproject};
use crate::segments::RouteShape;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Route {
    pub route_id: String,
    #[serde(default)]
    pub route_short_name: String,
    #[serde(default)]
    pub route_long_name: String,
}

impl Route {
    /// Public route number when published, otherwise the feed identifier.
    pub fn display_id(&self) -> &str {
        if self.route_short_name.is_empty() {
            &self.route_id
        } else {
            &self.route_short_name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Trip {
    pub route_id: String,
    pub trip_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub direction_id: Option<u8>,
    #[serde(default)]
    pub shape_id: Option<String>,
    #[serde(default)]
    pub trip_headsign: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ShapePointRow {
    shape_pt_lat: f64,
    shape_pt_lon: f64,
    shape_pt_sequence: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ShapeRow {
    shape_id: String,
    shape_pt_lat: f64,
    shape_pt_lon: f64,
    shape_pt_sequence: u32,
}

/// A route to build segments for, and which of its trips supplies the shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSelection {
    /// Route short name or feed route id
    pub route: String,
    /// Position among the route's trips that have a shape, in file order
    #[serde(default)]
    pub trip_index: usize,
}

impl RouteSelection {
    pub fn new(route: &str, trip_index: usize) -> Self {
        Self {
            route: route.to_string(),
            trip_index,
        }
    }
}

/// Routes, trips and shapes of a static feed.
#[derive(Debug, Clone, Default)]
pub struct GtfsTables {
    pub routes: Vec<Route>,
    pub trips: Vec<Trip>,
    /// Shape points by shape id, sorted by sequence
    shapes: HashMap<String, Vec<ShapePointRow>>,
}

impl GtfsTables {
    /// Load `routes`, `trips` and `shapes` from an extracted feed directory.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let routes: Vec<Route> = read_table(&table_path(dir, "routes")?)?;
        let trips: Vec<Trip> = read_table(&table_path(dir, "trips")?)?;
        let rows: Vec<ShapeRow> = read_table(&table_path(dir, "shapes")?)?;

        if routes.is_empty() {
            return Err(PipelineError::EmptyLayer(format!(
                "{}/routes",
                dir.display()
            )));
        }

        let tables = Self::from_rows(
            routes,
            trips,
            rows.into_iter()
                .map(|r| (r.shape_id, r.shape_pt_lat, r.shape_pt_lon, r.shape_pt_sequence)),
        );
        info!(
            "[Gtfs] Loaded {} routes, {} trips, {} shapes from {}",
            tables.routes.len(),
            tables.trips.len(),
            tables.shapes.len(),
            dir.display()
        );
        Ok(tables)
    }

    /// Build tables from in-memory rows. Shape points are `(shape_id, lat, lon, sequence)`.
    pub fn from_rows(
        routes: Vec<Route>,
        trips: Vec<Trip>,
        shape_points: impl IntoIterator<Item = (String, f64, f64, u32)>,
    ) -> Self {
        Self::from_parts(
            routes,
            trips,
            shape_points.into_iter().map(|(id, lat, lon, seq)| {
                (
                    id,
                    ShapePointRow {
                        shape_pt_lat: lat,
                        shape_pt_lon: lon,
                        shape_pt_sequence: seq,
                    },
                )
            }),
        )
    }

    fn from_parts(
        routes: Vec<Route>,
        trips: Vec<Trip>,
        points: impl Iterator<Item = (String, ShapePointRow)>,
    ) -> Self {
        let mut shapes: HashMap<String, Vec<ShapePointRow>> = HashMap::new();
        for (id, point) in points {
            shapes.entry(id).or_default().push(point);
        }
        for points in shapes.values_mut() {
            points.sort_by_key(|p| p.shape_pt_sequence);
        }
        Self {
            routes,
            trips,
            shapes,
        }
    }

    /// Route whose short name or id equals `key`. Short names win.
    pub fn find_route(&self, key: &str) -> Option<&Route> {
        find_route(&self.routes, key)
    }

    /// Trips of a feed route that carry a shape, in file order.
    pub fn shaped_trips(&self, route_id: &str) -> Vec<&Trip> {
        self.trips
            .iter()
            .filter(|t| t.route_id == route_id && t.shape_id.is_some())
            .collect()
    }

    /// Shape as a WGS84 line (`x` = longitude), ordered by point sequence.
    pub fn shape_line(&self, shape_id: &str) -> Option<LineString<f64>> {
        let points = self.shapes.get(shape_id)?;
        Some(
            points
                .iter()
                .map(|p| Coord {
                    x: p.shape_pt_lon,
                    y: p.shape_pt_lat,
                })
                .collect(),
        )
    }

    /// The representative shape for one configured route, still in WGS84.
    pub fn representative_shape(&self, selection: &RouteSelection) -> Result<RouteShape> {
        let route = self
            .find_route(&selection.route)
            .ok_or_else(|| PipelineError::RouteNotFound {
                route: selection.route.clone(),
            })?;

        let trips = self.shaped_trips(&route.route_id);
        if trips.is_empty() {
            return Err(PipelineError::RouteNotFound {
                route: selection.route.clone(),
            });
        }
        let trip = trips
            .get(selection.trip_index)
            .ok_or_else(|| PipelineError::TripIndexOutOfRange {
                route: selection.route.clone(),
                index: selection.trip_index,
                available: trips.len(),
            })?;

        let shape_id = trip.shape_id.as_deref().unwrap_or_default();
        let geometry = self
            .shape_line(shape_id)
            .filter(|line| line.0.len() >= 2)
            .ok_or_else(|| {
                PipelineError::InvalidGeometry(format!(
                    "shape {} of route {} has fewer than two points",
                    shape_id, selection.route
                ))
            })?;

        debug!(
            "[Gtfs] Route {} uses trip {} (shape {}, {} points)",
            selection.route,
            trip.trip_id,
            shape_id,
            geometry.0.len()
        );

        Ok(RouteShape {
            route_id: route.display_id().to_string(),
            geometry,
        })
    }
}

/// Representative shapes for every selection, reprojected with `projector`.
///
/// Fails on the first route that cannot be resolved, naming it.
pub fn select_route_shapes(
    tables: &GtfsTables,
    selections: &[RouteSelection],
    projector: &Projector,
) -> Result<Vec<RouteShape>> {
    selections
        .iter()
        .map(|selection| {
            tables.representative_shape(selection).map(|shape| RouteShape {
                route_id: shape.route_id,
                geometry: shape.geometry.reproject(projector),
            })
        })
        .collect()
}

pub(crate) fn find_route<'a>(routes: &'a [Route], key: &str) -> Option<&'a Route> {
    routes
        .iter()
        .find(|r| r.route_short_name == key)
        .or_else(|| routes.iter().find(|r| r.route_id == key))
}

pub(crate) fn table_path(dir: &Path, name: &str) -> Result<PathBuf> {
    ["txt", "csv"]
        .iter()
        .map(|ext| dir.join(format!("{name}.{ext}")))
        .find(|p| p.exists())
        .ok_or_else(|| {
            PipelineError::MissingInput(format!("{name}.txt in {}", dir.display()))
        })
}

pub(crate) fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let rows = reader
        .deserialize()
        .collect::<std::result::Result<Vec<T>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::Crs;

    fn route(id: &str, short: &str) -> Route {
        Route {
            route_id: id.to_string(),
            route_short_name: short.to_string(),
            route_long_name: String::new(),
        }
    }

    fn trip(route_id: &str, trip_id: &str, shape: Option<&str>) -> Trip {
        Trip {
            route_id: route_id.to_string(),
            trip_id: trip_id.to_string(),
            service_id: "WKDY".to_string(),
            direction_id: Some(0),
            shape_id: shape.map(str::to_string),
            trip_headsign: String::new(),
        }
    }

    fn tables() -> GtfsTables {
        GtfsTables::from_rows(
            vec![route("26-VIC", "26"), route("4-VIC", "4")],
            vec![
                trip("26-VIC", "T1", None),
                trip("26-VIC", "T2", Some("S26a")),
                trip("26-VIC", "T3", Some("S26b")),
            ],
            vec![
                ("S26a".to_string(), 48.43, -123.37, 2),
                ("S26a".to_string(), 48.42, -123.38, 1),
                ("S26b".to_string(), 48.44, -123.36, 1),
                ("S26b".to_string(), 48.45, -123.35, 2),
            ],
        )
    }

    #[test]
    fn test_find_route_by_short_name_or_id() {
        let t = tables();
        assert_eq!(t.find_route("26").unwrap().route_id, "26-VIC");
        assert_eq!(t.find_route("4-VIC").unwrap().route_short_name, "4");
        assert!(t.find_route("99").is_none());
    }

    #[test]
    fn test_shape_points_sorted_by_sequence() {
        let line = tables().shape_line("S26a").unwrap();
        assert_eq!(line.0[0], Coord { x: -123.38, y: 48.42 });
        assert_eq!(line.0[1], Coord { x: -123.37, y: 48.43 });
    }

    #[test]
    fn test_trip_index_counts_shaped_trips_only() {
        let shape = tables()
            .representative_shape(&RouteSelection::new("26", 1))
            .unwrap();
        assert_eq!(shape.route_id, "26");
        assert_eq!(shape.geometry.0[0], Coord { x: -123.36, y: 48.44 });
    }

    #[test]
    fn test_missing_route_is_named() {
        let err = tables()
            .representative_shape(&RouteSelection::new("99", 0))
            .unwrap_err();
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn test_route_without_shaped_trips() {
        let err = tables()
            .representative_shape(&RouteSelection::new("4", 0))
            .unwrap_err();
        assert!(matches!(err, PipelineError::RouteNotFound { .. }));
    }

    #[test]
    fn test_trip_index_out_of_range() {
        let err = tables()
            .representative_shape(&RouteSelection::new("26", 5))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TripIndexOutOfRange { index: 5, available: 2, .. }
        ));
    }

    #[test]
    fn test_select_route_shapes_reprojects() {
        let projector = Projector::new(Crs::Wgs84, Crs::Utm { zone: 10, north: true }).unwrap();
        let shapes =
            select_route_shapes(&tables(), &[RouteSelection::new("26", 0)], &projector).unwrap();
        assert_eq!(shapes.len(), 1);
        assert!(shapes[0].geometry.0[0].x > 400_000.0);
    }

    #[test]
    fn test_load_dir() {
        let dir = std::env::temp_dir().join(format!("transit_speeds_gtfs_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("routes.txt"),
            "route_id,agency_id,route_short_name,route_long_name,route_type\n26-VIC,1,26,Dockyard / UVic,3\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("trips.txt"),
            "route_id,service_id,trip_id,direction_id,shape_id\n26-VIC,WKDY,T9,1,S9\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("shapes.csv"),
            "shape_id,shape_pt_lat,shape_pt_lon,shape_pt_sequence\nS9,48.42,-123.38,1\nS9,48.43,-123.37,2\n",
        )
        .unwrap();

        let t = GtfsTables::load_dir(&dir).unwrap();
        assert_eq!(t.routes.len(), 1);
        assert_eq!(t.trips[0].direction_id, Some(1));
        assert_eq!(t.shape_line("S9").unwrap().0.len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_dir_missing_table() {
        let dir = std::env::temp_dir().join(format!("transit_speeds_gtfs_empty_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            GtfsTables::load_dir(&dir),
            Err(PipelineError::MissingInput(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
