//! GeoJSON line layers: road networks, route corridors and named corridors.
//!
//! Features are read and written with the `geojson` crate. Only line and
//! multi-line geometries are turned into road or corridor lines; other
//! geometry types are ignored. Extra coordinate dimensions are dropped by the
//! `geo-types` conversion.

use std::path::Path;

use geo::LineString;
use geojson::{Feature, FeatureCollection, JsonObject, JsonValue};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::aggregate::Corridor;
use crate::error::{PipelineError, Result};
use crate::projection::{Projector, Reproject};
use crate::segments::RouteShape;

/// A feature collection without a bounding box or foreign members.
pub fn feature_collection(features: Vec<Feature>) -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

/// A feature with a geometry converted from `geo` and a property object.
pub fn feature(geometry: geojson::Value, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(geojson::Geometry::new(geometry)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

/// Line parts of a feature. Non-line geometries yield nothing.
pub fn feature_lines(feature: &Feature) -> Vec<LineString<f64>> {
    let Some(geometry) = &feature.geometry else {
        return Vec::new();
    };
    match geo::Geometry::<f64>::try_from(geometry.value.clone()) {
        Ok(geo::Geometry::LineString(line)) if line.0.len() >= 2 => vec![line],
        Ok(geo::Geometry::MultiLineString(parts)) => {
            parts.0.into_iter().filter(|l| l.0.len() >= 2).collect()
        }
        _ => Vec::new(),
    }
}

/// Read a GeoJSON feature collection from disk.
pub fn read_feature_collection(path: &Path) -> Result<FeatureCollection> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.display().to_string()));
    }
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Property value as a string; whole numbers print without a fraction.
pub fn property_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Some(i.to_string()),
            None => n.as_f64().map(|f| f.to_string()),
        },
        _ => None,
    }
}

// =============================================================================
// Road Network
// =============================================================================

/// Keeps road features whose lane count is in an allowed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneFilter {
    /// Default: `TOTAL_NUMBER_OF_LANES`
    pub property: String,
    /// Default: 1 through 6
    pub allowed: Vec<u32>,
}

impl Default for LaneFilter {
    fn default() -> Self {
        Self {
            property: "TOTAL_NUMBER_OF_LANES".to_string(),
            allowed: (1..=6).collect(),
        }
    }
}

impl LaneFilter {
    /// Features without a readable lane count are kept.
    pub fn accepts(&self, feature: &Feature) -> bool {
        let lanes = feature.property(&self.property).and_then(|v| match v {
            JsonValue::Number(n) => n.as_u64(),
            JsonValue::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        });
        match lanes {
            Some(n) => self.allowed.iter().any(|&a| u64::from(a) == n),
            None => true,
        }
    }

    /// `where` clause selecting the allowed lane counts on a feature service.
    pub fn where_clause(&self) -> String {
        let values: Vec<String> = self.allowed.iter().map(u32::to_string).collect();
        format!("{} IN ({})", self.property, values.join(","))
    }
}

/// Road lines from a feature collection, lane-filtered and reprojected.
///
/// Multi-part lines contribute one line per part, in feature order.
pub fn road_lines(
    collection: &FeatureCollection,
    lanes: &LaneFilter,
    projector: &Projector,
) -> Result<Vec<LineString<f64>>> {
    let mut rejected = 0usize;
    let mut lines = Vec::with_capacity(collection.features.len());

    for feature in &collection.features {
        if !lanes.accepts(feature) {
            rejected += 1;
            continue;
        }
        lines.extend(feature_lines(feature).iter().map(|l| l.reproject(projector)));
    }

    debug!("[Layers] Lane filter rejected {} road features", rejected);
    if lines.is_empty() {
        return Err(PipelineError::EmptyLayer("road network".to_string()));
    }
    info!(
        "[Layers] {} road lines from {} features",
        lines.len(),
        collection.features.len()
    );
    Ok(lines)
}

/// Read and prepare a road network layer.
pub fn read_road_layer(
    path: &Path,
    lanes: &LaneFilter,
    projector: &Projector,
) -> Result<Vec<LineString<f64>>> {
    road_lines(&read_feature_collection(path)?, lanes, projector)
        .map_err(|e| match e {
            PipelineError::EmptyLayer(_) => PipelineError::EmptyLayer(path.display().to_string()),
            other => other,
        })
}

// =============================================================================
// Corridors
// =============================================================================

/// Route corridor lines: one [`RouteShape`] per line part, route id taken from
/// `route_property`. Features without a route id are skipped with a warning.
pub fn read_route_corridors(
    path: &Path,
    route_property: &str,
    projector: &Projector,
) -> Result<Vec<RouteShape>> {
    let collection = read_feature_collection(path)?;
    let mut missing = 0usize;
    let mut shapes = Vec::new();

    for feature in &collection.features {
        let Some(route_id) = feature.property(route_property).and_then(property_string) else {
            missing += 1;
            continue;
        };
        shapes.extend(feature_lines(feature).into_iter().map(|line| RouteShape {
            route_id: route_id.clone(),
            geometry: line.reproject(projector),
        }));
    }

    if missing > 0 {
        warn!(
            "[Layers] {} corridor features in {} have no '{}' property",
            missing,
            path.display(),
            route_property
        );
    }
    if shapes.is_empty() {
        return Err(PipelineError::EmptyLayer(path.display().to_string()));
    }
    Ok(shapes)
}

/// Named corridors. Each feature needs a `name` property and a `routes`
/// property holding an array of route ids; the first line part is used.
pub fn read_named_corridors(path: &Path, projector: &Projector) -> Result<Vec<Corridor>> {
    let collection = read_feature_collection(path)?;
    let mut corridors = Vec::with_capacity(collection.features.len());

    for (i, feature) in collection.features.iter().enumerate() {
        let name = feature
            .property("name")
            .and_then(property_string)
            .unwrap_or_else(|| format!("corridor {i}"));
        let routes: Vec<String> = feature
            .property("routes")
            .and_then(JsonValue::as_array)
            .map(|values| values.iter().filter_map(property_string).collect())
            .unwrap_or_default();
        let Some(line) = feature_lines(feature).into_iter().next() else {
            return Err(PipelineError::InvalidGeometry(format!(
                "corridor {name} has no line geometry"
            )));
        };

        if routes.is_empty() {
            warn!("[Layers] Corridor {} lists no routes", name);
        }
        corridors.push(Corridor {
            name,
            geometry: line.reproject(projector),
            routes,
        });
    }

    if corridors.is_empty() {
        return Err(PipelineError::EmptyLayer(path.display().to_string()));
    }
    Ok(corridors)
}
