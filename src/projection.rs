//! # Coordinate Reference Systems
//!
//! Conversion between geographic WGS84 coordinates and Universal Transverse
//! Mercator grids, so every geometric operation in the pipeline can run in
//! metres. The transforms themselves are done by `proj4rs`, built from PROJ
//! strings for each supported EPSG code.
//!
//! NAD83 UTM codes (EPSG:269xx) are accepted and treated as WGS84 UTM. The two
//! datums differ by about a metre in North America, below the resolution of the
//! 20 m buffers used downstream.
//!
//! ```rust
//! use transit_speeds::projection::{Crs, Projector};
//! use geo::coord;
//!
//! let to_utm = Projector::new(Crs::Wgs84, Crs::from_epsg(26910).unwrap()).unwrap();
//! let victoria = to_utm.coord(coord! { x: -123.3656, y: 48.4284 });
//! assert!((victoria.x - 472_954.46).abs() < 0.5);
//! assert!((victoria.y - 5_363_981.44).abs() < 0.5);
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use geo::{Coord, LineString, Point, Polygon};
use log::debug;
use proj4rs::proj::Proj;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// A supported coordinate reference system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Crs {
    /// Geographic longitude/latitude in degrees (EPSG:4326). `x` is longitude.
    #[default]
    Wgs84,
    /// UTM grid zone in metres.
    Utm { zone: u8, north: bool },
}

impl Crs {
    /// Look up a CRS by EPSG code.
    ///
    /// Supports 4326, 32601-32660 (north), 32701-32760 (south) and
    /// 26901-26923 (NAD83, treated as WGS84 north).
    pub fn from_epsg(code: u32) -> Result<Self> {
        let utm = |zone: u32, north: bool| -> Result<Self> {
            if (1..=60).contains(&zone) {
                Ok(Crs::Utm { zone: zone as u8, north })
            } else {
                Err(PipelineError::UnsupportedCrs(format!("EPSG:{code}")))
            }
        };
        match code {
            4326 => Ok(Crs::Wgs84),
            32601..=32660 => utm(code - 32600, true),
            32701..=32760 => utm(code - 32700, false),
            26901..=26923 => utm(code - 26900, true),
            _ => Err(PipelineError::UnsupportedCrs(format!("EPSG:{code}"))),
        }
    }

    /// EPSG code of this CRS (WGS84 UTM codes for grid systems).
    pub fn epsg(&self) -> u32 {
        match *self {
            Crs::Wgs84 => 4326,
            Crs::Utm { zone, north: true } => 32600 + zone as u32,
            Crs::Utm { zone, north: false } => 32700 + zone as u32,
        }
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Wgs84)
    }

    /// PROJ definition string of this CRS.
    pub fn proj_string(&self) -> String {
        match *self {
            Crs::Wgs84 => "+proj=longlat +datum=WGS84 +no_defs".to_string(),
            Crs::Utm { zone, north } => format!(
                "+proj=utm +zone={}{} +datum=WGS84 +units=m +no_defs",
                zone,
                if north { "" } else { " +south" }
            ),
        }
    }

    fn build(&self) -> Result<Proj> {
        Proj::from_proj_string(&self.proj_string())
            .map_err(|e| PipelineError::Projection(format!("{self}: {e}")))
    }
}

impl FromStr for Crs {
    type Err = PipelineError;

    /// Parses `"EPSG:26910"`, `"epsg:4326"` or a bare code.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let code = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        code.parse::<u32>()
            .map_err(|_| PipelineError::UnsupportedCrs(s.to_string()))
            .and_then(Crs::from_epsg)
    }
}

impl TryFrom<String> for Crs {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Crs> for String {
    fn from(crs: Crs) -> Self {
        crs.to_string()
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

// =============================================================================
// Projector
// =============================================================================

/// Converts coordinates from one CRS to another.
///
/// Geographic coordinates are degrees on both sides; the conversion to the
/// radians `proj4rs` works in happens here. An identity projector never
/// touches its input.
#[derive(Clone)]
pub struct Projector {
    from: Crs,
    to: Crs,
    transform: Option<(Arc<Proj>, Arc<Proj>)>,
}

impl fmt::Debug for Projector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projector")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

impl Projector {
    pub fn new(from: Crs, to: Crs) -> Result<Self> {
        let transform = if from == to {
            None
        } else {
            debug!("[Projection] {} -> {}", from, to);
            Some((Arc::new(from.build()?), Arc::new(to.build()?)))
        };
        Ok(Self { from, to, transform })
    }

    pub fn source(&self) -> Crs {
        self.from
    }

    pub fn target(&self) -> Crs {
        self.to
    }

    pub fn is_identity(&self) -> bool {
        self.transform.is_none()
    }

    /// The projector for the opposite direction.
    pub fn inverse(&self) -> Self {
        Self {
            from: self.to,
            to: self.from,
            transform: self
                .transform
                .as_ref()
                .map(|(src, dst)| (Arc::clone(dst), Arc::clone(src))),
        }
    }

    /// Convert a single coordinate, failing for positions outside the
    /// domain of the transform.
    pub fn try_coord(&self, c: Coord<f64>) -> Result<Coord<f64>> {
        let Some((src, dst)) = &self.transform else {
            return Ok(c);
        };

        let mut point = if self.from.is_geographic() {
            (c.x.to_radians(), c.y.to_radians(), 0.0)
        } else {
            (c.x, c.y, 0.0)
        };
        proj4rs::transform::transform(src, dst, &mut point)
            .map_err(|e| PipelineError::Projection(format!("({}, {}): {e}", c.x, c.y)))?;

        Ok(if self.to.is_geographic() {
            Coord { x: point.0.to_degrees(), y: point.1.to_degrees() }
        } else {
            Coord { x: point.0, y: point.1 }
        })
    }

    /// Convert a single coordinate. A position the transform rejects comes
    /// back as NaN, which every later containment test treats as outside.
    pub fn coord(&self, c: Coord<f64>) -> Coord<f64> {
        self.try_coord(c).unwrap_or(Coord { x: f64::NAN, y: f64::NAN })
    }
}

/// Geometries that can be carried through a [`Projector`].
pub trait Reproject {
    fn reproject(&self, projector: &Projector) -> Self;
}

impl Reproject for Coord<f64> {
    fn reproject(&self, projector: &Projector) -> Self {
        projector.coord(*self)
    }
}

impl Reproject for Point<f64> {
    fn reproject(&self, projector: &Projector) -> Self {
        Point(projector.coord(self.0))
    }
}

impl Reproject for LineString<f64> {
    fn reproject(&self, projector: &Projector) -> Self {
        if projector.is_identity() {
            return self.clone();
        }
        self.0.iter().map(|&c| projector.coord(c)).collect()
    }
}

impl Reproject for Polygon<f64> {
    fn reproject(&self, projector: &Projector) -> Self {
        Polygon::new(
            self.exterior().reproject(projector),
            self.interiors()
                .iter()
                .map(|ring| ring.reproject(projector))
                .collect(),
        )
    }
}
