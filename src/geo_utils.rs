//! # Planar Geometry Utilities
//!
//! Thin helpers over the `geo` algorithms, fixed to the Euclidean metric.
//!
//! Every function here works in the units of the working CRS. Inputs are expected
//! to have been reprojected with [`crate::projection`] first; nothing in this
//! module knows about latitude or longitude.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`line_length`] | Total planar length of a line |
//! | [`point_segment_distance`] | Distance from a point to a straight segment |
//! | [`point_line_distance`] | Distance from a point to a polyline |
//! | [`point_at_fraction`] | Point at a normalized position along a line |
//! | [`interpolate_points`] | Evenly spaced points along a line (lazy) |
//! | [`densify`] | Line vertices plus extra points at a maximum spacing |
//! | [`line_envelope`] | Bounding rectangle grown by a margin |
//!
//! ## Example
//!
//! ```rust
//! use geo::LineString;
//! use transit_speeds::geo_utils;
//!
//! let line = LineString::from(vec![(0.0, 0.0), (450.0, 0.0)]);
//!
//! assert_eq!(geo_utils::line_length(&line), 450.0);
//!
//! // floor(450 / 200) = 2 intervals -> 3 points at 0, 225 and 450
//! let points: Vec<_> = geo_utils::interpolate_points(&line, 200.0).collect();
//! assert_eq!(points.len(), 3);
//! assert_eq!(points[1].x, 225.0);
//! ```

use geo::{
    BoundingRect, Coord, Densify, Distance, Euclidean, Length, Line, LineInterpolatePoint,
    LineString, Point, Rect, RemoveRepeatedPoints,
};

// =============================================================================
// Distance Functions
// =============================================================================

/// Euclidean distance between two coordinates.
#[inline]
pub fn coord_distance(a: Coord<f64>, b: Coord<f64>) -> f64 {
    Euclidean::distance(Point::from(a), Point::from(b))
}

/// Total planar length of a line. Empty or single-point lines return 0.0.
pub fn line_length(line: &LineString<f64>) -> f64 {
    line.length::<Euclidean>()
}

/// Distance from `p` to the closed segment `a`-`b`.
///
/// A zero-length segment degrades to point distance.
pub fn point_segment_distance(p: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> f64 {
    Euclidean::distance(&Point::from(p), &Line::new(a, b))
}

/// Distance from `p` to the nearest point of a polyline.
///
/// Returns `f64::INFINITY` for an empty line.
pub fn point_line_distance(p: Coord<f64>, line: &LineString<f64>) -> f64 {
    match line.0.len() {
        0 => f64::INFINITY,
        1 => coord_distance(p, line.0[0]),
        _ => Euclidean::distance(&Point::from(p), line),
    }
}

// =============================================================================
// Interpolation
// =============================================================================

/// Point at a normalized position (0 = start, 1 = end) along a line.
///
/// Fractions outside `[0, 1]` are clamped. Returns `None` for an empty line.
pub fn point_at_fraction(line: &LineString<f64>, fraction: f64) -> Option<Coord<f64>> {
    let first = *line.0.first()?;
    // Zero-length pieces would interpolate to NaN
    let line = line.remove_repeated_points();
    if line.0.len() < 2 {
        return Some(first);
    }
    line.line_interpolate_point(fraction.clamp(0.0, 1.0))
        .map(|p| p.0)
}

/// Evenly spaced points along a line at approximately `spacing_m` intervals.
///
/// Computes `n = floor(length / spacing_m)` and yields the points at fractional
/// positions `0, 1/n, ..., 1`, so both endpoints are always included. The
/// sequence is lazy and finite. It is empty when `n < 1`, i.e. when the line is
/// shorter than the spacing.
pub fn interpolate_points(
    line: &LineString<f64>,
    spacing_m: f64,
) -> impl Iterator<Item = Coord<f64>> + '_ {
    let length = line_length(line);
    let n = if spacing_m > 0.0 && length.is_finite() {
        (length / spacing_m).floor() as usize
    } else {
        0
    };
    let count = if n >= 1 { n + 1 } else { 0 };

    (0..count).filter_map(move |i| point_at_fraction(line, i as f64 / n as f64))
}

/// The line with intermediate points inserted so that no two consecutive
/// points are more than `max_step` apart. A non-positive step returns the line
/// unchanged.
pub fn densify(line: &LineString<f64>, max_step: f64) -> LineString<f64> {
    if !(max_step.is_finite() && max_step > 0.0) {
        return line.clone();
    }
    line.densify::<Euclidean>(max_step)
}

/// Bounding rectangle of a line grown by `margin` on every side.
pub fn line_envelope(line: &LineString<f64>, margin: f64) -> Option<Rect<f64>> {
    let rect = line.bounding_rect()?;
    let grow = Coord { x: margin, y: margin };
    Some(Rect::new(rect.min() - grow, rect.max() + grow))
}

// =============================================================================
// Unit Tests
// =============================================================================
