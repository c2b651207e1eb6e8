//! Offset buffers around points and lines.
//!
//! A [`Buffer`] is the region within `radius` of a geometry. With
//! [`CapStyle::Flat`] the region is cut off at the perpendicular through each
//! line endpoint, so the buffers of two segments that meet end to end only touch
//! along a line instead of overlapping in a half-disk. Interior vertices always
//! get round joins.
//!
//! Membership is tested analytically (union of one rectangle per segment plus a
//! disk per interior vertex, plus end disks for round caps), which is exact and
//! cheap. [`Buffer::to_polygon`] produces a polygon approximation for rendering.

use geo::{Coord, LineString, Point, Polygon, Rect, RemoveRepeatedPoints};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{
    coord_distance, densify, line_envelope, point_line_distance, point_segment_distance,
};

/// Segments per quarter circle when approximating arcs.
const QUADRANT_SEGMENTS: usize = 8;

/// End cap style of a line buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapStyle {
    /// Truncate at the perpendicular through the endpoint.
    #[default]
    Flat,
    /// Half-disk beyond each endpoint.
    Round,
}

/// The region within `radius` of a line (or of a single point).
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    line: LineString<f64>,
    radius: f64,
    cap: CapStyle,
    envelope: Rect<f64>,
}

impl Buffer {
    /// Buffer a line. A line with a single distinct coordinate is treated as a point.
    ///
    /// Returns `None` for an empty geometry or a radius that is not positive and finite.
    pub fn new(geometry: &LineString<f64>, radius: f64, cap: CapStyle) -> Option<Self> {
        if !(radius.is_finite() && radius > 0.0) {
            return None;
        }

        let line = geometry.remove_repeated_points();
        if line.0.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
            return None;
        }
        let envelope = line_envelope(&line, radius)?;

        Some(Self {
            line,
            radius,
            cap,
            envelope,
        })
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn cap_style(&self) -> CapStyle {
        self.cap
    }

    /// Axis-aligned box that contains the whole buffer.
    pub fn envelope(&self) -> Rect<f64> {
        self.envelope
    }

    /// The buffered geometry (consecutive duplicate vertices removed).
    pub fn line(&self) -> &LineString<f64> {
        &self.line
    }

    /// Whether `p` lies inside the buffer or on its boundary.
    pub fn contains(&self, p: Coord<f64>) -> bool {
        let min = self.envelope.min();
        let max = self.envelope.max();
        if p.x < min.x || p.x > max.x || p.y < min.y || p.y > max.y {
            return false;
        }

        let coords = &self.line.0;
        let r = self.radius;

        if self.cap == CapStyle::Round {
            return point_line_distance(p, &self.line) <= r;
        }
        // A flat-capped point has no extent
        if coords.len() == 1 {
            return false;
        }

        // One rectangle per segment: the foot of the perpendicular must land on it
        let on_rectangle = self.line.lines().any(|l| {
            let d = l.delta();
            let t = Point(p - l.start).dot(Point(d)) / Point(d).dot(Point(d));
            (0.0..=1.0).contains(&t) && point_segment_distance(p, l.start, l.end) <= r
        });
        if on_rectangle {
            return true;
        }

        // Round joins
        let last = coords.len() - 1;
        coords[1..last].iter().any(|&v| coord_distance(p, v) <= r)
    }

    /// Whether the whole of `line` lies inside the buffer.
    ///
    /// Tested on the line's vertices plus intermediate points spaced at most a
    /// quarter of the radius apart.
    pub fn contains_line(&self, line: &LineString<f64>) -> bool {
        if line.0.is_empty() {
            return false;
        }
        densify(line, self.radius / 4.0)
            .0
            .into_iter()
            .all(|c| self.contains(c))
    }

    /// Polygon approximation of the buffer outline.
    ///
    /// Convex joins and round caps are approximated with eight segments per
    /// quarter circle; concave joins use the intersection of the offset lines.
    /// A flat-capped point yields an empty polygon.
    pub fn to_polygon(&self) -> Polygon<f64> {
        let coords = &self.line.0;
        let r = self.radius;

        if coords.len() == 1 {
            if self.cap == CapStyle::Flat {
                return Polygon::new(LineString::new(vec![]), vec![]);
            }
            let mut ring = Vec::with_capacity(4 * QUADRANT_SEGMENTS + 1);
            let steps = 4 * QUADRANT_SEGMENTS;
            for i in 0..steps {
                let angle = std::f64::consts::TAU * i as f64 / steps as f64;
                ring.push(Coord {
                    x: coords[0].x + r * angle.cos(),
                    y: coords[0].y + r * angle.sin(),
                });
            }
            return Polygon::new(LineString::new(ring), vec![]);
        }

        let reversed: Vec<Coord<f64>> = coords.iter().rev().copied().collect();

        let mut ring = offset_left_side(coords, r);
        if self.cap == CapStyle::Round {
            push_end_cap(&mut ring, coords, r);
        }
        ring.extend(offset_left_side(&reversed, r));
        if self.cap == CapStyle::Round {
            push_end_cap(&mut ring, &reversed, r);
        }

        Polygon::new(LineString::new(ring), vec![])
    }
}

// =============================================================================
// Outline construction
// =============================================================================

fn unit_direction(a: Coord<f64>, b: Coord<f64>) -> Coord<f64> {
    let len = coord_distance(a, b);
    Coord {
        x: (b.x - a.x) / len,
        y: (b.y - a.y) / len,
    }
}

fn left_normal(d: Coord<f64>) -> Coord<f64> {
    Coord { x: -d.y, y: d.x }
}

fn offset(c: Coord<f64>, n: Coord<f64>, r: f64) -> Coord<f64> {
    Coord {
        x: c.x + r * n.x,
        y: c.y + r * n.y,
    }
}

/// Offset points on the left-hand side of `coords`, walking forward.
/// Coordinates must contain no consecutive duplicates.
fn offset_left_side(coords: &[Coord<f64>], r: f64) -> Vec<Coord<f64>> {
    let dirs: Vec<Coord<f64>> = coords.windows(2).map(|w| unit_direction(w[0], w[1])).collect();
    let mut out = Vec::with_capacity(coords.len() * 2);

    out.push(offset(coords[0], left_normal(dirs[0]), r));

    for k in 1..coords.len() - 1 {
        let d_in = dirs[k - 1];
        let d_out = dirs[k];
        let n_in = left_normal(d_in);
        let n_out = left_normal(d_out);
        let cross = d_in.x * d_out.y - d_in.y * d_out.x;
        let dot = d_in.x * d_out.x + d_in.y * d_out.y;

        if cross.abs() < 1e-12 && dot > 0.0 {
            out.push(offset(coords[k], n_out, r));
        } else if cross > 0.0 {
            // Left turn: this side is concave, meet the offset lines
            let a = offset(coords[k - 1], n_in, r);
            let b = offset(coords[k], n_out, r);
            match line_intersection(a, d_in, b, d_out) {
                Some(p) => out.push(p),
                None => {
                    out.push(offset(coords[k], n_in, r));
                    out.push(b);
                }
            }
        } else {
            // Right turn (or reversal): convex side gets a round join
            out.push(offset(coords[k], n_in, r));
            push_clockwise_arc(&mut out, coords[k], r, n_in, n_out);
            out.push(offset(coords[k], n_out, r));
        }
    }

    let last = coords.len() - 1;
    out.push(offset(coords[last], left_normal(dirs[last - 1]), r));
    out
}

/// Half-circle beyond the last coordinate, from the left offset to the right offset.
fn push_end_cap(ring: &mut Vec<Coord<f64>>, coords: &[Coord<f64>], r: f64) {
    let last = coords.len() - 1;
    let n = left_normal(unit_direction(coords[last - 1], coords[last]));
    let opposite = Coord { x: -n.x, y: -n.y };
    push_clockwise_arc(ring, coords[last], r, n, opposite);
}

/// Intermediate arc points around `center`, turning clockwise from `from` to `to`
/// (both unit vectors). Endpoints are not pushed.
fn push_clockwise_arc(
    out: &mut Vec<Coord<f64>>,
    center: Coord<f64>,
    r: f64,
    from: Coord<f64>,
    to: Coord<f64>,
) {
    let start = from.y.atan2(from.x);
    let end = to.y.atan2(to.x);
    let mut sweep = start - end;
    while sweep <= 0.0 {
        sweep += std::f64::consts::TAU;
    }
    let step = std::f64::consts::FRAC_PI_2 / QUADRANT_SEGMENTS as f64;
    let steps = (sweep / step).ceil() as usize;

    for i in 1..steps {
        let angle = start - sweep * i as f64 / steps as f64;
        out.push(Coord {
            x: center.x + r * angle.cos(),
            y: center.y + r * angle.sin(),
        });
    }
}

/// Intersection of the lines `p + t*d` and `q + s*e`, if not parallel.
fn line_intersection(
    p: Coord<f64>,
    d: Coord<f64>,
    q: Coord<f64>,
    e: Coord<f64>,
) -> Option<Coord<f64>> {
    let denom = d.x * e.y - d.y * e.x;
    if denom.abs() < 1e-12 {
        return None;
    }
    let t = ((q.x - p.x) * e.y - (q.y - p.y) * e.x) / denom;
    Some(Coord {
        x: p.x + t * d.x,
        y: p.y + t * d.y,
    })
}
