//! # Segment Builder
//!
//! Derives the set of road segments that speeds are attributed to.
//!
//! Two strategies feed the same deduplication pass:
//!
//! - **Road network filtering** ([`build_from_road_network`]): keep each road
//!   line whose start, midpoint and end all lie within `sample_radius` of some
//!   route corridor. Requiring all three rejects roads that merely cross a route.
//! - **Shape synthesis** ([`build_from_shapes`]): resample each route shape at
//!   `resample_spacing` and turn consecutive resampled points into segments.
//!
//! Deduplication drops a candidate whose geometry lies wholly within the
//! `dedup_radius` buffer of an earlier surviving segment, so one physical road
//! is not counted twice. Ids are assigned by final position.

use std::time::Instant;

use geo::{BoundingRect, Coord, LineString, Rect, Simplify};
use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::buffer::{Buffer, CapStyle};
use crate::error::{PipelineError, Result};
use crate::geo_utils::{interpolate_points, line_length, point_at_fraction, point_segment_distance};
use crate::{RoadSegment, SegmentId};

/// A route's path in the working CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteShape {
    pub route_id: String,
    pub geometry: LineString<f64>,
}

/// How candidates are compared during deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    /// Compare each candidate with the most recent survivor only. O(n), but
    /// misses duplicates that are not adjacent in build order.
    #[default]
    Adjacent,
    /// Compare each candidate with every nearby survivor through an R-tree.
    /// Guarantees no survivor lies inside an earlier survivor's buffer; results
    /// differ from `Adjacent` when input order is irregular.
    Global,
}

/// Configuration for segment building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Radius around the start, mid and end point of a road line that must reach
    /// a route corridor for the road to be kept.
    /// Default: 20.0 metres
    pub sample_radius: f64,

    /// Target length of synthesized segments.
    /// Default: 200.0 metres
    pub resample_spacing: f64,

    /// Buffer radius used to detect duplicate segments.
    /// Default: 10.0 metres
    pub dedup_radius: f64,

    /// Default: adjacent pass
    pub dedup: DedupStrategy,

    /// Douglas-Peucker tolerance applied to input lines before use.
    /// 0.0 disables simplification. Default: 0.0
    pub simplify_tolerance: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            sample_radius: 20.0,
            resample_spacing: 200.0,
            dedup_radius: 10.0,
            dedup: DedupStrategy::Adjacent,
            simplify_tolerance: 0.0,
        }
    }
}

/// A road line kept by [`filter_road_network`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoadMatch {
    /// Index into the road layer
    pub road_index: usize,
    /// Routes whose corridor passes within the sample radius of the road midpoint
    pub route_ids: Vec<String>,
}

/// A segment before deduplication and id assignment.
#[derive(Debug, Clone)]
struct Candidate {
    geometry: LineString<f64>,
    route_ids: Vec<String>,
}

// =============================================================================
// Route Corridor Index
// =============================================================================

/// One edge of a route corridor line.
#[derive(Debug, Clone, Copy)]
struct CorridorEdge {
    start: Coord<f64>,
    end: Coord<f64>,
    route: usize,
}

impl RTreeObject for CorridorEdge {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners([self.start.x, self.start.y], [self.end.x, self.end.y])
    }
}

/// Answers "which route corridors pass within `radius` of this point".
struct CorridorIndex<'a> {
    tree: RTree<CorridorEdge>,
    corridors: &'a [RouteShape],
    radius: f64,
}

impl<'a> CorridorIndex<'a> {
    fn new(corridors: &'a [RouteShape], radius: f64) -> Self {
        let edges: Vec<CorridorEdge> = corridors
            .iter()
            .enumerate()
            .flat_map(|(route, shape)| {
                shape.geometry.lines().map(move |l| CorridorEdge {
                    start: l.start,
                    end: l.end,
                    route,
                })
            })
            .collect();
        Self {
            tree: RTree::bulk_load(edges),
            corridors,
            radius,
        }
    }

    fn edges_near(&self, p: Coord<f64>) -> impl Iterator<Item = &CorridorEdge> + '_ {
        let r = self.radius;
        let search = AABB::from_corners([p.x - r, p.y - r], [p.x + r, p.y + r]);
        self.tree
            .locate_in_envelope_intersecting(&search)
            .filter(move |e| point_segment_distance(p, e.start, e.end) <= r)
    }

    fn is_near(&self, p: Coord<f64>) -> bool {
        self.edges_near(p).next().is_some()
    }

    /// Route ids near `p`, in corridor order, without repeats.
    fn routes_near(&self, p: Coord<f64>) -> Vec<String> {
        let mut routes: Vec<usize> = self.edges_near(p).map(|e| e.route).collect();
        routes.sort_unstable();
        routes.dedup();
        let mut ids: Vec<String> = Vec::with_capacity(routes.len());
        for route in routes {
            let id = &self.corridors[route].route_id;
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Apply the start / mid / end test to one road line.
    fn match_road(&self, road_index: usize, road: &LineString<f64>) -> Option<RoadMatch> {
        let start = *road.0.first()?;
        let end = *road.0.last()?;
        let mid = point_at_fraction(road, 0.5)?;

        if self.is_near(start) && self.is_near(mid) && self.is_near(end) {
            Some(RoadMatch {
                road_index,
                route_ids: self.routes_near(mid),
            })
        } else {
            None
        }
    }
}

// =============================================================================
// Strategy A: Road Network Filtering
// =============================================================================

/// Road lines whose start, midpoint and end each lie within
/// `config.sample_radius` of a route corridor, in road-layer order.
///
/// Both layers must be in the same projected CRS.
///
/// # Example
/// ```
/// use geo::LineString;
/// use transit_speeds::segments::{filter_road_network, RouteShape, SegmentConfig};
///
/// let corridor = RouteShape {
///     route_id: "26".to_string(),
///     geometry: LineString::from(vec![(0.0, 0.0), (500.0, 0.0)]),
/// };
/// let roads = vec![
///     LineString::from(vec![(0.0, 2.0), (500.0, 2.0)]),    // runs along the route
///     LineString::from(vec![(250.0, -300.0), (250.0, 300.0)]), // crosses it once
/// ];
///
/// let kept = filter_road_network(&roads, &[corridor], &SegmentConfig::default());
/// assert_eq!(kept.len(), 1);
/// assert_eq!(kept[0].road_index, 0);
/// ```
pub fn filter_road_network(
    roads: &[LineString<f64>],
    corridors: &[RouteShape],
    config: &SegmentConfig,
) -> Vec<RoadMatch> {
    let index = CorridorIndex::new(corridors, config.sample_radius);
    roads
        .iter()
        .enumerate()
        .filter_map(|(i, road)| index.match_road(i, road))
        .collect()
}

/// Parallel version of [`filter_road_network`]. Output order is identical.
#[cfg(feature = "parallel")]
pub fn filter_road_network_parallel(
    roads: &[LineString<f64>],
    corridors: &[RouteShape],
    config: &SegmentConfig,
) -> Vec<RoadMatch> {
    let index = CorridorIndex::new(corridors, config.sample_radius);
    roads
        .par_iter()
        .enumerate()
        .filter_map(|(i, road)| index.match_road(i, road))
        .collect()
}

/// Build segments from a road network layer filtered against route corridors.
///
/// Every kept road line becomes one candidate segment. Fails when either layer
/// is empty, when no road survives, or when one of the configured `routes`
/// ends up with no segment. With no configured routes, corridor routes left
/// without a segment are only reported in a warning.
pub fn build_from_road_network(
    roads: &[LineString<f64>],
    corridors: &[RouteShape],
    routes: &[String],
    config: &SegmentConfig,
) -> Result<Vec<RoadSegment>> {
    if roads.is_empty() {
        return Err(PipelineError::EmptyLayer("road network".to_string()));
    }
    if corridors.is_empty() {
        return Err(PipelineError::EmptyLayer("route corridors".to_string()));
    }

    let start = Instant::now();

    #[cfg(feature = "parallel")]
    let matches = filter_road_network_parallel(roads, corridors, config);
    #[cfg(not(feature = "parallel"))]
    let matches = filter_road_network(roads, corridors, config);

    info!(
        "[Segments] Road filter kept {} of {} road lines",
        matches.len(),
        roads.len()
    );
    if matches.is_empty() {
        return Err(PipelineError::NoSurvivingSegments(
            "the road network".to_string(),
        ));
    }

    let candidates: Vec<Candidate> = matches
        .into_iter()
        .map(|m| Candidate {
            geometry: prepare_line(&roads[m.road_index], config),
            route_ids: m.route_ids,
        })
        .collect();

    let required: Vec<&str> = routes.iter().map(String::as_str).collect();
    let segments = finish(candidates, &required, config)?;

    if routes.is_empty() {
        let uncovered = uncovered_routes(&segments, corridors.iter().map(|c| c.route_id.as_str()));
        if !uncovered.is_empty() {
            warn!(
                "[Segments] No road kept for corridor routes: {}",
                uncovered.join(", ")
            );
        }
    }

    info!(
        "[Segments] Built {} segments from road network in {:?}",
        segments.len(),
        start.elapsed()
    );
    Ok(segments)
}

// =============================================================================
// Strategy B: Shape Synthesis
// =============================================================================

/// Build segments by resampling route shapes into fixed-length pieces.
///
/// Shapes are processed in the given order and each shape's pieces in travel
/// order, so the result is a pure function of the input. A shape shorter than
/// `resample_spacing` produces no pieces and fails the build for that route.
pub fn build_from_shapes(shapes: &[RouteShape], config: &SegmentConfig) -> Result<Vec<RoadSegment>> {
    if shapes.is_empty() {
        return Err(PipelineError::MissingInput("route shapes".to_string()));
    }

    let start = Instant::now();
    let mut candidates = Vec::new();

    for shape in shapes {
        let line = prepare_line(&shape.geometry, config);
        let points: Vec<Coord<f64>> = interpolate_points(&line, config.resample_spacing).collect();

        if points.len() < 2 {
            warn!(
                "[Segments] Route {} shape ({:.0}m) is shorter than the {:.0}m resample spacing",
                shape.route_id,
                line_length(&line),
                config.resample_spacing
            );
        }
        debug!(
            "[Segments] Route {} resampled into {} pieces",
            shape.route_id,
            points.len().saturating_sub(1)
        );

        candidates.extend(points.windows(2).map(|pair| Candidate {
            geometry: LineString::new(vec![pair[0], pair[1]]),
            route_ids: vec![shape.route_id.clone()],
        }));
    }

    let route_ids: Vec<&str> = shapes.iter().map(|s| s.route_id.as_str()).collect();
    let segments = finish(candidates, &route_ids, config)?;

    info!(
        "[Segments] Built {} segments from {} route shapes in {:?}",
        segments.len(),
        shapes.len(),
        start.elapsed()
    );
    Ok(segments)
}

fn prepare_line(line: &LineString<f64>, config: &SegmentConfig) -> LineString<f64> {
    if config.simplify_tolerance > 0.0 {
        line.simplify(&config.simplify_tolerance)
    } else {
        line.clone()
    }
}

/// Deduplicate, check route coverage and assign ids.
fn finish(
    candidates: Vec<Candidate>,
    expected_routes: &[&str],
    config: &SegmentConfig,
) -> Result<Vec<RoadSegment>> {
    let before = candidates.len();
    let survivors = match config.dedup {
        DedupStrategy::Adjacent => dedup_adjacent(candidates, config.dedup_radius),
        DedupStrategy::Global => dedup_global(candidates, config.dedup_radius),
    };
    debug!(
        "[Segments] Deduplication ({:?}) kept {} of {} candidates",
        config.dedup,
        survivors.len(),
        before
    );

    let segments: Vec<RoadSegment> = survivors
        .into_iter()
        .enumerate()
        .map(|(i, c)| RoadSegment::new(i as SegmentId, c.geometry, c.route_ids))
        .collect();

    if let Some(route) = uncovered_routes(&segments, expected_routes.iter().copied()).first() {
        return Err(PipelineError::NoSurvivingSegments(format!("route {route}")));
    }
    Ok(segments)
}

/// Routes carried by no segment, in first-seen order.
fn uncovered_routes<'r>(
    segments: &[RoadSegment],
    routes: impl IntoIterator<Item = &'r str>,
) -> Vec<&'r str> {
    let mut missing: Vec<&str> = Vec::new();
    for route in routes {
        if !missing.contains(&route)
            && !segments.iter().any(|s| s.route_ids.iter().any(|r| r == route))
        {
            missing.push(route);
        }
    }
    missing
}

// =============================================================================
// Deduplication
// =============================================================================

fn dedup_buffer(line: &LineString<f64>, radius: f64) -> Option<Buffer> {
    Buffer::new(line, radius, CapStyle::Flat)
}

fn absorb_routes(survivor: &mut Candidate, dropped: Candidate) {
    for route in dropped.route_ids {
        if !survivor.route_ids.contains(&route) {
            survivor.route_ids.push(route);
        }
    }
}

/// Greedy pass comparing each candidate with the last survivor.
fn dedup_adjacent(candidates: Vec<Candidate>, radius: f64) -> Vec<Candidate> {
    let mut survivors: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut last_buffer: Option<Buffer> = None;

    for candidate in candidates {
        let redundant = last_buffer
            .as_ref()
            .map(|b| b.contains_line(&candidate.geometry))
            .unwrap_or(false);

        match survivors.last_mut() {
            Some(last) if redundant => absorb_routes(last, candidate),
            _ => {
                last_buffer = dedup_buffer(&candidate.geometry, radius);
                survivors.push(candidate);
            }
        }
    }

    survivors
}

/// A survivor's dedup buffer in the global index.
struct IndexedBuffer {
    survivor: usize,
    buffer: Buffer,
}

impl RTreeObject for IndexedBuffer {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        rect_aabb(self.buffer.envelope())
    }
}

/// Compare each candidate against every earlier survivor whose buffer overlaps it.
fn dedup_global(candidates: Vec<Candidate>, radius: f64) -> Vec<Candidate> {
    let mut survivors: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut tree: RTree<IndexedBuffer> = RTree::new();

    for candidate in candidates {
        let Some(bounds) = candidate.geometry.bounding_rect().map(rect_aabb) else {
            continue;
        };

        let container = tree
            .locate_in_envelope_intersecting(&bounds)
            .filter(|ib| ib.buffer.contains_line(&candidate.geometry))
            .map(|ib| ib.survivor)
            .min();

        match container {
            Some(i) => absorb_routes(&mut survivors[i], candidate),
            None => {
                if let Some(buffer) = dedup_buffer(&candidate.geometry, radius) {
                    tree.insert(IndexedBuffer {
                        survivor: survivors.len(),
                        buffer,
                    });
                }
                survivors.push(candidate);
            }
        }
    }

    survivors
}

fn rect_aabb(rect: Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}
