//! # Spatial Attribution Engine
//!
//! Joins GPS samples to road segments. Every segment is buffered (flat caps by
//! default) and the buffer envelopes go into an R-tree; each sample is projected
//! into the working CRS, candidate buffers are found through the tree, and the
//! exact containment test decides.
//!
//! A sample inside several overlapping buffers yields one row per buffer. A
//! sample inside none is dropped unless `keep_unattributed` is set, in which
//! case it is kept with no segment id.

use std::collections::HashSet;
use std::time::Instant;

use geo::Coord;
use log::{info, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::buffer::{Buffer, CapStyle};
use crate::error::{PipelineError, Result};
use crate::projection::Projector;
use crate::{GpsSample, RoadSegment, SegmentId};

/// Configuration for attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// Buffer radius around each segment.
    /// Default: 20.0 metres
    pub buffer_radius: f64,

    /// Default: flat, so buffers of consecutive segments do not overlap at joints
    pub cap_style: CapStyle,

    /// Emit a row with no segment for samples outside every buffer.
    /// Default: false
    pub keep_unattributed: bool,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            buffer_radius: 20.0,
            cap_style: CapStyle::Flat,
            keep_unattributed: false,
        }
    }
}

/// A sample joined to at most one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributedSample<'a> {
    pub sample: &'a GpsSample,
    /// Sample position in the working CRS
    pub position: Coord<f64>,
    pub segment_id: Option<SegmentId>,
}

// =============================================================================
// Segment Index
// =============================================================================

/// A segment buffer stored in the R-tree.
#[derive(Debug, Clone)]
struct IndexedBuffer {
    segment_id: SegmentId,
    buffer: Buffer,
}

impl RTreeObject for IndexedBuffer {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        let rect = self.buffer.envelope();
        AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
    }
}

/// Read-only spatial index over segment buffers.
#[derive(Debug, Clone)]
pub struct SegmentIndex {
    tree: RTree<IndexedBuffer>,
}

impl SegmentIndex {
    /// Buffer and index every segment. Segments with unusable geometry are
    /// skipped with a warning.
    pub fn new(segments: &[RoadSegment], config: &AttributionConfig) -> Self {
        let mut skipped = 0usize;
        let buffers: Vec<IndexedBuffer> = segments
            .iter()
            .filter_map(|s| {
                let buffer = Buffer::new(&s.geometry, config.buffer_radius, config.cap_style);
                if buffer.is_none() {
                    skipped += 1;
                }
                buffer.map(|buffer| IndexedBuffer {
                    segment_id: s.id,
                    buffer,
                })
            })
            .collect();

        if skipped > 0 {
            warn!("[Attribution] Skipped {} segments with empty geometry", skipped);
        }

        Self {
            tree: RTree::bulk_load(buffers),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Ids of all segments whose buffer contains `p`, ascending.
    pub fn segments_containing(&self, p: Coord<f64>) -> Vec<SegmentId> {
        let query = AABB::from_point([p.x, p.y]);
        let mut ids: Vec<SegmentId> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .filter(|ib| ib.buffer.contains(p))
            .map(|ib| ib.segment_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Rows for one sample: one per containing buffer.
    fn attribute<'a>(
        &self,
        sample: &'a GpsSample,
        projector: &Projector,
        keep_unattributed: bool,
    ) -> Vec<AttributedSample<'a>> {
        let position = projector.coord(Coord {
            x: sample.x,
            y: sample.y,
        });
        let ids = self.segments_containing(position);

        if ids.is_empty() {
            return if keep_unattributed {
                vec![AttributedSample {
                    sample,
                    position,
                    segment_id: None,
                }]
            } else {
                Vec::new()
            };
        }

        ids.into_iter()
            .map(|id| AttributedSample {
                sample,
                position,
                segment_id: Some(id),
            })
            .collect()
    }
}

// =============================================================================
// Attribution
// =============================================================================

/// Attribute samples to segments.
///
/// `projector` converts sample coordinates (longitude/latitude on ingest) into
/// the segments' working CRS. Output order follows sample order, and within one
/// sample ascending segment id.
pub fn attribute_samples<'a>(
    segments: &[RoadSegment],
    samples: &'a [GpsSample],
    projector: &Projector,
    config: &AttributionConfig,
) -> Vec<AttributedSample<'a>> {
    let start = Instant::now();
    let index = SegmentIndex::new(segments, config);

    let rows: Vec<AttributedSample<'a>> = samples
        .iter()
        .flat_map(|s| index.attribute(s, projector, config.keep_unattributed))
        .collect();

    log_summary(&rows, samples.len(), index.len(), start);
    rows
}

/// Parallel version of [`attribute_samples`]. Output is identical, including order.
#[cfg(feature = "parallel")]
pub fn attribute_samples_parallel<'a>(
    segments: &[RoadSegment],
    samples: &'a [GpsSample],
    projector: &Projector,
    config: &AttributionConfig,
) -> Vec<AttributedSample<'a>> {
    let start = Instant::now();
    let index = SegmentIndex::new(segments, config);

    let rows: Vec<AttributedSample<'a>> = samples
        .par_iter()
        .flat_map_iter(|s| index.attribute(s, projector, config.keep_unattributed))
        .collect();

    log_summary(&rows, samples.len(), index.len(), start);
    rows
}

fn log_summary(rows: &[AttributedSample<'_>], samples: usize, segments: usize, start: Instant) {
    let attributed = rows.iter().filter(|r| r.segment_id.is_some()).count();
    info!(
        "[Attribution] {} samples -> {} attributed rows over {} segments in {:?}",
        samples,
        attributed,
        segments,
        start.elapsed()
    );
}

/// Fail when a configured route has no sample attributed to any segment.
///
/// That means the segments no longer follow the route, which is a
/// configuration problem rather than a quiet gap in the map.
pub fn ensure_routes_attributed(rows: &[AttributedSample<'_>], routes: &[String]) -> Result<()> {
    let seen: HashSet<&str> = rows
        .iter()
        .filter(|r| r.segment_id.is_some())
        .map(|r| r.sample.route_id.as_str())
        .collect();

    match routes.iter().find(|r| !seen.contains(r.as_str())) {
        Some(route) => Err(PipelineError::NoSurvivingSegments(format!(
            "route {route} (no samples fell inside any segment buffer)"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::point_line_distance;
    use crate::projection::Crs;
    use geo::LineString;

    fn identity() -> Projector {
        let working = Crs::Utm { zone: 10, north: true };
        Projector::new(working, working).unwrap()
    }

    fn segment(id: SegmentId, x0: f64, y0: f64, x1: f64, y1: f64) -> RoadSegment {
        RoadSegment::new(id, LineString::from(vec![(x0, y0), (x1, y1)]), vec!["26".into()])
    }

    fn make_sample(x: f64, y: f64, speed: f64) -> GpsSample {
        GpsSample::new(0, "26", "t1", "0", speed, x, y)
    }

    #[test]
    fn test_point_inside_one_buffer() {
        let segments = vec![segment(0, 0.0, 0.0, 200.0, 0.0), segment(1, 0.0, 100.0, 200.0, 100.0)];
        let samples = vec![make_sample(50.0, 10.0, 20.0)];
        let rows = attribute_samples(&segments, &samples, &identity(), &AttributionConfig::default());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].segment_id, Some(0));
    }

    #[test]
    fn test_point_outside_is_dropped_or_kept() {
        let segments = vec![segment(0, 0.0, 0.0, 200.0, 0.0)];
        let samples = vec![make_sample(50.0, 30.0, 20.0)];

        let dropped = attribute_samples(&segments, &samples, &identity(), &AttributionConfig::default());
        assert!(dropped.is_empty());

        let config = AttributionConfig {
            keep_unattributed: true,
            ..Default::default()
        };
        let kept = attribute_samples(&segments, &samples, &identity(), &config);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].segment_id, None);
    }

    #[test]
    fn test_flat_caps_do_not_overlap_at_joint() {
        let segments = vec![segment(0, 0.0, 0.0, 200.0, 0.0), segment(1, 200.0, 0.0, 400.0, 0.0)];
        let samples = vec![make_sample(205.0, 5.0, 20.0), make_sample(195.0, 5.0, 20.0)];
        let rows = attribute_samples(&segments, &samples, &identity(), &AttributionConfig::default());
        let ids: Vec<_> = rows.iter().map(|r| r.segment_id).collect();
        assert_eq!(ids, vec![Some(1), Some(0)]);
    }

    #[test]
    fn test_overlapping_buffers_duplicate_rows() {
        let segments = vec![segment(0, 0.0, 0.0, 200.0, 0.0), segment(1, 0.0, 30.0, 200.0, 30.0)];
        let samples = vec![make_sample(100.0, 15.0, 20.0)];
        let rows = attribute_samples(&segments, &samples, &identity(), &AttributionConfig::default());
        let ids: Vec<_> = rows.iter().map(|r| r.segment_id).collect();
        assert_eq!(ids, vec![Some(0), Some(1)]);
    }

    #[test]
    fn test_attributed_points_within_radius() {
        let segments = vec![
            segment(0, 0.0, 0.0, 200.0, 0.0),
            segment(1, 200.0, 0.0, 300.0, 150.0),
            segment(2, 300.0, 150.0, 100.0, 300.0),
        ];
        let samples: Vec<GpsSample> = (0..400)
            .map(|i| {
                let x = (i % 20) as f64 * 17.0;
                let y = (i / 20) as f64 * 17.0 - 20.0;
                make_sample(x, y, 10.0)
            })
            .collect();
        let config = AttributionConfig::default();
        let rows = attribute_samples(&segments, &samples, &identity(), &config);
        assert!(!rows.is_empty());
        for row in &rows {
            let seg = &segments[row.segment_id.unwrap() as usize];
            assert!(point_line_distance(row.position, &seg.geometry) <= config.buffer_radius + 1e-9);
        }
    }

    #[test]
    fn test_samples_are_projected() {
        let to_utm = Projector::new(Crs::Wgs84, Crs::Utm { zone: 10, north: true }).unwrap();
        let here = to_utm.coord(Coord { x: -123.3656, y: 48.4284 });
        let segments = vec![segment(0, here.x - 100.0, here.y, here.x + 100.0, here.y)];
        let samples = vec![make_sample(-123.3656, 48.4284, 22.0)];
        let rows = attribute_samples(&segments, &samples, &to_utm, &AttributionConfig::default());
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_ensure_routes_attributed() {
        let segments = vec![segment(0, 0.0, 0.0, 200.0, 0.0)];
        let samples = vec![make_sample(50.0, 5.0, 20.0)];
        let rows = attribute_samples(&segments, &samples, &identity(), &AttributionConfig::default());
        assert!(ensure_routes_attributed(&rows, &["26".to_string()]).is_ok());
        let err = ensure_routes_attributed(&rows, &["26".to_string(), "4".to_string()]).unwrap_err();
        assert!(err.to_string().contains("route 4"));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_matches_sequential() {
        let segments: Vec<RoadSegment> = (0..30)
            .map(|i| segment(i, i as f64 * 200.0, 0.0, (i + 1) as f64 * 200.0, 0.0))
            .collect();
        let samples: Vec<GpsSample> = (0..5_000)
            .map(|i| make_sample(i as f64 * 1.2, (i % 50) as f64 - 25.0, 15.0))
            .collect();
        let config = AttributionConfig::default();
        assert_eq!(
            attribute_samples(&segments, &samples, &identity(), &config),
            attribute_samples_parallel(&segments, &samples, &identity(), &config)
        );
    }
}
