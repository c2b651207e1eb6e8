//! End-to-end checks of the segment -> attribution -> aggregation pipeline
//! through the public API.

use geo::{coord, Coord, LineString};
use transit_speeds::aggregate::{segment_speed_deltas, segment_speeds, TimeFilter};
use transit_speeds::attribution::{attribute_samples, ensure_routes_attributed, AttributionConfig};
use transit_speeds::buffer::{Buffer, CapStyle};
use transit_speeds::geo_utils::point_line_distance;
use transit_speeds::runtimes::{
    aggregate_runtimes, build_trip_summaries, filter_outliers, runtime_stats, RuntimeConfig,
    RuntimeGrouping,
};
use transit_speeds::segments::{
    build_from_road_network, build_from_shapes, filter_road_network, DedupStrategy, RouteShape,
    SegmentConfig,
};
use transit_speeds::{Crs, GpsSample, LocalClock, PipelineError, Projector, RoadSegment};

/// Monday 2024-01-15 08:30 in Los Angeles
const MONDAY_0830: i64 = 1_705_336_200;

fn working() -> Projector {
    let crs = Crs::Utm { zone: 10, north: true };
    Projector::new(crs, crs).unwrap()
}

fn straight_line(points: &[(f64, f64)]) -> LineString<f64> {
    LineString::new(points.iter().map(|&(x, y)| coord! { x: x, y: y }).collect())
}

fn route_shape(route: &str, points: &[(f64, f64)]) -> RouteShape {
    RouteShape {
        route_id: route.to_string(),
        geometry: straight_line(points),
    }
}

fn sample(ts: i64, route: &str, trip: &str, speed: f64, x: f64, y: f64) -> GpsSample {
    GpsSample::new(ts, route, trip, "0", speed, x, y)
}

/// Samples spread along an L-shaped pair of routes, every 25m, one trip each.
fn corridor_samples() -> Vec<GpsSample> {
    let mut samples = Vec::new();
    for i in 0..40 {
        let d = i as f64 * 25.0;
        samples.push(sample(MONDAY_0830 + i * 20, "26", "A1", 20.0 + (i % 5) as f64, d, 4.0));
        samples.push(sample(MONDAY_0830 + i * 20, "14", "B1", 15.0 + (i % 3) as f64, 1000.0 - 3.0, d));
    }
    samples
}

fn corridor_segments(dedup: DedupStrategy) -> Vec<RoadSegment> {
    let shapes = vec![
        route_shape("26", &[(0.0, 0.0), (1000.0, 0.0)]),
        route_shape("14", &[(1000.0, 0.0), (1000.0, 1000.0)]),
    ];
    let config = SegmentConfig {
        dedup,
        ..SegmentConfig::default()
    };
    build_from_shapes(&shapes, &config).unwrap()
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_parallel_road_outside_corridor_radius_is_dropped() {
    let roads = vec![
        straight_line(&[(0.0, 0.0), (100.0, 0.0)]),
        straight_line(&[(0.0, 5.0), (100.0, 5.0)]),
    ];
    let corridors = vec![route_shape("26", &[(0.0, 0.0), (100.0, 0.0)])];
    let config = SegmentConfig {
        sample_radius: 4.0,
        ..SegmentConfig::default()
    };

    let kept = filter_road_network(&roads, &corridors, &config);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].road_index, 0);
    assert_eq!(kept[0].route_ids, vec!["26"]);

    let segments = build_from_road_network(&roads, &corridors, &[], &config).unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].geometry, roads[0]);
}

#[test]
fn test_three_samples_average_to_thirty() {
    let segments = vec![RoadSegment::new(
        0,
        straight_line(&[(0.0, 0.0), (200.0, 0.0)]),
        vec!["26".to_string()],
    )];
    let samples: Vec<GpsSample> = [20.0, 30.0, 40.0]
        .iter()
        .enumerate()
        .map(|(i, &speed)| sample(1000 + i as i64 * 30, "26", "T1", speed, 50.0 + i as f64 * 40.0, 3.0))
        .collect();

    let rows = attribute_samples(&segments, &samples, &working(), &AttributionConfig::default());
    let stats = segment_speeds(&rows, &segments, None);
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].segment_id, 0);
    assert_eq!(stats[0].count, 3);
    assert!((stats[0].mean_speed - 30.0).abs() < 1e-9);
}

#[test]
fn test_short_trip_is_filtered_out() {
    let samples = vec![
        sample(1000, "26", "T1", 22.0, 0.0, 0.0),
        sample(1300, "26", "T1", 18.0, 0.0, 0.0),
        sample(1600, "26", "T1", 25.0, 0.0, 0.0),
        sample(1900, "26", "T1", 0.0, 0.0, 0.0), // idle, ignored
        sample(5000, "26", "T2", 30.0, 0.0, 0.0),
        sample(5120, "26", "T2", 30.0, 0.0, 0.0),
    ];
    let clock = LocalClock::default();
    let trips = build_trip_summaries(&samples, &clock, false);
    assert_eq!(trips.len(), 2);
    assert_eq!(trips[0].runtime_minutes, 10.0);
    assert_eq!(trips[1].runtime_minutes, 2.0);

    let kept = filter_outliers(trips, &RuntimeConfig::default());
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].trip_id, "T1");
    assert_eq!(kept[0].runtime_minutes, 10.0);
}

// =============================================================================
// Properties
// =============================================================================

#[test]
fn test_segment_build_is_deterministic() {
    let a = corridor_segments(DedupStrategy::Adjacent);
    let b = corridor_segments(DedupStrategy::Adjacent);
    assert_eq!(a, b);
    for (i, s) in a.iter().enumerate() {
        assert_eq!(s.id as usize, i);
    }
}

fn contained(outer: &RoadSegment, inner: &RoadSegment, radius: f64) -> bool {
    Buffer::new(&outer.geometry, radius, CapStyle::Flat)
        .map(|b| b.contains_line(&inner.geometry))
        .unwrap_or(false)
}

#[test]
fn test_adjacent_dedup_invariant() {
    let config = SegmentConfig::default();
    let segments = corridor_segments(DedupStrategy::Adjacent);
    for pair in segments.windows(2) {
        assert!(!contained(&pair[0], &pair[1], config.dedup_radius));
    }
}

#[test]
fn test_global_dedup_invariant_with_revisited_road() {
    // Route 15 retraces route 26 after a detour, so its duplicates are not adjacent
    // to the segments they repeat.
    let shapes = vec![
        route_shape("26", &[(0.0, 0.0), (1000.0, 0.0)]),
        route_shape("15", &[(0.0, 0.0), (1000.0, 0.0)]),
    ];
    let config = SegmentConfig {
        dedup: DedupStrategy::Global,
        ..SegmentConfig::default()
    };
    let segments = build_from_shapes(&shapes, &config).unwrap();
    assert_eq!(segments.len(), 5);
    for (i, earlier) in segments.iter().enumerate() {
        for later in &segments[i + 1..] {
            assert!(!contained(earlier, later, config.dedup_radius));
        }
    }
    assert!(segments
        .iter()
        .all(|s| s.route_ids == vec!["26".to_string(), "15".to_string()]));

    let adjacent = build_from_shapes(
        &shapes,
        &SegmentConfig {
            dedup: DedupStrategy::Adjacent,
            ..SegmentConfig::default()
        },
    )
    .unwrap();
    assert_eq!(adjacent.len(), 10);
}

#[test]
fn test_attribution_containment() {
    let config = AttributionConfig::default();
    let segments = corridor_segments(DedupStrategy::Adjacent);
    let samples = corridor_samples();
    let rows = attribute_samples(&segments, &samples, &working(), &config);
    assert!(!rows.is_empty());

    for row in &rows {
        let id = row.segment_id.expect("unattributed rows are dropped by default");
        let segment = &segments[id as usize];
        assert!(point_line_distance(row.position, &segment.geometry) <= config.buffer_radius + 1e-9);
    }
    ensure_routes_attributed(&rows, &["26".to_string(), "14".to_string()]).unwrap();
}

#[test]
fn test_missing_route_is_reported() {
    let segments = corridor_segments(DedupStrategy::Adjacent);
    let samples = corridor_samples();
    let rows = attribute_samples(&segments, &samples, &working(), &AttributionConfig::default());
    let err = ensure_routes_attributed(&rows, &["99".to_string()]).unwrap_err();
    assert!(matches!(err, PipelineError::NoSurvivingSegments(_)));
    assert!(err.to_string().contains("99"));
}

#[test]
fn test_no_phantom_zero_segments() {
    let segments = corridor_segments(DedupStrategy::Adjacent);
    // Only route 26 runs; route 14 segments have no data
    let samples: Vec<GpsSample> = corridor_samples()
        .into_iter()
        .filter(|s| s.route_id == "26")
        .collect();
    let rows = attribute_samples(&segments, &samples, &working(), &AttributionConfig::default());

    let clock = LocalClock::default();
    let stats = segment_speeds(&rows, &segments, None);
    assert!(!stats.is_empty());
    assert!(stats.len() < segments.len());
    assert!(stats.iter().all(|s| s.count > 0));

    let filter = TimeFilter {
        clock: &clock,
        window: transit_speeds::aggregate::HourWindow::new(17, 19),
    };
    assert!(segment_speeds(&rows, &segments, Some(&filter)).is_empty());
    assert!(segment_speed_deltas(&rows, &segments, &clock)
        .iter()
        .all(|d| d.peak_speed.is_finite() && d.off_peak_speed.is_finite()));
}

#[test]
fn test_percentile_ordering() {
    let clock = LocalClock::default();
    let mut samples = Vec::new();
    let runtimes = [12.0, 14.0, 15.0, 19.0, 41.0, 16.0, 13.0];
    for (i, minutes) in runtimes.iter().enumerate() {
        let trip = format!("T{i}");
        let start = MONDAY_0830 + i as i64 * 600;
        samples.push(sample(start, "4", &trip, 24.0, 0.0, 0.0));
        samples.push(sample(start + (*minutes * 60.0) as i64, "4", &trip, 21.0, 0.0, 0.0));
    }

    let config = RuntimeConfig::default();
    for grouping in [RuntimeGrouping::DepartureHour, RuntimeGrouping::Date] {
        let stats = runtime_stats(&samples, &clock, grouping, &config);
        assert!(!stats.is_empty());
        for s in &stats {
            assert!(s.p_low <= s.median + 1e-9 && s.median <= s.p_high + 1e-9);
            assert!(s.p_low <= s.p_high);
        }
    }
}

#[test]
fn test_outlier_filter_bounds() {
    let clock = LocalClock::default();
    let samples: Vec<GpsSample> = [0.0, 3.0, 5.0, 6.0, 90.0, 200.0, 250.0]
        .iter()
        .enumerate()
        .flat_map(|(i, minutes)| {
            let trip = format!("T{i}");
            vec![
                sample(MONDAY_0830, "6", &trip, 20.0, 0.0, 0.0),
                sample(MONDAY_0830 + (minutes * 60.0) as i64, "6", &trip, 20.0, 0.0, 0.0),
            ]
        })
        .collect();

    let config = RuntimeConfig::default();
    let kept = filter_outliers(build_trip_summaries(&samples, &clock, true), &config);
    assert_eq!(kept.len(), 2);
    assert!(kept
        .iter()
        .all(|t| t.runtime_minutes > 5.0 && t.runtime_minutes < 200.0));

    let stats = aggregate_runtimes(&kept, RuntimeGrouping::DepartureHour, &config);
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].trips, 2);
}

#[test]
fn test_sample_positions_are_reprojected() {
    // The same road built in UTM 10N, with samples arriving as longitude/latitude
    let to_utm = Projector::new(Crs::Wgs84, Crs::Utm { zone: 10, north: true }).unwrap();
    let origin = to_utm.coord(coord! { x: -123.3656, y: 48.4284 });
    let segments = vec![RoadSegment::new(
        0,
        LineString::new(vec![origin, Coord { x: origin.x + 200.0, y: origin.y }]),
        vec!["26".to_string()],
    )];
    let samples = vec![sample(MONDAY_0830, "26", "T1", 33.0, -123.3650, 48.4284)];

    let rows = attribute_samples(&segments, &samples, &to_utm, &AttributionConfig::default());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].segment_id, Some(0));
    assert!((rows[0].position.x - origin.x - 44.4).abs() < 1.0);
}
