//! Example comparing sequential and parallel attribution on a large timeline.
//!
//! Run with: cargo run --example parallel_attribution --features parallel

use geo::{coord, LineString};
use std::time::Instant;
use transit_speeds::attribution::{attribute_samples, attribute_samples_parallel, AttributionConfig};
use transit_speeds::segments::{build_from_shapes, DedupStrategy, RouteShape, SegmentConfig};
use transit_speeds::{Crs, GpsSample, Projector};

fn main() -> transit_speeds::Result<()> {
    println!("Parallel Attribution Example\n");

    // A 10 x 10 grid of 5km routes, 500m apart, in metres
    let mut shapes = Vec::new();
    for i in 0..10 {
        let offset = i as f64 * 500.0;
        shapes.push(RouteShape {
            route_id: format!("E{i}"),
            geometry: LineString::new(vec![
                coord! { x: 0.0, y: offset },
                coord! { x: 5000.0, y: offset },
            ]),
        });
        shapes.push(RouteShape {
            route_id: format!("N{i}"),
            geometry: LineString::new(vec![
                coord! { x: offset, y: 0.0 },
                coord! { x: offset, y: 5000.0 },
            ]),
        });
    }
    let config = SegmentConfig {
        dedup: DedupStrategy::Global,
        ..SegmentConfig::default()
    };
    let segments = build_from_shapes(&shapes, &config)?;
    println!("Built {} segments from {} routes\n", segments.len(), shapes.len());

    // Samples scattered over the grid with a simple deterministic generator
    let mut state: u64 = 42;
    let mut next = move || {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    let samples: Vec<GpsSample> = (0..200_000)
        .map(|i| {
            let lane = (next() * 10.0).floor() * 500.0;
            let along = next() * 5000.0;
            let jitter = next() * 30.0 - 15.0;
            let (x, y) = if i % 2 == 0 { (along, lane + jitter) } else { (lane + jitter, along) };
            GpsSample::new(1_705_336_200 + i, "E0", &format!("T{}", i % 500), "0", next() * 50.0, x, y)
        })
        .collect();

    let working = Crs::Utm { zone: 10, north: true };
    let projector = Projector::new(working, working)?;
    let attribution = AttributionConfig::default();

    let start = Instant::now();
    let sequential = attribute_samples(&segments, &samples, &projector, &attribution);
    let sequential_time = start.elapsed();

    let start = Instant::now();
    let parallel = attribute_samples_parallel(&segments, &samples, &projector, &attribution);
    let parallel_time = start.elapsed();

    println!("Sequential: {} rows in {:?}", sequential.len(), sequential_time);
    println!("Parallel:   {} rows in {:?}", parallel.len(), parallel_time);
    println!(
        "Identical output: {}",
        sequential.len() == parallel.len()
            && sequential
                .iter()
                .zip(&parallel)
                .all(|(a, b)| a.segment_id == b.segment_id && a.sample.timestamp == b.sample.timestamp)
    );

    Ok(())
}
