//! Example of the full pipeline on a synthetic Victoria corridor.
//!
//! Run with: cargo run --example synthetic_corridor

use geo::{coord, LineString};
use transit_speeds::aggregate::{segment_speed_deltas, segment_speeds};
use transit_speeds::attribution::{attribute_samples, AttributionConfig};
use transit_speeds::output::write_geojson;
use transit_speeds::runtimes::{runtime_stats, RuntimeGrouping};
use transit_speeds::segments::{build_from_shapes, RouteShape, SegmentConfig};
use transit_speeds::{
    Crs, GpsSample, LocalClock, OutputAdapter, OutputConfig, PipelineConfig, Projector,
    Reproject,
};

/// Monday 2024-01-15 06:00 in Los Angeles
const MONDAY_0600: i64 = 1_705_327_200;

fn main() -> transit_speeds::Result<()> {
    println!("Synthetic Corridor Example\n");

    let config = PipelineConfig::default();
    let clock = LocalClock::default();
    let to_working = config.ingest_projector()?;
    let to_display = Projector::new(config.working_crs, Crs::Wgs84)?;

    // Route 26 runs 2km east along a straight street from downtown
    let shape_lonlat = LineString::new(vec![
        coord! { x: -123.3656, y: 48.4284 },
        coord! { x: -123.3386, y: 48.4284 },
    ]);
    let shape = RouteShape {
        route_id: "26".to_string(),
        geometry: shape_lonlat.reproject(&to_working),
    };
    let segments = build_from_shapes(&[shape.clone()], &SegmentConfig::default())?;
    println!("Built {} segments\n", segments.len());

    // One trip every 30 minutes from 06:00 to 19:00, slower in the morning peak
    let mut samples = Vec::new();
    for trip in 0..26 {
        let departure = MONDAY_0600 + trip * 1800;
        let hour = 6 + trip / 2;
        let speed = if (8..=10).contains(&hour) { 14.0 } else { 32.0 };
        for step in 0..=20 {
            let along = coord! { x: step as f64 * 100.0, y: 0.0 };
            let start = shape.geometry.0[0];
            let position = to_display.coord(coord! { x: start.x + along.x, y: start.y + 3.0 });
            samples.push(GpsSample::new(
                departure + step * 25,
                "26",
                &format!("26-{trip}"),
                "0",
                speed,
                position.x,
                position.y,
            ));
        }
    }
    println!("Generated {} samples\n", samples.len());

    let rows = attribute_samples(&segments, &samples, &to_working, &AttributionConfig::default());
    let stats = segment_speeds(&rows, &segments, None);
    println!("All-day segment speeds:");
    for s in &stats {
        println!("  segment {:>2}: {:>5.1} km/h over {} samples", s.segment_id, s.mean_speed, s.count);
    }

    println!("\nPeak vs off-peak:");
    for d in segment_speed_deltas(&rows, &segments, &clock) {
        println!(
            "  segment {:>2}: peak {:.1} @ {:02}:00, off-peak {:.1} @ {:02}:00, delta {:.1}",
            d.segment_id, d.peak_speed, d.peak_hour, d.off_peak_speed, d.off_peak_hour, d.speed_delta
        );
    }

    println!("\nRuntime by departure hour:");
    for r in runtime_stats(&samples, &clock, RuntimeGrouping::DepartureHour, &config.runtimes) {
        println!(
            "  route {} hour {:>2}: mean {:.2} min (p5 {:.2}, p95 {:.2}, {} trips)",
            r.route_id, r.key, r.mean, r.p_low, r.p_high, r.trips
        );
    }

    let adapter = OutputAdapter::new(config.working_crs, OutputConfig::default())?;
    let path = std::env::temp_dir().join("synthetic_corridor_speeds.geojson");
    write_geojson(&path, &adapter.segment_speeds(&stats))?;
    println!("\nWrote {}", path.display());

    Ok(())
}
