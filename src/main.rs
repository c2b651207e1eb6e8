//! `transit-speeds` command line tool.
//!
//! Each subcommand runs the stages it needs (segment building, attribution,
//! aggregation) from a YAML pipeline configuration and writes one output file.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use transit_speeds::aggregate::{
    corridor_speeds, route_speeds, segment_hourly_speeds, segment_speed_deltas, segment_speeds,
    TimeFilter,
};
use transit_speeds::attribution::{ensure_routes_attributed, AttributedSample};
use transit_speeds::gtfs::{select_route_shapes, GtfsTables};
use transit_speeds::layers::{read_named_corridors, read_road_layer, read_route_corridors};
use transit_speeds::output::{write_csv, write_geojson, OutputAdapter};
use transit_speeds::runtimes::{runtime_stats, RuntimeGrouping};
use transit_speeds::schedules::analyze_feeds;
use transit_speeds::segments::{build_from_road_network, build_from_shapes};
use transit_speeds::timeline::{screen_samples, summarize, CsvTimeline, LocalClock};
use transit_speeds::{GpsSample, PipelineConfig, RoadSegment, TimelineStore};

#[derive(Parser)]
#[command(name = "transit-speeds")]
#[command(about = "Road-segment speeds and trip runtimes from transit GPS timelines", long_about = None)]
struct Cli {
    /// Pipeline configuration (YAML); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Timeline CSV, overriding the configured path
    #[arg(long, global = true)]
    timeline: Option<PathBuf>,

    /// Output directory, overriding the configured path
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum GroupBy {
    Hour,
    Date,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the road segment set and write it as lines
    Segments,
    /// Mean speed per segment over the whole timeline
    SystemMap,
    /// Mean speed per segment within the peak window
    PeakMap,
    /// Mean speed per segment and local hour
    HourlyMap,
    /// Peak vs off-peak speed difference per segment
    SpeedDelta,
    /// Peak-window mean speed per route, slowest first
    RouteSpeeds,
    /// Mean speed along named corridors
    Corridors,
    /// Trip runtime distribution per route
    Runtimes {
        /// Group trips by departure hour or by service date
        #[arg(long, value_enum, default_value_t = GroupBy::Hour)]
        by: GroupBy,
    },
    /// Scheduled runtime and headway per route across historical feeds
    Schedules,
    /// Sample count and time span of the timeline
    Summary,
    /// Download the road network layer
    #[cfg(feature = "http")]
    FetchRoads {
        /// GeoJSON file to write
        #[arg(long, default_value = "data/roads.geojson")]
        out: PathBuf,
    },
    /// Download and extract the static GTFS feed into the configured directory
    #[cfg(feature = "http")]
    FetchGtfs,
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(timeline) = &cli.timeline {
        config.paths.timeline = timeline.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.paths.output_dir = dir.clone();
    }
    Ok(config)
}

fn load_samples(config: &PipelineConfig) -> Result<Vec<GpsSample>> {
    let store = CsvTimeline::new(&config.paths.timeline);
    let samples = store
        .load()
        .with_context(|| format!("reading timeline {}", config.paths.timeline.display()))?;
    Ok(screen_samples(samples, &config.bounds).kept)
}

/// Road-network filtering when a road layer is configured, route shapes otherwise.
fn build_segments(config: &PipelineConfig) -> Result<Vec<RoadSegment>> {
    let projector = config.ingest_projector()?;
    let segments = match (&config.paths.road_layer, &config.paths.route_corridors) {
        (Some(roads), Some(corridors)) => {
            let lines = read_road_layer(roads, &config.lanes, &projector)
                .with_context(|| format!("reading road layer {}", roads.display()))?;
            let corridors = read_route_corridors(
                corridors,
                &config.paths.corridor_route_property,
                &projector,
            )
            .with_context(|| format!("reading route corridors {}", corridors.display()))?;
            build_from_road_network(&lines, &corridors, &config.route_ids(), &config.segments)?
        }
        (Some(_), None) => bail!("a road layer needs route corridors to filter against"),
        _ => {
            if config.routes.is_empty() {
                bail!("no routes configured; add a `routes` list to the config");
            }
            let tables = GtfsTables::load_dir(&config.paths.gtfs_dir)
                .with_context(|| format!("reading GTFS tables in {}", config.paths.gtfs_dir.display()))?;
            let shapes = select_route_shapes(&tables, &config.routes, &projector)?;
            build_from_shapes(&shapes, &config.segments)?
        }
    };
    info!("Built {} segments", segments.len());
    Ok(segments)
}

fn attribute<'a>(
    config: &PipelineConfig,
    segments: &[RoadSegment],
    samples: &'a [GpsSample],
) -> Result<Vec<AttributedSample<'a>>> {
    let projector = config.ingest_projector()?;

    #[cfg(feature = "parallel")]
    let rows = transit_speeds::attribution::attribute_samples_parallel(
        segments,
        samples,
        &projector,
        &config.attribution,
    );
    #[cfg(not(feature = "parallel"))]
    let rows = transit_speeds::attribution::attribute_samples(
        segments,
        samples,
        &projector,
        &config.attribution,
    );

    ensure_routes_attributed(&rows, &config.route_ids())?;
    Ok(rows)
}

fn clock(config: &PipelineConfig) -> Result<LocalClock> {
    config
        .clock()
        .with_context(|| format!("timezone {}", config.timezone))
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let adapter = OutputAdapter::new(config.working_crs, config.output.clone())?;

    match cli.command {
        Commands::Segments => {
            let segments = build_segments(&config)?;
            write_geojson(&config.output_path("segments.geojson"), &adapter.segments(&segments))?;
        }
        Commands::SystemMap => {
            let segments = build_segments(&config)?;
            let samples = load_samples(&config)?;
            let rows = attribute(&config, &segments, &samples)?;
            let stats = segment_speeds(&rows, &segments, None);
            write_geojson(&config.output_path("system_map.geojson"), &adapter.segment_speeds(&stats))?;
        }
        Commands::PeakMap => {
            let clock = clock(&config)?;
            let segments = build_segments(&config)?;
            let samples = load_samples(&config)?;
            let rows = attribute(&config, &segments, &samples)?;
            let filter = TimeFilter {
                clock: &clock,
                window: config.peak,
            };
            let stats = segment_speeds(&rows, &segments, Some(&filter));
            write_geojson(&config.output_path("peak_map.geojson"), &adapter.segment_speeds(&stats))?;
        }
        Commands::HourlyMap => {
            let clock = clock(&config)?;
            let segments = build_segments(&config)?;
            let samples = load_samples(&config)?;
            let rows = attribute(&config, &segments, &samples)?;
            let stats = segment_hourly_speeds(&rows, &segments, &clock);
            write_geojson(&config.output_path("hourly_map.geojson"), &adapter.hourly_speeds(&stats))?;
        }
        Commands::SpeedDelta => {
            let clock = clock(&config)?;
            let segments = build_segments(&config)?;
            let samples = load_samples(&config)?;
            let rows = attribute(&config, &segments, &samples)?;
            let deltas = segment_speed_deltas(&rows, &segments, &clock);
            write_geojson(&config.output_path("speed_delta.geojson"), &adapter.speed_deltas(&deltas))?;
        }
        Commands::RouteSpeeds => {
            let clock = clock(&config)?;
            let samples = load_samples(&config)?;
            let speeds = route_speeds(&samples, &clock, &config.peak, &config.tiers);
            write_csv(&config.output_path("route_speeds.csv"), &adapter.route_speed_rows(&speeds))?;
        }
        Commands::Corridors => {
            let Some(path) = &config.paths.named_corridors else {
                bail!("no named corridor layer configured (paths.named_corridors)");
            };
            let projector = config.ingest_projector()?;
            let corridors = read_named_corridors(path, &projector)
                .with_context(|| format!("reading corridors {}", path.display()))?;
            let samples = load_samples(&config)?;
            let speeds = corridor_speeds(&corridors, &samples, &projector, config.corridor_radius);
            write_geojson(&config.output_path("corridors.geojson"), &adapter.corridor_speeds(&speeds))?;
        }
        Commands::Runtimes { by } => {
            let clock = clock(&config)?;
            let samples = load_samples(&config)?;
            let (grouping, file) = match by {
                GroupBy::Hour => (RuntimeGrouping::DepartureHour, "runtimes_by_hour.csv"),
                GroupBy::Date => (RuntimeGrouping::Date, "runtimes_by_date.csv"),
            };
            let stats = runtime_stats(&samples, &clock, grouping, &config.runtimes);
            write_csv(&config.output_path(file), &adapter.runtime_rows(&stats))?;
        }
        Commands::Schedules => {
            if config.paths.historical_feeds.is_empty() {
                bail!("no historical feeds configured (paths.historical_feeds)");
            }
            let mut routes = config.route_ids();
            if routes.is_empty() {
                routes = config.schedules.headsigns.keys().cloned().collect();
            }
            let services = analyze_feeds(&config.paths.historical_feeds, &routes, &config.schedules)?;
            write_csv(&config.output_path("scheduled_runtimes.csv"), &adapter.schedule_rows(&services))?;
        }
        Commands::Summary => {
            let clock = clock(&config)?;
            let samples = load_samples(&config)?;
            match summarize(&samples, &clock) {
                Some(summary) => println!(
                    "{} samples from {} to {}",
                    summary.count, summary.first, summary.last
                ),
                None => println!("timeline is empty"),
            }
        }
        #[cfg(feature = "http")]
        Commands::FetchRoads { out } => {
            let fetcher = transit_speeds::http::Fetcher::new(Default::default())?;
            let roads = fetcher.fetch_road_layer(&config.lanes, None).await?;
            write_geojson(&out, &roads)?;
        }
        #[cfg(feature = "http")]
        Commands::FetchGtfs => {
            let fetcher = transit_speeds::http::Fetcher::new(Default::default())?;
            let files = fetcher.download_gtfs(&config.paths.gtfs_dir).await?;
            info!("Extracted {} feed files", files.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    run(Cli::parse()).await
}
