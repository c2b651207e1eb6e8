//! Error type shared by every pipeline stage.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required input (file, table or layer) is missing.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// A configured route has no entry in the schedule tables.
    #[error("route {route} has no matching route shape")]
    RouteNotFound { route: String },

    /// The configured representative trip index does not exist for a route.
    #[error("route {route} has {available} trips, trip index {index} is out of range")]
    TripIndexOutOfRange {
        route: String,
        index: usize,
        available: usize,
    },

    /// Segment building left nothing for a route; corridor data or trip index is stale.
    #[error("no road segments survived for {0}; check route corridor data and trip index")]
    NoSurvivingSegments(String),

    /// No calendar service in a feed runs on the requested weekday and month.
    #[error("no calendar service matches {0}")]
    NoMatchingService(String),

    /// An input layer parsed fine but holds no usable features.
    #[error("input layer {0} contains no usable features")]
    EmptyLayer(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("unsupported coordinate reference system: {0}")]
    UnsupportedCrs(String),

    /// The projection library rejected a definition or a position.
    #[error("projection failed: {0}")]
    Projection(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[cfg(feature = "http")]
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A downloaded archive would expand past the configured limit.
    #[error("archive expands to {size} bytes, over the {limit} byte limit")]
    ArchiveTooLarge { size: u64, limit: u64 },

    /// A remote service answered with a non-success status after all retries.
    #[error("request to {url} failed with status {status}")]
    RequestFailed { url: String, status: u16 },
}
