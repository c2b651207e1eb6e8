//! HTTP acquisition of road layers and static feeds, with rate limiting.
//!
//! This module provides:
//! - Paginated download of a road network feature service (ArcGIS REST query
//!   API, GeoJSON output), with pages fetched concurrently and reassembled
//!   in offset order
//! - Static GTFS feed download and extraction
//! - Dispatch rate limiting (spaces out request starts)
//! - Automatic retry with exponential backoff on 429 and 5xx
//!
//! Everything the fetcher needs is passed in through [`AcquisitionConfig`];
//! nothing is read from the environment.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use geojson::{Feature, FeatureCollection};
use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{PipelineError, Result};
use crate::layers::{feature_collection, LaneFilter};

/// Upper bound on the expanded size of a downloaded feed.
const MAX_DECOMPRESSED_SIZE: u64 = 1024 * 1024 * 1024;

/// Where and how fast to fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Query endpoint of the road feature layer.
    pub road_query_url: String,
    /// Records per page. Default: 3000
    pub page_size: usize,
    /// Static GTFS zip URL.
    pub gtfs_url: String,
    /// Spacing between request starts. Default: 100ms
    pub dispatch_interval_ms: u64,
    /// Pages in flight at once. Default: 4
    pub max_concurrency: usize,
    /// Default: 3
    pub max_retries: u32,
    /// Per-request timeout. Default: 120s
    pub timeout_secs: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            road_query_url: "https://mapservices.crd.bc.ca/arcgis/rest/services/Roads/MapServer/14/query"
                .to_string(),
            page_size: 3000,
            gtfs_url: "https://bct.tmix.se/Tmix.Cap.TdExport.WebApi/gtfs/?operatorIds=48".to_string(),
            dispatch_interval_ms: 100,
            max_concurrency: 4,
            max_retries: 3,
            timeout_secs: 120,
        }
    }
}

/// Progress callback type, called with (pages done, pages total)
pub type ProgressCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Dispatch rate limiter - spaces out when requests START.
///
/// Each caller reserves the next free slot, `interval` after the previous one,
/// and sleeps until it arrives.
struct DispatchRateLimiter {
    interval: Duration,
    next_dispatch: Mutex<Instant>,
    dispatched_count: AtomicU32,
    consecutive_throttles: AtomicU32,
}

impl DispatchRateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_dispatch: Mutex::new(Instant::now()),
            dispatched_count: AtomicU32::new(0),
            consecutive_throttles: AtomicU32::new(0),
        }
    }

    /// Wait for our dispatch slot. Returns the 1-based dispatch number.
    async fn wait_for_dispatch_slot(&self) -> u32 {
        let (wait_duration, dispatch_num) = {
            let mut next = self.next_dispatch.lock().await;
            let now = Instant::now();
            let dispatch_at = if *next > now { *next } else { now };
            *next = dispatch_at + self.interval;

            let num = self.dispatched_count.fetch_add(1, Ordering::Relaxed) + 1;
            (dispatch_at.saturating_duration_since(now), num)
        };

        // Wait outside the lock
        if wait_duration > Duration::from_millis(5) {
            debug!("[Dispatch #{}] Waiting {:?} for slot", dispatch_num, wait_duration);
            tokio::time::sleep(wait_duration).await;
        }

        dispatch_num
    }

    fn record_success(&self) {
        self.consecutive_throttles.store(0, Ordering::Relaxed);
    }

    /// Exponential backoff: 1s, 2s, 4s max
    fn record_throttle(&self) -> Duration {
        let count = self.consecutive_throttles.fetch_add(1, Ordering::Relaxed) + 1;
        let backoff = Duration::from_millis(500 * (1 << count.min(3)));
        warn!(
            "[DispatchRateLimiter] Throttled, consecutive: {}, backing off {:?}",
            count, backoff
        );
        backoff
    }
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct RoadPage {
    #[serde(default)]
    features: Vec<Feature>,
}

/// Offsets of every page needed to cover `total` records.
fn page_offsets(total: usize, page_size: usize) -> Vec<usize> {
    if page_size == 0 {
        return Vec::new();
    }
    (0..total).step_by(page_size).collect()
}

/// Fetches road layers and static feeds.
pub struct Fetcher {
    client: Client,
    config: AcquisitionConfig,
    rate_limiter: Arc<DispatchRateLimiter>,
}

impl Fetcher {
    pub fn new(config: AcquisitionConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_concurrency.max(1) * 2)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let rate_limiter = Arc::new(DispatchRateLimiter::new(Duration::from_millis(
            config.dispatch_interval_ms,
        )));
        Ok(Self {
            client,
            config,
            rate_limiter,
        })
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// GET with dispatch spacing, retrying throttled, failed and errored
    /// requests up to `max_retries` times.
    async fn get_bytes(&self, url: &str, query: &[(&str, String)]) -> Result<Vec<u8>> {
        let mut retries = 0;
        loop {
            let dispatch_num = self.rate_limiter.wait_for_dispatch_slot().await;
            let req_start = Instant::now();
            let response = self.client.get(url).query(query).send().await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        retries += 1;
                        if retries > self.config.max_retries {
                            return Err(PipelineError::RequestFailed {
                                url: url.to_string(),
                                status: status.as_u16(),
                            });
                        }
                        let wait = self.rate_limiter.record_throttle();
                        warn!(
                            "[Fetch #{}] {} after {:?}, retry {} with {:?} backoff",
                            dispatch_num,
                            status,
                            req_start.elapsed(),
                            retries,
                            wait
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }

                    self.rate_limiter.record_success();
                    if !status.is_success() {
                        return Err(PipelineError::RequestFailed {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    }

                    let bytes = resp.bytes().await?;
                    debug!(
                        "[Fetch #{}] {:.1}KB in {:?}",
                        dispatch_num,
                        bytes.len() as f64 / 1024.0,
                        req_start.elapsed()
                    );
                    return Ok(bytes.to_vec());
                }
                Err(e) => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        return Err(e.into());
                    }
                    let wait = Duration::from_millis(200 * (1 << retries));
                    warn!(
                        "[Fetch #{}] Error: {}, retry {} after {:?}",
                        dispatch_num, e, retries, wait
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Number of road features passing the lane filter on the server.
    pub async fn count_roads(&self, lanes: &LaneFilter) -> Result<usize> {
        let query = [
            ("where", lanes.where_clause()),
            ("returnCountOnly", "true".to_string()),
            ("f", "json".to_string()),
        ];
        let bytes = self.get_bytes(&self.config.road_query_url, &query).await?;
        let count: CountResponse = serde_json::from_slice(&bytes)?;
        Ok(count.count)
    }

    async fn fetch_road_page(&self, lanes: &LaneFilter, offset: usize) -> Result<Vec<Feature>> {
        let query = [
            ("where", lanes.where_clause()),
            ("outFields", "*".to_string()),
            ("outSR", "4326".to_string()),
            ("f", "geojson".to_string()),
            ("resultRecordCount", self.config.page_size.to_string()),
            ("resultOffset", offset.to_string()),
        ];
        let bytes = self.get_bytes(&self.config.road_query_url, &query).await?;
        let page: RoadPage = serde_json::from_slice(&bytes)?;
        Ok(page.features)
    }

    /// Download the whole road layer as one feature collection.
    ///
    /// Pages are requested concurrently (bounded by `max_concurrency`) and
    /// concatenated in offset order, so the result does not depend on timing.
    pub async fn fetch_road_layer(
        &self,
        lanes: &LaneFilter,
        on_progress: Option<ProgressCallback>,
    ) -> Result<FeatureCollection> {
        use futures::stream::{self, StreamExt};

        let start = Instant::now();
        let total = self.count_roads(lanes).await?;
        let offsets = page_offsets(total, self.config.page_size);
        let pages_total = offsets.len() as u32;
        let completed = Arc::new(AtomicU32::new(0));

        info!(
            "[Fetcher] {} road features in {} pages (dispatch interval: {}ms, max concurrent: {})",
            total, pages_total, self.config.dispatch_interval_ms, self.config.max_concurrency
        );

        let pages: Vec<Result<Vec<Feature>>> = stream::iter(offsets)
            .map(|offset| {
                let completed = Arc::clone(&completed);
                let callback = on_progress.clone();
                async move {
                    let page = self.fetch_road_page(lanes, offset).await;
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(ref cb) = callback {
                        cb(done, pages_total);
                    }
                    page
                }
            })
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut features = Vec::with_capacity(total);
        for page in pages {
            features.extend(page?);
        }
        if features.len() != total {
            warn!(
                "[Fetcher] Expected {} road features, received {}",
                total,
                features.len()
            );
        }

        info!(
            "[Fetcher] DONE: {} road features in {:.2}s",
            features.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(feature_collection(features))
    }

    /// Download the static feed and extract it into `dir`.
    pub async fn download_gtfs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let start = Instant::now();
        let bytes = self.get_bytes(&self.config.gtfs_url, &[]).await?;
        info!(
            "[Fetcher] Downloaded feed ({:.1}MB) in {:.2}s",
            bytes.len() as f64 / (1024.0 * 1024.0),
            start.elapsed().as_secs_f64()
        );
        extract_feed(&bytes, dir)
    }
}

/// Extract a zipped feed into `dir`, returning the written paths.
///
/// Entries with unsafe names (absolute or escaping `dir`) are skipped.
pub fn extract_feed(bytes: &[u8], dir: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

    let mut total_uncompressed: u64 = 0;
    for i in 0..archive.len() {
        total_uncompressed += archive.by_index(i)?.size();
    }
    if total_uncompressed > MAX_DECOMPRESSED_SIZE {
        return Err(PipelineError::ArchiveTooLarge {
            size: total_uncompressed,
            limit: MAX_DECOMPRESSED_SIZE,
        });
    }

    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(name) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            warn!("[Fetcher] Skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let target = dir.join(name);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        std::fs::write(&target, contents)?;
        written.push(target);
    }

    info!("[Fetcher] Extracted {} files to {}", written.len(), dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_dispatch_rate_limiter() {
        let limiter = DispatchRateLimiter::new(Duration::from_millis(50));

        // First request should not wait
        let start = Instant::now();
        let num = limiter.wait_for_dispatch_slot().await;
        assert_eq!(num, 1);
        assert!(start.elapsed() < Duration::from_millis(10));

        // Second request should wait ~50ms
        let start2 = Instant::now();
        let num2 = limiter.wait_for_dispatch_slot().await;
        assert_eq!(num2, 2);
        let elapsed = start2.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "Expected ~50ms wait, got {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(100), "Expected ~50ms wait, got {:?}", elapsed);
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let limiter = DispatchRateLimiter::new(Duration::from_millis(50));
        assert_eq!(limiter.record_throttle(), Duration::from_millis(1000));
        assert_eq!(limiter.record_throttle(), Duration::from_millis(2000));
        assert_eq!(limiter.record_throttle(), Duration::from_millis(4000));
        assert_eq!(limiter.record_throttle(), Duration::from_millis(4000));
        limiter.record_success();
        assert_eq!(limiter.record_throttle(), Duration::from_millis(1000));
    }

    #[test]
    fn test_page_offsets() {
        assert_eq!(page_offsets(0, 3000), Vec::<usize>::new());
        assert_eq!(page_offsets(3000, 3000), vec![0]);
        assert_eq!(page_offsets(7001, 3000), vec![0, 3000, 6000]);
    }

    #[test]
    fn test_road_page_parses_arcgis_geojson() {
        let body = r#"{"type": "FeatureCollection", "properties": {"exceededTransferLimit": true},
            "features": [{"type": "Feature", "properties": {"TOTAL_NUMBER_OF_LANES": 2},
            "geometry": {"type": "LineString", "coordinates": [[-123.36, 48.42], [-123.35, 48.43]]}}]}"#;
        let page: RoadPage = serde_json::from_str(body).unwrap();
        assert_eq!(page.features.len(), 1);
    }

    #[test]
    fn test_extract_feed() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("routes.txt", options).unwrap();
            zip.write_all(b"route_id,route_short_name,route_long_name\nR1,26,Dogwood\n")
                .unwrap();
            zip.start_file("shapes.txt", options).unwrap();
            zip.write_all(b"shape_id,shape_pt_lat,shape_pt_lon,shape_pt_sequence\n").unwrap();
            zip.finish().unwrap();
        }

        let dir = std::env::temp_dir().join(format!("transit_speeds_feed_{}", std::process::id()));
        let written = extract_feed(buf.get_ref(), &dir).unwrap();
        assert_eq!(written, vec![dir.join("routes.txt"), dir.join("shapes.txt")]);
        let text = std::fs::read_to_string(dir.join("routes.txt")).unwrap();
        assert!(text.contains("Dogwood"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
