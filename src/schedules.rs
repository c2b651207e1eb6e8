//! Scheduled runtime and headway per route from static feeds.
//!
//! Each feed contributes one service: the first (by start date) that runs on
//! the configured weekday and covers the configured month. Its trips leaving
//! within the configured hour are averaged per route, giving a comparison
//! series of what the schedule promised across feed versions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Months, NaiveDate, Weekday};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::gtfs::{find_route, read_table, table_path, Route, Trip};

/// Which service and trips of a feed are analysed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Month (1-12) the service must cover. Default: 9
    pub month: u32,
    /// Default: Monday
    pub weekday: Weekday,
    /// Local hour of the first departure of the averaged trips. Default: 7
    pub departure_hour: u32,
    /// Headsign keyword per route. Routes without an entry keep every trip.
    /// Default: `UVic` for 4, 14, 15 and 26, `Downtown` for 50
    pub headsigns: BTreeMap<String, String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let headsigns = [
            ("4", "UVic"),
            ("14", "UVic"),
            ("15", "UVic"),
            ("26", "UVic"),
            ("50", "Downtown"),
        ]
        .into_iter()
        .map(|(route, keyword)| (route.to_string(), keyword.to_string()))
        .collect();
        Self {
            month: 9,
            weekday: Weekday::Mon,
            departure_hour: 7,
            headsigns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CalendarEntry {
    pub service_id: String,
    pub monday: u8,
    pub tuesday: u8,
    pub wednesday: u8,
    pub thursday: u8,
    pub friday: u8,
    pub saturday: u8,
    pub sunday: u8,
    #[serde(deserialize_with = "gtfs_date::deserialize")]
    pub start_date: NaiveDate,
    #[serde(deserialize_with = "gtfs_date::deserialize")]
    pub end_date: NaiveDate,
}

impl CalendarEntry {
    pub fn runs_on(&self, weekday: Weekday) -> bool {
        let flag = match weekday {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        };
        flag == 1
    }

    /// Whether any day of `month` (in any year) falls inside the service dates.
    pub fn covers_month(&self, month: u32) -> bool {
        (self.start_date.year()..=self.end_date.year()).any(|year| {
            let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
                return false;
            };
            let Some(next) = first.checked_add_months(Months::new(1)) else {
                return false;
            };
            first <= self.end_date && next > self.start_date
        })
    }
}

mod gtfs_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDate::parse_from_str(raw.trim(), "%Y%m%d").map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    pub arrival_time: String,
    pub departure_time: String,
}

impl StopTime {
    pub fn new(trip_id: &str, arrival_time: &str, departure_time: &str) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            arrival_time: arrival_time.to_string(),
            departure_time: departure_time.to_string(),
        }
    }
}

/// Seconds after service-day midnight of an `H:MM:SS` schedule time.
///
/// Hours past 23 are valid and mean the trip runs after midnight.
pub fn parse_schedule_time(value: &str) -> Option<u32> {
    let mut parts = value.trim().split(':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes > 59 || seconds > 59 {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// The tables of one feed version needed for schedule analysis.
#[derive(Debug, Clone, Default)]
pub struct ScheduleFeed {
    pub calendar: Vec<CalendarEntry>,
    pub routes: Vec<Route>,
    pub trips: Vec<Trip>,
    pub stop_times: Vec<StopTime>,
}

impl ScheduleFeed {
    /// Load `calendar`, `routes`, `trips` and `stop_times` from an extracted feed.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let feed = Self {
            calendar: read_table(&table_path(dir, "calendar")?)?,
            routes: read_table(&table_path(dir, "routes")?)?,
            trips: read_table(&table_path(dir, "trips")?)?,
            stop_times: read_table(&table_path(dir, "stop_times")?)?,
        };
        info!(
            "[Schedules] Loaded {} services, {} trips, {} stop times from {}",
            feed.calendar.len(),
            feed.trips.len(),
            feed.stop_times.len(),
            dir.display()
        );
        Ok(feed)
    }

    /// First service by start date running on the configured weekday and month.
    pub fn select_service(&self, config: &ScheduleConfig) -> Option<&CalendarEntry> {
        let mut services: Vec<&CalendarEntry> = self
            .calendar
            .iter()
            .filter(|s| s.runs_on(config.weekday) && s.covers_month(config.month))
            .collect();
        services.sort_by_key(|s| s.start_date);
        services.into_iter().next()
    }
}

/// Scheduled mean runtime and headway of one route in one feed version.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledService {
    /// Start date of the selected service
    pub date: NaiveDate,
    pub route_id: String,
    /// Minutes from first to last arrival, averaged over trips
    pub mean_runtime: f64,
    /// Mean minutes between consecutive departures; `None` with a single trip
    pub mean_headway: Option<f64>,
    pub trips: usize,
}

#[derive(Debug, Clone, Copy)]
struct TripTimes {
    first_arrival: u32,
    last_arrival: u32,
    first_departure: u32,
}

fn trip_times(stop_times: &[StopTime]) -> HashMap<&str, TripTimes> {
    let mut by_trip: HashMap<&str, TripTimes> = HashMap::new();
    for stop in stop_times {
        let (Some(arrival), Some(departure)) = (
            parse_schedule_time(&stop.arrival_time),
            parse_schedule_time(&stop.departure_time),
        ) else {
            continue;
        };
        by_trip
            .entry(stop.trip_id.as_str())
            .and_modify(|t| {
                t.first_arrival = t.first_arrival.min(arrival);
                t.last_arrival = t.last_arrival.max(arrival);
                t.first_departure = t.first_departure.min(departure);
            })
            .or_insert(TripTimes {
                first_arrival: arrival,
                last_arrival: arrival,
                first_departure: departure,
            });
    }
    by_trip
}

/// Scheduled runtime and headway of each requested route in one feed.
///
/// Routes that are missing from the feed, or have no trip leaving in the
/// configured hour, are skipped with a warning.
pub fn analyze_feed(
    feed: &ScheduleFeed,
    routes: &[String],
    config: &ScheduleConfig,
) -> Result<Vec<ScheduledService>> {
    let service = feed.select_service(config).ok_or_else(|| {
        PipelineError::NoMatchingService(format!(
            "{} in month {}",
            config.weekday, config.month
        ))
    })?;
    debug!(
        "[Schedules] Using service {} from {}",
        service.service_id, service.start_date
    );

    let times = trip_times(&feed.stop_times);
    let mut rows = Vec::new();

    for key in routes {
        let Some(route) = find_route(&feed.routes, key) else {
            warn!("[Schedules] Route {key} not in feed starting {}", service.start_date);
            continue;
        };
        let keyword = config.headsigns.get(route.display_id());

        let mut departures: Vec<(u32, u32)> = feed
            .trips
            .iter()
            .filter(|t| t.route_id == route.route_id && t.service_id == service.service_id)
            .filter(|t| keyword.map_or(true, |k| t.trip_headsign.contains(k.as_str())))
            .filter_map(|t| times.get(t.trip_id.as_str()))
            .filter(|t| t.first_departure / 3600 == config.departure_hour)
            .map(|t| (t.first_departure, t.last_arrival - t.first_arrival))
            .collect();
        if departures.is_empty() {
            warn!(
                "[Schedules] Route {} has no trips leaving at hour {} on {}",
                route.display_id(),
                config.departure_hour,
                service.start_date
            );
            continue;
        }
        departures.sort_unstable();

        let trips = departures.len();
        let mean_runtime =
            departures.iter().map(|&(_, r)| r as f64).sum::<f64>() / trips as f64 / 60.0;
        let mean_headway = (trips > 1).then(|| {
            let span = departures[trips - 1].0 - departures[0].0;
            span as f64 / (trips - 1) as f64 / 60.0
        });

        rows.push(ScheduledService {
            date: service.start_date,
            route_id: route.display_id().to_string(),
            mean_runtime,
            mean_headway,
            trips,
        });
    }
    Ok(rows)
}

/// [`analyze_feed`] over several feed versions, sorted by route then date.
///
/// A feed whose selected service starts on a date already seen is skipped.
pub fn analyze_feeds(
    dirs: &[PathBuf],
    routes: &[String],
    config: &ScheduleConfig,
) -> Result<Vec<ScheduledService>> {
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for dir in dirs {
        let feed = ScheduleFeed::load_dir(dir)?;
        let Some(service) = feed.select_service(config) else {
            warn!("[Schedules] No matching service in {}", dir.display());
            continue;
        };
        if !seen.insert(service.start_date) {
            debug!("[Schedules] Skipping {}, service date already seen", dir.display());
            continue;
        }
        rows.extend(analyze_feed(&feed, routes, config)?);
    }
    rows.sort_by(|a, b| a.route_id.cmp(&b.route_id).then(a.date.cmp(&b.date)));
    info!(
        "[Schedules] {} route rows from {} feed versions",
        rows.len(),
        seen.len()
    );
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str, weekdays: bool, start: (i32, u32, u32), end: (i32, u32, u32)) -> CalendarEntry {
        let flag = u8::from(weekdays);
        CalendarEntry {
            service_id: id.to_string(),
            monday: flag,
            tuesday: flag,
            wednesday: flag,
            thursday: flag,
            friday: flag,
            saturday: 1 - flag,
            sunday: 1 - flag,
            start_date: NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
            end_date: NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
        }
    }

    fn trip(trip_id: &str, service_id: &str, headsign: &str) -> Trip {
        Trip {
            route_id: "26-VIC".to_string(),
            trip_id: trip_id.to_string(),
            service_id: service_id.to_string(),
            direction_id: None,
            shape_id: None,
            trip_headsign: headsign.to_string(),
        }
    }

    /// First and last stop of a trip.
    fn stops(trip_id: &str, start: &str, end: &str) -> Vec<StopTime> {
        vec![
            StopTime::new(trip_id, start, start),
            StopTime::new(trip_id, end, end),
        ]
    }

    fn feed() -> ScheduleFeed {
        let mut stop_times = Vec::new();
        stop_times.extend(stops("A", "07:00:00", "07:30:00"));
        stop_times.extend(stops("B", "07:15:00", "07:51:00"));
        stop_times.extend(stops("C", "07:30:00", "08:03:00"));
        // wrong direction
        stop_times.extend(stops("D", "07:05:00", "07:45:00"));
        // outside the hour
        stop_times.extend(stops("E", "08:00:00", "08:30:00"));
        // weekend service
        stop_times.extend(stops("F", "07:10:00", "07:20:00"));

        ScheduleFeed {
            calendar: vec![
                service("WKND", false, (2023, 9, 2), (2023, 12, 30)),
                service("FALL", true, (2023, 9, 4), (2023, 12, 22)),
                service("SUMMER", true, (2023, 5, 1), (2023, 8, 31)),
            ],
            routes: vec![Route {
                route_id: "26-VIC".to_string(),
                route_short_name: "26".to_string(),
                route_long_name: "Dockyard / UVic".to_string(),
            }],
            trips: vec![
                trip("A", "FALL", "UVic via McKenzie"),
                trip("B", "FALL", "UVic via McKenzie"),
                trip("C", "FALL", "UVic via McKenzie"),
                trip("D", "FALL", "Dockyard"),
                trip("E", "FALL", "UVic via McKenzie"),
                trip("F", "WKND", "UVic via McKenzie"),
            ],
            stop_times,
        }
    }

    #[test]
    fn test_parse_schedule_time() {
        assert_eq!(parse_schedule_time("07:15:30"), Some(7 * 3600 + 15 * 60 + 30));
        assert_eq!(parse_schedule_time(" 7:00:00"), Some(7 * 3600));
        assert_eq!(parse_schedule_time("25:10:00"), Some(25 * 3600 + 600));
        assert_eq!(parse_schedule_time("07:61:00"), None);
        assert_eq!(parse_schedule_time("07:00"), None);
        assert_eq!(parse_schedule_time(""), None);
    }

    #[test]
    fn test_covers_month() {
        let within = service("S", true, (2021, 9, 15), (2021, 9, 20));
        assert!(within.covers_month(9));
        assert!(!within.covers_month(10));

        let winter = service("W", true, (2020, 10, 1), (2021, 3, 31));
        assert!(!winter.covers_month(9));
        assert!(winter.covers_month(1));

        let year_long = service("Y", true, (2020, 12, 1), (2021, 12, 1));
        assert!(year_long.covers_month(9));

        let ends_on_first = service("E", true, (2022, 6, 1), (2022, 9, 1));
        assert!(ends_on_first.covers_month(9));
    }

    #[test]
    fn test_select_service_prefers_weekday_covering_month() {
        let feed = feed();
        let selected = feed.select_service(&ScheduleConfig::default()).unwrap();
        assert_eq!(selected.service_id, "FALL");

        let saturday = ScheduleConfig {
            weekday: Weekday::Sat,
            ..Default::default()
        };
        assert_eq!(feed.select_service(&saturday).unwrap().service_id, "WKND");

        let june = ScheduleConfig {
            month: 6,
            ..Default::default()
        };
        assert_eq!(feed.select_service(&june).unwrap().service_id, "SUMMER");
    }

    #[test]
    fn test_analyze_feed_means() {
        let rows = analyze_feed(&feed(), &["26".to_string()], &ScheduleConfig::default()).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.date, NaiveDate::from_ymd_opt(2023, 9, 4).unwrap());
        assert_eq!(row.route_id, "26");
        assert_eq!(row.trips, 3);
        // runtimes 30, 36 and 33 minutes; departures 15 minutes apart
        assert!((row.mean_runtime - 33.0).abs() < 1e-9);
        assert!((row.mean_headway.unwrap() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_route_without_headsign_filter_keeps_every_direction() {
        let config = ScheduleConfig {
            headsigns: BTreeMap::new(),
            ..Default::default()
        };
        let rows = analyze_feed(&feed(), &["26".to_string()], &config).unwrap();
        assert_eq!(rows[0].trips, 4);
    }

    #[test]
    fn test_single_trip_has_no_headway() {
        let mut feed = feed();
        feed.trips.retain(|t| t.trip_id == "A");
        let rows = analyze_feed(&feed, &["26".to_string()], &ScheduleConfig::default()).unwrap();
        assert_eq!(rows[0].trips, 1);
        assert_eq!(rows[0].mean_headway, None);
    }

    #[test]
    fn test_unknown_route_is_skipped() {
        let rows = analyze_feed(&feed(), &["99".to_string()], &ScheduleConfig::default()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_no_matching_service_is_error() {
        let config = ScheduleConfig {
            month: 2,
            ..Default::default()
        };
        let err = analyze_feed(&feed(), &["26".to_string()], &config).unwrap_err();
        assert!(matches!(err, PipelineError::NoMatchingService(_)));
    }

    #[test]
    fn test_analyze_feeds_reads_tables_and_dedups_service_dates() {
        let root = std::env::temp_dir().join(format!("transit_speeds_schedules_{}", std::process::id()));
        let write_feed = |name: &str, start: &str| {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("calendar.txt"),
                format!(
                    "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\n\
                     WK,1,1,1,1,1,0,0,{start},20241220\n"
                ),
            )
            .unwrap();
            std::fs::write(
                dir.join("routes.txt"),
                "route_id,route_short_name,route_long_name\n14-VIC,14,Vic General / UVic\n",
            )
            .unwrap();
            std::fs::write(
                dir.join("trips.txt"),
                "route_id,service_id,trip_id,trip_headsign\n\
                 14-VIC,WK,1,UVic\n\
                 14-VIC,WK,2,UVic\n",
            )
            .unwrap();
            std::fs::write(
                dir.join("stop_times.txt"),
                "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
                 1,07:10:00,07:10:00,A,1\n\
                 1,07:50:00,07:50:00,B,2\n\
                 2,07:40:00,07:40:00,A,1\n\
                 2,08:20:00,08:20:00,B,2\n",
            )
            .unwrap();
            dir
        };
        let dirs = vec![
            write_feed("2024b", "20240903"),
            write_feed("2023", "20230905"),
            write_feed("2024a", "20240903"),
        ];

        let rows = analyze_feeds(&dirs, &["14".to_string()], &ScheduleConfig::default()).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2023, 9, 5).unwrap());
        assert_eq!(rows[1].date, NaiveDate::from_ymd_opt(2024, 9, 3).unwrap());
        assert!((rows[0].mean_runtime - 40.0).abs() < 1e-9);
        assert!((rows[0].mean_headway.unwrap() - 30.0).abs() < 1e-9);
    }
}
