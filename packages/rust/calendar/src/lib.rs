//! Publication calendar: which daily packages exist for a year and which of
//! them are already released.
//!
//! The calendar is a CSV whose first two columns are the OJS number and the
//! release date (`day/month/year`). Everything after them is ignored.

use chrono::NaiveDate;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use tedsync_shared::{DownloadConfig, Publication, Result, TedSyncError};

/// User-Agent string for calendar requests.
const USER_AGENT: &str = concat!("tedsync/", env!("CARGO_PKG_VERSION"));

/// Release date format used by the calendar.
const DATE_FORMAT: &str = "%d/%m/%Y";

/// Parse calendar CSV content into publications of `year`.
///
/// The header row is skipped, as are rows with fewer than two columns and
/// rows whose date does not parse (with a warning). Row order is kept.
pub fn parse_calendar(content: &str, year: i32) -> Vec<Publication> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut publications = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "skipping unreadable calendar row");
                continue;
            }
        };
        let (Some(id), Some(date)) = (record.get(0), record.get(1)) else {
            continue;
        };
        match NaiveDate::parse_from_str(date, DATE_FORMAT) {
            Ok(release_date) => publications.push(Publication {
                id: id.to_string(),
                year,
                release_date,
            }),
            Err(_) => warn!(date, "could not parse date"),
        }
    }
    publications
}

/// Publications released on or before `today`, oldest first.
///
/// Ties keep calendar order.
pub fn available_on(publications: &[Publication], today: NaiveDate) -> Vec<Publication> {
    let mut available: Vec<Publication> = publications
        .iter()
        .filter(|p| p.release_date <= today)
        .cloned()
        .collect();
    available.sort_by_key(|p| p.release_date);
    available
}

/// The most recently released publication. On a date tie, the one listed first.
pub fn latest(publications: &[Publication]) -> Option<&Publication> {
    publications
        .iter()
        .rev()
        .max_by_key(|p| p.release_date)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Fetches calendars from `{calendar_url}/{year}`.
#[derive(Debug, Clone)]
pub struct CalendarClient {
    client: Client,
    calendar_url: String,
}

impl CalendarClient {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(std::time::Duration::from_secs(30)))
            .build()
            .map_err(|e| TedSyncError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            calendar_url: config.calendar_url.trim_end_matches('/').to_string(),
        })
    }

    /// Download the raw calendar CSV for `year`.
    pub async fn fetch(&self, year: i32) -> Result<String> {
        let url = format!("{}/{year}", self.calendar_url);
        debug!(%url, "downloading calendar");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TedSyncError::Transport(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TedSyncError::Transport(format!("{url}: HTTP {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| TedSyncError::Transport(format!("{url}: {e}")))
    }

    /// Publications of `year` already released on `today`, oldest first.
    ///
    /// A calendar that cannot be fetched yields an empty list.
    #[instrument(skip(self))]
    pub async fn resolve(&self, year: i32, today: NaiveDate) -> Vec<Publication> {
        let content = match self.fetch(year).await {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, "failed to download calendar");
                return Vec::new();
            }
        };

        let all = parse_calendar(&content, year);
        let available = available_on(&all, today);
        info!(
            listed = all.len(),
            available = available.len(),
            "calendar resolved"
        );
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FIXTURE: &str = include_str!("../../../../fixtures/calendar/2024.csv");

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn config_for(calendar_url: &str) -> DownloadConfig {
        DownloadConfig {
            download_dir: PathBuf::from("downloads"),
            file_extension: ".tar.gz".into(),
            base_url: "https://ted.europa.eu".into(),
            calendar_url: calendar_url.to_string(),
            max_concurrent_years: 1,
            max_concurrent_downloads: 1,
            dispatch_delay: Duration::ZERO,
            timeout: Duration::from_secs(5),
            ledger_path: PathBuf::from("downloads/processed_publications.txt"),
        }
    }

    #[test]
    fn parses_fixture_and_skips_bad_dates() {
        let pubs = parse_calendar(FIXTURE, 2024);
        let ids: Vec<&str> = pubs.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3", "5", "103", "104", "250"]);
        assert_eq!(pubs[2].release_date, date(2024, 1, 4));
        assert!(pubs.iter().all(|p| p.year == 2024));
    }

    #[test]
    fn parse_is_idempotent() {
        assert_eq!(parse_calendar(FIXTURE, 2024), parse_calendar(FIXTURE, 2024));
    }

    #[test]
    fn short_rows_and_header_only() {
        assert!(parse_calendar("OJS,Publication date\n", 2024).is_empty());
        assert!(parse_calendar("", 2024).is_empty());

        let pubs = parse_calendar("OJS,Date\n7\n8, 09/01/2024 ,extra\n", 2024);
        assert_eq!(pubs.len(), 1);
        assert_eq!(pubs[0].id, "8");
        assert_eq!(pubs[0].release_date, date(2024, 1, 9));
    }

    #[test]
    fn never_returns_future_publications() {
        let pubs = parse_calendar(FIXTURE, 2024);
        for today in [date(2023, 12, 31), date(2024, 1, 3), date(2024, 3, 2), date(2025, 1, 1)] {
            let available = available_on(&pubs, today);
            assert!(available.iter().all(|p| p.release_date <= today));
            assert!(available.windows(2).all(|w| w[0].release_date <= w[1].release_date));
        }
        assert!(available_on(&pubs, date(2023, 12, 31)).is_empty());
        assert_eq!(available_on(&pubs, date(2025, 1, 1)).len(), pubs.len());
    }

    #[test]
    fn available_sorts_out_of_order_rows() {
        let pubs = parse_calendar("id,date\n2,03/01/2024\n1,02/01/2024\n", 2024);
        let available = available_on(&pubs, date(2024, 12, 31));
        assert_eq!(available[0].id, "1");
        assert_eq!(available[1].id, "2");
    }

    #[test]
    fn latest_picks_most_recent() {
        let pubs = available_on(&parse_calendar(FIXTURE, 2024), date(2024, 3, 2));
        assert_eq!(latest(&pubs).map(|p| p.id.as_str()), Some("103"));
        assert!(latest(&[]).is_none());

        let tied = parse_calendar("id,date\n10,05/02/2024\n11,05/02/2024\n", 2024);
        assert_eq!(latest(&tied).map(|p| p.id.as_str()), Some("10"));
    }

    #[tokio::test]
    async fn resolve_fetches_year_and_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendar/CSV/2024"))
            .respond_with(ResponseTemplate::new(200).set_body_string("id,date\n103,01/03/2024"))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            CalendarClient::new(&config_for(&format!("{}/calendar/CSV/", server.uri()))).unwrap();
        let pubs = client.resolve(2024, date(2024, 3, 2)).await;
        assert_eq!(
            pubs,
            vec![Publication {
                id: "103".into(),
                year: 2024,
                release_date: date(2024, 3, 1),
            }]
        );
    }

    #[tokio::test]
    async fn resolve_failure_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = CalendarClient::new(&config_for(&server.uri())).unwrap();
        assert!(client.resolve(2024, date(2024, 3, 2)).await.is_empty());
        assert!(matches!(
            client.fetch(2024).await,
            Err(TedSyncError::Transport(_))
        ));
    }
}
