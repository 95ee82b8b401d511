use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;

use crate::config::NetworkConfig;
use crate::models::{Coordinates, PrayerDate, PrayerTimesResult, PrayerTiming};

/// Remote prayer-time calculation service.
///
/// The service decides what "today" is; callers only supply a position and
/// the calculation parameters.
#[async_trait]
pub trait PrayerTimeSource: Send + Sync {
    async fn fetch_timings(
        &self,
        coordinates: Coordinates,
        method: u8,
        school: u8,
    ) -> Result<PrayerTimesResult>;
}

/// Response envelope from the Aladhan timings endpoint.
#[derive(Debug, Deserialize)]
pub struct TimingsResponse {
    pub code: u16,
    pub status: String,
    pub data: TimingsData,
}

#[derive(Debug, Deserialize)]
pub struct TimingsData {
    pub timings: PrayerTiming,
    pub date: ResponseDate,
    pub meta: ResponseMeta,
}

#[derive(Debug, Deserialize)]
pub struct ResponseDate {
    #[serde(default)]
    pub readable: String,
    pub gregorian: Option<DatePart>,
    pub hijri: Option<HijriPart>,
}

#[derive(Debug, Deserialize)]
pub struct DatePart {
    pub date: String,
}

#[derive(Debug, Deserialize)]
pub struct HijriPart {
    pub date: String,
    pub month: Option<HijriMonth>,
}

#[derive(Debug, Deserialize)]
pub struct HijriMonth {
    pub en: String,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMeta {
    pub timezone: String,
    pub method: Option<MethodInfo>,
}

#[derive(Debug, Deserialize)]
pub struct MethodInfo {
    pub name: String,
}

impl TimingsResponse {
    /// Validate the envelope and convert it into a result.
    pub fn into_result(self) -> Result<PrayerTimesResult> {
        if self.code != 200 {
            anyhow::bail!("Prayer time service returned code {}: {}", self.code, self.status);
        }
        if self.data.meta.timezone.trim().is_empty() {
            anyhow::bail!("Prayer time service response has no timezone");
        }

        let hijri = self.data.date.hijri.map(|h| match h.month {
            Some(month) => format!("{} ({})", h.date, month.en),
            None => h.date,
        });

        Ok(PrayerTimesResult {
            timings: self.data.timings,
            timezone: self.data.meta.timezone,
            date: PrayerDate {
                readable: self.data.date.readable,
                gregorian: self
                    .data
                    .date
                    .gregorian
                    .map(|g| g.date)
                    .unwrap_or_default(),
                hijri,
            },
            method: self.data.meta.method.map(|m| m.name),
        })
    }
}

/// HTTP client for an Aladhan-compatible prayer time service.
#[derive(Clone, Debug)]
pub struct AladhanClient {
    client: reqwest::Client,
    base_url: String,
}

impl AladhanClient {
    /// Create a new API client with configurable timeouts.
    pub fn new(base_url: String, network_config: &NetworkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(network_config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(network_config.connect_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    fn timings_url(&self, coordinates: Coordinates, method: u8, school: u8) -> Result<Url> {
        let endpoint = format!("{}/timings", self.base_url.trim_end_matches('/'));
        Url::parse_with_params(
            &endpoint,
            &[
                ("latitude", coordinates.latitude.to_string()),
                ("longitude", coordinates.longitude.to_string()),
                ("method", method.to_string()),
                ("school", school.to_string()),
            ],
        )
        .with_context(|| format!("Invalid prayer time service URL: {endpoint}"))
    }
}

#[async_trait]
impl PrayerTimeSource for AladhanClient {
    async fn fetch_timings(
        &self,
        coordinates: Coordinates,
        method: u8,
        school: u8,
    ) -> Result<PrayerTimesResult> {
        let url = self.timings_url(coordinates, method, school)?;
        tracing::debug!("Fetching prayer times from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request to prayer time service")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("API returned error status: {}", status);
        }

        let data = response
            .json::<TimingsResponse>()
            .await
            .context("Failed to parse prayer time service response")?;

        data.into_result()
    }
}

#[derive(Debug)]
struct MockSourceState {
    response: Result<PrayerTimesResult, String>,
    calls: Vec<Coordinates>,
}

/// Mock source that returns a canned result and records every call.
#[derive(Debug, Clone)]
pub struct MockPrayerTimeSource {
    state: Arc<Mutex<MockSourceState>>,
}

impl MockPrayerTimeSource {
    pub fn new(response: PrayerTimesResult) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockSourceState {
                response: Ok(response),
                calls: Vec::new(),
            })),
        }
    }

    pub fn set_response(&self, response: PrayerTimesResult) {
        self.state.lock().unwrap().response = Ok(response);
    }

    /// Make every following call fail with `message`.
    pub fn fail_with(&self, message: &str) {
        self.state.lock().unwrap().response = Err(message.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn calls(&self) -> Vec<Coordinates> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl PrayerTimeSource for MockPrayerTimeSource {
    async fn fetch_timings(
        &self,
        coordinates: Coordinates,
        _method: u8,
        _school: u8,
    ) -> Result<PrayerTimesResult> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(coordinates);
        state.response.clone().map_err(|message| anyhow::anyhow!(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_response(code: u16, timezone: &str) -> TimingsResponse {
        let body = format!(
            r#"{{
                "code": {code},
                "status": "OK",
                "data": {{
                    "timings": {{
                        "Fajr": "04:07", "Sunrise": "05:32", "Dhuhr": "11:50",
                        "Asr": "15:14", "Sunset": "18:08", "Maghrib": "18:08",
                        "Isha": "19:24", "Imsak": "03:57", "Midnight": "23:50"
                    }},
                    "date": {{
                        "readable": "15 Jun 2024",
                        "gregorian": {{ "date": "15-06-2024" }},
                        "hijri": {{ "date": "09-12-1445", "month": {{ "en": "Dhū al-Ḥijjah" }} }}
                    }},
                    "meta": {{
                        "timezone": "{timezone}",
                        "method": {{ "id": 4, "name": "Umm Al-Qura University, Makkah" }}
                    }}
                }}
            }}"#
        );
        serde_json::from_str(&body).unwrap()
    }

    // ==================== Response Conversion Tests ====================

    #[test]
    fn test_into_result_maps_all_fields() {
        let result = make_response(200, "Asia/Riyadh").into_result().unwrap();
        assert_eq!(result.timings.fajr, "04:07");
        assert_eq!(result.timings.isha, "19:24");
        assert_eq!(result.timezone, "Asia/Riyadh");
        assert_eq!(result.date.gregorian, "15-06-2024");
        assert_eq!(result.date.hijri.as_deref(), Some("09-12-1445 (Dhū al-Ḥijjah)"));
        assert_eq!(result.method.as_deref(), Some("Umm Al-Qura University, Makkah"));
    }

    #[test]
    fn test_into_result_rejects_error_code() {
        let err = make_response(400, "Asia/Riyadh").into_result().unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn test_into_result_rejects_blank_timezone() {
        assert!(make_response(200, " ").into_result().is_err());
    }

    // ==================== URL Construction Tests ====================

    #[test]
    fn test_timings_url_carries_parameters() {
        let client = AladhanClient::new(
            "https://api.example.com/v1/".to_string(),
            &NetworkConfig::default(),
        )
        .unwrap();
        let url = client
            .timings_url(Coordinates::new(21.5, 39.25), 4, 1)
            .unwrap();

        assert_eq!(url.path(), "/v1/timings");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(query.contains(&("latitude".to_string(), "21.5".to_string())));
        assert!(query.contains(&("longitude".to_string(), "39.25".to_string())));
        assert!(query.contains(&("method".to_string(), "4".to_string())));
        assert!(query.contains(&("school".to_string(), "1".to_string())));
    }

    #[test]
    fn test_api_client_rejects_invalid_base_url() {
        let client = AladhanClient::new("not a url".to_string(), &NetworkConfig::default()).unwrap();
        assert!(client.timings_url(Coordinates::new(0.0, 0.0), 2, 0).is_err());
    }

    // ==================== Mock Source Tests ====================

    #[tokio::test]
    async fn test_mock_source_records_calls_and_fails_on_demand() {
        let canned = make_response(200, "UTC").into_result().unwrap();
        let source = MockPrayerTimeSource::new(canned.clone());

        let coords = Coordinates::new(1.0, 2.0);
        assert_eq!(source.fetch_timings(coords, 2, 0).await.unwrap(), canned);

        source.fail_with("boom");
        let err = source.fetch_timings(coords, 2, 0).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(source.calls(), vec![coords, coords]);
    }
}
