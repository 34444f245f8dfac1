use log::debug;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::metrics::metrics;

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geocoder returned no usable result")]
    Empty,
}

/// What reverse geocoding contributes to a new place.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlace {
    pub name: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    display_name: Option<String>,
    #[serde(default)]
    address: NominatimAddress,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    hamlet: Option<String>,
    suburb: Option<String>,
    road: Option<String>,
    country: Option<String>,
}

/// Reverse geocoding against a Nominatim-compatible endpoint, behind a
/// single shared rate limiter. The limiter mutex is held across the whole
/// request, so calls are strictly sequential no matter how many photos are
/// being resolved.
#[derive(Debug)]
pub struct Geocoder {
    http: reqwest::Client,
    base_url: String,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl Geocoder {
    pub fn new(base_url: &str, min_interval: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            // Nominatim's usage policy requires an identifying agent.
            .user_agent(concat!("lumapix/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            min_interval,
            last_request: Mutex::new(None),
        })
    }

    pub async fn reverse(&self, lat: f64, lon: f64) -> Result<ResolvedPlace, GeocodeError> {
        let mut last = self.last_request.lock().await;

        // A call inside the rate window is delayed, never dropped.
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());

        metrics().geocoder_requests.inc();

        let url = format!(
            "{}/reverse?format=jsonv2&lat={}&lon={}&zoom=14&addressdetails=1",
            self.base_url, lat, lon
        );
        debug!("Reverse geocoding ({}, {})", lat, lon);

        let response: NominatimResponse = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let addr = response.address;
        let city = addr
            .city
            .or(addr.town)
            .or(addr.village)
            .or(addr.hamlet);
        let name = build_place_name(
            city.as_deref(),
            addr.country.as_deref(),
            addr.suburb.as_deref().or(addr.road.as_deref()),
            response.display_name.as_deref(),
            lat,
            lon,
        );

        Ok(ResolvedPlace {
            name,
            country: addr.country,
            city,
            address: response.display_name,
        })
    }
}

/// Display name for a place, best field first: city, then a named feature,
/// then the head of the full display name, then raw coordinates.
pub fn build_place_name(
    city: Option<&str>,
    country: Option<&str>,
    feature: Option<&str>,
    display_name: Option<&str>,
    lat: f64,
    lon: f64,
) -> String {
    match (city, feature, country) {
        (Some(city), _, Some(country)) => format!("{}, {}", city, country),
        (Some(city), _, None) => city.to_string(),
        (None, Some(feature), Some(country)) => format!("{}, {}", feature, country),
        (None, Some(feature), None) => feature.to_string(),
        (None, None, _) => display_name
            .map(|d| {
                d.split(',')
                    .map(str::trim)
                    .take(2)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{:.4}, {:.4}", lat, lon)),
    }
}
