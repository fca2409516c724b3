use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::models::driver::GeoPoint;

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Resolves a one-line address. `Ok(None)` means the address is unknown.
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>, AppError>;
}

fn normalize(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Client for a Nominatim-compatible `/search` endpoint. Successful lookups
/// are cached per normalized address.
pub struct HttpGeocoder {
    http: Client,
    base_url: String,
    cache: DashMap<String, GeoPoint>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

impl HttpGeocoder {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>, AppError> {
        let key = normalize(address);
        if key.is_empty() {
            return Ok(None);
        }
        if let Some(point) = self.cache.get(&key) {
            return Ok(Some(*point));
        }

        let res = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&[("q", address), ("format", "json"), ("limit", "1")])
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "geocoding failed: {status} {body}"
            )));
        }

        let hits: Vec<SearchHit> = res.json().await?;
        let Some(hit) = hits.into_iter().next() else {
            debug!(address, "address not found by geocoder");
            return Ok(None);
        };

        let point = match (hit.lat.parse::<f64>(), hit.lon.parse::<f64>()) {
            (Ok(lat), Ok(lng)) => GeoPoint { lat, lng },
            _ => {
                warn!(address, lat = %hit.lat, lon = %hit.lon, "geocoder returned unparsable coordinates");
                return Ok(None);
            }
        };

        if !point.is_valid() {
            return Ok(None);
        }

        self.cache.insert(key, point);
        Ok(Some(point))
    }
}

/// Fixed address table, for seeding and tests.
#[derive(Default)]
pub struct StaticGeocoder {
    entries: DashMap<String, GeoPoint>,
}

impl StaticGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, address: &str, point: GeoPoint) {
        self.entries.insert(normalize(address), point);
    }
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<GeoPoint>, AppError> {
        Ok(self.entries.get(&normalize(address)).map(|entry| *entry))
    }
}
