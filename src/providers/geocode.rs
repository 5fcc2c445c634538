//! The two geocoders: a paid structured geocoder and a free OSM-based one.

use super::{retry_after_secs, ProviderError, ProviderResult, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const TIMEOUT: Duration = Duration::from_secs(30);

/// Output of a geocoder call.
#[derive(Debug, Clone)]
pub struct GeocodeHit {
    pub lat: f64,
    pub lng: f64,
    pub formatted_address: Option<String>,
    pub place_hint: Option<String>,
}

// ---------------------------------------------------------------------------
// Geocoder A (paid, structured)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GoogleGeocodeResponse {
    status: Option<String>,
    #[serde(default)]
    results: Vec<GoogleGeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GoogleGeocodeResult {
    formatted_address: Option<String>,
    place_id: Option<String>,
    geometry: GoogleGeometry,
}

#[derive(Debug, Deserialize)]
struct GoogleGeometry {
    location: GoogleLocation,
}

#[derive(Debug, Deserialize)]
struct GoogleLocation {
    lat: f64,
    lng: f64,
}

pub struct GeocoderA {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl GeocoderA {
    pub fn new(base_url: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(TIMEOUT)
            .user_agent("cadastro-backend/1.0 (geocoding)")
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub async fn geocode(
        &self,
        free_text: &str,
        city: Option<&str>,
        state: Option<&str>,
        name_hint: Option<&str>,
    ) -> ProviderResult<Option<GeocodeHit>> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::ConfigMissing("GEOCODER_A_KEY"))?;

        let address = [Some(free_text), city, state]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ");
        if address.is_empty() {
            return Err(ProviderError::InvalidInput("empty address".to_string()));
        }
        // A name hint helps the geocoder snap onto the establishment itself.
        let query = match name_hint {
            Some(hint) if !hint.trim().is_empty() => format!("{}, {}", hint.trim(), address),
            _ => address,
        };

        let response = self
            .http
            .get(&self.base_url)
            .query(&[("address", query.as_str()), ("region", "br"), ("key", key)])
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        if !response.status().is_success() {
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(response.status(), retry));
        }

        let payload: GoogleGeocodeResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        match payload.status.as_deref() {
            Some("OK") | None => {}
            Some("ZERO_RESULTS") => return Ok(None),
            Some("OVER_QUERY_LIMIT") => {
                return Err(ProviderError::RateLimited {
                    retry_after_secs: None,
                })
            }
            Some("REQUEST_DENIED") => return Err(ProviderError::AuthExpired),
            Some(other) => {
                return Err(ProviderError::ParseError(format!(
                    "geocoder status {}",
                    other
                )))
            }
        }

        let hit = payload.results.into_iter().next().map(|r| GeocodeHit {
            lat: r.geometry.location.lat,
            lng: r.geometry.location.lng,
            formatted_address: r.formatted_address,
            place_hint: r.place_id,
        });
        debug!(found = hit.is_some(), "Geocoder A lookup done");
        Ok(hit)
    }
}

// ---------------------------------------------------------------------------
// Geocoder B (free, OSM-based, best effort)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NominatimHit {
    lat: String,
    lon: String,
    display_name: Option<String>,
}

pub struct GeocoderB {
    http: Client,
    base_url: String,
    limiter: RateLimiter,
}

impl GeocoderB {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(TIMEOUT)
            .user_agent("cadastro-backend/1.0 (contact: ops@cadastro.local)")
            .build()?;
        Ok(Self {
            http,
            base_url,
            // Public OSM instances ask for at most one request per second.
            limiter: RateLimiter::new(1, Duration::from_secs(1)),
        })
    }

    pub async fn geocode(
        &self,
        free_text: &str,
        city: &str,
        state: &str,
    ) -> ProviderResult<Option<GeocodeHit>> {
        if free_text.trim().is_empty() && city.trim().is_empty() && state.trim().is_empty() {
            return Err(ProviderError::InvalidInput("empty address".to_string()));
        }
        let query = format!("{}, {}, {}, Brasil", free_text.trim(), city, state);
        self.limiter.acquire().await;

        let response = self
            .http
            .get(&self.base_url)
            .query(&[("q", query.as_str()), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        if !response.status().is_success() {
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(response.status(), retry));
        }

        let hits: Vec<NominatimHit> = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        let hit = hits.into_iter().next().and_then(|h| {
            let lat = h.lat.parse::<f64>().ok()?;
            let lng = h.lon.parse::<f64>().ok()?;
            Some(GeocodeHit {
                lat,
                lng,
                formatted_address: h.display_name,
                place_hint: None,
            })
        });
        debug!(found = hit.is_some(), "Geocoder B lookup done");
        Ok(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_geocoder_payload() {
        let raw = serde_json::json!({
            "status": "OK",
            "results": [{
                "formatted_address": "Rua A, 10 - Centro, São Paulo - SP, 01000-000, Brazil",
                "place_id": "ChIJexample",
                "geometry": {"location": {"lat": -23.55, "lng": -46.63}}
            }]
        });
        let parsed: GoogleGeocodeResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.status.as_deref(), Some("OK"));
        let first = &parsed.results[0];
        assert_eq!(first.geometry.location.lat, -23.55);
        assert_eq!(first.place_id.as_deref(), Some("ChIJexample"));
    }

    #[test]
    fn parses_osm_payload_with_string_coords() {
        let raw = serde_json::json!([
            {"lat": "-23.5505", "lon": "-46.6333", "display_name": "Rua A, São Paulo"}
        ]);
        let hits: Vec<NominatimHit> = serde_json::from_value(raw).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].lat.parse::<f64>().unwrap(), -23.5505);
    }
}
