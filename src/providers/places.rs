//! Places provider client: coordinate-nearby search, text search, and photo
//! download by reference.

use super::{retry_after_secs, ProviderError, ProviderResult, RateLimiter};
use crate::models::OpenInterval;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const TIMEOUT: Duration = Duration::from_secs(30);
const NEARBY_RADIUS_M: f64 = 150.0;
const FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,places.types,\
places.primaryType,places.rating,places.userRatingCount,places.nationalPhoneNumber,\
places.websiteUri,places.regularOpeningHours,places.photos";

/// One Places result, normalized to the fields the pipeline consumes.
#[derive(Debug, Clone)]
pub struct PlaceResult {
    pub place_id: String,
    pub display_name: String,
    pub formatted_address: String,
    pub types: Vec<String>,
    pub primary_type: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub opening_hours: Option<HashMap<u8, Vec<OpenInterval>>>,
    pub photo_refs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    places: Vec<PlacePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlacePayload {
    id: Option<String>,
    display_name: Option<TextPayload>,
    formatted_address: Option<String>,
    #[serde(default)]
    types: Vec<String>,
    primary_type: Option<String>,
    rating: Option<f64>,
    user_rating_count: Option<u32>,
    national_phone_number: Option<String>,
    website_uri: Option<String>,
    regular_opening_hours: Option<OpeningHoursPayload>,
    #[serde(default)]
    photos: Vec<PhotoPayload>,
}

#[derive(Debug, Deserialize)]
struct TextPayload {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpeningHoursPayload {
    #[serde(default)]
    periods: Vec<PeriodPayload>,
}

#[derive(Debug, Deserialize)]
struct PeriodPayload {
    open: Option<PointPayload>,
    close: Option<PointPayload>,
}

#[derive(Debug, Deserialize)]
struct PointPayload {
    day: Option<u8>,
    hour: Option<u8>,
    minute: Option<u8>,
}

fn hhmm(point: &PointPayload) -> String {
    format!(
        "{:02}:{:02}",
        point.hour.unwrap_or(0),
        point.minute.unwrap_or(0)
    )
}

impl PlacePayload {
    fn into_result(self) -> Option<PlaceResult> {
        let opening_hours = self.regular_opening_hours.map(|oh| {
            let mut days: HashMap<u8, Vec<OpenInterval>> = HashMap::new();
            for period in oh.periods {
                let (Some(open), Some(close)) = (&period.open, &period.close) else {
                    continue;
                };
                let Some(day) = open.day else { continue };
                days.entry(day).or_default().push(OpenInterval {
                    open: hhmm(open),
                    close: hhmm(close),
                });
            }
            days
        });

        Some(PlaceResult {
            place_id: self.id?,
            display_name: self.display_name.and_then(|d| d.text).unwrap_or_default(),
            formatted_address: self.formatted_address.unwrap_or_default(),
            types: self.types,
            primary_type: self.primary_type,
            rating: self.rating,
            review_count: self.user_rating_count,
            phone: self.national_phone_number,
            website: self.website_uri,
            opening_hours,
            photo_refs: self.photos.into_iter().filter_map(|p| p.name).collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PhotoPayload {
    name: Option<String>,
}

pub struct PlacesClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    limiter: RateLimiter,
}

impl PlacesClient {
    pub fn new(base_url: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(TIMEOUT)
            .user_agent("cadastro-backend/1.0 (places)")
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
            limiter: RateLimiter::new(50, Duration::from_secs(10)),
        })
    }

    fn key(&self) -> ProviderResult<&str> {
        self.api_key
            .as_deref()
            .ok_or(ProviderError::ConfigMissing("PLACES_KEY"))
    }

    async fn search(&self, path: &str, body: serde_json::Value) -> ProviderResult<Vec<PlaceResult>> {
        let key = self.key()?;
        self.limiter.acquire().await;

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .http
            .post(&url)
            .header("X-Goog-Api-Key", key)
            .header("X-Goog-FieldMask", FIELD_MASK)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        if !response.status().is_success() {
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(response.status(), retry));
        }

        let payload: SearchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        Ok(payload
            .places
            .into_iter()
            .filter_map(PlacePayload::into_result)
            .collect())
    }

    /// Direct details lookup when the geocoder already produced a place id.
    pub async fn details(&self, place_id: &str) -> ProviderResult<Option<PlaceResult>> {
        let key = self.key()?;
        self.limiter.acquire().await;

        let url = format!(
            "{}/places/{}",
            self.base_url.trim_end_matches('/'),
            place_id
        );
        let response = self
            .http
            .get(&url)
            .header("X-Goog-Api-Key", key)
            .header("X-Goog-FieldMask", FIELD_MASK.replace("places.", ""))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(response.status(), retry));
        }
        let payload: PlacePayload = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        Ok(payload.into_result())
    }

    /// Coordinate-nearby search around the geocoded point. A place id from
    /// the geocoder short-circuits into a details lookup.
    pub async fn nearby(
        &self,
        place_id: Option<&str>,
        lat: f64,
        lng: f64,
        name_hint: Option<&str>,
    ) -> ProviderResult<Option<PlaceResult>> {
        if let Some(id) = place_id.filter(|id| !id.trim().is_empty()) {
            if let Some(result) = self.details(id).await? {
                return Ok(Some(result));
            }
        }
        let body = json!({
            "maxResultCount": 5,
            "locationRestriction": {
                "circle": {
                    "center": {"latitude": lat, "longitude": lng},
                    "radius": NEARBY_RADIUS_M
                }
            }
        });
        let results = self.search("places:searchNearby", body).await?;
        debug!(count = results.len(), "Places nearby search done");

        // Prefer the result whose name echoes the hint; otherwise the closest
        // (first) one the provider returned.
        if let Some(hint) = name_hint.filter(|h| !h.trim().is_empty()) {
            let hint_canonical = crate::crossval::similarity::canonical(hint);
            if let Some(best) = results.iter().find(|r| {
                crate::crossval::similarity::canonical(&r.display_name) == hint_canonical
            }) {
                return Ok(Some(best.clone()));
            }
        }
        Ok(results.into_iter().next())
    }

    /// Free-text search: "name, address, city, state".
    pub async fn text(&self, query: &str) -> ProviderResult<Option<PlaceResult>> {
        if query.trim().is_empty() {
            return Err(ProviderError::InvalidInput("empty query".to_string()));
        }
        let body = json!({"textQuery": query, "maxResultCount": 3});
        let results = self.search("places:searchText", body).await?;
        debug!(count = results.len(), "Places text search done");
        Ok(results.into_iter().next())
    }

    /// Download photo bytes by provider reference.
    pub async fn fetch_photo(&self, external_ref: &str) -> ProviderResult<Vec<u8>> {
        let key = self.key()?;
        self.limiter.acquire().await;

        let url = format!(
            "{}/{}/media?maxWidthPx=1600&key={}",
            self.base_url.trim_end_matches('/'),
            external_ref.trim_matches('/'),
            key
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        if !response.status().is_success() {
            let retry = retry_after_secs(&response);
            return Err(ProviderError::from_status(response.status(), retry));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(ProviderError::from_reqwest)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_payload_and_hours() {
        let raw = serde_json::json!({
            "places": [{
                "id": "P1",
                "displayName": {"text": "Padaria X"},
                "formattedAddress": "Rua A, 10 - Centro, São Paulo - SP",
                "types": ["bakery", "food"],
                "primaryType": "bakery",
                "rating": 4.5,
                "userRatingCount": 120,
                "nationalPhoneNumber": "(11) 1111-1111",
                "websiteUri": "https://padariax.example",
                "regularOpeningHours": {
                    "periods": [
                        {"open": {"day": 1, "hour": 6, "minute": 0},
                         "close": {"day": 1, "hour": 18, "minute": 30}}
                    ]
                },
                "photos": [{"name": "places/P1/photos/abc"}]
            }]
        });
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        let result = parsed
            .places
            .into_iter()
            .next()
            .unwrap()
            .into_result()
            .unwrap();

        assert_eq!(result.place_id, "P1");
        assert_eq!(result.display_name, "Padaria X");
        assert_eq!(result.rating, Some(4.5));
        assert_eq!(result.review_count, Some(120));
        let monday = &result.opening_hours.unwrap()[&1];
        assert_eq!(monday[0], OpenInterval { open: "06:00".into(), close: "18:30".into() });
        assert_eq!(result.photo_refs, vec!["places/P1/photos/abc"]);
    }

    #[test]
    fn skips_results_without_id() {
        let raw = serde_json::json!({"places": [{"displayName": {"text": "X"}}]});
        let parsed: SearchResponse = serde_json::from_value(raw).unwrap();
        assert!(parsed
            .places
            .into_iter()
            .filter_map(PlacePayload::into_result)
            .next()
            .is_none());
    }
}
