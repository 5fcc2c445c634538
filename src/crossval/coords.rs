//! Coordinate cross-validation between the two geocoders, plus bounding-box
//! validation against the declared state and city.

use super::similarity::strip_accents;
use serde::Serialize;

/// Approximate bounding box and capital-centroid per Brazilian state.
struct StateBounds {
    uf: &'static str,
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
    center_lat: f64,
    center_lng: f64,
}

const STATE_BOUNDS: &[StateBounds] = &[
    StateBounds { uf: "AC", min_lat: -11.15, max_lat: -7.11, min_lng: -74.00, max_lng: -66.62, center_lat: -9.97, center_lng: -67.81 },
    StateBounds { uf: "AL", min_lat: -10.50, max_lat: -8.81, min_lng: -38.24, max_lng: -35.15, center_lat: -9.67, center_lng: -35.74 },
    StateBounds { uf: "AP", min_lat: -1.24, max_lat: 4.44, min_lng: -54.88, max_lng: -49.87, center_lat: 0.04, center_lng: -51.07 },
    StateBounds { uf: "AM", min_lat: -9.82, max_lat: 2.25, min_lng: -73.80, max_lng: -56.10, center_lat: -3.12, center_lng: -60.02 },
    StateBounds { uf: "BA", min_lat: -18.35, max_lat: -8.53, min_lng: -46.62, max_lng: -37.34, center_lat: -12.97, center_lng: -38.50 },
    StateBounds { uf: "CE", min_lat: -7.87, max_lat: -2.78, min_lng: -41.42, max_lng: -37.25, center_lat: -3.72, center_lng: -38.54 },
    StateBounds { uf: "DF", min_lat: -16.05, max_lat: -15.50, min_lng: -48.29, max_lng: -47.31, center_lat: -15.79, center_lng: -47.88 },
    StateBounds { uf: "ES", min_lat: -21.30, max_lat: -17.89, min_lng: -41.88, max_lng: -39.66, center_lat: -20.32, center_lng: -40.34 },
    StateBounds { uf: "GO", min_lat: -19.50, max_lat: -12.40, min_lng: -53.25, max_lng: -45.91, center_lat: -16.69, center_lng: -49.26 },
    StateBounds { uf: "MA", min_lat: -10.26, max_lat: -1.04, min_lng: -48.76, max_lng: -41.80, center_lat: -2.53, center_lng: -44.30 },
    StateBounds { uf: "MT", min_lat: -18.04, max_lat: -7.35, min_lng: -61.63, max_lng: -50.22, center_lat: -15.60, center_lng: -56.10 },
    StateBounds { uf: "MS", min_lat: -24.07, max_lat: -17.17, min_lng: -58.17, max_lng: -50.92, center_lat: -20.44, center_lng: -54.65 },
    StateBounds { uf: "MG", min_lat: -22.92, max_lat: -14.23, min_lng: -51.05, max_lng: -39.86, center_lat: -19.92, center_lng: -43.94 },
    StateBounds { uf: "PA", min_lat: -9.84, max_lat: 2.59, min_lng: -58.90, max_lng: -46.06, center_lat: -1.46, center_lng: -48.49 },
    StateBounds { uf: "PB", min_lat: -8.30, max_lat: -6.02, min_lng: -38.77, max_lng: -34.79, center_lat: -7.12, center_lng: -34.86 },
    StateBounds { uf: "PR", min_lat: -26.72, max_lat: -22.52, min_lng: -54.62, max_lng: -48.02, center_lat: -25.43, center_lng: -49.27 },
    StateBounds { uf: "PE", min_lat: -9.48, max_lat: -3.83, min_lng: -41.36, max_lng: -32.39, center_lat: -8.05, center_lng: -34.88 },
    StateBounds { uf: "PI", min_lat: -10.93, max_lat: -2.74, min_lng: -45.99, max_lng: -40.37, center_lat: -5.09, center_lng: -42.80 },
    StateBounds { uf: "RJ", min_lat: -23.37, max_lat: -20.76, min_lng: -44.89, max_lng: -40.96, center_lat: -22.91, center_lng: -43.17 },
    StateBounds { uf: "RN", min_lat: -6.98, max_lat: -4.83, min_lng: -38.58, max_lng: -34.97, center_lat: -5.79, center_lng: -35.21 },
    StateBounds { uf: "RS", min_lat: -33.75, max_lat: -27.08, min_lng: -57.64, max_lng: -49.69, center_lat: -30.03, center_lng: -51.23 },
    StateBounds { uf: "RO", min_lat: -13.69, max_lat: -7.97, min_lng: -66.81, max_lng: -59.77, center_lat: -8.76, center_lng: -63.90 },
    StateBounds { uf: "RR", min_lat: -1.58, max_lat: 5.27, min_lng: -64.82, max_lng: -58.89, center_lat: 2.82, center_lng: -60.67 },
    StateBounds { uf: "SC", min_lat: -29.35, max_lat: -25.96, min_lng: -53.84, max_lng: -48.35, center_lat: -27.60, center_lng: -48.55 },
    StateBounds { uf: "SP", min_lat: -25.31, max_lat: -19.78, min_lng: -53.11, max_lng: -44.16, center_lat: -23.55, center_lng: -46.63 },
    StateBounds { uf: "SE", min_lat: -11.57, max_lat: -9.51, min_lng: -38.24, max_lng: -36.39, center_lat: -10.91, center_lng: -37.07 },
    StateBounds { uf: "TO", min_lat: -13.47, max_lat: -5.17, min_lng: -50.74, max_lng: -45.70, center_lat: -10.25, center_lng: -48.32 },
];

/// City centroids (accentless lowercase key). Capitals plus frequent large
/// municipalities; a point is "within city" under 30 km from the centroid.
const CITY_CENTERS: &[(&str, f64, f64)] = &[
    ("sao paulo", -23.55, -46.63),
    ("rio de janeiro", -22.91, -43.17),
    ("belo horizonte", -19.92, -43.94),
    ("brasilia", -15.79, -47.88),
    ("salvador", -12.97, -38.50),
    ("fortaleza", -3.72, -38.54),
    ("curitiba", -25.43, -49.27),
    ("manaus", -3.12, -60.02),
    ("recife", -8.05, -34.88),
    ("porto alegre", -30.03, -51.23),
    ("belem", -1.46, -48.49),
    ("goiania", -16.69, -49.26),
    ("sao luis", -2.53, -44.30),
    ("maceio", -9.67, -35.74),
    ("natal", -5.79, -35.21),
    ("teresina", -5.09, -42.80),
    ("joao pessoa", -7.12, -34.86),
    ("aracaju", -10.91, -37.07),
    ("cuiaba", -15.60, -56.10),
    ("campo grande", -20.44, -54.65),
    ("florianopolis", -27.60, -48.55),
    ("vitoria", -20.32, -40.34),
    ("macapa", 0.04, -51.07),
    ("rio branco", -9.97, -67.81),
    ("boa vista", 2.82, -60.67),
    ("porto velho", -8.76, -63.90),
    ("palmas", -10.25, -48.32),
    ("campinas", -22.91, -47.06),
    ("guarulhos", -23.46, -46.53),
    ("ribeirao preto", -21.18, -47.81),
    ("uberlandia", -18.92, -48.28),
    ("niteroi", -22.88, -43.10),
];

const WITHIN_CITY_RADIUS_M: f64 = 30_000.0;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

fn bounds_for(uf: &str) -> Option<&'static StateBounds> {
    let uf = uf.trim().to_ascii_uppercase();
    STATE_BOUNDS.iter().find(|b| b.uf == uf)
}

/// Whether a point falls inside the declared state's bounding box.
pub fn point_within_state(lat: f64, lng: f64, uf: &str) -> Option<bool> {
    bounds_for(uf).map(|b| {
        lat >= b.min_lat && lat <= b.max_lat && lng >= b.min_lng && lng <= b.max_lng
    })
}

fn city_center(city: &str) -> Option<(f64, f64)> {
    let key = strip_accents(city).to_lowercase();
    let key = key.split_whitespace().collect::<Vec<_>>().join(" ");
    CITY_CENTERS
        .iter()
        .find(|(name, _, _)| *name == key)
        .map(|(_, lat, lng)| (*lat, *lng))
}

/// Validation of the chosen point against the declared state and city.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GeoValidation {
    pub within_state: Option<bool>,
    pub within_city: Option<bool>,
    pub distance_to_center_m: Option<f64>,
}

pub fn validate_point(lat: f64, lng: f64, state: Option<&str>, city: Option<&str>) -> GeoValidation {
    let within_state = state.and_then(|uf| point_within_state(lat, lng, uf));

    let center = city
        .and_then(city_center)
        .or_else(|| state.and_then(bounds_for).map(|b| (b.center_lat, b.center_lng)));
    let distance_to_center_m = center.map(|(clat, clng)| haversine_m(lat, lng, clat, clng));

    let within_city = city
        .and_then(city_center)
        .map(|(clat, clng)| haversine_m(lat, lng, clat, clng) <= WITHIN_CITY_RADIUS_M);

    GeoValidation {
        within_state,
        within_city,
        distance_to_center_m,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeoSource {
    GeocoderA,
    GeocoderB,
}

impl GeoSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeoSource::GeocoderA => "GEOCODER_A",
            GeoSource::GeocoderB => "GEOCODER_B",
        }
    }
}

/// Outcome of coordinate reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct CoordResolution {
    pub lat: f64,
    pub lng: f64,
    pub source: GeoSource,
    pub confidence: u8,
    pub max_divergence_m: Option<f64>,
    pub divergences: Vec<String>,
}

/// Reconcile the two geocoders by Haversine distance. `state` arbitrates the
/// far-apart case: prefer A only while it stays inside the declared state.
pub fn reconcile_coords(
    a: Option<(f64, f64)>,
    b: Option<(f64, f64)>,
    state: Option<&str>,
) -> Option<CoordResolution> {
    match (a, b) {
        (Some((alat, alng)), Some((blat, blng))) => {
            let d = haversine_m(alat, alng, blat, blng);
            let (point, source, confidence, divergences) = if d <= 50.0 {
                ((alat, alng), GeoSource::GeocoderA, 100, Vec::new())
            } else if d <= 200.0 {
                ((alat, alng), GeoSource::GeocoderA, 90, Vec::new())
            } else if d <= 1000.0 {
                (
                    (alat, alng),
                    GeoSource::GeocoderA,
                    75,
                    vec![format!("geocoders {:.0}m apart", d)],
                )
            } else {
                let a_in_state = state
                    .and_then(|uf| point_within_state(alat, alng, uf))
                    .unwrap_or(true);
                let (point, source) = if a_in_state {
                    ((alat, alng), GeoSource::GeocoderA)
                } else {
                    ((blat, blng), GeoSource::GeocoderB)
                };
                (
                    point,
                    source,
                    60,
                    vec![format!("geocoders disagree by {:.0}m", d)],
                )
            };
            Some(CoordResolution {
                lat: point.0,
                lng: point.1,
                source,
                confidence,
                max_divergence_m: Some(d),
                divergences,
            })
        }
        (Some((lat, lng)), None) => Some(CoordResolution {
            lat,
            lng,
            source: GeoSource::GeocoderA,
            confidence: 90,
            max_divergence_m: None,
            divergences: Vec::new(),
        }),
        (None, Some((lat, lng))) => Some(CoordResolution {
            lat,
            lng,
            source: GeoSource::GeocoderB,
            confidence: 75,
            max_divergence_m: None,
            divergences: Vec::new(),
        }),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_known_distance() {
        // São Paulo to Rio de Janeiro is roughly 360 km.
        let d = haversine_m(-23.55, -46.63, -22.91, -43.17);
        assert!((330_000.0..390_000.0).contains(&d), "got {}", d);
    }

    #[test]
    fn consensus_within_50m() {
        let a = (-23.5500, -46.6300);
        let b = (-23.5502, -46.6301); // ~25 m away
        let res = reconcile_coords(Some(a), Some(b), Some("SP")).unwrap();
        assert_eq!(res.confidence, 100);
        assert_eq!(res.source, GeoSource::GeocoderA);
        assert!(res.max_divergence_m.unwrap() < 50.0);
    }

    #[test]
    fn agreement_within_200m() {
        let a = (-23.5500, -46.6300);
        let b = (-23.5513, -46.6300); // ~140 m
        let res = reconcile_coords(Some(a), Some(b), Some("SP")).unwrap();
        assert_eq!(res.confidence, 90);
    }

    #[test]
    fn weak_agreement_notes_divergence() {
        let a = (-23.5500, -46.6300);
        let b = (-23.5560, -46.6300); // ~670 m
        let res = reconcile_coords(Some(a), Some(b), Some("SP")).unwrap();
        assert_eq!(res.confidence, 75);
        assert!(!res.divergences.is_empty());
    }

    #[test]
    fn disagreement_prefers_in_state_point() {
        // A landed in Rio, B in São Paulo; the declared state is SP.
        let a = (-22.91, -43.17);
        let b = (-23.55, -46.63);
        let res = reconcile_coords(Some(a), Some(b), Some("SP")).unwrap();
        assert_eq!(res.confidence, 60);
        assert_eq!(res.source, GeoSource::GeocoderB);
    }

    #[test]
    fn single_source_baselines() {
        let res = reconcile_coords(Some((-23.55, -46.63)), None, None).unwrap();
        assert_eq!(res.confidence, 90);
        let res = reconcile_coords(None, Some((-23.55, -46.63)), None).unwrap();
        assert_eq!(res.confidence, 75);
        assert!(reconcile_coords(None, None, None).is_none());
    }

    #[test]
    fn state_bounding_box() {
        assert_eq!(point_within_state(-23.55, -46.63, "SP"), Some(true));
        assert_eq!(point_within_state(-22.91, -43.17, "SP"), Some(false));
        assert_eq!(point_within_state(-22.91, -43.17, "RJ"), Some(true));
        assert_eq!(point_within_state(0.0, 0.0, "XX"), None);
    }

    #[test]
    fn city_validation() {
        let v = validate_point(-23.55, -46.63, Some("SP"), Some("São Paulo"));
        assert_eq!(v.within_state, Some(true));
        assert_eq!(v.within_city, Some(true));
        assert!(v.distance_to_center_m.unwrap() < 1000.0);

        let v = validate_point(-22.91, -43.17, Some("SP"), Some("São Paulo"));
        assert_eq!(v.within_state, Some(false));
        assert_eq!(v.within_city, Some(false));
    }
}
