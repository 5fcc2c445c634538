//! Sales-potential rubric computed from Places data and photo volume.

use crate::models::{OpenInterval, PotentialCategory, Record, ScoringData};
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::collections::HashMap;

fn minutes(hhmm: &str) -> Option<i32> {
    let (h, m) = hhmm.split_once(':')?;
    Some(h.parse::<i32>().ok()? * 60 + m.parse::<i32>().ok()?)
}

/// Weekly open time in hours and count of open days.
fn weekly_hours(hours: &HashMap<u8, Vec<OpenInterval>>) -> (f64, u32) {
    let mut total_minutes = 0i32;
    let mut open_days = 0u32;
    for intervals in hours.values() {
        let mut day_minutes = 0i32;
        for interval in intervals {
            if let (Some(open), Some(close)) = (minutes(&interval.open), minutes(&interval.close)) {
                let span = if close >= open {
                    close - open
                } else {
                    // Past-midnight closing.
                    24 * 60 - open + close
                };
                day_minutes += span;
            }
        }
        if day_minutes > 0 {
            open_days += 1;
            total_minutes += day_minutes;
        }
    }
    (total_minutes as f64 / 60.0, open_days)
}

fn years_since(date: &str) -> Option<f64> {
    const FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];
    let parsed = FORMATS.iter().find_map(|f| NaiveDate::parse_from_str(date, f).ok())?;
    let days = (Utc::now().date_naive() - parsed).num_days();
    if days <= 0 {
        return None;
    }
    Some(days as f64 / 365.25)
}

fn rating_points(rating: Option<f64>) -> f64 {
    (rating.unwrap_or(0.0) * 3.0).min(15.0)
}

fn review_points(count: u32) -> f64 {
    match count {
        0 => 0.0,
        1..=10 => 3.0,
        11..=50 => 6.0,
        51..=200 => 10.0,
        _ => 14.0,
    }
}

fn photo_points(count: usize) -> f64 {
    match count {
        0 => 0.0,
        1..=3 => 4.0,
        4..=7 => 8.0,
        _ => 10.0,
    }
}

fn density_points(review_count: u32, opening_date: Option<&str>) -> f64 {
    let Some(years) = opening_date.and_then(years_since) else {
        return 0.0;
    };
    let per_year = review_count as f64 / years;
    if per_year >= 20.0 {
        6.0
    } else if per_year >= 5.0 {
        3.0
    } else {
        0.0
    }
}

/// Compute the rubric for a record given the current photo count.
pub fn compute_potential(record: &Record, photo_count: usize) -> ScoringData {
    let rating = rating_points(record.place.rating);
    let reviews = review_points(record.place.review_count.unwrap_or(0));
    let photos = photo_points(photo_count);

    let (hours_score, weekly, days) = match &record.place.opening_hours {
        Some(hours) => {
            let (weekly, days) = weekly_hours(hours);
            ((days as f64 + weekly / 8.0).min(10.0), weekly, days)
        }
        None => (0.0, 0.0, 0),
    };

    let website = if record.place.website.is_some() { 5.0 } else { 0.0 };
    let density = density_points(
        record.place.review_count.unwrap_or(0),
        record
            .registry
            .as_ref()
            .and_then(|r| r.opening_date.as_deref()),
    );

    let total = (rating + reviews + photos + hours_score + website + density)
        .round()
        .clamp(0.0, 70.0) as u8;
    let category = if total >= 50 {
        PotentialCategory::High
    } else if total >= 25 {
        PotentialCategory::Medium
    } else {
        PotentialCategory::Low
    };

    ScoringData {
        potential_score: Some(total),
        potential_category: Some(category),
        breakdown: Some(json!({
            "rating": rating,
            "reviews": reviews,
            "photos": photos,
            "opening_hours": hours_score,
            "weekly_open_hours": weekly,
            "open_days_per_week": days,
            "website": website,
            "review_density": density,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentKind, RawInput, RegistryData};

    fn record() -> Record {
        Record::new(
            "11222333000181".to_string(),
            DocumentKind::Cnpj,
            RawInput::default(),
        )
    }

    fn full_week() -> HashMap<u8, Vec<OpenInterval>> {
        (0..6u8)
            .map(|d| {
                (
                    d,
                    vec![OpenInterval {
                        open: "08:00".to_string(),
                        close: "18:00".to_string(),
                    }],
                )
            })
            .collect()
    }

    #[test]
    fn busy_establishment_scores_high() {
        let mut rec = record();
        rec.place.rating = Some(4.5);
        rec.place.review_count = Some(120);
        rec.place.website = Some("https://x.example".to_string());
        rec.place.opening_hours = Some(full_week());
        rec.registry = Some(RegistryData {
            opening_date: Some("2015-03-01".to_string()),
            ..Default::default()
        });

        let scoring = compute_potential(&rec, 6);
        // rating 13.5, reviews 10, photos 8, hours 10 (capped), website 5,
        // density ~11.6/year -> 3; total 49.5 -> 50.
        assert_eq!(scoring.potential_score, Some(50));
        assert_eq!(scoring.potential_category, Some(PotentialCategory::High));
    }

    #[test]
    fn empty_place_scores_low() {
        let scoring = compute_potential(&record(), 0);
        assert_eq!(scoring.potential_score, Some(0));
        assert_eq!(scoring.potential_category, Some(PotentialCategory::Low));
    }

    #[test]
    fn review_buckets() {
        assert_eq!(review_points(0), 0.0);
        assert_eq!(review_points(5), 3.0);
        assert_eq!(review_points(30), 6.0);
        assert_eq!(review_points(120), 10.0);
        assert_eq!(review_points(500), 14.0);
    }

    #[test]
    fn rating_is_capped() {
        assert_eq!(rating_points(Some(5.0)), 15.0);
        assert_eq!(rating_points(Some(4.0)), 12.0);
        assert_eq!(rating_points(None), 0.0);
    }

    #[test]
    fn overnight_interval_counts_past_midnight() {
        let mut hours = HashMap::new();
        hours.insert(
            5u8,
            vec![OpenInterval {
                open: "22:00".to_string(),
                close: "02:00".to_string(),
            }],
        );
        let (weekly, days) = weekly_hours(&hours);
        assert_eq!(days, 1);
        assert!((weekly - 4.0).abs() < 1e-9);
    }
}
