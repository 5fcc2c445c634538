//! Majority-vote reconciliation of photo classifications from independent
//! vision sources.

use crate::models::PhotoCategory;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct PhotoVoteResolution {
    pub category: PhotoCategory,
    pub confidence: u8,
    /// Set when the vote was too split or too thin to trust.
    pub needs_review: bool,
    /// Fewer than two sources were available for cross-validation.
    pub cross_validation_unavailable: bool,
}

/// Baseline confidence of a single vision source (see the trust registry).
const SINGLE_SOURCE_CONFIDENCE: u8 = 75;

/// Majority vote over up to three classifications.
pub fn reconcile_photo_votes(votes: &[PhotoCategory]) -> Option<PhotoVoteResolution> {
    match votes.len() {
        0 => None,
        1 => Some(PhotoVoteResolution {
            category: votes[0],
            confidence: SINGLE_SOURCE_CONFIDENCE,
            needs_review: false,
            cross_validation_unavailable: true,
        }),
        n => {
            let mut tally: HashMap<PhotoCategory, usize> = HashMap::new();
            for vote in votes {
                *tally.entry(*vote).or_insert(0) += 1;
            }
            let (category, count) = tally
                .into_iter()
                .max_by_key(|(_, count)| *count)
                .expect("non-empty tally");

            let (confidence, needs_review) = if count == n && n >= 3 {
                (100, false)
            } else if count >= 2 {
                (85, false)
            } else {
                (60, true)
            };
            Some(PhotoVoteResolution {
                category,
                confidence,
                needs_review,
                cross_validation_unavailable: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PhotoCategory::*;

    #[test]
    fn unanimous_three_way_vote() {
        let res = reconcile_photo_votes(&[Facade, Facade, Facade]).unwrap();
        assert_eq!(res.category, Facade);
        assert_eq!(res.confidence, 100);
        assert!(!res.needs_review);
    }

    #[test]
    fn two_of_three_majority() {
        let res = reconcile_photo_votes(&[Facade, Facade, Interior]).unwrap();
        assert_eq!(res.category, Facade);
        assert_eq!(res.confidence, 85);
        assert!(!res.needs_review);
    }

    #[test]
    fn three_way_split_flags_review() {
        let res = reconcile_photo_votes(&[Facade, Interior, Product]).unwrap();
        assert_eq!(res.confidence, 60);
        assert!(res.needs_review);
    }

    #[test]
    fn single_source_uses_baseline() {
        let res = reconcile_photo_votes(&[Menu]).unwrap();
        assert_eq!(res.category, Menu);
        assert_eq!(res.confidence, SINGLE_SOURCE_CONFIDENCE);
        assert!(res.cross_validation_unavailable);
    }

    #[test]
    fn two_sources_in_agreement() {
        let res = reconcile_photo_votes(&[Product, Product]).unwrap();
        assert_eq!(res.confidence, 85);
        let res = reconcile_photo_votes(&[Product, Menu]).unwrap();
        assert_eq!(res.confidence, 60);
        assert!(res.needs_review);
    }

    #[test]
    fn empty_votes_yield_nothing() {
        assert!(reconcile_photo_votes(&[]).is_none());
    }
}
