//! Cross-validation of candidate series returned by different providers.
//!
//! Two series agree when the mean relative difference of their closes over
//! shared timestamps stays within `max_deviation`. The candidate with the most
//! agreeing peers wins; values are never averaged across providers.

use std::collections::HashMap;

use crate::{OhlcvPoint, ProviderId, UtcDateTime};

/// Confidence assigned when only one provider answered.
pub const SINGLE_SOURCE_CONFIDENCE: f64 = 0.6;

/// One accepted provider result entering cross-validation.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider: ProviderId,
    /// Position in the configured preference order, lower is preferred.
    pub preference: usize,
    pub reliability: f64,
    pub points: Vec<OhlcvPoint>,
}

/// Outcome of [`cross_validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// Index into the candidate slice of the selected series.
    pub selected: usize,
    pub confidence: f64,
    pub confirmed_by: Vec<ProviderId>,
    pub disputed_by: Vec<ProviderId>,
}

impl ValidationOutcome {
    pub fn has_disagreement(&self) -> bool {
        !self.disputed_by.is_empty()
    }
}

/// Mean relative close deviation over overlapping timestamps, `None` without overlap.
pub fn close_deviation(left: &[OhlcvPoint], right: &[OhlcvPoint]) -> Option<f64> {
    let closes: HashMap<UtcDateTime, f64> =
        right.iter().map(|point| (point.ts, point.close)).collect();

    let mut total = 0.0;
    let mut overlap = 0_usize;
    for point in left {
        let Some(other) = closes.get(&point.ts) else {
            continue;
        };
        let scale = point.close.abs().max(other.abs());
        let deviation = if scale == 0.0 {
            0.0
        } else {
            (point.close - other).abs() / scale
        };
        total += deviation;
        overlap += 1;
    }

    (overlap > 0).then(|| total / overlap as f64)
}

/// Pick the best-supported candidate. Returns `None` for an empty slice.
pub fn cross_validate(candidates: &[Candidate], max_deviation: f64) -> Option<ValidationOutcome> {
    match candidates.len() {
        0 => return None,
        1 => {
            return Some(ValidationOutcome {
                selected: 0,
                confidence: SINGLE_SOURCE_CONFIDENCE,
                confirmed_by: Vec::new(),
                disputed_by: Vec::new(),
            })
        }
        _ => {}
    }

    let n = candidates.len();
    let mut agrees = vec![vec![false; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let agree = close_deviation(&candidates[i].points, &candidates[j].points)
                .is_some_and(|deviation| deviation <= max_deviation);
            agrees[i][j] = agree;
            agrees[j][i] = agree;
        }
    }

    let support = |index: usize| agrees[index].iter().filter(|agree| **agree).count();
    let selected = (0..n)
        .max_by(|&left, &right| {
            support(left)
                .cmp(&support(right))
                .then_with(|| {
                    candidates[left]
                        .reliability
                        .total_cmp(&candidates[right].reliability)
                })
                // Lower preference index wins, so reverse it for max_by.
                .then_with(|| candidates[right].preference.cmp(&candidates[left].preference))
        })
        .unwrap_or(0);

    let mut confirmed_by = Vec::new();
    let mut disputed_by = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        if index == selected {
            continue;
        }
        if agrees[selected][index] {
            confirmed_by.push(candidate.provider.clone());
        } else {
            disputed_by.push(candidate.provider.clone());
        }
    }

    Some(ValidationOutcome {
        selected,
        confidence: (confirmed_by.len() + 1) as f64 / n as f64,
        confirmed_by,
        disputed_by,
    })
}
