//! Compliance score.

use crate::config::ScoringWeights;

/// Score of a document with no findings.
pub const BASELINE_SCORE: f64 = 100.0;

/// Combine the two branches' score impacts into a 0-100 compliance score.
///
/// `score = clamp(100 - w_rule * rule_impact - w_sem * semantic_impact, 0, 100)`,
/// rounded to two decimals. A degraded branch contributes an impact of zero.
pub fn compliance_score(weights: &ScoringWeights, rule_impact: f64, semantic_impact: f64) -> f64 {
    let deduction =
        weights.rule_engine * finite(rule_impact) + weights.inference * finite(semantic_impact);
    let score = (BASELINE_SCORE - deduction).clamp(0.0, BASELINE_SCORE);
    (score * 100.0).round() / 100.0
}

fn finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
