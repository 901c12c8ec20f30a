//! Merge of issue lists produced independently by the audit branches.
//!
//! # Postconditions
//! - no two issues share a `(section_id, code)` pair
//! - output is ordered by `section_id` ascending, then severity descending,
//!   then source (rule engine first); remaining ties keep input order

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::services::{Issue, SectionId};

/// Whether `candidate` should replace `kept` for the same `(section_id, code)`.
fn preferred(candidate: &Issue, kept: &Issue) -> bool {
    (Reverse(candidate.severity), candidate.source) < (Reverse(kept.severity), kept.source)
}

/// Merge rule-engine and inference findings into one deterministic list.
pub fn aggregate_issues(rule_issues: Vec<Issue>, semantic_issues: Vec<Issue>) -> Vec<Issue> {
    let mut merged: Vec<Issue> = Vec::with_capacity(rule_issues.len() + semantic_issues.len());
    let mut index: HashMap<(SectionId, String), usize> = HashMap::new();

    for issue in rule_issues.into_iter().chain(semantic_issues) {
        let key = (issue.section_id, issue.code.clone());
        match index.get(&key) {
            Some(&slot) => {
                if preferred(&issue, &merged[slot]) {
                    merged[slot] = issue;
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(issue);
            }
        }
    }

    merged.sort_by_key(|issue| (issue.section_id, Reverse(issue.severity), issue.source));
    merged
}
