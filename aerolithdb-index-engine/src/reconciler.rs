//! # Reconciler
//!
//! Diffs the recommended [`IndexSet`] against the database's existing
//! indexes and classifies every index into `create`, `drop`, or `keep`,
//! honoring the `auto_` ownership marker. See SPEC_FULL.md §4.5.

use crate::index::{IndexSet, NamedIndex};

/// The three reconciliation buckets for one collection (or the whole
/// recommended set, when namespaces aren't separated by the caller).
#[derive(Debug, Clone, Default)]
pub struct ReconciliationPlan {
    pub create: Vec<NamedIndex>,
    pub drop: Vec<NamedIndex>,
    pub keep: Vec<NamedIndex>,
}

/// Diff `recommended` against `existing`:
/// - `create` = recommended − existing (by canonical sequence equality),
///   excluding the primary-key-only index.
/// - `drop` = (existing − recommended) filtered to `auto_`-prefixed names,
///   excluding the primary-key-only index.
/// - `keep` = intersection, plus (existing − recommended) whose names lack
///   the `auto_` prefix.
pub fn reconcile(recommended: &IndexSet, existing: &IndexSet) -> ReconciliationPlan {
    let mut plan = ReconciliationPlan::default();

    for candidate in recommended.difference(existing) {
        if candidate.index.is_primary_key_only() {
            continue;
        }
        plan.create.push(candidate.clone());
    }

    for candidate in existing.difference(recommended) {
        if candidate.index.is_primary_key_only() {
            continue;
        }
        if candidate.is_auto_owned() {
            plan.drop.push(candidate.clone());
        } else {
            plan.keep.push(candidate.clone());
        }
    }

    for candidate in recommended.intersection(existing) {
        plan.keep.push(candidate.clone());
    }

    plan
}
