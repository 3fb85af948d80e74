//! # Query Decomposer
//!
//! Walks a MongoDB-style query predicate tree and produces one
//! [`QueryProfile`] per leaf of its `$or`-expansion tree. Mirrors the
//! teacher's `DocumentFilter::matches_filter` operator-dispatch style
//! (`aerolithdb-query/src/processing.rs`), but builds field-reference sets
//! instead of evaluating documents.

use serde_json::Value;

use crate::profile::{QueryProfile, QuerySource};

/// One branch of the predicate tree's disjunctive expansion: the field sets
/// that will become a produced [`QueryProfile`]'s `exact`/`range`.
#[derive(Debug, Clone, Default)]
struct Subprofile {
    exact: Vec<String>,
    range: Vec<String>,
}

fn push_unique(fields: &mut Vec<String>, path: &str) {
    if !fields.iter().any(|existing| existing == path) {
        fields.push(path.to_string());
    }
}

impl Subprofile {
    fn merge(&self, other: &Subprofile) -> Subprofile {
        let mut merged = self.clone();
        for field in &other.exact {
            push_unique(&mut merged.exact, field);
        }
        for field in &other.range {
            push_unique(&mut merged.range, field);
        }
        merged
    }

    fn is_empty_coverage(&self) -> bool {
        self.exact.is_empty() && self.range.is_empty()
    }

    fn only_primary_key(&self) -> bool {
        let fields: Vec<&str> = self
            .exact
            .iter()
            .chain(self.range.iter())
            .map(|s| s.as_str())
            .collect();
        crate::field::is_primary_key_only(&fields)
    }
}

/// Cartesian merge: cross every subprofile in `acc` against every
/// subprofile in `next`, unioning their field sets. This single operation
/// realizes both `$and`'s sequential merge and `$or`'s disjunctive
/// expansion; the caller controls which by what it passes as `next`.
fn cartesian(acc: Vec<Subprofile>, next: Vec<Subprofile>) -> Vec<Subprofile> {
    if next.is_empty() {
        return acc;
    }
    let mut out = Vec::with_capacity(acc.len() * next.len());
    for a in &acc {
        for n in &next {
            out.push(a.merge(n));
        }
    }
    out
}

const RANGE_OPERATORS: &[&str] = &[
    "$lt", "$lte", "$gt", "$gte", "$in", "$nin", "$ne", "$neq", "$exists", "$mod", "$all",
    "$regex", "$size",
];
const IGNORED_OPERATORS: &[&str] = &["$options", "$hint", "$explain", "$text"];

fn is_operator_map(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.keys().any(|k| k.starts_with('$')))
}

fn classify_operator(
    sp: &mut Subprofile,
    path: &str,
    op: &str,
    opval: &Value,
    sources: &mut Vec<QuerySource>,
) {
    match op {
        "$eq" => push_unique(&mut sp.exact, path),
        _ if RANGE_OPERATORS.contains(&op) => push_unique(&mut sp.range, path),
        "$not" => {
            if let Value::Object(inner) = opval {
                for (inner_op, inner_val) in inner {
                    classify_operator(sp, path, inner_op, inner_val, sources);
                }
            } else {
                push_unique(&mut sp.range, path);
            }
        }
        _ if IGNORED_OPERATORS.contains(&op) => {}
        _ => {
            tracing::warn!(operator = %op, path = %path, "unrecognized predicate operator, skipped");
        }
    }
}

fn analyze_field(path: &str, value: &Value, sources: &mut Vec<QuerySource>) -> Vec<Subprofile> {
    if is_operator_map(value) {
        let map = value.as_object().unwrap();
        if let Some(elem) = map.get("$elemMatch") {
            let inner_prefix = format!("{path}.");
            return analyze_object(
                elem.as_object().unwrap_or(&serde_json::Map::new()),
                &inner_prefix,
                sources,
            );
        }
        let mut sp = Subprofile::default();
        for (op, opval) in map {
            classify_operator(&mut sp, path, op, opval, sources);
        }
        vec![sp]
    } else {
        let mut sp = Subprofile::default();
        push_unique(&mut sp.exact, path);
        vec![sp]
    }
}

fn extract_comment(value: &Value, sources: &mut Vec<QuerySource>) {
    if let Value::Object(obj) = value {
        let source = obj.get("source").and_then(Value::as_str);
        let version = obj.get("version").and_then(Value::as_str);
        if let (Some(source), Some(version)) = (source, version) {
            sources.push(QuerySource {
                source: source.to_string(),
                version: version.to_string(),
            });
        }
    }
}

fn analyze_entry(
    key: &str,
    value: &Value,
    prefix: &str,
    sources: &mut Vec<QuerySource>,
) -> Vec<Subprofile> {
    match key {
        "$and" => {
            let mut acc = vec![Subprofile::default()];
            if let Value::Array(operands) = value {
                for operand in operands {
                    let operand_map = operand.as_object().cloned().unwrap_or_default();
                    let contribution = analyze_object(&operand_map, prefix, sources);
                    acc = cartesian(acc, contribution);
                }
            }
            acc
        }
        "$or" => {
            let mut union = Vec::new();
            if let Value::Array(operands) = value {
                for operand in operands {
                    let operand_map = operand.as_object().cloned().unwrap_or_default();
                    union.extend(analyze_object(&operand_map, prefix, sources));
                }
            }
            if union.is_empty() {
                vec![Subprofile::default()]
            } else {
                union
            }
        }
        "$not" => {
            let inner = value.as_object().cloned().unwrap_or_default();
            analyze_object(&inner, prefix, sources)
        }
        "$comment" => {
            extract_comment(value, sources);
            vec![Subprofile::default()]
        }
        _ if IGNORED_OPERATORS.contains(&key) => vec![Subprofile::default()],
        _ if key.starts_with('$') => {
            tracing::warn!(operator = %key, "unrecognized predicate operator, skipped");
            vec![Subprofile::default()]
        }
        _ => analyze_field(&crate::field::join(prefix, key), value, sources),
    }
}

fn analyze_object(
    obj: &serde_json::Map<String, Value>,
    prefix: &str,
    sources: &mut Vec<QuerySource>,
) -> Vec<Subprofile> {
    let mut acc = vec![Subprofile::default()];
    for (key, value) in obj {
        let contribution = analyze_entry(key, value, prefix, sources);
        acc = cartesian(acc, contribution);
    }
    acc
}

fn parse_sort(sort: Option<&Value>) -> Vec<(String, i8)> {
    let Some(Value::Object(obj)) = sort else {
        return Vec::new();
    };
    obj.iter()
        .map(|(field, direction)| {
            let sign = match direction {
                Value::Number(n) => {
                    if n.as_i64().map(|v| v < 0).unwrap_or(false) {
                        -1
                    } else {
                        1
                    }
                }
                Value::String(s) => {
                    if matches!(s.as_str(), "desc" | "descending" | "-1") {
                        -1
                    } else {
                        1
                    }
                }
                _ => 1,
            };
            (field.clone(), sign)
        })
        .collect()
}

/// Decompose one observed query (predicate + optional sort) into one
/// [`QueryProfile`] per leaf of its disjunctive expansion.
pub fn decompose(namespace: &str, query: &Value, sort: Option<&Value>) -> Vec<QueryProfile> {
    let mut sources = Vec::new();
    let root = query.as_object().cloned().unwrap_or_default();
    let subprofiles = analyze_object(&root, "", &mut sources);
    let sort_keys = parse_sort(sort);

    subprofiles
        .into_iter()
        .filter(|sp| !sp.is_empty_coverage() && !sp.only_primary_key())
        .map(|sp| {
            let mut range = sp.range;
            range.retain(|field| !sp.exact.contains(field));
            QueryProfile::new(
                namespace.to_string(),
                sp.exact,
                sort_keys.clone(),
                range,
                sources.clone(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// S1: $or expansion with a shared exact field and a nested conjunct.
    #[test]
    fn or_expansion_scenario() {
        let query = json!({
            "name": "brad",
            "$or": [
                {"email": {"$exists": true}},
                {"status": "registered", "email": "x"}
            ]
        });
        let sort = json!({"birthday": -1});
        let profiles = decompose("db.users", &query, Some(&sort));

        assert_eq!(profiles.len(), 2);
        for profile in &profiles {
            assert_eq!(profile.sort, vec![("birthday".to_string(), -1)]);
            assert!(profile.exact.contains(&"name".to_string()));
            assert!(profile.range.contains(&"email".to_string()) || profile.exact.contains(&"email".to_string()));
        }
        let first = profiles
            .iter()
            .find(|p| p.exact.len() == 1)
            .expect("one profile has only name in exact");
        assert!(first.range.contains(&"email".to_string()));

        let second = profiles
            .iter()
            .find(|p| p.exact.len() == 2)
            .expect("one profile adds status to exact");
        assert!(second.exact.contains(&"status".to_string()));
        assert!(second.exact.contains(&"email".to_string()));
    }

    #[test]
    fn decomposition_completeness_matches_or_leaf_count() {
        let query = json!({
            "$or": [
                {"a": 1},
                {"b": 2},
                {"$or": [{"c": 3}, {"d": 4}]}
            ]
        });
        let profiles = decompose("db.c", &query, None);
        assert_eq!(profiles.len(), 4);
    }

    #[test]
    fn empty_coverage_and_primary_key_only_are_discarded() {
        let query = json!({"$comment": {"source": "svc", "version": "1"}});
        let profiles = decompose("db.c", &query, None);
        assert!(profiles.is_empty());

        let pk_only = json!({"_id": "abc"});
        let profiles = decompose("db.c", &pk_only, None);
        assert!(profiles.is_empty());
    }

    #[test]
    fn elem_match_joins_under_field_path() {
        let query = json!({
            "tags": {"$elemMatch": {"name": "x", "score": {"$gt": 1}}}
        });
        let profiles = decompose("db.c", &query, None);
        assert_eq!(profiles.len(), 1);
        assert!(profiles[0].exact.contains(&"tags.name".to_string()));
        assert!(profiles[0].range.contains(&"tags.score".to_string()));
    }

    #[test]
    fn comment_metadata_propagates_to_every_profile() {
        let query = json!({
            "$comment": {"source": "billing-service", "version": "3"},
            "$or": [{"a": 1}, {"b": 2}]
        });
        let profiles = decompose("db.c", &query, None);
        assert_eq!(profiles.len(), 2);
        for profile in &profiles {
            assert_eq!(profile.sources.len(), 1);
            assert_eq!(profile.sources[0].source, "billing-service");
        }
    }

    #[test]
    fn unrecognized_operator_is_skipped_not_fatal() {
        // The unknown operator contributes no field reference, and alongside
        // a recognized field the query still decomposes normally instead of
        // aborting.
        let query = json!({"x": {"$weirdOp": 1}, "y": 5});
        let profiles = decompose("db.c", &query, None);
        assert_eq!(profiles.len(), 1);
        assert!(!profiles[0].exact.contains(&"x".to_string()));
        assert!(profiles[0].exact.contains(&"y".to_string()));
    }

    // Property: decomposition completeness (invariant 1) under randomly
    // generated `$or`-nesting trees. A node is either a single-field leaf or
    // an `$or` branching over 1-3 sub-nodes; the expected profile count is
    // the tree's total leaf count regardless of nesting depth.
    #[derive(Debug, Clone)]
    enum OrTreeNode {
        Leaf(String),
        Or(Vec<OrTreeNode>),
    }

    fn or_tree_leaf_count(node: &OrTreeNode) -> usize {
        match node {
            OrTreeNode::Leaf(_) => 1,
            OrTreeNode::Or(children) => children.iter().map(or_tree_leaf_count).sum(),
        }
    }

    fn or_tree_to_json(node: &OrTreeNode) -> Value {
        match node {
            OrTreeNode::Leaf(field) => json!({ field: 1 }),
            OrTreeNode::Or(children) => {
                json!({ "$or": children.iter().map(or_tree_to_json).collect::<Vec<_>>() })
            }
        }
    }

    fn or_tree_strategy() -> impl Strategy<Value = OrTreeNode> {
        let leaf = (1u32..1000).prop_map(|n| OrTreeNode::Leaf(format!("field_{n}")));
        leaf.prop_recursive(3, 16, 4, |inner| {
            prop::collection::vec(inner, 1..4).prop_map(OrTreeNode::Or)
        })
    }

    proptest! {
        #[test]
        fn decomposition_completeness_under_random_or_trees(node in or_tree_strategy()) {
            let query = or_tree_to_json(&node);
            let profiles = decompose("db.c", &query, None);
            prop_assert_eq!(profiles.len(), or_tree_leaf_count(&node));
        }
    }
}
