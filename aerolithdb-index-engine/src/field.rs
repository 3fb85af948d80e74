//! # Field Path Utilities
//!
//! Field paths are plain dotted strings, matching the teacher's own
//! `DocumentFilter::get_nested_field` convention of addressing nested
//! document fields by `&str` rather than a wrapper type. Array positions are
//! canonicalized to a fixed marker segment so that `names.0.first` and
//! `names.1.first` collapse to the same statistics bucket, `names.[].first`.

/// The marker segment substituted for any array index while flattening a
/// document (§4.3) or while deriving array-prefix membership.
pub const ARRAY_MARKER: &str = "[]";

/// The primary-key field name. Profiles whose only referenced field is the
/// primary key are discarded by the decomposer (§4.1), and the primary-key
/// index is never emitted as a create/drop action by the reconciler (§4.5).
pub const PRIMARY_KEY_FIELD: &str = "_id";

pub type FieldPath = String;

/// Join a path prefix (already ending in `.` or empty) with a raw key.
pub fn join(prefix: &str, key: &str) -> FieldPath {
    format!("{prefix}{key}")
}

/// Append the array marker segment to a path, producing the path used to
/// address elements of the array at `path`.
pub fn array_element_path(path: &str) -> FieldPath {
    format!("{path}.{ARRAY_MARKER}")
}

/// Split a dotted path into its segments.
pub fn segments(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Re-key a plain Mongo dot-path into the marked form the sampler stores
/// field statistics under, by splicing [`ARRAY_MARKER`] after every ancestor
/// segment that `known_array_prefixes` reports as array-valued. A query
/// references `names.first`; the sampler, having walked the actual
/// documents, knows the stats for that field live under `names.[].first`.
/// With no known array ancestors this returns `field` unchanged.
pub fn insert_array_markers(field: &str, known_array_prefixes: &std::collections::BTreeSet<String>) -> FieldPath {
    if known_array_prefixes.is_empty() {
        return field.to_string();
    }
    let mut result = String::new();
    for (i, seg) in field.split('.').enumerate() {
        if i > 0 {
            result.push('.');
        }
        result.push_str(seg);
        if known_array_prefixes.contains(&result) {
            result.push('.');
            result.push_str(ARRAY_MARKER);
        }
    }
    result
}

/// Whether `path` is, or lives under, the primary key field.
pub fn is_primary_key_only(fields: &[&str]) -> bool {
    !fields.is_empty() && fields.iter().all(|f| *f == PRIMARY_KEY_FIELD)
}

/// Array-valued ancestors of an already-marked path: every strict prefix
/// ending just before an [`ARRAY_MARKER`] segment. For a doubly-nested path
/// like `"a.[].b.[].c"` this yields `{"a", "a.[].b"}` — note the second
/// ancestor itself contains a marker segment, so matching a raw query path
/// against these via `starts_with` does not work; compare against a
/// `field`'s own marked form (see [`insert_array_markers`]) instead.
pub fn array_ancestors(path: &str) -> std::collections::BTreeSet<FieldPath> {
    let mut ancestors = std::collections::BTreeSet::new();
    let segs: Vec<&str> = path.split('.').collect();
    for (i, seg) in segs.iter().enumerate() {
        if *seg == ARRAY_MARKER {
            ancestors.insert(segs[..i].join("."));
        }
    }
    ancestors
}
