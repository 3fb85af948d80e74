//! # QuerySet: Deduplication, Reduction, and Extension
//!
//! The [`QuerySet`] owns every observed [`QueryProfile`] and drives the
//! iterative core of the recommendation engine: prefix absorption
//! (`reduce_indexes`), field-reduction by sampling (`simplify`), and
//! index extension (`extend`). See SPEC_FULL.md §4.4 and §9.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::index::{CompoundIndex, Direction, IndexCanonicalizer, IndexKey, IndexSet, NamedIndex};
use crate::profile::QueryProfile;
use crate::stats::{CollectionStatistics, IndexStatistics};

/// One tracked query profile plus its current candidate index set.
#[derive(Debug, Clone)]
pub struct ProfileEntry {
    pub profile: QueryProfile,
    pub candidates: Vec<Arc<CompoundIndex>>,
}

/// The deduplicated set of observed query profiles, plus the reduction
/// machinery that turns their candidate indexes into a minimal covering set.
#[derive(Debug, Default)]
pub struct QuerySet {
    entries: Vec<ProfileEntry>,
    hashed: IndexSet,
    canonicalizer: IndexCanonicalizer,
}

fn push_if_absent(v: &mut Vec<Arc<CompoundIndex>>, item: Arc<CompoundIndex>) {
    if !v.iter().any(|existing| Arc::ptr_eq(existing, &item)) {
        v.push(item);
    }
}

impl QuerySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ProfileEntry] {
        &self.entries
    }

    /// Record an observed query profile: merge into an equivalent existing
    /// profile, or insert a new entry. Returns the entry's index.
    pub fn observe(&mut self, profile: QueryProfile) -> usize {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|entry| entry.profile.is_equivalent(&profile))
        {
            self.entries[pos].profile.merge_observation(&profile);
            return pos;
        }
        self.entries.push(ProfileEntry {
            profile,
            candidates: Vec::new(),
        });
        self.entries.len() - 1
    }

    /// Remove profiles whose `last_query_time` is older than
    /// `recent_queries_only_days` (when that option is enabled).
    pub fn expire_stale(&mut self, now: DateTime<Utc>, cutoff: Option<chrono::Duration>) {
        self.entries.retain(|entry| !entry.profile.is_stale(now, cutoff));
    }

    /// Recompute every profile's candidate indexes from fresh collection
    /// statistics (§4.2), and accumulate the hashed single-field indexes
    /// each profile also produces. Profiles below `minimum_query_count` are
    /// still retained (so they keep accumulating usage) but contribute no
    /// candidates to this cycle's recommendation.
    pub fn compute_candidates(
        &mut self,
        stats_for: impl Fn(&str) -> Option<CollectionStatistics>,
        config: &EngineConfig,
        mut on_missing_field: impl FnMut(&str, &str),
    ) {
        self.canonicalizer.clear();
        for entry in &mut self.entries {
            if entry.profile.usage_count < config.minimum_query_count {
                entry.candidates.clear();
                continue;
            }
            let Some(stats) = stats_for(&entry.profile.namespace) else {
                entry.candidates.clear();
                continue;
            };
            let namespace = entry.profile.namespace.clone();
            let optimized = entry.profile.optimized_indexes(
                &stats,
                config.minimum_cardinality,
                |field| on_missing_field(&namespace, field),
            );
            entry.candidates = optimized
                .compounds
                .into_iter()
                .map(|index| self.canonicalizer.canonicalize(index))
                .collect();
            for hashed in optimized.hashed {
                self.hashed.insert(NamedIndex::recommended(hashed));
            }
        }
    }

    /// Prefix absorption to a fixed point (§4.4 `reduceIndexes`):
    /// - no candidate is an index-prefix of another candidate anywhere
    /// - identical candidates across profiles share a single object
    ///
    /// Returns whether anything changed.
    pub fn reduce_indexes(&mut self) -> bool {
        let mut changed_any = false;
        loop {
            let all: Vec<Arc<CompoundIndex>> = self
                .entries
                .iter()
                .flat_map(|entry| entry.candidates.iter().cloned())
                .collect();

            let mut changed_this_pass = false;
            for entry in &mut self.entries {
                let mut new_candidates: Vec<Arc<CompoundIndex>> = Vec::new();
                for candidate in entry.candidates.clone() {
                    let supers: Vec<Arc<CompoundIndex>> = all
                        .iter()
                        .filter(|other| !Arc::ptr_eq(other, &candidate) && candidate.is_prefix_of(other))
                        .cloned()
                        .collect();
                    if !supers.is_empty() {
                        changed_this_pass = true;
                        for sup in supers {
                            push_if_absent(&mut new_candidates, sup);
                        }
                    } else {
                        let canonical = self.canonicalizer.canonicalize((*candidate).clone());
                        if !Arc::ptr_eq(&canonical, &candidate) {
                            changed_this_pass = true;
                        }
                        push_if_absent(&mut new_candidates, canonical);
                    }
                }
                entry.candidates = new_candidates;
            }

            if changed_this_pass {
                changed_any = true;
            } else {
                break;
            }
        }
        changed_any
    }

    /// The index-ID → serving-profiles relation, rebuilt fresh from the
    /// current candidate sets (§9: never stored as owning back-pointers).
    pub fn served_by(&self) -> HashMap<String, Vec<usize>> {
        let mut relation: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, entry) in self.entries.iter().enumerate() {
            for candidate in &entry.candidates {
                relation
                    .entry(candidate.canonical_name())
                    .or_default()
                    .push(i);
            }
        }
        relation
    }

    fn unique_candidates(&self) -> Vec<Arc<CompoundIndex>> {
        let mut unique = Vec::new();
        for entry in &self.entries {
            for candidate in &entry.candidates {
                push_if_absent(&mut unique, candidate.clone());
            }
        }
        unique
    }

    fn replace_candidates(&mut self, replacements: &[(Arc<CompoundIndex>, Arc<CompoundIndex>)]) {
        for entry in &mut self.entries {
            for candidate in entry.candidates.iter_mut() {
                if let Some((_, replacement)) = replacements
                    .iter()
                    .find(|(old, _)| Arc::ptr_eq(old, candidate))
                {
                    *candidate = replacement.clone();
                }
            }
        }
    }

    /// Field-reduction by sampling (§4.4 `simplify`): repeatedly fetch index
    /// statistics, remove at most one non-selective, non-sort field per
    /// index per pass, then re-run `reduce_indexes`, until a full pass
    /// removes nothing.
    pub fn simplify(
        &mut self,
        mut index_stats_for: impl FnMut(&CompoundIndex) -> IndexStatistics,
        minimum_reduction: f64,
    ) -> bool {
        let mut changed_overall = false;
        loop {
            let served_by = self.served_by();
            let unique = self.unique_candidates();
            let mut replacements = Vec::new();

            for candidate in &unique {
                if candidate.keys.len() <= 1 {
                    continue;
                }
                let serving = served_by
                    .get(&candidate.canonical_name())
                    .cloned()
                    .unwrap_or_default();
                let sort_immune: BTreeSet<&str> = serving
                    .iter()
                    .flat_map(|&i| self.entries[i].profile.sort.iter().map(|(p, _)| p.as_str()))
                    .collect();

                let stats = index_stats_for(candidate);
                let eligible: Vec<(usize, f64)> = candidate
                    .keys
                    .iter()
                    .enumerate()
                    .filter_map(|(p, key)| {
                        if sort_immune.contains(key.path.as_str()) {
                            return None;
                        }
                        let reduction = stats.reduction_at(p)?;
                        (reduction > minimum_reduction).then_some((p, reduction))
                    })
                    .collect();

                // Remove the least-discriminating eligible field: the
                // maximum reduction value, tie-broken by rightmost position.
                let worst = eligible
                    .iter()
                    .copied()
                    .max_by(|(pa, ra), (pb, rb)| ra.total_cmp(rb).then(pa.cmp(pb)));

                if let Some((worst_position, _)) = worst {
                    let mut new_keys = candidate.keys.clone();
                    new_keys.remove(worst_position);
                    if !new_keys.is_empty() {
                        let new_index = CompoundIndex::new(candidate.namespace.clone(), new_keys);
                        let new_arc = self.canonicalizer.canonicalize(new_index);
                        replacements.push((candidate.clone(), new_arc));
                    }
                }
            }

            if replacements.is_empty() {
                break;
            }
            changed_overall = true;
            self.replace_candidates(&replacements);
            self.reduce_indexes();
        }
        changed_overall
    }

    /// Index extension (§4.4 `extend`): append "free" fields that don't
    /// split the index further but give the planner more to work with.
    pub fn extend(&mut self, collection_stats_for: impl Fn(&str) -> Option<CollectionStatistics>) {
        let served_by = self.served_by();
        let unique = self.unique_candidates();
        let mut replacements = Vec::new();

        for candidate in &unique {
            let Some(stats) = collection_stats_for(&candidate.namespace) else {
                continue;
            };
            let mut keys = candidate.keys.clone();
            let mut serving = served_by
                .get(&candidate.canonical_name())
                .cloned()
                .unwrap_or_default();

            loop {
                let existing: BTreeSet<&str> = keys.iter().map(|k| k.path.as_str()).collect();
                let mut votes: BTreeMap<String, u64> = BTreeMap::new();
                let mut contributing: BTreeMap<String, Vec<usize>> = BTreeMap::new();

                for &pi in &serving {
                    let profile = &self.entries[pi].profile;
                    for field in profile.exact.iter().chain(profile.range.iter()) {
                        if existing.contains(field.as_str()) {
                            continue;
                        }
                        let Some(field_stats) = stats.fields.get(field) else {
                            continue;
                        };
                        if field_stats.is_hash_mode() || !field_stats.array_prefixes.is_empty() {
                            continue;
                        }
                        *votes.entry(field.clone()).or_insert(0) += profile.usage_count;
                        contributing.entry(field.clone()).or_default().push(pi);
                    }
                }

                let Some((winner, _)) = votes.iter().max_by_key(|(_, votes)| **votes) else {
                    break;
                };
                let winner = winner.clone();
                keys.push(IndexKey {
                    path: winner.clone(),
                    direction: Direction::Asc,
                });
                serving = contributing.remove(&winner).unwrap_or_default();
            }

            if keys.len() != candidate.keys.len() {
                let new_index = CompoundIndex::new(candidate.namespace.clone(), keys);
                let new_arc = self.canonicalizer.canonicalize(new_index);
                replacements.push((candidate.clone(), new_arc));
            }
        }

        self.replace_candidates(&replacements);
    }

    /// The final recommended index set: every distinct compound candidate
    /// plus every separately-tracked hashed single-field index.
    pub fn recommended_index_set(&self) -> IndexSet {
        let mut result = IndexSet::new();
        for candidate in self.unique_candidates() {
            if candidate.is_primary_key_only() {
                continue;
            }
            result.insert(NamedIndex::recommended((*candidate).clone()));
        }
        for hashed in self.hashed.iter() {
            result.insert(hashed.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(path: &str, direction: Direction) -> IndexKey {
        IndexKey {
            path: path.to_string(),
            direction,
        }
    }

    fn profile_with_candidate(namespace: &str, keys: Vec<IndexKey>) -> (QueryProfile, CompoundIndex) {
        let index = CompoundIndex::new(namespace, keys.clone());
        let fields: Vec<String> = keys.iter().map(|k| k.path.clone()).collect();
        let profile = QueryProfile::new(namespace.to_string(), fields, vec![], vec![], vec![]);
        (profile, index)
    }

    /// S4: prefix absorption, (x) and (x,y) both absorb into (x,y,z).
    #[test]
    fn prefix_absorption_scenario() {
        let mut qs = QuerySet::new();

        let (pa, ia) = profile_with_candidate("db.c", vec![key("x", Direction::Asc)]);
        let (pb, ib) = profile_with_candidate(
            "db.c",
            vec![key("x", Direction::Asc), key("y", Direction::Asc)],
        );
        let (pc, ic) = profile_with_candidate(
            "db.c",
            vec![
                key("x", Direction::Asc),
                key("y", Direction::Asc),
                key("z", Direction::Asc),
            ],
        );

        let ia = qs.canonicalizer.canonicalize(ia);
        let ib = qs.canonicalizer.canonicalize(ib);
        let ic = qs.canonicalizer.canonicalize(ic);

        qs.entries.push(ProfileEntry {
            profile: pa,
            candidates: vec![ia],
        });
        qs.entries.push(ProfileEntry {
            profile: pb,
            candidates: vec![ib],
        });
        qs.entries.push(ProfileEntry {
            profile: pc,
            candidates: vec![ic],
        });

        qs.reduce_indexes();

        let recommended = qs.recommended_index_set();
        assert_eq!(recommended.len(), 1);
        let only = recommended.iter().next().unwrap();
        assert_eq!(only.index.keys.len(), 3);
    }

    /// S5: field reduction removes the rightmost eligible non-sort field.
    #[test]
    fn field_reduction_scenario() {
        let mut qs = QuerySet::new();
        let (profile, index) = profile_with_candidate(
            "db.c",
            vec![key("name", Direction::Asc), key("birthday", Direction::Asc)],
        );
        let index = qs.canonicalizer.canonicalize(index);
        qs.entries.push(ProfileEntry {
            profile,
            candidates: vec![index],
        });

        qs.simplify(
            |_index| IndexStatistics {
                positions: vec![
                    crate::stats::IndexPositionStatistics {
                        path: "name".into(),
                        current_average_distinct: 33.0,
                        last_average_distinct: 33.0,
                        reduction: 0.33,
                    },
                    crate::stats::IndexPositionStatistics {
                        path: "birthday".into(),
                        current_average_distinct: 75.0,
                        last_average_distinct: 75.0,
                        reduction: 0.75,
                    },
                ],
                last_sample_time: Utc::now(),
            },
            0.70,
        );

        let recommended = qs.recommended_index_set();
        assert_eq!(recommended.len(), 1);
        let only = recommended.iter().next().unwrap();
        assert_eq!(only.index.keys.len(), 1);
        assert_eq!(only.index.keys[0].path, "name");
    }

    #[test]
    fn sort_fields_are_never_removed_by_simplify() {
        let mut qs = QuerySet::new();
        let mut profile = QueryProfile::new(
            "db.c".into(),
            vec!["name".into()],
            vec![("birthday".into(), 1)],
            vec![],
            vec![],
        );
        profile.usage_count = 1;
        let index = qs.canonicalizer.canonicalize(CompoundIndex::new(
            "db.c",
            vec![key("name", Direction::Asc), key("birthday", Direction::Asc)],
        ));
        qs.entries.push(ProfileEntry {
            profile,
            candidates: vec![index],
        });

        // birthday would exceed the threshold too, but it is a sort key.
        qs.simplify(
            |_| IndexStatistics {
                positions: vec![
                    crate::stats::IndexPositionStatistics {
                        path: "name".into(),
                        current_average_distinct: 33.0,
                        last_average_distinct: 33.0,
                        reduction: 0.33,
                    },
                    crate::stats::IndexPositionStatistics {
                        path: "birthday".into(),
                        current_average_distinct: 95.0,
                        last_average_distinct: 95.0,
                        reduction: 0.95,
                    },
                ],
                last_sample_time: Utc::now(),
            },
            0.70,
        );

        let recommended = qs.recommended_index_set();
        let only = recommended.iter().next().unwrap();
        assert_eq!(only.index.keys.len(), 2);
    }

    fn stats_with(entries: &[(&str, u64, usize, BTreeSet<String>)]) -> CollectionStatistics {
        use crate::stats::{FieldMode, FieldStatistics};
        let mut fields = HashMap::new();
        for (path, cardinality, longest, array_prefixes) in entries {
            fields.insert(
                path.to_string(),
                FieldStatistics {
                    cardinality: *cardinality,
                    longest: *longest,
                    mode: FieldMode::Normal,
                    array_prefixes: array_prefixes.clone(),
                },
            );
        }
        CollectionStatistics {
            fields,
            known_array_prefixes: BTreeSet::new(),
            last_sample_time: Utc::now(),
        }
    }

    /// `extend` appends the highest-voted free field, preferring the field
    /// referenced by more (or higher-usage) serving profiles.
    #[test]
    fn extend_appends_highest_voted_free_field() {
        let mut qs = QuerySet::new();
        let mut a = QueryProfile::new("db.c".into(), vec!["x".into(), "winner".into()], vec![], vec![], vec![]);
        a.usage_count = 10;
        let mut b = QueryProfile::new("db.c".into(), vec!["x".into(), "loser".into()], vec![], vec![], vec![]);
        b.usage_count = 1;
        let index = qs.canonicalizer.canonicalize(CompoundIndex::new("db.c", vec![key("x", Direction::Asc)]));
        qs.entries.push(ProfileEntry { profile: a, candidates: vec![index.clone()] });
        qs.entries.push(ProfileEntry { profile: b, candidates: vec![index] });

        let stats = stats_with(&[
            ("x", 10, 1, BTreeSet::new()),
            ("winner", 10, 1, BTreeSet::new()),
            ("loser", 10, 1, BTreeSet::new()),
        ]);
        qs.extend(|_ns| Some(stats.clone()));

        let recommended = qs.recommended_index_set();
        assert_eq!(recommended.len(), 1);
        let only = &recommended.iter().next().unwrap().index;
        assert_eq!(only.keys.len(), 2);
        assert_eq!(only.keys[1].path, "winner");
    }

    /// Invariant 8: `extend` never appends a hash-mode field or a field
    /// with a non-empty `arrayPrefixes`, even if it would otherwise win the
    /// vote.
    #[test]
    fn extend_never_adds_hashed_or_array_fields() {
        use crate::stats::{FieldMode, FieldStatistics};
        let mut qs = QuerySet::new();
        let profile = QueryProfile::new(
            "db.c".into(),
            vec!["x".into(), "blob".into(), "names.first".into()],
            vec![],
            vec![],
            vec![],
        );
        let index = qs.canonicalizer.canonicalize(CompoundIndex::new("db.c", vec![key("x", Direction::Asc)]));
        qs.entries.push(ProfileEntry { profile, candidates: vec![index] });

        let mut fields = HashMap::new();
        fields.insert(
            "x".to_string(),
            FieldStatistics { cardinality: 10, longest: 1, mode: FieldMode::Normal, array_prefixes: BTreeSet::new() },
        );
        fields.insert(
            "blob".to_string(),
            FieldStatistics { cardinality: 10, longest: 4096, mode: FieldMode::Hash, array_prefixes: BTreeSet::new() },
        );
        fields.insert(
            "names.first".to_string(),
            FieldStatistics {
                cardinality: 10,
                longest: 1,
                mode: FieldMode::Normal,
                array_prefixes: ["names".to_string()].into_iter().collect(),
            },
        );
        let stats = CollectionStatistics { fields, known_array_prefixes: BTreeSet::new(), last_sample_time: Utc::now() };
        qs.extend(|_ns| Some(stats.clone()));

        let recommended = qs.recommended_index_set();
        let only = &recommended.iter().next().unwrap().index;
        assert_eq!(only.keys.len(), 1);
        assert_eq!(only.keys[0].path, "x");
    }

    #[test]
    fn equivalence_dedup_unions_usage_count() {
        let mut qs = QuerySet::new();
        let a = QueryProfile::new("db.c".into(), vec!["x".into()], vec![], vec![], vec![]);
        let b = QueryProfile::new("db.c".into(), vec!["x".into()], vec![], vec![], vec![]);
        qs.observe(a);
        qs.observe(b);
        assert_eq!(qs.entries.len(), 1);
        assert_eq!(qs.entries[0].profile.usage_count, 2);
    }

    // Property: prefix-free fixed point (invariant 5). Any set of randomly
    // generated candidate index sequences, each assigned to its own profile,
    // settles after `reduce_indexes` into a state where no candidate is an
    // index-prefix of another anywhere in the set.
    fn field_sequence_strategy() -> impl Strategy<Value = Vec<Vec<&'static str>>> {
        let fields = vec!["a", "b", "c", "d", "e"];
        prop::collection::vec(
            prop::collection::vec(prop::sample::select(fields), 1..4),
            1..8,
        )
    }

    proptest! {
        #[test]
        fn prefix_free_fixed_point_holds_after_reduction(sequences in field_sequence_strategy()) {
            let mut qs = QuerySet::new();
            for seq in &sequences {
                let keys: Vec<IndexKey> = seq.iter().map(|f| key(f, Direction::Asc)).collect();
                let (profile, index) = profile_with_candidate("db.c", keys);
                let index = qs.canonicalizer.canonicalize(index);
                qs.entries.push(ProfileEntry { profile, candidates: vec![index] });
            }
            qs.reduce_indexes();

            let all: Vec<_> = qs.entries.iter().flat_map(|e| e.candidates.iter().cloned()).collect();
            for (i, a) in all.iter().enumerate() {
                for (j, b) in all.iter().enumerate() {
                    if i != j {
                        prop_assert!(!a.is_prefix_of(b));
                    }
                }
            }
        }
    }
}
