//! # Sampler
//!
//! Draws uniform random documents without replacement from a collection via
//! the [`crate::collaborators::DocumentSampler`] data-plane trait, and
//! derives per-field and per-index-prefix statistics from the sample. See
//! SPEC_FULL.md §4.3.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use rand::seq::index::sample as sample_indices;
use rand::thread_rng;
use serde_json::Value;

use crate::collaborators::DocumentSampler;
use crate::errors::EngineError;
use crate::field::array_ancestors;
use crate::index::CompoundIndex;
use crate::stats::{CollectionStatistics, FieldMode, FieldStatistics, IndexPositionStatistics, IndexStatistics};

/// One flattened `{path → value}` entry, with array positions already
/// canonicalized to [`crate::field::ARRAY_MARKER`].
type FlatDocument = HashMap<String, Vec<Value>>;

/// Flatten a document into `{path → values}`, canonicalizing every array
/// index segment to the shared array marker so that `names.0.first` and
/// `names.1.first` collapse into the same `names.[].first` bucket. A path
/// maps to multiple values when it passes through an array.
fn flatten(value: &Value) -> FlatDocument {
    let mut out = FlatDocument::new();
    flatten_into(value, String::new(), &mut out);
    out
}

fn flatten_into(value: &Value, prefix: String, out: &mut FlatDocument) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(val, path, out);
            }
        }
        Value::Array(items) => {
            let array_path = crate::field::array_element_path(&prefix);
            if items.is_empty() {
                out.entry(array_path).or_default();
            } else {
                for item in items {
                    flatten_into(item, array_path.clone(), out);
                }
            }
        }
        leaf => {
            out.entry(prefix).or_default().push(leaf.clone());
        }
    }
}

fn fingerprint(value: &Value) -> String {
    value.to_string()
}

/// Random sampling, statistics derivation, and per-request pacing.
pub struct Sampler<'a> {
    source: &'a dyn DocumentSampler,
    sample_speed: Duration,
}

impl<'a> Sampler<'a> {
    pub fn new(source: &'a dyn DocumentSampler, sample_speed: Duration) -> Self {
        Self { source, sample_speed }
    }

    /// Draw at most `n` documents from `namespace`, uniformly without
    /// replacement, visited in ascending index order via `skip` deltas from
    /// the previous position. Paces one request per document evenly over
    /// `sample_speed`.
    async fn draw(&self, namespace: &str, n: u64) -> Result<Vec<Value>, EngineError> {
        let total = self.source.count(namespace).await?;
        let n = n.min(total) as usize;
        if n == 0 || total == 0 {
            return Ok(Vec::new());
        }

        let mut indices: Vec<usize> =
            sample_indices(&mut thread_rng(), total as usize, n).into_vec();
        indices.sort_unstable();

        let pacing = if n == 0 {
            Duration::ZERO
        } else {
            self.sample_speed / n as u32
        };

        let mut documents = Vec::with_capacity(n);
        for chunk in indices.chunks(1) {
            let indices_u64: Vec<u64> = chunk.iter().map(|&i| i as u64).collect();
            let fetched = self.source.fetch_at(namespace, &indices_u64).await?;
            // A skipped slot (document deleted between count and fetch)
            // simply yields nothing here, which is silently tolerated.
            documents.extend(fetched);
            if !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
        }
        Ok(documents)
    }

    /// Collection sampling: derive [`CollectionStatistics`] from a fresh
    /// random sample of `sample_size / 10` documents.
    pub async fn sample_collection(
        &self,
        namespace: &str,
        sample_size: u64,
        longest_indexable_value: usize,
    ) -> Result<CollectionStatistics, EngineError> {
        let documents = self.draw(namespace, (sample_size / 10).max(1)).await?;

        let mut fingerprints: HashMap<String, HashSet<String>> = HashMap::new();
        let mut longest: HashMap<String, usize> = HashMap::new();
        let mut known_array_prefixes: BTreeSet<String> = BTreeSet::new();

        for document in &documents {
            for (path, values) in flatten(document) {
                known_array_prefixes.extend(array_ancestors(&path));
                let entry_fps = fingerprints.entry(path.clone()).or_default();
                let entry_longest = longest.entry(path.clone()).or_insert(0);
                for value in &values {
                    let fp = fingerprint(value);
                    *entry_longest = (*entry_longest).max(fp.len());
                    entry_fps.insert(fp);
                }
            }
        }

        let mut fields = HashMap::new();
        for (path, fps) in fingerprints {
            let path_longest = longest.get(&path).copied().unwrap_or(0);
            let array_prefixes: BTreeSet<String> = array_ancestors(&path)
                .into_iter()
                .filter(|p| known_array_prefixes.contains(p))
                .collect();
            fields.insert(
                path,
                FieldStatistics {
                    cardinality: fps.len() as u64,
                    longest: path_longest,
                    mode: if path_longest > longest_indexable_value {
                        FieldMode::Hash
                    } else {
                        FieldMode::Normal
                    },
                    array_prefixes,
                },
            );
        }

        Ok(CollectionStatistics {
            fields,
            known_array_prefixes,
            last_sample_time: Utc::now(),
        })
    }

    /// Index sampling: for every candidate index and every prefix length,
    /// derive the average distinct composite-key count and reduction ratio.
    pub async fn sample_indexes(
        &self,
        namespace: &str,
        candidates: &[CompoundIndex],
        sample_size: u64,
    ) -> Result<HashMap<String, IndexStatistics>, EngineError> {
        let documents = self.draw(namespace, sample_size).await?;
        let total_documents = documents.len().max(1) as f64;

        // Each document's own flattened keys carry the marked array ancestors
        // it actually has; an index key like "names.first" must be re-keyed
        // against that document's markers before the flat lookup below.
        let mut known_array_prefixes: BTreeSet<String> = BTreeSet::new();
        for document in &documents {
            for path in flatten(document).keys() {
                known_array_prefixes.extend(array_ancestors(path));
            }
        }

        let mut result = HashMap::new();
        for index in candidates {
            let mut positions = Vec::with_capacity(index.keys.len());
            let mut previous_average = total_documents;

            for prefix_len in 1..=index.keys.len() {
                let mut frequency: HashMap<String, u64> = HashMap::new();
                for document in &documents {
                    let flat = flatten(document);
                    let mut tuples: Vec<Vec<String>> = vec![Vec::new()];
                    for key in &index.keys[..prefix_len] {
                        let sampled_key = crate::field::insert_array_markers(&key.path, &known_array_prefixes);
                        let values = flat.get(&sampled_key).cloned().unwrap_or_default();
                        let fingerprints: Vec<String> = if values.is_empty() {
                            vec!["\u{0}missing".to_string()]
                        } else {
                            values.iter().map(fingerprint).collect()
                        };
                        tuples = tuples
                            .into_iter()
                            .flat_map(|prefix| {
                                fingerprints.iter().map(move |f| {
                                    let mut next = prefix.clone();
                                    next.push(f.clone());
                                    next
                                })
                            })
                            .collect();
                    }
                    for tuple in tuples {
                        *frequency.entry(tuple.join("\u{1}")).or_insert(0) += 1;
                    }
                }

                let current_average = if frequency.is_empty() {
                    total_documents
                } else {
                    frequency.values().sum::<u64>() as f64 / frequency.len() as f64
                };
                let reduction = if previous_average > 0.0 {
                    current_average / previous_average
                } else {
                    1.0
                };

                positions.push(IndexPositionStatistics {
                    path: index.keys[prefix_len - 1].path.clone(),
                    current_average_distinct: current_average,
                    last_average_distinct: current_average,
                    reduction,
                });
                previous_average = current_average;
            }

            result.insert(
                format!("{namespace}-{}", index.canonical_name()),
                IndexStatistics {
                    positions,
                    last_sample_time: Utc::now(),
                },
            );
        }
        Ok(result)
    }
}
