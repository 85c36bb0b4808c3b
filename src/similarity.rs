//! Similarity resolution for fuzzy filters.
//!
//! Each fuzzy filter is resolved independently: fetch the column's
//! distinct values, mark the filter pending, score the values against the
//! filter's current value remotely, and store the ranked matches. Filters
//! resolve concurrently with no cross-filter ordering; a response carrying
//! a stale version stamp is discarded so an edit issued meanwhile wins.

use crate::error::{DataChatError, Result};
use crate::filters::{FilterSet, Match, MatchState, Resolution};
use crate::store::TabularStore;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    docs: &'a [String],
    topics: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    similarity: Vec<Vec<f64>>,
}

/// Remote scoring seam: score every doc against a single topic.
#[async_trait]
pub trait SimilarityScorer: Send + Sync {
    async fn score(&self, docs: &[String], topic: &str) -> Result<Vec<f64>>;
}

/// HTTP implementation of the similarity contract:
/// POST `{docs, topics}` -> `{similarity: [[score, ..], ..]}` where
/// `similarity[i][0]` is the score of `docs[i]` against `topics[0]`.
pub struct RemoteScorer {
    client: reqwest::Client,
    url: String,
}

impl RemoteScorer {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl SimilarityScorer for RemoteScorer {
    async fn score(&self, docs: &[String], topic: &str) -> Result<Vec<f64>> {
        let topics = [topic.to_string()];
        let response = self
            .client
            .post(&self.url)
            .json(&ScoreRequest {
                docs,
                topics: &topics,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DataChatError::Similarity(format!(
                "Similarity request failed with {}",
                response.status()
            )));
        }
        let payload: ScoreResponse = response.json().await?;
        payload
            .similarity
            .into_iter()
            .map(|row| {
                row.first().copied().ok_or_else(|| {
                    DataChatError::Similarity("Empty similarity row".to_string())
                })
            })
            .collect()
    }
}

/// One failed resolution, reported inline without blocking the others.
#[derive(Debug, Clone)]
pub struct ResolutionFailure {
    pub index: usize,
    pub error: String,
}

/// Resolve every fuzzy filter whose matches are unresolved.
pub async fn resolve_pending(
    set: &mut FilterSet,
    store: &TabularStore,
    scorer: &dyn SimilarityScorer,
) -> Vec<ResolutionFailure> {
    let targets: Vec<usize> = set
        .filters
        .iter()
        .enumerate()
        .filter(|(_, f)| {
            matches!(
                f.resolution,
                Resolution::Fuzzy {
                    matches: MatchState::Unresolved,
                    ..
                }
            )
        })
        .map(|(i, _)| i)
        .collect();
    resolve_indices(set, store, scorer, &targets).await
}

/// Resolve a single filter (after its value was edited).
pub async fn resolve_one(
    set: &mut FilterSet,
    store: &TabularStore,
    scorer: &dyn SimilarityScorer,
    index: usize,
) -> Vec<ResolutionFailure> {
    resolve_indices(set, store, scorer, &[index]).await
}

async fn resolve_indices(
    set: &mut FilterSet,
    store: &TabularStore,
    scorer: &dyn SimilarityScorer,
    targets: &[usize],
) -> Vec<ResolutionFailure> {
    let mut failures = Vec::new();

    // Phase 1: fetch candidates and mark each target pending, so the
    // pending state is observable before any result lands.
    let mut issued: Vec<(usize, u64, Vec<String>, String)> = Vec::new();
    for &idx in targets {
        let Some(filter) = set.filters.get_mut(idx) else {
            continue;
        };
        let Resolution::Fuzzy {
            matches, version, ..
        } = &mut filter.resolution
        else {
            continue;
        };
        let docs = match store.distinct_values(&filter.table, &filter.column) {
            Ok(docs) => docs,
            Err(e) => {
                failures.push(ResolutionFailure {
                    index: idx,
                    error: e.to_string(),
                });
                continue;
            }
        };
        *matches = MatchState::Pending;
        issued.push((idx, *version, docs, filter.value.clone()));
    }

    // Phase 2: score all targets concurrently.
    let scored = join_all(issued.iter().map(|(idx, version, docs, topic)| async move {
        (*idx, *version, scorer.score(docs, topic).await)
    }))
    .await;

    // Phase 3: apply, discarding stale or malformed responses.
    for ((idx, issued_version, docs, _), (_, _, result)) in issued.iter().zip(scored) {
        apply_resolution(set, *idx, *issued_version, docs, result, &mut failures);
    }

    failures
}

/// Write one resolution result back, unless the filter was edited (or
/// replaced) while the score request was in flight.
fn apply_resolution(
    set: &mut FilterSet,
    idx: usize,
    issued_version: u64,
    docs: &[String],
    result: Result<Vec<f64>>,
    failures: &mut Vec<ResolutionFailure>,
) {
    let Some(filter) = set.filters.get_mut(idx) else {
        return;
    };
    let Resolution::Fuzzy {
        matches, version, ..
    } = &mut filter.resolution
    else {
        return;
    };
    if *version != issued_version {
        debug!(index = idx, "discarding stale similarity resolution");
        return;
    }
    match result {
        Ok(scores) if scores.len() == docs.len() => {
            *matches = MatchState::Resolved(
                docs.iter()
                    .zip(scores)
                    .map(|(value, score)| Match {
                        value: value.clone(),
                        score,
                    })
                    .collect(),
            );
        }
        Ok(scores) => {
            // Contract violation: never zip out of range.
            warn!(
                index = idx,
                docs = docs.len(),
                scores = scores.len(),
                "similarity response length mismatch"
            );
            *matches = MatchState::Unresolved;
            failures.push(ResolutionFailure {
                index: idx,
                error: format!(
                    "similarity returned {} scores for {} values",
                    scores.len(),
                    docs.len()
                ),
            });
        }
        Err(e) => {
            *matches = MatchState::Unresolved;
            failures.push(ResolutionFailure {
                index: idx,
                error: e.to_string(),
            });
        }
    }
}
