//! # Robust Aggregator
//!
//! Multi-Krum selection: with `m` contributions and at most `f` Byzantine
//! contributors, each contribution is scored by the summed Euclidean distance
//! to its `m - f - 2` nearest neighbours. The `k <= m - f` lowest scores are
//! kept and averaged; everything else is treated as an outlier.
//!
//! Contributions whose length differs from the majority length, or that
//! contain non-finite values, are excluded before scoring.

use serde::{Deserialize, Serialize};
use sovereign_core::{NodeId, SovereignError};
use std::collections::BTreeMap;

use crate::quorum::verify_selection_bound;

/// Aggregation configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Assumed upper bound on Byzantine contributors (`f`)
    #[serde(default = "default_byzantine_tolerance")]
    pub byzantine_tolerance: usize,
    /// Contributions kept after scoring (`k`); `m - f` when unset
    #[serde(default)]
    pub selection_size: Option<usize>,
    /// Weight the average by each contribution's weight
    #[serde(default)]
    pub weighted: bool,
    /// Expected vector length; fixed by the first accepted contribution when unset
    #[serde(default)]
    pub dimension: Option<usize>,
}

fn default_byzantine_tolerance() -> usize {
    1
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            byzantine_tolerance: default_byzantine_tolerance(),
            selection_size: None,
            weighted: false,
            dimension: None,
        }
    }
}

/// One participant's update vector
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub contributor: NodeId,
    pub vector: Vec<f64>,
    pub weight: Option<f64>,
}

impl Contribution {
    pub fn new(contributor: impl Into<NodeId>, vector: Vec<f64>) -> Self {
        Self {
            contributor: contributor.into(),
            vector,
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn is_finite(&self) -> bool {
        self.vector.iter().all(|v| v.is_finite())
    }
}

/// Outcome of Multi-Krum selection, as indices into the input slice
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selection {
    /// Kept contributions, ascending by index
    pub selected: Vec<usize>,
    /// Well-formed but rejected by scoring
    pub outliers: Vec<usize>,
    /// Wrong length or non-finite
    pub malformed: Vec<usize>,
    /// Score of every well-formed contribution, ascending by index
    pub scores: Vec<(usize, f64)>,
}

/// Merged vector and the selection that produced it
#[derive(Clone, Debug, PartialEq)]
pub struct AggregationResult {
    pub vector: Vec<f64>,
    pub selection: Selection,
    pub digest: [u8; 32],
}

/// Multi-Krum aggregator
#[derive(Clone, Debug, Default)]
pub struct RobustAggregator {
    config: AggregationConfig,
}

impl RobustAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Most common vector length among finite, non-empty contributions.
    /// Ties go to the shorter length.
    fn majority_length(contributions: &[Contribution]) -> Option<usize> {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for c in contributions {
            if !c.vector.is_empty() && c.is_finite() {
                *counts.entry(c.vector.len()).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(len, _)| len)
    }

    /// Split indices into well-formed and malformed
    pub fn partition(&self, contributions: &[Contribution]) -> (Vec<usize>, Vec<usize>) {
        let expected = self
            .config
            .dimension
            .or_else(|| Self::majority_length(contributions));

        let mut valid = Vec::with_capacity(contributions.len());
        let mut malformed = Vec::new();
        for (i, c) in contributions.iter().enumerate() {
            if Some(c.vector.len()) == expected && c.is_finite() {
                valid.push(i);
            } else {
                malformed.push(i);
            }
        }
        (valid, malformed)
    }

    /// Select the most central contributions, tolerating `f` Byzantine ones
    pub fn select(&self, contributions: &[Contribution], f: usize) -> Result<Selection, SovereignError> {
        let (valid, malformed) = self.partition(contributions);
        let m = valid.len();
        verify_selection_bound(m, f)?;

        if !malformed.is_empty() {
            tracing::debug!("Excluded {} malformed contributions", malformed.len());
        }

        let neighbours = m - f - 2;
        let mut distances = vec![vec![0.0f64; m]; m];
        for a in 0..m {
            for b in (a + 1)..m {
                let d = euclidean(&contributions[valid[a]].vector, &contributions[valid[b]].vector);
                distances[a][b] = d;
                distances[b][a] = d;
            }
        }

        let mut scored: Vec<(usize, f64)> = (0..m)
            .map(|a| {
                let mut row: Vec<f64> = (0..m).filter(|&b| b != a).map(|b| distances[a][b]).collect();
                row.sort_by(f64::total_cmp);
                (valid[a], row.iter().take(neighbours).sum::<f64>())
            })
            .collect();

        let mut ranking = scored.clone();
        ranking.sort_by(|x, y| {
            x.1.total_cmp(&y.1).then_with(|| {
                contributions[x.0]
                    .contributor
                    .cmp(&contributions[y.0].contributor)
            })
        });

        let k = self
            .config
            .selection_size
            .unwrap_or(m - f)
            .clamp(1, m - f);

        let mut selected: Vec<usize> = ranking[..k].iter().map(|(i, _)| *i).collect();
        let mut outliers: Vec<usize> = ranking[k..].iter().map(|(i, _)| *i).collect();
        selected.sort_unstable();
        outliers.sort_unstable();
        scored.sort_by(|x, y| x.0.cmp(&y.0));

        Ok(Selection {
            selected,
            outliers,
            malformed,
            scores: scored,
        })
    }

    /// Element-wise mean of `selected`, in the order given
    pub fn aggregate(&self, selected: &[&Contribution]) -> Result<Vec<f64>, SovereignError> {
        let Some(first) = selected.first() else {
            return Err(SovereignError::InsufficientContributions {
                required: 0,
                available: 0,
            });
        };
        let dim = first.vector.len();
        if let Some(bad) = selected.iter().find(|c| c.vector.len() != dim) {
            return Err(SovereignError::MalformedContribution {
                contributor: bad.contributor.clone(),
                reason: format!("length {} differs from {}", bad.vector.len(), dim),
            });
        }

        let mut merged = vec![0.0f64; dim];
        let mut total_weight = 0.0f64;
        for c in selected {
            let weight = if self.config.weighted {
                c.weight.unwrap_or(1.0).max(0.0)
            } else {
                1.0
            };
            total_weight += weight;
            for (acc, v) in merged.iter_mut().zip(&c.vector) {
                *acc += weight * v;
            }
        }

        if total_weight <= 0.0 {
            return Err(SovereignError::InvalidInput(
                "selected contributions carry no weight".to_string(),
            ));
        }
        for v in merged.iter_mut() {
            *v /= total_weight;
        }
        Ok(merged)
    }

    /// Select then aggregate with the configured fault bound
    pub fn robust_aggregate(
        &self,
        contributions: &[Contribution],
    ) -> Result<AggregationResult, SovereignError> {
        let selection = self.select(contributions, self.config.byzantine_tolerance)?;
        let chosen: Vec<&Contribution> = selection.selected.iter().map(|&i| &contributions[i]).collect();
        let vector = self.aggregate(&chosen)?;
        let digest = sovereign_crypto::hash_f64_slice(&vector);
        Ok(AggregationResult {
            vector,
            selection,
            digest,
        })
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Encode an update vector as a proposal payload
pub fn encode_vector(vector: &[f64]) -> Result<Vec<u8>, SovereignError> {
    bincode::serialize(vector).map_err(|e| SovereignError::Serialization(e.to_string()))
}

/// Decode a proposal payload into an update vector
pub fn decode_vector(payload: &[u8]) -> Result<Vec<f64>, SovereignError> {
    bincode::deserialize(payload).map_err(|e| SovereignError::Serialization(e.to_string()))
}
