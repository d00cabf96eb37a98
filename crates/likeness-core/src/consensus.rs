//! Identity consensus: which images in a batch show the dominant subject.
//!
//! A batch is built once from already-extracted embeddings and decided in
//! a single pass. Strategies hold only their parameters, so one instance
//! can be shared across threads and reused for any number of batches.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{self, ClusterLabel, DistanceMetric};
use crate::types::Embedding;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("identity batch is empty")]
    EmptyBatch,
    #[error("member '{id}' has an empty embedding")]
    EmptyEmbedding { id: String },
    #[error("member '{id}' has a {actual}-dim embedding, batch is {expected}-dim")]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate member id '{0}'")]
    DuplicateMember(String),
    #[error("member '{0}' has a non-finite embedding value")]
    NonFinite(String),
    #[error("density clustering needs at least {required} members, got {actual}")]
    InsufficientMembers { required: usize, actual: usize },
    #[error("invalid strategy parameter: {0}")]
    InvalidParameter(String),
}

/// One image's contribution to a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchMember {
    pub id: String,
    pub embedding: Embedding,
}

/// Ordered set of per-image embeddings sharing one dimensionality.
#[derive(Debug, Clone, Default)]
pub struct IdentityBatch {
    members: Vec<BatchMember>,
    ids: HashSet<String>,
}

impl IdentityBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members<I, S>(members: I) -> Result<Self, ConsensusError>
    where
        I: IntoIterator<Item = (S, Embedding)>,
        S: Into<String>,
    {
        let mut batch = Self::new();
        for (id, embedding) in members {
            batch.push(id, embedding)?;
        }
        Ok(batch)
    }

    /// Append a member, keeping detection order.
    pub fn push(&mut self, id: impl Into<String>, embedding: Embedding) -> Result<(), ConsensusError> {
        let id = id.into();
        if embedding.dim() == 0 {
            return Err(ConsensusError::EmptyEmbedding { id });
        }
        if let Some(expected) = self.dim() {
            if embedding.dim() != expected {
                return Err(ConsensusError::DimensionMismatch {
                    id,
                    expected,
                    actual: embedding.dim(),
                });
            }
        }
        if !embedding.is_finite() {
            return Err(ConsensusError::NonFinite(id));
        }
        if !self.ids.insert(id.clone()) {
            return Err(ConsensusError::DuplicateMember(id));
        }
        self.members.push(BatchMember { id, embedding });
        Ok(())
    }

    pub fn members(&self) -> &[BatchMember] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Shared embedding dimensionality, `None` while empty.
    pub fn dim(&self) -> Option<usize> {
        self.members.first().map(|m| m.embedding.dim())
    }
}

/// Why a member was kept or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "basis", rename_all = "snake_case")]
pub enum DecisionBasis {
    /// Cosine similarity to the batch centroid.
    Similarity { score: f32 },
    /// DBSCAN label; `majority` is the winning cluster when one exists.
    Cluster {
        label: ClusterLabel,
        majority: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberDecision {
    pub id: String,
    #[serde(flatten)]
    pub basis: DecisionBasis,
}

/// Partition of a batch into the dominant identity and everything else.
///
/// `kept` and `rejected` are disjoint, cover every member, and keep batch order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConsensusResult {
    pub strategy: String,
    pub kept: Vec<MemberDecision>,
    pub rejected: Vec<MemberDecision>,
}

impl ConsensusResult {
    pub fn kept_ids(&self) -> impl Iterator<Item = &str> {
        self.kept.iter().map(|d| d.id.as_str())
    }

    pub fn rejected_ids(&self) -> impl Iterator<Item = &str> {
        self.rejected.iter().map(|d| d.id.as_str())
    }

    pub fn is_kept(&self, id: &str) -> bool {
        self.kept.iter().any(|d| d.id == id)
    }

    pub fn decision(&self, id: &str) -> Option<&MemberDecision> {
        self.kept
            .iter()
            .chain(self.rejected.iter())
            .find(|d| d.id == id)
    }
}

/// No dominant identity could be established.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoConsensus {
    pub strategy: String,
    /// Every member with its decision basis, in batch order.
    pub decisions: Vec<MemberDecision>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsensusOutcome {
    Consensus(ConsensusResult),
    NoConsensus(NoConsensus),
}

/// Driver-chosen handling of [`ConsensusOutcome::NoConsensus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoConsensusPolicy {
    /// Stop; the batch needs a human look.
    #[default]
    Abort,
    /// Treat every member as the subject.
    KeepAll,
    /// Treat every member as an outlier.
    RejectAll,
}

impl fmt::Display for NoConsensusPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NoConsensusPolicy::Abort => "abort",
            NoConsensusPolicy::KeepAll => "keep_all",
            NoConsensusPolicy::RejectAll => "reject_all",
        })
    }
}

impl FromStr for NoConsensusPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "abort" => Ok(NoConsensusPolicy::Abort),
            "keep_all" => Ok(NoConsensusPolicy::KeepAll),
            "reject_all" => Ok(NoConsensusPolicy::RejectAll),
            other => Err(format!(
                "unknown no-consensus policy '{other}' (expected abort, keep_all or reject_all)"
            )),
        }
    }
}

impl ConsensusOutcome {
    pub fn is_consensus(&self) -> bool {
        matches!(self, ConsensusOutcome::Consensus(_))
    }

    /// Collapse to a result under `policy`. `Abort` hands the
    /// [`NoConsensus`] back to the caller.
    pub fn resolve(self, policy: NoConsensusPolicy) -> Result<ConsensusResult, NoConsensus> {
        match self {
            ConsensusOutcome::Consensus(result) => Ok(result),
            ConsensusOutcome::NoConsensus(none) => match policy {
                NoConsensusPolicy::Abort => Err(none),
                NoConsensusPolicy::KeepAll => Ok(ConsensusResult {
                    strategy: none.strategy,
                    kept: none.decisions,
                    rejected: Vec::new(),
                }),
                NoConsensusPolicy::RejectAll => Ok(ConsensusResult {
                    strategy: none.strategy,
                    kept: Vec::new(),
                    rejected: none.decisions,
                }),
            },
        }
    }
}

/// Policy for deciding which batch members share the dominant identity.
pub trait ConsensusStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn decide(&self, batch: &IdentityBatch) -> Result<ConsensusOutcome, ConsensusError>;
}

/// Mean-embedding consensus: keep members whose cosine similarity to the
/// batch centroid exceeds `threshold`.
///
/// The centroid is the plain element-wise mean, not renormalized. If no
/// member clears the threshold the outcome is `NoConsensus`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidConsensus {
    pub threshold: f32,
}

impl ConsensusStrategy for CentroidConsensus {
    fn name(&self) -> &'static str {
        "centroid"
    }

    fn decide(&self, batch: &IdentityBatch) -> Result<ConsensusOutcome, ConsensusError> {
        let members = batch.members();
        if members.is_empty() {
            return Err(ConsensusError::EmptyBatch);
        }
        if !self.threshold.is_finite() {
            return Err(ConsensusError::InvalidParameter(format!(
                "threshold must be finite, got {}",
                self.threshold
            )));
        }

        let centroid =
            Embedding::mean(members.iter().map(|m| &m.embedding)).ok_or(ConsensusError::EmptyBatch)?;

        let mut result = ConsensusResult {
            strategy: self.name().to_string(),
            ..ConsensusResult::default()
        };

        for member in members {
            // A lone member is its own centroid.
            let score = if members.len() == 1 {
                1.0
            } else {
                member.embedding.similarity(&centroid)
            };
            let decision = MemberDecision {
                id: member.id.clone(),
                basis: DecisionBasis::Similarity { score },
            };
            if score > self.threshold {
                result.kept.push(decision);
            } else {
                tracing::debug!(id = %member.id, score, threshold = self.threshold, "outlier removed");
                result.rejected.push(decision);
            }
        }

        tracing::info!(
            kept = result.kept.len(),
            rejected = result.rejected.len(),
            threshold = self.threshold,
            "centroid consensus"
        );

        if result.kept.is_empty() {
            tracing::warn!(members = members.len(), "no member cleared the centroid threshold");
            return Ok(ConsensusOutcome::NoConsensus(NoConsensus {
                strategy: result.strategy,
                decisions: result.rejected,
            }));
        }

        Ok(ConsensusOutcome::Consensus(result))
    }
}

/// Density consensus: keep the largest DBSCAN cluster.
///
/// `metric` must be the native metric of the embedding space, and `eps`
/// is expressed in that metric's units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityConsensus {
    pub eps: f32,
    pub min_samples: usize,
    pub metric: DistanceMetric,
}

const DENSITY_MIN_MEMBERS: usize = 2;

impl ConsensusStrategy for DensityConsensus {
    fn name(&self) -> &'static str {
        "density"
    }

    fn decide(&self, batch: &IdentityBatch) -> Result<ConsensusOutcome, ConsensusError> {
        let members = batch.members();
        if members.is_empty() {
            return Err(ConsensusError::EmptyBatch);
        }
        if members.len() < DENSITY_MIN_MEMBERS {
            return Err(ConsensusError::InsufficientMembers {
                required: DENSITY_MIN_MEMBERS,
                actual: members.len(),
            });
        }
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return Err(ConsensusError::InvalidParameter(format!(
                "eps must be positive, got {}",
                self.eps
            )));
        }
        if self.min_samples == 0 {
            return Err(ConsensusError::InvalidParameter(
                "min_samples must be at least 1".to_string(),
            ));
        }

        let points: Vec<&Embedding> = members.iter().map(|m| &m.embedding).collect();
        let labels = cluster::dbscan(&points, self.eps, self.min_samples, self.metric);
        let majority = cluster::majority_cluster(&labels);

        let decisions = members.iter().zip(labels.iter()).map(|(member, &label)| MemberDecision {
            id: member.id.clone(),
            basis: DecisionBasis::Cluster {
                label,
                majority: majority.map(|(id, _)| id),
            },
        });

        let Some((majority_id, size)) = majority else {
            tracing::warn!(
                members = members.len(),
                eps = self.eps,
                min_samples = self.min_samples,
                "no cluster formed; every member is noise"
            );
            return Ok(ConsensusOutcome::NoConsensus(NoConsensus {
                strategy: self.name().to_string(),
                decisions: decisions.collect(),
            }));
        };

        let mut result = ConsensusResult {
            strategy: self.name().to_string(),
            ..ConsensusResult::default()
        };
        for (decision, label) in decisions.zip(labels.iter()) {
            if *label == ClusterLabel::Cluster(majority_id) {
                result.kept.push(decision);
            } else {
                tracing::debug!(id = %decision.id, label = label.as_i64(), "outlier removed");
                result.rejected.push(decision);
            }
        }

        tracing::info!(
            majority = majority_id,
            size,
            kept = result.kept.len(),
            rejected = result.rejected.len(),
            metric = ?self.metric,
            "density consensus"
        );

        Ok(ConsensusOutcome::Consensus(result))
    }
}
