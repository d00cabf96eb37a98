//! Tunables for crop framing and identity consensus.
//!
//! Every value here is dataset- and model-dependent. Defaults are a
//! starting point, and each one documents the embedding convention it
//! assumes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::DistanceMetric;
use crate::consensus::{CentroidConsensus, ConsensusStrategy, DensityConsensus, NoConsensusPolicy};
use crate::geometry::CropMode;
use crate::types::EmbeddingNorm;

// --- Crop framing ---
/// Face crop side as a multiple of the larger face-box edge.
pub const DEFAULT_FACE_SCALE: f64 = 1.6;
/// Upward shift of the face crop center, as a fraction of face-box height.
pub const DEFAULT_FACE_SHIFT: f64 = 0.15;
/// Body crop side as a multiple of the larger face-box edge.
pub const DEFAULT_BODY_SCALE: f64 = 6.0;
/// Downward shift of the body crop center, as a fraction of the crop side.
pub const DEFAULT_BODY_SHIFT: f64 = 0.20;

// --- Consensus ---
/// Cosine similarity to the batch centroid a member must exceed.
/// Cosine is scale-invariant, so this holds for raw and L2 embeddings alike.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.45;
/// Neighbourhood radius in cosine distance, for L2-normalized ArcFace embeddings.
pub const DEFAULT_COSINE_EPS: f32 = 0.6;
/// Neighbourhood radius in euclidean distance, for raw FaceNet-style embeddings.
pub const DEFAULT_EUCLIDEAN_EPS: f32 = 10.0;
pub const DEFAULT_MIN_SAMPLES: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Scale and shift constants for the two framing modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    pub face_scale: f64,
    pub face_shift: f64,
    pub body_scale: f64,
    pub body_shift: f64,
}

impl Default for CropConfig {
    fn default() -> Self {
        Self {
            face_scale: DEFAULT_FACE_SCALE,
            face_shift: DEFAULT_FACE_SHIFT,
            body_scale: DEFAULT_BODY_SCALE,
            body_shift: DEFAULT_BODY_SHIFT,
        }
    }
}

impl CropConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("crop.face_scale", self.face_scale), ("crop.body_scale", self.body_scale)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(field, format!("must be a positive number, got {value}")));
            }
        }
        for (field, value) in [("crop.face_shift", self.face_shift), ("crop.body_shift", self.body_shift)] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, format!("must be zero or positive, got {value}")));
            }
        }
        Ok(())
    }
}

/// Which consensus policy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Cosine similarity to the mean embedding against a threshold.
    #[default]
    Centroid,
    /// DBSCAN majority cluster.
    Density,
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "centroid" => Ok(StrategyKind::Centroid),
            "density" | "dbscan" => Ok(StrategyKind::Density),
            other => Err(format!("unknown strategy '{other}' (expected centroid or density)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub strategy: StrategyKind,
    /// Centroid strategy cutoff.
    pub threshold: f32,
    /// Density strategy radius. Unset means the default for the batch's
    /// embedding convention.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eps: Option<f32>,
    pub min_samples: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Centroid,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            eps: None,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || !(-1.0..=1.0).contains(&self.threshold) {
            return Err(invalid(
                "consensus.threshold",
                format!("must lie in [-1, 1], got {}", self.threshold),
            ));
        }
        if let Some(eps) = self.eps {
            if !eps.is_finite() || eps <= 0.0 {
                return Err(invalid("consensus.eps", format!("must be positive, got {eps}")));
            }
        }
        if self.min_samples == 0 {
            return Err(invalid("consensus.min_samples", "must be at least 1"));
        }
        Ok(())
    }

    /// Radius for `norm`, falling back to the convention's default.
    pub fn eps_for(&self, norm: EmbeddingNorm) -> f32 {
        self.eps.unwrap_or(match norm.native_metric() {
            DistanceMetric::Cosine => DEFAULT_COSINE_EPS,
            DistanceMetric::Euclidean => DEFAULT_EUCLIDEAN_EPS,
        })
    }

    /// Build the configured strategy for embeddings in `norm`.
    pub fn build(&self, norm: EmbeddingNorm) -> Box<dyn ConsensusStrategy> {
        match self.strategy {
            StrategyKind::Centroid => Box::new(CentroidConsensus {
                threshold: self.threshold,
            }),
            StrategyKind::Density => Box::new(DensityConsensus {
                eps: self.eps_for(norm),
                min_samples: self.min_samples,
                metric: norm.native_metric(),
            }),
        }
    }
}

/// Full tuning for one curation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    /// What to do when the filter finds no dominant identity.
    pub no_consensus: NoConsensusPolicy,
    /// Framing modes emitted per image with a detected face.
    pub modes: Vec<CropMode>,
    pub crop: CropConfig,
    pub consensus: ConsensusConfig,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            no_consensus: NoConsensusPolicy::Abort,
            modes: CropMode::ALL.to_vec(),
            crop: CropConfig::default(),
            consensus: ConsensusConfig::default(),
        }
    }
}

impl CurationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modes.is_empty() {
            return Err(invalid("modes", "at least one crop mode is required"));
        }
        self.crop.validate()?;
        self.consensus.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(CurationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_scale() {
        let mut cfg = CurationConfig::default();
        cfg.crop.face_scale = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "crop.face_scale", .. })
        ));
    }

    #[test]
    fn test_rejects_negative_shift() {
        let mut cfg = CurationConfig::default();
        cfg.crop.body_shift = -0.1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "crop.body_shift", .. })
        ));
    }

    #[test]
    fn test_rejects_bad_consensus_params() {
        let mut cfg = ConsensusConfig::default();
        cfg.threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = ConsensusConfig::default();
        cfg.eps = Some(0.0);
        assert!(cfg.validate().is_err());

        let mut cfg = ConsensusConfig::default();
        cfg.min_samples = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_modes() {
        let cfg = CurationConfig {
            modes: Vec::new(),
            ..CurationConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_eps_follows_embedding_norm() {
        let cfg = ConsensusConfig::default();
        assert_eq!(cfg.eps_for(EmbeddingNorm::L2), DEFAULT_COSINE_EPS);
        assert_eq!(cfg.eps_for(EmbeddingNorm::Raw), DEFAULT_EUCLIDEAN_EPS);

        let pinned = ConsensusConfig {
            eps: Some(0.4),
            ..ConsensusConfig::default()
        };
        assert_eq!(pinned.eps_for(EmbeddingNorm::Raw), 0.4);
    }

    #[test]
    fn test_build_selects_strategy() {
        let mut cfg = ConsensusConfig::default();
        assert_eq!(cfg.build(EmbeddingNorm::L2).name(), "centroid");
        cfg.strategy = StrategyKind::Density;
        assert_eq!(cfg.build(EmbeddingNorm::L2).name(), "density");
    }

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!("Centroid".parse::<StrategyKind>(), Ok(StrategyKind::Centroid));
        assert_eq!("dbscan".parse::<StrategyKind>(), Ok(StrategyKind::Density));
        assert!("median".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: CurationConfig =
            serde_json::from_str(r#"{"consensus": {"strategy": "density", "eps": 0.5}}"#).unwrap();
        assert_eq!(cfg.consensus.strategy, StrategyKind::Density);
        assert_eq!(cfg.consensus.eps, Some(0.5));
        assert_eq!(cfg.consensus.min_samples, DEFAULT_MIN_SAMPLES);
        assert_eq!(cfg.crop, CropConfig::default());
        assert_eq!(cfg.no_consensus, NoConsensusPolicy::Abort);
    }
}
