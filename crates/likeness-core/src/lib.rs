//! likeness-core — Crop geometry and identity consensus for dataset curation.
//!
//! Consumes the output of an external face detector (bounding box plus
//! embedding per face) and turns it into square crop rectangles and
//! keep/reject decisions. No image decoding, no I/O, no shared state.

pub mod cluster;
pub mod config;
pub mod consensus;
pub mod geometry;
pub mod types;

pub use cluster::{ClusterLabel, DistanceMetric};
pub use config::{ConfigError, ConsensusConfig, CropConfig, CurationConfig, StrategyKind};
pub use consensus::{
    BatchMember, CentroidConsensus, ConsensusError, ConsensusOutcome, ConsensusResult,
    ConsensusStrategy, DecisionBasis, DensityConsensus, IdentityBatch, MemberDecision,
    NoConsensus, NoConsensusPolicy,
};
pub use geometry::{
    center_square, compute_crop, plan_crop, plan_crops, CropMode, CropPlan, CropRect, CropSpec,
    InputError,
};
pub use types::{primary_face, BoundingBox, DetectedFace, Embedding, EmbeddingNorm, ImageDetections};
