//! Curation driver: plan crops, collect primary-face embeddings, decide
//! consensus once for the whole manifest, and assemble a report.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use likeness_core::{
    plan_crops, ConsensusError, ConsensusOutcome, ConsensusResult, CropPlan, CurationConfig, EmbeddingNorm,
    IdentityBatch, ImageDetections, InputError, MemberDecision, NoConsensusPolicy,
};
use serde::Serialize;

use crate::manifest::DetectionManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// Matches the dominant identity; crops advance to captioning.
    Kept,
    /// Face found but judged a different identity.
    Rejected,
    /// No face detected, so identity could not be checked.
    NoFace,
    /// Detector output unusable for this image.
    Invalid,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub id: String,
    pub height: u32,
    pub width: u32,
    pub status: ImageStatus,
    pub faces: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub crops: Vec<CropPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<MemberDecision>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub images: usize,
    pub kept: usize,
    pub rejected: usize,
    pub no_face: usize,
    pub invalid: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurationReport {
    pub generated_at: DateTime<Utc>,
    pub strategy: String,
    pub embedding_norm: EmbeddingNorm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Policy applied because the filter found no dominant identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_consensus: Option<NoConsensusPolicy>,
    pub summary: Summary,
    pub images: Vec<ImageReport>,
}

impl CurationReport {
    pub fn kept(&self) -> impl Iterator<Item = &ImageReport> {
        self.images.iter().filter(|i| i.status == ImageStatus::Kept)
    }
}

/// Crop plans for one image's primary face (or the fallback square).
pub fn plan_image(image: &ImageDetections, config: &CurationConfig) -> Result<Vec<CropPlan>, InputError> {
    plan_crops(
        image.height,
        image.width,
        image.primary_face().map(|f| &f.bbox),
        &config.modes,
        &config.crop,
    )
}

/// Primary-face embeddings of every image that has one, in manifest order.
///
/// Images whose embedding cannot join the batch are returned with the reason.
pub fn collect_batch<'a, I>(images: I) -> (IdentityBatch, Vec<(String, ConsensusError)>)
where
    I: IntoIterator<Item = &'a ImageDetections>,
{
    let mut batch = IdentityBatch::new();
    let mut refused = Vec::new();
    for image in images {
        if let Some(face) = image.primary_face() {
            if let Err(e) = batch.push(image.id.as_str(), face.embedding.clone()) {
                refused.push((image.id.clone(), e));
            }
        }
    }
    (batch, refused)
}

/// Raw consensus outcome over the same images `curate` would batch: images
/// with invalid geometry are left out before embeddings are collected.
pub fn consensus_outcome(manifest: &DetectionManifest, config: &CurationConfig) -> Result<ConsensusOutcome> {
    let usable = manifest.images.iter().filter(|image| match plan_image(image, config) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(id = %image.id, error = %e, "skipping image with invalid geometry");
            false
        }
    });
    let (batch, refused) = collect_batch(usable);
    for (id, e) in &refused {
        tracing::warn!(%id, error = %e, "embedding excluded from consensus");
    }
    config
        .consensus
        .build(manifest.embedding_norm)
        .decide(&batch)
        .context("consensus filtering")
}

pub fn curate(manifest: &DetectionManifest, config: &CurationConfig) -> Result<CurationReport> {
    let strategy = config.consensus.build(manifest.embedding_norm);

    let mut reports: Vec<ImageReport> = manifest
        .images
        .iter()
        .map(|image| ImageReport {
            id: image.id.clone(),
            height: image.height,
            width: image.width,
            status: ImageStatus::NoFace,
            faces: image.faces.len(),
            error: None,
            crops: Vec::new(),
            decision: None,
        })
        .collect();

    // Geometry failures drop the image, not the run.
    let mut usable = Vec::with_capacity(manifest.images.len());
    for (image, report) in manifest.images.iter().zip(reports.iter_mut()) {
        match plan_image(image, config) {
            Ok(plans) => {
                report.crops = plans;
                usable.push(image);
            }
            Err(e) => {
                tracing::warn!(id = %image.id, error = %e, "skipping image with invalid geometry");
                report.status = ImageStatus::Invalid;
                report.error = Some(e.to_string());
            }
        }
    }

    let (batch, refused) = collect_batch(usable);
    let by_id: HashMap<String, usize> = reports
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id.clone(), i))
        .collect();
    for (id, e) in refused {
        tracing::warn!(%id, error = %e, "embedding excluded from consensus");
        if let Some(&i) = by_id.get(&id) {
            reports[i].status = ImageStatus::Invalid;
            reports[i].error = Some(e.to_string());
        }
    }

    let mut applied_policy = None;
    let result: Option<ConsensusResult> = match strategy.decide(&batch) {
        Ok(outcome) => {
            if !outcome.is_consensus() {
                tracing::warn!(policy = %config.no_consensus, "no dominant identity; applying policy");
                applied_policy = Some(config.no_consensus);
            }
            let result = outcome.resolve(config.no_consensus).map_err(|none| {
                anyhow!(
                    "no consensus among {} images with the {} strategy; \
                     set no_consensus to keep_all or reject_all to continue",
                    none.decisions.len(),
                    none.strategy
                )
            })?;
            Some(result)
        }
        Err(ConsensusError::EmptyBatch) => {
            tracing::warn!("no usable faces; nothing can pass consensus");
            None
        }
        Err(e) => return Err(anyhow!(e).context("consensus filtering")),
    };

    if let Some(result) = &result {
        for (decisions, status) in [(&result.kept, ImageStatus::Kept), (&result.rejected, ImageStatus::Rejected)] {
            for decision in decisions {
                if let Some(&i) = by_id.get(&decision.id) {
                    reports[i].status = status;
                    reports[i].decision = Some(decision.clone());
                }
            }
        }
    }

    let summary = summarize(&reports);
    tracing::info!(
        images = summary.images,
        kept = summary.kept,
        rejected = summary.rejected,
        no_face = summary.no_face,
        invalid = summary.invalid,
        strategy = strategy.name(),
        "curation complete"
    );

    Ok(CurationReport {
        generated_at: Utc::now(),
        strategy: strategy.name().to_string(),
        embedding_norm: manifest.embedding_norm,
        model: manifest.model.clone(),
        no_consensus: applied_policy,
        summary,
        images: reports,
    })
}

fn summarize(reports: &[ImageReport]) -> Summary {
    let mut summary = Summary {
        images: reports.len(),
        ..Summary::default()
    };
    for report in reports {
        match report.status {
            ImageStatus::Kept => summary.kept += 1,
            ImageStatus::Rejected => summary.rejected += 1,
            ImageStatus::NoFace => summary.no_face += 1,
            ImageStatus::Invalid => summary.invalid += 1,
        }
    }
    summary
}
