//! Detector manifest: the JSON an external face detector writes for a
//! scraped image set.
//!
//! ```json
//! {
//!   "embedding_norm": "l2",
//!   "model": "buffalo_l",
//!   "images": [
//!     { "id": "0001.jpg", "height": 600, "width": 800,
//!       "faces": [ { "bbox": [300, 200, 500, 400], "embedding": [0.01, ...] } ] }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use likeness_core::{EmbeddingNorm, ImageDetections};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionManifest {
    #[serde(default)]
    pub embedding_norm: EmbeddingNorm,
    /// Recognition model that produced the embeddings, if the detector says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub images: Vec<ImageDetections>,
}

impl DetectionManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading detections {}", path.display()))?;
        let manifest =
            Self::parse(&text).with_context(|| format!("parsing detections {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            images = manifest.images.len(),
            faces = manifest.images.iter().map(|i| i.faces.len()).sum::<usize>(),
            norm = ?manifest.embedding_norm,
            "loaded detector manifest"
        );
        Ok(manifest)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(text)?;

        let mut seen = HashSet::new();
        for image in &manifest.images {
            if !seen.insert(image.id.as_str()) {
                bail!("duplicate image id '{}' in manifest", image.id);
            }
        }
        Ok(manifest)
    }
}
